//! Indexed-роутер: маршрутизация через прекомпилированный trie-файл.
//!
//! Файл отдаёт (context_index, type_index); роутер держит массив context
//! node-ов — по слоту на строку контекста из файла — и маршрутизирует
//! индексированием, без строковых сравнений тегов.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use log::error;

use crate::area::PropArea;
use crate::consts::{NO_INDEX, SERIAL_AREA_FILE};
use crate::context::ContextNode;
use crate::infofile::InfoFile;
use crate::record::RecordRef;

use super::Contexts;

pub struct IndexedContexts {
    info: InfoFile,
    nodes: Vec<ContextNode>,
    serial_area: Option<PropArea>,
    rw: bool,
}

impl IndexedContexts {
    pub fn initialize(
        writable: bool,
        dir: &Path,
        info_path: &PathBuf,
        area_size: usize,
        mut xattr_failed: Option<&mut bool>,
    ) -> Result<IndexedContexts> {
        let info = InfoFile::load(info_path)?;

        let mut nodes = Vec::with_capacity(info.num_contexts() as usize);
        for i in 0..info.num_contexts() {
            let context = info
                .context(i)
                .ok_or_else(|| anyhow!("corrupt context string at index {}", i))?;
            nodes.push(ContextNode::new(context, dir));
        }

        let mut ctx = IndexedContexts {
            info,
            nodes,
            serial_area: None,
            rw: false,
        };

        if writable {
            let _ = std::fs::create_dir_all(dir);
            let mut open_failed = false;
            for node in &ctx.nodes {
                let mut xf = false;
                if !node.open_rw_sized(area_size, &mut xf) {
                    open_failed = true;
                }
                if xf {
                    if let Some(out) = xattr_failed.as_deref_mut() {
                        *out = true;
                    }
                }
            }
            let mut xf = false;
            let serial = PropArea::create_rw(
                &dir.join(SERIAL_AREA_FILE),
                area_size,
                Some(SERIAL_AREA_FILE),
                &mut xf,
            );
            if xf {
                if let Some(out) = xattr_failed.as_deref_mut() {
                    *out = true;
                }
            }
            match serial {
                Ok(pa) if !open_failed => {
                    ctx.serial_area = Some(pa);
                    ctx.rw = true;
                }
                Ok(_) => bail!("failed to open one or more property areas rw"),
                Err(e) => return Err(e.context("map serial property area")),
            }
        } else {
            let pa = PropArea::open(&dir.join(SERIAL_AREA_FILE))?;
            ctx.rw = pa.rw();
            ctx.serial_area = Some(pa);
        }
        Ok(ctx)
    }

    pub fn info(&self) -> &InfoFile {
        &self.info
    }
}

impl Contexts for IndexedContexts {
    fn get_prop_area(&self, name: &str) -> Option<&PropArea> {
        let (index, _) = self.info.get_property_info_indexes(name);
        if index == NO_INDEX || index as usize >= self.nodes.len() {
            error!("could not find context for property \"{}\"", name);
            return None;
        }
        let node = &self.nodes[index as usize];
        if node.area().is_none() {
            // Мимо кэша no_access: явная маршрутизация обязана оставлять
            // след в аудите хоста на каждый отказ.
            node.open(false, None);
        }
        node.area()
    }

    fn get_context(&self, name: &str) -> Option<&str> {
        self.info.get_property_info(name).0
    }

    fn serial_area(&self) -> Option<&PropArea> {
        self.serial_area.as_ref()
    }

    fn for_each(&self, f: &mut dyn FnMut(RecordRef)) {
        for node in &self.nodes {
            if let Some(pa) = node.check_access_and_open() {
                pa.foreach(f);
            }
        }
    }

    fn reset_access(&self) {
        for node in &self.nodes {
            node.reset_access();
        }
    }

    fn free_and_unmap(&mut self) {
        for node in &self.nodes {
            node.unmap();
        }
        self.serial_area = None;
    }

    fn rw(&self) -> bool {
        self.rw
    }
}
