//! Split-роутер: текстовые конфиги `<префикс> <тег> [прочее игнорируется]`.
//!
//! Каждый уникальный тег — один context node (один файл области); префиксы
//! лежат упорядоченным списком по убыванию длины, так что первый совпавший —
//! самый длинный. Единственное исключение — `*`: всегда в хвосте и матчит
//! любое имя. Записи зарезервированного control-неймспейса парсятся, но
//! отбрасываются: эти имена живут только в IPC и файла не имеют.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use log::warn;

use crate::area::PropArea;
use crate::consts::{CTL_PREFIX, SERIAL_AREA_FILE};
use crate::context::ContextNode;
use crate::record::RecordRef;

use super::Contexts;

struct PrefixEntry {
    prefix: String,
    context_index: usize,
}

pub struct SplitContexts {
    contexts: Vec<ContextNode>,
    prefixes: Vec<PrefixEntry>,
    serial_area: Option<PropArea>,
    rw: bool,
}

impl SplitContexts {
    /// Прочитать конфиги и поднять роутер. Для writer-а (`writable`)
    /// создаются каталог, все области и serial-область; для читателя
    /// мапится только serial-область, остальные — лениво по маршруту.
    pub fn initialize(
        writable: bool,
        dir: &Path,
        config_files: &[PathBuf],
        area_size: usize,
        mut xattr_failed: Option<&mut bool>,
    ) -> Result<SplitContexts> {
        let mut ctx = SplitContexts {
            contexts: Vec::new(),
            prefixes: Vec::new(),
            serial_area: None,
            rw: false,
        };

        let mut any_loaded = false;
        for path in config_files {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    ctx.parse_config(&text, dir);
                    any_loaded = true;
                }
                Err(e) => {
                    // Часть файлов в списке предпочтений опциональна: не все
                    // инсталляции несут все слои.
                    warn!("skipping property contexts {}: {}", path.display(), e);
                }
            }
        }
        if !any_loaded {
            bail!("no property contexts file could be read");
        }
        if ctx.prefixes.is_empty() {
            bail!("property contexts parsed to zero routable entries");
        }

        if writable {
            let _ = std::fs::create_dir_all(dir);
            let mut open_failed = false;
            for node in &ctx.contexts {
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

    fn parse_config(&mut self, text: &str, dir: &Path) {
        for line in text.lines() {
            let mut tokens = line.split_whitespace();
            let Some(prefix) = tokens.next() else { continue };
            if prefix.starts_with('#') {
                continue;
            }
            let Some(tag) = tokens.next() else { continue };
            // control-неймспейс не имеет файла — только IPC.
            if prefix.starts_with(CTL_PREFIX) {
                continue;
            }

            let context_index = match self.contexts.iter().position(|c| c.context() == tag) {
                Some(i) => i,
                None => {
                    self.contexts.push(ContextNode::new(tag, dir));
                    self.contexts.len() - 1
                }
            };
            self.add_prefix_ordered(prefix, context_index);
        }
    }

    /// Вставка с сохранением порядка "длинные раньше, `*` в хвосте";
    /// среди равных длин позже добавленные идут позже.
    fn add_prefix_ordered(&mut self, prefix: &str, context_index: usize) {
        let entry = PrefixEntry {
            prefix: prefix.to_string(),
            context_index,
        };
        let pos = self
            .prefixes
            .iter()
            .position(|p| p.prefix.len() < entry.prefix.len() || p.prefix.starts_with('*'));
        match pos {
            Some(i) => self.prefixes.insert(i, entry),
            None => self.prefixes.push(entry),
        }
    }

    fn prefix_entry_for(&self, name: &str) -> Option<&PrefixEntry> {
        self.prefixes
            .iter()
            .find(|p| p.prefix.starts_with('*') || name.starts_with(p.prefix.as_str()))
    }

    #[cfg(test)]
    fn route(&self, name: &str) -> Option<&str> {
        self.prefix_entry_for(name)
            .map(|p| self.contexts[p.context_index].context())
    }
}

impl Contexts for SplitContexts {
    fn get_prop_area(&self, name: &str) -> Option<&PropArea> {
        let entry = self.prefix_entry_for(name)?;
        let node = &self.contexts[entry.context_index];
        if node.area().is_none() {
            // Намеренно мимо кэша no_access: каждая запрещённая попытка
            // маршрутизации по имени должна дойти до хоста и его аудита.
            node.open(false, None);
        }
        node.area()
    }

    fn get_context(&self, name: &str) -> Option<&str> {
        let entry = self.prefix_entry_for(name)?;
        Some(self.contexts[entry.context_index].context())
    }

    fn serial_area(&self) -> Option<&PropArea> {
        self.serial_area.as_ref()
    }

    fn for_each(&self, f: &mut dyn FnMut(RecordRef)) {
        for node in &self.contexts {
            if let Some(pa) = node.check_access_and_open() {
                pa.foreach(f);
            }
        }
    }

    fn reset_access(&self) {
        for node in &self.contexts {
            node.reset_access();
        }
    }

    fn free_and_unmap(&mut self) {
        for node in &self.contexts {
            node.unmap();
        }
        self.serial_area = None;
    }

    fn rw(&self) -> bool {
        self.rw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SplitContexts {
        let mut ctx = SplitContexts {
            contexts: Vec::new(),
            prefixes: Vec::new(),
            serial_area: None,
            rw: false,
        };
        ctx.parse_config(text, Path::new("/nonexistent"));
        ctx
    }

    #[test]
    fn longest_prefix_wins_and_wildcard_is_last() {
        let ctx = parse(
            "persist. ctx_a\n\
             persist.sys. ctx_b\n\
             * ctx_c\n",
        );
        assert_eq!(ctx.route("persist.sys.foo"), Some("ctx_b"));
        assert_eq!(ctx.route("persist.bar"), Some("ctx_a"));
        assert_eq!(ctx.route("other"), Some("ctx_c"));
    }

    #[test]
    fn comments_blank_lines_and_ctl_are_skipped() {
        let ctx = parse(
            "# comment line\n\
             \n\
             ctl.start ctx_ipc\n\
             net. ctx_net extra tokens ignored\n\
             lonely_token\n",
        );
        assert_eq!(ctx.prefixes.len(), 1);
        assert_eq!(ctx.route("net.dns1"), Some("ctx_net"));
        assert_eq!(ctx.route("ctl.start"), None);
    }

    #[test]
    fn duplicate_tags_share_one_context_node() {
        let ctx = parse(
            "net. ctx_shared\n\
             sys. ctx_shared\n",
        );
        assert_eq!(ctx.contexts.len(), 1);
        assert_eq!(ctx.prefixes.len(), 2);
    }

    #[test]
    fn no_route_without_wildcard() {
        let ctx = parse("persist. ctx_a\n");
        assert_eq!(ctx.route("other.name"), None);
    }
}
