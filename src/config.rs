//! Конфигурация стора: одно место для настроек вместо рассыпанных env-чтений.
//!
//! Env-переменные (все опциональны):
//! - PS_AREA_SIZE            — размер файла области в байтах (по умолчанию 128 KiB)
//! - PS_PROPERTY_CONTEXTS    — список конфигов split-роутера через ':'
//! - PS_PROPERTY_INFO        — путь к прекомпилированному info-файлу

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::consts::{PA_SIZE_DEFAULT, PROPERTY_CONTEXTS_FILE, PROPERTY_INFO_FILE};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Каталог стора (или путь к единственной области для pre-split).
    pub dir: PathBuf,

    /// Размер каждого файла области. Фиксируется при создании; существующие
    /// области мапятся по их фактическому размеру.
    pub area_size: usize,

    /// Список конфигов контекстов в порядке предпочтения; отсутствующие
    /// логируются и пропускаются, но хотя бы один обязан прочитаться.
    pub contexts_files: Vec<PathBuf>,

    /// Прекомпилированный trie-файл; если читается — выбирается
    /// indexed-роутер, иначе split.
    pub info_file: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(dir: &Path) -> StoreConfig {
        StoreConfig {
            dir: dir.to_path_buf(),
            area_size: PA_SIZE_DEFAULT,
            contexts_files: vec![dir.join(PROPERTY_CONTEXTS_FILE)],
            info_file: None,
        }
    }

    /// Конфигурация из окружения поверх дефолтов.
    pub fn from_env(dir: &Path) -> StoreConfig {
        let mut cfg = Self::new(dir);

        if let Ok(v) = std::env::var("PS_AREA_SIZE") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.area_size = n;
            }
        }
        if let Ok(v) = std::env::var("PS_PROPERTY_CONTEXTS") {
            let files: Vec<PathBuf> = v
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
            if !files.is_empty() {
                cfg.contexts_files = files;
            }
        }
        if let Ok(v) = std::env::var("PS_PROPERTY_INFO") {
            if !v.trim().is_empty() {
                cfg.info_file = Some(PathBuf::from(v));
            }
        }
        cfg
    }

    pub fn with_area_size(mut self, area_size: usize) -> StoreConfig {
        self.area_size = area_size;
        self
    }

    pub fn with_contexts_files(mut self, files: Vec<PathBuf>) -> StoreConfig {
        self.contexts_files = files;
        self
    }

    pub fn with_info_file(mut self, path: PathBuf) -> StoreConfig {
        self.info_file = Some(path);
        self
    }

    /// Фактический путь info-файла: явный или <dir>/property_info.
    pub fn info_file_path(&self) -> PathBuf {
        self.info_file
            .clone()
            .unwrap_or_else(|| self.dir.join(PROPERTY_INFO_FILE))
    }

    /// Размер области: кратен 4 KiB, в разумных пределах.
    pub fn validate(&self) -> Result<()> {
        const MIN: usize = 8 * 1024;
        const MAX: usize = 16 * 1024 * 1024;
        if self.area_size < MIN || self.area_size > MAX || self.area_size % 4096 != 0 {
            return Err(anyhow!(
                "area_size must be a multiple of 4096 in [{} .. {}], got {}",
                MIN,
                MAX,
                self.area_size
            ));
        }
        Ok(())
    }
}
