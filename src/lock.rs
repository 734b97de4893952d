//! Файловый lock writer-а.
//!
//! Протокол областей рассчитан ровно на одного мутатора; advisory-lock на
//! <dir>/LOCK превращает это из конвенции в проверяемое свойство. Читатели
//! lock не берут — их путь wait-free и на файловую блокировку не смотрит.
//!
//! Lock снимается в Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Ошибки unlock при Drop игнорируются сознательно.
        let _ = self.file.unlock();
    }
}

fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE)
}

fn open_lock_file(dir: &Path) -> Result<std::fs::File> {
    let path = lock_file_path(dir);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))
}

/// Взять эксклюзивный lock writer-а. Блокируется до получения.
pub fn acquire_exclusive_lock(dir: &Path) -> Result<LockGuard> {
    let file = open_lock_file(dir)?;
    file.lock_exclusive()
        .with_context(|| format!("lock_exclusive {}", lock_file_path(dir).display()))?;
    Ok(LockGuard {
        file,
        path: lock_file_path(dir),
    })
}

/// Попытаться взять lock writer-а; занято — ошибка (второй мутатор).
pub fn try_acquire_exclusive_lock(dir: &Path) -> Result<LockGuard> {
    let file = open_lock_file(dir)?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "try_lock_exclusive failed: {}",
            lock_file_path(dir).display()
        )
    })?;
    Ok(LockGuard {
        file,
        path: lock_file_path(dir),
    })
}
