//! Context node: ленивый хэндл одного файла области, помеченного тегом
//! доступа (для хоста это SELinux-контекст; для нас — непрозрачная строка,
//! она же имя файла области).
//!
//! Открытие идемпотентно и сериализуется внутренним мьютексом: низкоуровневым
//! и без обращений к стору, чтобы его можно было звать из раннего bringup
//! процесса. Результат проверки доступа кэшируется во флаге no_access —
//! foreach не долбит open по файлам, на которые прав нет; явная маршрутизация
//! по имени наоборот зовёт open в обход кэша, чтобы каждая запрещённая
//! попытка была видна аудиту хоста.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::area::PropArea;

pub struct ContextNode {
    context: String,
    dir: PathBuf,
    area: AtomicPtr<PropArea>,
    no_access: AtomicBool,
    open_lock: Mutex<()>,
}

impl ContextNode {
    pub fn new(context: &str, dir: &Path) -> ContextNode {
        ContextNode {
            context: context.to_string(),
            dir: dir.to_path_buf(),
            area: AtomicPtr::new(std::ptr::null_mut()),
            no_access: AtomicBool::new(false),
            open_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn filename(&self) -> PathBuf {
        self.dir.join(&self.context)
    }

    /// Область, если уже открыта. Без локов: указатель публикуется
    /// release-store после полной инициализации.
    pub fn area(&self) -> Option<&PropArea> {
        let ptr = self.area.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Открыть (или создать при `access_rw`) область. Повторный вызов —
    /// no-op. Неудача xattr-метки при создании поднимает `xattr_failed`.
    pub fn open(&self, access_rw: bool, xattr_failed: Option<&mut bool>) -> bool {
        if access_rw {
            let mut xf = false;
            let ok = self.open_rw_sized(crate::consts::PA_SIZE_DEFAULT, &mut xf);
            if xf {
                if let Some(out) = xattr_failed {
                    *out = true;
                }
            }
            return ok;
        }

        let _guard = self.open_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.area.load(Ordering::Acquire).is_null() {
            return true;
        }
        let path = self.filename();
        match PropArea::open(&path) {
            Ok(pa) => {
                let boxed = Box::into_raw(Box::new(pa));
                self.area.store(boxed, Ordering::Release);
                true
            }
            Err(e) => {
                warn!("cannot open property area {}: {:#}", path.display(), e);
                false
            }
        }
    }

    /// Создать область заданного размера и открыть её RW (writer).
    pub fn open_rw_sized(&self, area_size: usize, xattr_failed: &mut bool) -> bool {
        let _guard = self.open_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.area.load(Ordering::Acquire).is_null() {
            return true;
        }
        let path = self.filename();
        match PropArea::create_rw(&path, area_size, Some(&self.context), xattr_failed) {
            Ok(pa) => {
                let boxed = Box::into_raw(Box::new(pa));
                self.area.store(boxed, Ordering::Release);
                true
            }
            Err(e) => {
                warn!("cannot create property area {}: {:#}", path.display(), e);
                false
            }
        }
    }

    /// R_OK-проверка файла области, без открытия.
    pub fn check_access(&self) -> bool {
        let path = self.filename();
        let Ok(cpath) = std::ffi::CString::new(path.into_os_string().into_encoded_bytes()) else {
            return false;
        };
        unsafe { libc::access(cpath.as_ptr(), libc::R_OK) == 0 }
    }

    /// Для foreach: открыть, если доступно, с кэшированием отказа.
    pub fn check_access_and_open(&self) -> Option<&PropArea> {
        if self.area().is_none() && !self.no_access.load(Ordering::Relaxed) {
            if !self.check_access() || !self.open(false, None) {
                self.no_access.store(true, Ordering::Relaxed);
            }
        }
        self.area()
    }

    /// Переоценить доступ (после смены политики хоста). При потере доступа
    /// область размапливается; звать только из init-подобных мест, пока никто
    /// не держит ссылок в эту область.
    pub fn reset_access(&self) {
        if !self.check_access() {
            self.unmap();
            self.no_access.store(true, Ordering::Relaxed);
        } else {
            self.no_access.store(false, Ordering::Relaxed);
        }
    }

    pub fn unmap(&self) {
        let _guard = self.open_lock.lock().unwrap_or_else(|e| e.into_inner());
        let ptr = self.area.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl Drop for ContextNode {
    fn drop(&mut self) {
        self.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_cached_as_no_access() {
        let dir = std::env::temp_dir().join(format!(
            "propstore-ctx-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let node = ContextNode::new("no_such_area", &dir);
        assert!(!node.check_access());
        assert!(node.check_access_and_open().is_none());
        assert!(node.no_access.load(Ordering::Relaxed));
        // Явный open тоже падает, но кэш отказа его не глушит.
        assert!(!node.open(false, None));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
