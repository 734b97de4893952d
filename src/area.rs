//! Property area — один mmap-файл: заголовок, dirty-backup слот, bump-арена.
//!
//! Формат (LE), смещения от начала файла:
//!   [bytes_used u32 atomic][serial u32 atomic][magic u32][version u32]
//!   [reserved 28B][dirty_backup PROP_VALUE_MAX+1][pad][data ...]
//!
//! Внутри data[] — trie узлов и записей (src/trie.rs, src/record.rs); все
//! ссылки — u32-смещения от начала data. Корневой узел trie лежит по
//! смещению 0 и создаётся при конструировании области.
//!
//! Политика доступа:
//! - создаёт файл только writer: O_CREAT|O_EXCL, mode 0444, ftruncate до
//!   фиксированного размера, маппинг RW shared;
//! - открытие существующего: владелец/группа root, без group/other write,
//!   размер не меньше заголовка, magic+version сходятся — иначе unmap и отказ;
//! - аллокация не растит файл: кончилась арена — ошибка NoSpace.

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::consts::{
    PA_HEADER_SIZE, PA_MAGIC, PA_OFF_BYTES_USED, PA_OFF_DIRTY_BACKUP, PA_OFF_MAGIC,
    PA_OFF_SERIAL, PA_OFF_VERSION, PA_VERSION,
};

enum AreaMap {
    Ro(Mmap),
    Rw(MmapMut),
}

/// Одна замапленная область свойств (или serial-область).
///
/// Экземпляр владеет маппингом; `RecordRef`-ы, выданные из этой области,
/// валидны, пока область не размаплена. Мутации (add/update/remove) разрешены
/// только при `rw == true` и только из одного потока одного процесса —
/// писатель сериализует себя сам.
pub struct PropArea {
    _map: AreaMap,
    base: *mut u8,
    size: usize,
    data_size: usize,
    rw: bool,
}

// SAFETY: PropArea раздаёт доступ к shared-памяти только через атомики и
// протокол seqlock; сырые указатели стабильны, пока жив маппинг. Межпоточная
// дисциплина (один мутатор) — контракт writer-а, читатели wait-free.
unsafe impl Send for PropArea {}
unsafe impl Sync for PropArea {}

impl PropArea {
    /// Создать новую область (writer, единожды при инициализации стора).
    ///
    /// Файл создаётся эксклюзивно с mode 0444; опциональная метка доступа
    /// пишется в xattr — неудача не фатальна, но поднимает `xattr_failed`,
    /// чтобы вызывающий мог решить сам (тесты продолжают, init — нет).
    pub fn create_rw(
        path: &Path,
        size: usize,
        label: Option<&str>,
        xattr_failed: &mut bool,
    ) -> Result<PropArea> {
        if size < PA_HEADER_SIZE + 64 {
            bail!("area size {} is below header + root node", size);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o444)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("create property area {}", path.display()))?;

        if let Some(label) = label {
            if !set_selinux_xattr(&file, label) {
                warn!(
                    "failed to set label \"{}\" on {} (continuing)",
                    label,
                    path.display()
                );
                *xattr_failed = true;
            }
        }

        file.set_len(size as u64)
            .with_context(|| format!("truncate {} to {}", path.display(), size))?;

        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .with_context(|| format!("mmap rw {}", path.display()))?;

        let base = map.as_mut_ptr();
        let mut pa = PropArea {
            _map: AreaMap::Rw(map),
            base,
            size,
            data_size: size - PA_HEADER_SIZE,
            rw: true,
        };
        pa.init_header();
        // Корневой узел trie (пустое имя) обязан занять смещение 0.
        let root = pa
            .allocate(crate::consts::NODE_OFF_NAME + 1)
            .ok_or_else(|| anyhow!("area too small for root node"))?;
        debug_assert_eq!(root, 0);
        Ok(pa)
    }

    /// Открыть существующую область; RW если получится (у root получится),
    /// иначе RO. Возвращённый флаг `rw()` говорит, чем кончилось.
    pub fn open(path: &Path) -> Result<PropArea> {
        let rw_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path);
        match rw_file {
            Ok(f) => Self::from_file(f, path, true),
            Err(_) => {
                let f = OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
                    .open(path)
                    .with_context(|| format!("open property area {}", path.display()))?;
                Self::from_file(f, path, false)
            }
        }
    }

    /// Открыть строго read-only (читатель).
    pub fn open_ro(path: &Path) -> Result<PropArea> {
        let f = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("open property area {}", path.display()))?;
        Self::from_file(f, path, false)
    }

    fn from_file(file: File, path: &Path, rw: bool) -> Result<PropArea> {
        let meta = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?;

        // Чужой владелец, чужая группа или записываемость для group/other —
        // область не наша, мапить нельзя.
        if meta.uid() != 0 || meta.gid() != 0 {
            bail!(
                "{}: owner {}:{} is not root:root",
                path.display(),
                meta.uid(),
                meta.gid()
            );
        }
        if meta.mode() & 0o022 != 0 {
            bail!("{}: group/other writable (mode {:o})", path.display(), meta.mode());
        }
        let size = meta.len() as usize;
        if size < PA_HEADER_SIZE {
            bail!("{}: file too small for area header ({})", path.display(), size);
        }

        let (map, base) = if rw {
            let mut m = unsafe { MmapOptions::new().len(size).map_mut(&file) }
                .with_context(|| format!("mmap rw {}", path.display()))?;
            let p = m.as_mut_ptr();
            (AreaMap::Rw(m), p)
        } else {
            let m = unsafe { MmapOptions::new().len(size).map(&file) }
                .with_context(|| format!("mmap ro {}", path.display()))?;
            let p = m.as_ptr() as *mut u8;
            (AreaMap::Ro(m), p)
        };

        let pa = PropArea {
            _map: map,
            base,
            size,
            data_size: size - PA_HEADER_SIZE,
            rw,
        };
        if pa.magic() != PA_MAGIC || pa.version() != PA_VERSION {
            // Drop размапит.
            bail!(
                "{}: bad area magic/version ({:#x}/{:#x})",
                path.display(),
                pa.magic(),
                pa.version()
            );
        }
        Ok(pa)
    }

    fn init_header(&mut self) {
        unsafe {
            let magic = self.base.add(PA_OFF_MAGIC) as *mut u32;
            magic.write(PA_MAGIC.to_le());
            let version = self.base.add(PA_OFF_VERSION) as *mut u32;
            version.write(PA_VERSION.to_le());
        }
        self.atomic_at(PA_OFF_BYTES_USED).store(0, Ordering::Relaxed);
        self.atomic_at(PA_OFF_SERIAL).store(0, Ordering::Relaxed);
    }

    #[inline]
    fn atomic_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off + 4 <= self.size && off % 4 == 0);
        unsafe { AtomicU32::from_ptr(self.base.add(off) as *mut u32) }
    }

    pub fn magic(&self) -> u32 {
        u32::from_le(unsafe { (self.base.add(PA_OFF_MAGIC) as *const u32).read() })
    }

    pub fn version(&self) -> u32 {
        u32::from_le(unsafe { (self.base.add(PA_OFF_VERSION) as *const u32).read() })
    }

    /// Глобальное serial-слово области (заголовок). Для serial-области это
    /// и есть весь её смысл; futex-ожидание спит на этом слове.
    pub fn serial(&self) -> &AtomicU32 {
        self.atomic_at(PA_OFF_SERIAL)
    }

    pub fn bytes_used(&self) -> u32 {
        self.atomic_at(PA_OFF_BYTES_USED).load(Ordering::Relaxed)
    }

    pub fn rw(&self) -> bool {
        self.rw
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Bump-аллокация в арене: выравнивание к 4, без free-list, без роста
    /// файла. Не атомарно — мутатор один.
    pub(crate) fn allocate(&self, size: usize) -> Option<u32> {
        let aligned = (size + 3) & !3;
        let used = self.bytes_used() as usize;
        if used + aligned > self.data_size {
            return None;
        }
        self.atomic_at(PA_OFF_BYTES_USED)
            .store((used + aligned) as u32, Ordering::Relaxed);
        Some(used as u32)
    }

    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(PA_HEADER_SIZE) }
    }

    /// Смещение -> адрес объекта в арене, с проверкой границ. Каждый
    /// дереференс опубликованного смещения проходит здесь.
    #[inline]
    pub(crate) fn to_obj(&self, off: u32) -> Option<*mut u8> {
        let off = off as usize;
        if off >= self.data_size {
            return None;
        }
        Some(unsafe { self.data_ptr().add(off) })
    }

    /// Сколько байт арены доступно по смещению (для проверок длины полей).
    #[inline]
    pub(crate) fn bytes_at(&self, off: u32) -> usize {
        self.data_size.saturating_sub(off as usize)
    }

    #[inline]
    pub(crate) fn dirty_backup_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(PA_OFF_DIRTY_BACKUP) }
    }
}

fn set_selinux_xattr(file: &File, label: &str) -> bool {
    use std::os::unix::io::AsRawFd;
    let name = b"security.selinux\0";
    let mut value = label.as_bytes().to_vec();
    value.push(0);
    let rc = unsafe {
        libc::fsetxattr(
            file.as_raw_fd(),
            name.as_ptr() as *const libc::c_char,
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    rc == 0
}
