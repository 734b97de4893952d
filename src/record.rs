//! Запись свойства: layout + seqlock-протокол чтения/обновления.
//!
//! Serial-слово записи кодирует (len << 24) | long | dirty | counter и
//! служит одновременно версией seqlock и futex-словом. Контракт с
//! читателями: пока выставлен dirty-бит, неиспорченная копия старого
//! значения лежит в dirty-backup слоте владеющей области. Long-записи
//! неизменяемы: их значение живёт отдельным буфером в той же арене, по
//! относительному смещению от начала записи.

use std::ffi::CStr;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use anyhow::{bail, Result};

use crate::area::PropArea;
use crate::consts::{
    serial_value_len, LONG_ERROR_BUFFER_SIZE, LONG_LEGACY_ERROR, PROP_VALUE_MAX, REC_OFF_LONG_ERROR,
    REC_OFF_LONG_OFFSET, REC_OFF_NAME, REC_OFF_SERIAL, REC_OFF_VALUE, SERIAL_COUNTER_MASK,
    SERIAL_DIRTY, SERIAL_LONG,
};
use crate::futex::futex_wake_all;

/// Хэндл записи в замапленной области.
///
/// Валиден, пока жив маппинг владеющей области; стор держит области
/// замапленными весь свой срок жизни, поэтому хэндлы, полученные из стора,
/// живут вместе с ним. Copy — это просто адрес.
#[derive(Clone, Copy)]
pub struct RecordRef {
    ptr: *mut u8,
}

// SAFETY: хэндл — адрес в shared-маппинге; все обращения идут через атомики
// либо seqlock-копирование. Протокол одного мутатора обеспечивает writer.
unsafe impl Send for RecordRef {}
unsafe impl Sync for RecordRef {}

impl RecordRef {
    #[inline]
    pub(crate) fn from_ptr(ptr: *mut u8) -> RecordRef {
        RecordRef { ptr }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn serial_atomic(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.ptr.add(REC_OFF_SERIAL) as *mut u32) }
    }

    /// Текущее serial-слово (acquire).
    pub fn serial(&self) -> u32 {
        self.serial_atomic().load(Ordering::Acquire)
    }

    pub fn is_long(&self) -> bool {
        crate::consts::serial_long(self.serial_atomic().load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn name_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(REC_OFF_NAME) }
    }

    /// Имя записи. Байты имени неизменны после публикации записи.
    pub fn name(&self) -> &str {
        unsafe {
            let c = CStr::from_ptr(self.name_ptr() as *const libc::c_char);
            // Имена валидируются при add как печатаемый ASCII.
            std::str::from_utf8_unchecked(c.to_bytes())
        }
    }

    #[inline]
    pub(crate) fn value_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(REC_OFF_VALUE) }
    }

    /// Инлайн-значение как C-строка (только для read-only записей: у
    /// мутабельных значение читают через seqlock, не напрямую).
    pub(crate) fn inline_value_bytes(&self) -> &[u8] {
        unsafe { CStr::from_ptr(self.value_ptr() as *const libc::c_char).to_bytes() }
    }

    #[inline]
    pub(crate) fn long_value_ptr(&self) -> Option<*mut u8> {
        if !self.is_long() {
            return None;
        }
        unsafe {
            let rel =
                u32::from_le((self.ptr.add(REC_OFF_LONG_OFFSET) as *const u32).read()) as usize;
            Some(self.ptr.add(rel))
        }
    }

    /// Байты long-значения (без NUL). None для обычных записей.
    pub fn long_value(&self) -> Option<&[u8]> {
        let ptr = self.long_value_ptr()?;
        Some(unsafe { CStr::from_ptr(ptr as *const libc::c_char).to_bytes() })
    }
}

/// Инициализация короткой записи. Вызывается до публикации смещения,
/// поэтому обычные store достаточны.
///
/// # Safety
/// `ptr` указывает на свежеаллоцированный регион арены размером не меньше
/// REC_OFF_NAME + name.len() + 1; значение короче PROP_VALUE_MAX.
pub(crate) unsafe fn init_short(ptr: *mut u8, name: &str, value: &str) {
    debug_assert!(value.len() < PROP_VALUE_MAX);
    std::ptr::copy_nonoverlapping(name.as_ptr(), ptr.add(REC_OFF_NAME), name.len());
    ptr.add(REC_OFF_NAME + name.len()).write(0);
    std::ptr::copy_nonoverlapping(value.as_ptr(), ptr.add(REC_OFF_VALUE), value.len());
    ptr.add(REC_OFF_VALUE + value.len()).write(0);
    let serial = (value.len() as u32) << 24;
    (ptr.add(REC_OFF_SERIAL) as *mut u32).write(serial.to_le());
}

/// Инициализация long-записи: легаси-диагностика в инлайн-буфере плюс
/// относительное смещение буфера значения.
///
/// # Safety
/// Как у `init_short`; `long_rel` указывает внутрь той же арены на уже
/// записанный NUL-терминированный буфер значения.
pub(crate) unsafe fn init_long(ptr: *mut u8, name: &str, long_rel: u32) {
    std::ptr::copy_nonoverlapping(name.as_ptr(), ptr.add(REC_OFF_NAME), name.len());
    ptr.add(REC_OFF_NAME + name.len()).write(0);

    let err = LONG_LEGACY_ERROR.as_bytes();
    debug_assert!(err.len() + 1 <= LONG_ERROR_BUFFER_SIZE);
    std::ptr::copy_nonoverlapping(err.as_ptr(), ptr.add(REC_OFF_LONG_ERROR), err.len());
    ptr.add(REC_OFF_LONG_ERROR + err.len()).write(0);
    (ptr.add(REC_OFF_LONG_OFFSET) as *mut u32).write(long_rel.to_le());

    let serial = ((err.len() as u32) << 24) | SERIAL_LONG;
    (ptr.add(REC_OFF_SERIAL) as *mut u32).write(serial.to_le());
}

impl PropArea {
    /// Смещение -> хэндл записи, с проверкой, что фиксированная часть и имя
    /// помещаются в арену.
    pub(crate) fn record_at(&self, off: u32) -> Option<RecordRef> {
        let ptr = self.to_obj(off)?;
        let avail = self.bytes_at(off);
        if avail < REC_OFF_NAME + 1 {
            return None;
        }
        // NUL имени обязан найтись в пределах арены.
        let name_region =
            unsafe { std::slice::from_raw_parts(ptr.add(REC_OFF_NAME), avail - REC_OFF_NAME) };
        if !name_region.contains(&0) {
            return None;
        }
        Some(RecordRef::from_ptr(ptr))
    }

    /// Seqlock-чтение значения записи этой области.
    ///
    /// Возвращает serial, под которым снято значение (dirty-бит в нём
    /// гарантированно снят: пока writer держит dirty, копируется бэкап, а
    /// финальный store снимает бит и меняет слово — цикл перечитает).
    /// `out` заполняется len+1 байтами (значение + NUL).
    pub fn read_record(&self, rec: RecordRef, out: &mut [u8; PROP_VALUE_MAX]) -> u32 {
        let word = rec.serial_atomic();
        let mut new_serial = word.load(Ordering::Acquire);
        loop {
            let serial = new_serial;
            let len = serial_value_len(serial).min(PROP_VALUE_MAX - 1);
            unsafe {
                let src = if crate::consts::serial_dirty(serial) {
                    self.dirty_backup_ptr() as *const u8
                } else {
                    rec.value_ptr() as *const u8
                };
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len + 1);
            }
            fence(Ordering::Acquire);
            new_serial = word.load(Ordering::Relaxed);
            if serial == new_serial {
                return serial;
            }
            // Следующая итерация обязана копировать после этой перезагрузки
            // слова; acquire-fence дешевле, чем acquire на каждом load выше.
            fence(Ordering::Acquire);
        }
    }

    /// Обновление значения (writer-only, только короткие записи).
    ///
    /// Протокол: бэкап старого значения -> release -> dirty-бит ->
    /// копирование нового значения -> release -> финальное слово
    /// (len << 24) | counter+1 со снятым dirty -> futex wake.
    pub fn update_record(&self, rec: RecordRef, value: &str) -> Result<()> {
        if !self.rw() {
            bail!("property area is read-only");
        }
        if value.len() >= PROP_VALUE_MAX {
            bail!(
                "value too long for \"{}\": {} >= {}",
                rec.name(),
                value.len(),
                PROP_VALUE_MAX
            );
        }
        if value.as_bytes().contains(&0) {
            bail!("property value must not contain NUL");
        }
        if rec.is_long() {
            bail!("property \"{}\" is a long record and cannot be updated", rec.name());
        }

        let word = rec.serial_atomic();
        let serial = word.load(Ordering::Relaxed);
        let old_len = serial_value_len(serial).min(PROP_VALUE_MAX - 1);

        unsafe {
            // Копия старого значения должна быть видна раньше dirty-бита.
            std::ptr::copy_nonoverlapping(
                rec.value_ptr() as *const u8,
                self.dirty_backup_ptr(),
                old_len + 1,
            );
        }
        fence(Ordering::Release);
        let dirty_serial = serial | SERIAL_DIRTY;
        word.store(dirty_serial, Ordering::Relaxed);

        unsafe {
            std::ptr::copy_nonoverlapping(value.as_ptr(), rec.value_ptr(), value.len());
            rec.value_ptr().add(value.len()).write(0);
        }
        // Основное значение готово: пускаем читателей обратно на него.
        fence(Ordering::Release);
        word.store(
            ((value.len() as u32) << 24) | (dirty_serial.wrapping_add(1) & SERIAL_COUNTER_MASK),
            Ordering::Relaxed,
        );
        futex_wake_all(word);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{serial_dirty, serial_long, PA_SIZE_DEFAULT};
    use std::path::PathBuf;

    fn unique_path(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("propstore-rec-{}-{}-{}", prefix, pid, t))
    }

    fn new_area(prefix: &str) -> (PropArea, PathBuf) {
        let path = unique_path(prefix);
        let mut xf = false;
        let pa = PropArea::create_rw(&path, PA_SIZE_DEFAULT, None, &mut xf).unwrap();
        (pa, path)
    }

    #[test]
    fn short_record_roundtrip() {
        let (pa, path) = new_area("short");
        let rec = pa.add("a.b.c", "hello").unwrap();
        assert_eq!(rec.name(), "a.b.c");
        assert!(!rec.is_long());

        let mut buf = [0u8; PROP_VALUE_MAX];
        let serial = pa.read_record(rec, &mut buf);
        assert_eq!(serial_value_len(serial), 5);
        assert!(!serial_dirty(serial));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(buf[5], 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn update_bumps_counter_and_clears_dirty() {
        let (pa, path) = new_area("update");
        let rec = pa.add("svc.state", "stopped").unwrap();
        let s0 = rec.serial();
        pa.update_record(rec, "running").unwrap();
        let s1 = rec.serial();
        assert_ne!(s0, s1);
        assert!(!serial_dirty(s1));
        assert_eq!(serial_value_len(s1), "running".len());
        assert!((s1 & SERIAL_COUNTER_MASK) > (s0 & SERIAL_COUNTER_MASK));

        let mut buf = [0u8; PROP_VALUE_MAX];
        let s2 = pa.read_record(rec, &mut buf);
        assert_eq!(s2, s1);
        assert_eq!(&buf[..7], b"running");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn long_record_is_immutable() {
        let (pa, path) = new_area("long");
        let big = "x".repeat(200);
        let rec = pa.add("ro.big", &big).unwrap();
        assert!(rec.is_long());
        assert!(serial_long(rec.serial()));
        assert_eq!(rec.long_value().unwrap(), big.as_bytes());

        // Легаси-чтение видит диагностическую строку.
        let mut buf = [0u8; PROP_VALUE_MAX];
        let serial = pa.read_record(rec, &mut buf);
        let len = serial_value_len(serial);
        assert_eq!(&buf[..len], LONG_LEGACY_ERROR.as_bytes());

        assert!(pa.update_record(rec, "nope").is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn update_rejects_oversized_value() {
        let (pa, path) = new_area("oversize");
        let rec = pa.add("k", "v").unwrap();
        let big = "y".repeat(PROP_VALUE_MAX);
        assert!(pa.update_record(rec, &big).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
