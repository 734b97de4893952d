//! Общие константы форматов (property area, record, trie node, info file).
//!
//! Всё little-endian; все ссылки внутри области — u32-смещения от начала
//! data-региона, в info-файле — от начала файла. Никаких указателей в
//! персистентных структурах: одни и те же байты мапятся в разных процессах
//! по разным адресам.

// -------- Property area --------

/// Magic заголовка области ("PROP" в LE-байтах).
pub const PA_MAGIC: u32 = 0x504f_5250;
pub const PA_VERSION: u32 = 0xfc6e_d0ab;

/// Размер области по умолчанию (конфигурируется при инициализации).
pub const PA_SIZE_DEFAULT: usize = 128 * 1024;

/// Максимум значения: инлайн-буфер 92 байта, полезная длина <= 91 (NUL внутри).
/// Значение длиной >= PROP_VALUE_MAX становится long-записью.
pub const PROP_VALUE_MAX: usize = 92;

/// Легаси-буфер имени для read-with-name; полные имена могут быть длиннее
/// (тогда read обрезает с предупреждением). Сегмент имени ограничен жёстко.
pub const PROP_NAME_MAX: usize = 32;
pub const SEGMENT_NAME_MAX: usize = PROP_NAME_MAX - 1;

// Заголовок области:
// [bytes_used u32 atomic][serial u32 atomic][magic u32][version u32]
// [reserved 28B][dirty_backup PROP_VALUE_MAX+1 B][pad to 4][data ...]
pub const PA_OFF_BYTES_USED: usize = 0;
pub const PA_OFF_SERIAL: usize = 4;
pub const PA_OFF_MAGIC: usize = 8;
pub const PA_OFF_VERSION: usize = 12;
pub const PA_OFF_RESERVED: usize = 16;
pub const PA_OFF_DIRTY_BACKUP: usize = 44;
pub const PA_HEADER_SIZE: usize = 140; // 44 + 93, выровнено к 4

// -------- Record --------
//
// Layout (смещения от начала записи):
// [serial u32 atomic]
// [value union, 92 байта:
//    short: value[] + NUL (мутабельно)
//    long:  error_message[56] + NUL, затем long_offset u32 @60 —
//           положительное смещение от начала записи к NUL-терминированному
//           буферу значения в той же арене]
// [name[] + NUL]  -- полное имя с точками
pub const REC_OFF_SERIAL: usize = 0;
pub const REC_OFF_VALUE: usize = 4;
pub const REC_OFF_LONG_ERROR: usize = 4;
pub const REC_OFF_LONG_OFFSET: usize = 60;
pub const REC_OFF_NAME: usize = 96;

pub const LONG_ERROR_BUFFER_SIZE: usize = 56;

/// Диагностика, которую легаси-читатели видят вместо long-значения.
pub const LONG_LEGACY_ERROR: &str = "Must use a read callback to read this property value";

// Кодировка serial-слова записи:
// (value_len << 24) | (long_flag << 16) | dirty | counter
pub const SERIAL_DIRTY: u32 = 1;
pub const SERIAL_LONG: u32 = 1 << 16;
pub const SERIAL_COUNTER_MASK: u32 = 0x00ff_ffff;

#[inline]
pub fn serial_value_len(serial: u32) -> usize {
    (serial >> 24) as usize
}

#[inline]
pub fn serial_dirty(serial: u32) -> bool {
    serial & SERIAL_DIRTY != 0
}

#[inline]
pub fn serial_long(serial: u32) -> bool {
    serial & SERIAL_LONG != 0
}

// -------- Trie node --------
//
// Узел BST одного уровня (одного сегмента имени между точками):
// [namelen u32][prop u32 atomic][left u32 atomic][right u32 atomic]
// [children u32 atomic][name[] + NUL]
// left/right — BST по (длина, лексикографика) среди сиблингов уровня;
// children — корень BST следующего уровня; prop — запись узла (0 = нет).
pub const NODE_OFF_NAMELEN: usize = 0;
pub const NODE_OFF_PROP: usize = 4;
pub const NODE_OFF_LEFT: usize = 8;
pub const NODE_OFF_RIGHT: usize = 12;
pub const NODE_OFF_CHILDREN: usize = 16;
pub const NODE_OFF_NAME: usize = 20;

// -------- Files --------

pub const SERIAL_AREA_FILE: &str = "properties_serial";
pub const PROPERTY_CONTEXTS_FILE: &str = "property_contexts";
pub const PROPERTY_INFO_FILE: &str = "property_info";
pub const LOCK_FILE: &str = "LOCK";

/// Префикс зарезервированного control-неймспейса: IPC-only, без файла.
pub const CTL_PREFIX: &str = "ctl.";
/// Префикс read-only имён: long-записи разрешены, обновления — нет.
pub const RO_PREFIX: &str = "ro.";

// -------- Info file (serialized routing trie) --------
//
// Заголовок (9 x u32 LE от начала файла):
// [current_version][minimum_supported_version][size == file size]
// [contexts_offset][types_offset][root_offset][strings_offset]
// [num_contexts][num_types]
//
// contexts/types — массивы u32-смещений в пул NUL-строк, отсортированы
// лексикографически (binary search). Узел — 9 x u32:
// [name_offset][context_index][type_index]
// [num_child_nodes][child_nodes_offset]  -- u32-офсеты узлов, сорт. по имени
// [num_prefixes][prefixes_offset]
// [num_exact_matches][exact_matches_offset]
// Запись prefix/exact — 4 x u32: [name_offset][namelen][context_index][type_index].
// ~0u32 в индексе = "нет значения".
pub const INFO_VERSION: u32 = 1;
pub const INFO_MIN_SUPPORTED_VERSION: u32 = 1;

pub const INFO_OFF_VERSION: usize = 0;
pub const INFO_OFF_MIN_VERSION: usize = 4;
pub const INFO_OFF_SIZE: usize = 8;
pub const INFO_OFF_CONTEXTS: usize = 12;
pub const INFO_OFF_TYPES: usize = 16;
pub const INFO_OFF_ROOT: usize = 20;
pub const INFO_OFF_STRINGS: usize = 24;
pub const INFO_OFF_NUM_CONTEXTS: usize = 28;
pub const INFO_OFF_NUM_TYPES: usize = 32;
pub const INFO_HEADER_SIZE: usize = 36;

pub const INFO_NODE_SIZE: usize = 36;
pub const INFO_ENTRY_SIZE: usize = 16;

/// "Нет индекса" в info-файле.
pub const NO_INDEX: u32 = u32::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_word_encoding() {
        let s = (5u32 << 24) | 0x2a;
        assert_eq!(serial_value_len(s), 5);
        assert!(!serial_dirty(s));
        assert!(!serial_long(s));
        assert!(serial_dirty(s | SERIAL_DIRTY));
        assert!(serial_long(s | SERIAL_LONG));
    }

    #[test]
    fn long_error_fits_legacy_buffer() {
        // Вместе с NUL обязана помещаться в error_message[56].
        assert!(LONG_LEGACY_ERROR.len() + 1 <= LONG_ERROR_BUFFER_SIZE);
        assert!(LONG_LEGACY_ERROR.len() < PROP_VALUE_MAX);
    }

    #[test]
    fn header_layout_is_aligned() {
        assert_eq!(PA_OFF_DIRTY_BACKUP, PA_OFF_RESERVED + 28);
        assert!(PA_HEADER_SIZE >= PA_OFF_DIRTY_BACKUP + PROP_VALUE_MAX + 1);
        assert_eq!(PA_HEADER_SIZE % 4, 0);
        assert_eq!(REC_OFF_NAME, REC_OFF_VALUE + PROP_VALUE_MAX);
        assert_eq!(REC_OFF_LONG_OFFSET, REC_OFF_LONG_ERROR + LONG_ERROR_BUFFER_SIZE);
    }
}
