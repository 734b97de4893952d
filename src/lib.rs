// Базовые модули
pub mod config;
pub mod consts;
pub mod futex;
pub mod lock;

// Ядро: область, арена, trie, записи
pub mod area;
pub mod record;
pub mod trie;

// Маршрутизация
pub mod context;
pub mod contexts;
pub mod infofile;

// Фасад и процессный синглтон
pub mod global;
pub mod store;

// CLI
pub mod cli;

// Удобные реэкспорты
pub use area::PropArea;
pub use config::StoreConfig;
pub use infofile::{build_info_file, InfoFile, PropertyInfoEntry};
pub use record::RecordRef;
pub use store::{open_store, Store};
pub use trie::is_valid_property_name;
