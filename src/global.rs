//! Процессный синглтон стора.
//!
//! Инициализируется лениво один раз; повторный `init` ничего не сносит и не
//! перечитывает конфиги — только переоценивает доступ к областям
//! (`reset_access`), как того требует контракт повторной инициализации.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};

use crate::config::StoreConfig;
use crate::store::Store;

static STORE: OnceLock<Store> = OnceLock::new();

/// Инициализировать (или переоценить доступ) глобальный стор-читатель.
pub fn init(cfg: &StoreConfig) -> Result<&'static Store> {
    if let Some(store) = STORE.get() {
        store.reset_access();
        return Ok(store);
    }
    let created = Store::open(cfg)?;
    // Гонка инициализаций: проигравшая копия выбрасывается, победителю
    // переоцениваем доступ как при повторном init.
    let raced = STORE.set(created).is_err();
    let store = STORE
        .get()
        .ok_or_else(|| anyhow!("global store disappeared during init"))?;
    if raced {
        store.reset_access();
    }
    Ok(store)
}

/// Глобальный стор, если уже инициализирован.
pub fn get() -> Option<&'static Store> {
    STORE.get()
}
