//! Pre-split роутер: стор инициализировали путём к файлу одной области.
//!
//! Все имена живут в этой области, она же несёт глобальный serial.
//! Используется минимальными инсталляциями и тестами.

use std::path::Path;

use anyhow::Result;

use crate::area::PropArea;
use crate::record::RecordRef;

use super::Contexts;

pub struct PreSplitContexts {
    area: Option<PropArea>,
    rw: bool,
}

impl PreSplitContexts {
    pub fn initialize(path: &Path) -> Result<PreSplitContexts> {
        let pa = PropArea::open(path)?;
        let rw = pa.rw();
        Ok(PreSplitContexts {
            area: Some(pa),
            rw,
        })
    }
}

impl Contexts for PreSplitContexts {
    fn get_prop_area(&self, _name: &str) -> Option<&PropArea> {
        self.area.as_ref()
    }

    fn get_context(&self, _name: &str) -> Option<&str> {
        // Единственная область не несёт тегов: метки доступа — забота
        // каталожных вариантов.
        None
    }

    fn serial_area(&self) -> Option<&PropArea> {
        self.area.as_ref()
    }

    fn for_each(&self, f: &mut dyn FnMut(RecordRef)) {
        if let Some(pa) = &self.area {
            pa.foreach(f);
        }
    }

    fn reset_access(&self) {}

    fn free_and_unmap(&mut self) {
        self.area = None;
    }

    fn rw(&self) -> bool {
        self.rw
    }
}
