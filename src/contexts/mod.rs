//! Маршрутизация имя -> область.
//!
//! Три варианта за одним трейтом: split (текстовый конфиг префиксов),
//! indexed (прекомпилированный trie-файл) и pre-split (одна область на всё,
//! когда стор инициализируют путём к файлу, а не каталогу). Фасад выбирает
//! вариант при инициализации и дальше разговаривает только с трейтом.

pub mod indexed;
pub mod presplit;
pub mod split;

pub use indexed::IndexedContexts;
pub use presplit::PreSplitContexts;
pub use split::SplitContexts;

use crate::area::PropArea;
use crate::record::RecordRef;

pub trait Contexts: Send + Sync {
    /// Область, владеющая именем. None = нет маршрута либо нет доступа;
    /// каждая неудачная попытка здесь идёт через open (без кэша отказа),
    /// чтобы аудит хоста видел каждый запрещённый доступ.
    fn get_prop_area(&self, name: &str) -> Option<&PropArea>;

    /// Тег доступа (контекст), владеющий именем.
    fn get_context(&self, name: &str) -> Option<&str>;

    /// Область глобального serial.
    fn serial_area(&self) -> Option<&PropArea>;

    /// Обход записей всех доступных областей; закрытые области молча
    /// пропускаются (кэш no_access).
    fn for_each(&self, f: &mut dyn FnMut(RecordRef));

    /// Переоценить доступ ко всем областям (после смены политики хоста).
    fn reset_access(&self);

    /// Размапить всё. Обычно не нужен — Drop делает то же, — но интерфейс
    /// предоставляет явный teardown для управляемого завершения.
    fn free_and_unmap(&mut self);

    /// Открыт ли стор на запись.
    fn rw(&self) -> bool;
}
