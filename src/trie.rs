//! Trie записей внутри арены области.
//!
//! Каждый уровень (сегмент имени между точками) — BST сиблингов, связанных
//! атомарными смещениями left/right; children ведёт на корень BST следующего
//! уровня, prop — на запись узла. Сравнение сиблингов — (длина, лексикографика):
//! короткие имена раньше. Порядок заморожен совместимостью с уже
//! существующими читателями и менять его нельзя.
//!
//! Читатели ходят по структуре без локов: любое ненулевое смещение
//! публикуется release-store строго после полной инициализации объекта,
//! дереференс — через acquire-load с проверкой границ арены.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, bail, Result};

use crate::area::PropArea;
use crate::consts::{
    NODE_OFF_CHILDREN, NODE_OFF_LEFT, NODE_OFF_NAME, NODE_OFF_NAMELEN, NODE_OFF_PROP,
    NODE_OFF_RIGHT, PROP_VALUE_MAX, REC_OFF_NAME, SEGMENT_NAME_MAX,
};
use crate::record::{self, RecordRef};

/// Узел trie: тонкая обёртка над адресом в арене. Валидируется при
/// получении через `PropArea::node_at`.
#[derive(Clone, Copy)]
pub(crate) struct Node {
    ptr: *mut u8,
}

impl Node {
    #[inline]
    pub(crate) fn namelen(&self) -> usize {
        unsafe { u32::from_le((self.ptr.add(NODE_OFF_NAMELEN) as *const u32).read()) as usize }
    }

    #[inline]
    pub(crate) fn name(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.add(NODE_OFF_NAME), self.namelen()) }
    }

    #[inline]
    fn atomic_at(&self, off: usize) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.ptr.add(off) as *mut u32) }
    }

    #[inline]
    pub(crate) fn prop(&self) -> &AtomicU32 {
        self.atomic_at(NODE_OFF_PROP)
    }

    #[inline]
    pub(crate) fn left(&self) -> &AtomicU32 {
        self.atomic_at(NODE_OFF_LEFT)
    }

    #[inline]
    pub(crate) fn right(&self) -> &AtomicU32 {
        self.atomic_at(NODE_OFF_RIGHT)
    }

    #[inline]
    pub(crate) fn children(&self) -> &AtomicU32 {
        self.atomic_at(NODE_OFF_CHILDREN)
    }
}

/// Порядок сиблингов одного уровня: сперва длина, затем байты.
#[inline]
pub(crate) fn cmp_segment(a: &[u8], b: &[u8]) -> CmpOrdering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Валидный сегмент: 1..=31 байта печатаемого ASCII, точек внутри нет
/// (точка — разделитель уровней и до сегмента не доходит).
fn is_valid_segment(seg: &[u8]) -> bool {
    !seg.is_empty()
        && seg.len() <= SEGMENT_NAME_MAX
        && seg.iter().all(|b| b.is_ascii_graphic() && *b != b'.')
}

/// Полное имя: непустое, без пустых сегментов, каждый сегмент валиден.
pub fn is_valid_property_name(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(|s| is_valid_segment(s.as_bytes()))
}

impl PropArea {
    pub(crate) fn node_at(&self, off: u32) -> Option<Node> {
        let ptr = self.to_obj(off)?;
        if self.bytes_at(off) < NODE_OFF_NAME + 1 {
            return None;
        }
        let node = Node { ptr };
        // Имя обязано помещаться в арену вместе с NUL.
        if self.bytes_at(off) < NODE_OFF_NAME + node.namelen() + 1 {
            return None;
        }
        Some(node)
    }

    fn root_node(&self) -> Option<Node> {
        self.node_at(0)
    }

    /// Аллоцировать и полностью инициализировать новый узел. Смещение узла
    /// публикует вызывающий (release-store в родительскую ссылку).
    fn new_node(&self, name: &[u8]) -> Option<(Node, u32)> {
        let off = self.allocate(NODE_OFF_NAME + name.len() + 1)?;
        let ptr = self.to_obj(off)?;
        unsafe {
            (ptr.add(NODE_OFF_NAMELEN) as *mut u32).write((name.len() as u32).to_le());
            std::ptr::copy_nonoverlapping(name.as_ptr(), ptr.add(NODE_OFF_NAME), name.len());
            ptr.add(NODE_OFF_NAME + name.len()).write(0);
        }
        let node = Node { ptr };
        node.prop().store(0, Ordering::Relaxed);
        node.left().store(0, Ordering::Relaxed);
        node.right().store(0, Ordering::Relaxed);
        node.children().store(0, Ordering::Relaxed);
        Some((node, off))
    }

    /// BST-поиск сегмента на одном уровне; при `alloc` — вставка листом.
    fn find_node_in_level(&self, level_root: Node, seg: &[u8], alloc: bool) -> Option<Node> {
        let mut current = level_root;
        loop {
            match cmp_segment(seg, current.name()) {
                CmpOrdering::Equal => return Some(current),
                CmpOrdering::Less => {
                    let left = current.left().load(Ordering::Acquire);
                    if left != 0 {
                        current = self.node_at(left)?;
                    } else {
                        if !alloc {
                            return None;
                        }
                        let (node, off) = self.new_node(seg)?;
                        current.left().store(off, Ordering::Release);
                        return Some(node);
                    }
                }
                CmpOrdering::Greater => {
                    let right = current.right().load(Ordering::Acquire);
                    if right != 0 {
                        current = self.node_at(right)?;
                    } else {
                        if !alloc {
                            return None;
                        }
                        let (node, off) = self.new_node(seg)?;
                        current.right().store(off, Ordering::Release);
                        return Some(node);
                    }
                }
            }
        }
    }

    /// Пройти путь по точкам до терминального узла имени.
    /// Пустой сегмент (`""`, `.x`, `a..b`, `x.`) — отказ.
    fn traverse(&self, name: &str, alloc: bool) -> Option<Node> {
        let mut current = self.root_node()?;
        for seg in name.as_bytes().split(|b| *b == b'.') {
            if seg.is_empty() {
                return None;
            }
            let children = current.children().load(Ordering::Acquire);
            let level_root = if children != 0 {
                self.node_at(children)?
            } else if alloc {
                let (node, off) = self.new_node(seg)?;
                current.children().store(off, Ordering::Release);
                node
            } else {
                return None;
            };
            current = self.find_node_in_level(level_root, seg, alloc)?;
        }
        Some(current)
    }

    /// Найти запись по имени. Без аллокаций, wait-free.
    pub fn find(&self, name: &str) -> Option<RecordRef> {
        let node = self.traverse(name, false)?;
        let prop = node.prop().load(Ordering::Acquire);
        if prop == 0 {
            return None;
        }
        self.record_at(prop)
    }

    /// Добавить запись (writer-only). Имя с существующей записью возвращает
    /// её без изменения значения — обновлением занимается update.
    ///
    /// Значение длиной >= PROP_VALUE_MAX порождает long-запись: байты уходят
    /// отдельным буфером в ту же арену, в записи остаётся относительное
    /// смещение и легаси-диагностика для старых читателей.
    pub fn add(&self, name: &str, value: &str) -> Result<RecordRef> {
        if !self.rw() {
            bail!("property area is read-only");
        }
        if !is_valid_property_name(name) {
            bail!("invalid property name \"{}\"", name);
        }
        if value.as_bytes().contains(&0) {
            bail!("property value must not contain NUL");
        }

        let node = self
            .traverse(name, true)
            .ok_or_else(|| anyhow!("property area exhausted while adding \"{}\"", name))?;

        let prop = node.prop().load(Ordering::Acquire);
        if prop != 0 {
            return self
                .record_at(prop)
                .ok_or_else(|| anyhow!("corrupt record offset for \"{}\"", name));
        }

        let no_space = || anyhow!("property area exhausted while adding \"{}\"", name);
        let rec_off = if value.len() >= PROP_VALUE_MAX {
            let rec_off = self
                .allocate(REC_OFF_NAME + name.len() + 1)
                .ok_or_else(no_space)?;
            let long_off = self.allocate(value.len() + 1).ok_or_else(no_space)?;
            // Запись хранит смещение от самой себя: арена перемещаема целиком.
            let rel = long_off - rec_off;
            let rec_ptr = self.to_obj(rec_off).ok_or_else(no_space)?;
            let long_ptr = self.to_obj(long_off).ok_or_else(no_space)?;
            unsafe {
                std::ptr::copy_nonoverlapping(value.as_ptr(), long_ptr, value.len());
                long_ptr.add(value.len()).write(0);
                record::init_long(rec_ptr, name, rel);
            }
            rec_off
        } else {
            let rec_off = self
                .allocate(REC_OFF_NAME + name.len() + 1)
                .ok_or_else(no_space)?;
            let rec_ptr = self.to_obj(rec_off).ok_or_else(no_space)?;
            unsafe {
                record::init_short(rec_ptr, name, value);
            }
            rec_off
        };

        // Запись полностью сконструирована — только теперь публикуем.
        node.prop().store(rec_off, Ordering::Release);
        self.record_at(rec_off)
            .ok_or_else(|| anyhow!("corrupt record offset for \"{}\"", name))
    }

    /// Удалить запись. Сначала release-store нуля в prop (отцепить от
    /// читателей), затем занулить байты имени/значения; арена не
    /// освобождается — читатели могут держать старые смещения.
    ///
    /// `prune` дополнительно вычищает опустевшие поддеревья. Это безопасно
    /// только пока ни один читатель не идёт по trie: вызывать prune
    /// одновременно с читателями — ответственность writer-а.
    pub fn remove(&self, name: &str, prune: bool) -> bool {
        if !self.rw() {
            return false;
        }
        let node = match self.traverse(name, false) {
            Some(n) => n,
            None => return false,
        };
        let prop = node.prop().load(Ordering::Acquire);
        if prop == 0 {
            return false;
        }
        let rec = match self.record_at(prop) {
            Some(r) => r,
            None => return false,
        };

        node.prop().store(0, Ordering::Release);

        unsafe {
            if rec.is_long() {
                if let Some(ptr) = rec.long_value_ptr() {
                    let len = libc::strlen(ptr as *const libc::c_char);
                    std::ptr::write_bytes(ptr, 0, len);
                }
            }
            let name_ptr = rec.name_ptr();
            let name_len = libc::strlen(name_ptr as *const libc::c_char);
            std::ptr::write_bytes(name_ptr, 0, name_len);
            std::ptr::write_bytes(rec.as_ptr() as *mut u8, 0, REC_OFF_NAME);
        }

        if prune {
            if let Some(root) = self.root_node() {
                self.prune_trie(root);
            }
        }
        true
    }

    /// Post-order DFS: отцепить детей, чьё поддерево опустело; вернуть true,
    /// если сам узел стал пустым листом (родитель отцепит и его).
    fn prune_trie(&self, node: Node) -> bool {
        let mut is_leaf = true;
        for link in [node.children(), node.left(), node.right()] {
            let off = link.load(Ordering::Relaxed);
            if off == 0 {
                continue;
            }
            match self.node_at(off) {
                Some(child) if self.prune_trie(child) => link.store(0, Ordering::Release),
                _ => is_leaf = false,
            }
        }
        if is_leaf && node.prop().load(Ordering::Relaxed) == 0 {
            let namelen = node.namelen();
            unsafe {
                std::ptr::write_bytes(node.ptr.add(NODE_OFF_NAME), 0, namelen);
                std::ptr::write_bytes(node.ptr, 0, NODE_OFF_NAME);
            }
            return true;
        }
        false
    }

    /// Обход всех записей области: left, свой prop, children, right.
    ///
    /// Глубина и фан-аут BST произвольные, поэтому явный стек вместо
    /// рекурсии. Снапшот не гарантируется: конкурентные вставки читатель
    /// увидит частично, в согласованном на момент загрузки смещения виде.
    pub fn foreach(&self, f: &mut dyn FnMut(RecordRef)) {
        let root = match self.root_node() {
            Some(r) => r,
            None => return,
        };
        // Фазы: 0 — зайти слева, 1 — отдать prop и пойти в children,
        // 2 — пойти вправо.
        let mut stack: Vec<(Node, u8)> = vec![(root, 0)];
        while let Some((node, phase)) = stack.pop() {
            match phase {
                0 => {
                    stack.push((node, 1));
                    let left = node.left().load(Ordering::Acquire);
                    if left != 0 {
                        if let Some(child) = self.node_at(left) {
                            stack.push((child, 0));
                        }
                    }
                }
                1 => {
                    let prop = node.prop().load(Ordering::Acquire);
                    if prop != 0 {
                        if let Some(rec) = self.record_at(prop) {
                            f(rec);
                        }
                    }
                    stack.push((node, 2));
                    let children = node.children().load(Ordering::Acquire);
                    if children != 0 {
                        if let Some(child) = self.node_at(children) {
                            stack.push((child, 0));
                        }
                    }
                }
                _ => {
                    let right = node.right().load(Ordering::Acquire);
                    if right != 0 {
                        if let Some(child) = self.node_at(right) {
                            stack.push((child, 0));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_order_is_length_then_lex() {
        // Короткое имя всегда раньше длинного, независимо от байтов.
        assert_eq!(cmp_segment(b"z", b"aa"), CmpOrdering::Less);
        assert_eq!(cmp_segment(b"aa", b"z"), CmpOrdering::Greater);
        assert_eq!(cmp_segment(b"abc", b"abd"), CmpOrdering::Less);
        assert_eq!(cmp_segment(b"abc", b"abc"), CmpOrdering::Equal);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_property_name("a.b.c"));
        assert!(is_valid_property_name("ro.build.fingerprint"));
        assert!(is_valid_property_name("x"));
        assert!(!is_valid_property_name(""));
        assert!(!is_valid_property_name(".x"));
        assert!(!is_valid_property_name("x."));
        assert!(!is_valid_property_name("a..b"));
        assert!(!is_valid_property_name("a b"));
        assert!(!is_valid_property_name("пример"));
        // Сегмент длиннее 31 байта не лезет в узел.
        let long_seg = "a".repeat(SEGMENT_NAME_MAX + 1);
        assert!(!is_valid_property_name(&long_seg));
        assert!(is_valid_property_name(&"a".repeat(SEGMENT_NAME_MAX)));
    }
}
