//! Info-файл: прекомпилированный read-only trie маршрутизации
//! имя -> (context_index, type_index).
//!
//! Формат описан в src/consts.rs. Файл мапится только на чтение; все
//! смещения — u32 LE от начала файла, строки — NUL-терминированные в общем
//! пуле. Массивы contexts/types отсортированы лексикографически (binary
//! search при сборке), дети узла отсортированы по имени (binary search при
//! lookup). Обратите внимание: это обычная лексикографика, в отличие от
//! (длина, лексикографика) в мутабельном trie областей — оба порядка
//! зафиксированы форматами.
//!
//! Здесь же живёт сериализатор: инсталляции прекомпилируют файл из того же
//! текстового описания контекстов, тесты фабрикуют свои.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::{Mmap, MmapOptions};

use crate::consts::{
    INFO_ENTRY_SIZE, INFO_HEADER_SIZE, INFO_MIN_SUPPORTED_VERSION, INFO_NODE_SIZE,
    INFO_OFF_CONTEXTS, INFO_OFF_MIN_VERSION, INFO_OFF_NUM_CONTEXTS, INFO_OFF_NUM_TYPES,
    INFO_OFF_ROOT, INFO_OFF_SIZE, INFO_OFF_STRINGS, INFO_OFF_TYPES, INFO_OFF_VERSION,
    INFO_VERSION, NO_INDEX,
};

// Поля узла (индексы u32 от начала узла).
const NODE_NAME: usize = 0;
const NODE_CONTEXT: usize = 1;
const NODE_TYPE: usize = 2;
const NODE_NUM_CHILDREN: usize = 3;
const NODE_CHILDREN: usize = 4;
const NODE_NUM_PREFIXES: usize = 5;
const NODE_PREFIXES: usize = 6;
const NODE_NUM_EXACT: usize = 7;
const NODE_EXACT: usize = 8;

// Поля prefix/exact-записи.
const ENTRY_NAME: usize = 0;
const ENTRY_NAMELEN: usize = 1;
const ENTRY_CONTEXT: usize = 2;
const ENTRY_TYPE: usize = 3;

/// Замапленный info-файл.
pub struct InfoFile {
    _map: Mmap,
    base: *const u8,
    size: usize,
}

// SAFETY: файл read-only, парсер не пишет; каждый доступ через u32_at /
// c_string_at проверяет границы.
unsafe impl Send for InfoFile {}
unsafe impl Sync for InfoFile {}

impl InfoFile {
    pub fn load(path: &Path) -> Result<InfoFile> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("open property info file {}", path.display()))?;
        let meta = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?;
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
        if size < INFO_HEADER_SIZE {
            bail!("{}: too small for info header ({})", path.display(), size);
        }

        let map = unsafe { MmapOptions::new().len(size).map(&file) }
            .with_context(|| format!("mmap {}", path.display()))?;
        let base = map.as_ptr();
        let info = InfoFile {
            _map: map,
            base,
            size,
        };

        let min_version = info.u32_at(INFO_OFF_MIN_VERSION).unwrap_or(u32::MAX);
        if min_version > INFO_MIN_SUPPORTED_VERSION {
            bail!(
                "{}: minimum supported version {} is newer than this parser",
                path.display(),
                min_version
            );
        }
        if info.u32_at(INFO_OFF_SIZE) != Some(size as u32) {
            bail!("{}: header size does not match file size", path.display());
        }
        Ok(info)
    }

    #[inline]
    fn u32_at(&self, off: usize) -> Option<u32> {
        if off + 4 > self.size {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(self.base.add(off), 4) };
        Some(LittleEndian::read_u32(bytes))
    }

    /// NUL-терминированная строка из пула; None, если смещение бьёт мимо
    /// файла или терминатора нет.
    fn c_string_at(&self, off: u32) -> Option<&str> {
        let off = off as usize;
        if off >= self.size {
            return None;
        }
        let region = unsafe { std::slice::from_raw_parts(self.base.add(off), self.size - off) };
        let nul = region.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&region[..nul]).ok()
    }

    pub fn version(&self) -> u32 {
        self.u32_at(INFO_OFF_VERSION).unwrap_or(0)
    }

    pub fn num_contexts(&self) -> u32 {
        self.u32_at(INFO_OFF_NUM_CONTEXTS).unwrap_or(0)
    }

    pub fn num_types(&self) -> u32 {
        self.u32_at(INFO_OFF_NUM_TYPES).unwrap_or(0)
    }

    fn string_array_at(&self, array_off: usize, index: u32) -> Option<&str> {
        let base = self.u32_at(array_off)? as usize;
        let off = self.u32_at(base + (index as usize) * 4)?;
        self.c_string_at(off)
    }

    pub fn context(&self, index: u32) -> Option<&str> {
        if index >= self.num_contexts() {
            return None;
        }
        self.string_array_at(INFO_OFF_CONTEXTS, index)
    }

    pub fn type_name(&self, index: u32) -> Option<&str> {
        if index >= self.num_types() {
            return None;
        }
        self.string_array_at(INFO_OFF_TYPES, index)
    }

    // ---- lookup ----

    #[inline]
    fn node_field(&self, node_off: u32, field: usize) -> Option<u32> {
        self.u32_at(node_off as usize + field * 4)
    }

    fn node_name(&self, node_off: u32) -> Option<&str> {
        self.c_string_at(self.node_field(node_off, NODE_NAME)?)
    }

    /// Просканировать список префиксов узла; первый совпавший побеждает и
    /// завершает скан (префиксы — самый точный матч своего уровня).
    fn check_prefix_match(&self, node_off: u32, remaining: &str, ctx: &mut u32, ty: &mut u32) {
        let num = self.node_field(node_off, NODE_NUM_PREFIXES).unwrap_or(0);
        let Some(array) = self.node_field(node_off, NODE_PREFIXES) else {
            return;
        };
        for i in 0..num {
            let entry = array as usize + (i as usize) * INFO_ENTRY_SIZE;
            let Some(namelen) = self.u32_at(entry + ENTRY_NAMELEN * 4) else {
                continue;
            };
            let namelen = namelen as usize;
            if namelen > remaining.len() {
                continue;
            }
            let Some(name_off) = self.u32_at(entry + ENTRY_NAME * 4) else {
                continue;
            };
            let Some(prefix) = self.c_string_at(name_off) else {
                continue;
            };
            if prefix.len() == namelen && &remaining.as_bytes()[..namelen] == prefix.as_bytes() {
                if let Some(c) = self.u32_at(entry + ENTRY_CONTEXT * 4) {
                    if c != NO_INDEX {
                        *ctx = c;
                    }
                }
                if let Some(t) = self.u32_at(entry + ENTRY_TYPE * 4) {
                    if t != NO_INDEX {
                        *ty = t;
                    }
                }
                return;
            }
        }
    }

    /// Binary search ребёнка по сегменту. Сравнение как strncmp по длине
    /// сегмента с пост-проверкой, что имя ребёнка на этом и кончается:
    /// совпавший префикс более длинного имени трактуется как "больше",
    /// чтобы поиск ушёл к настоящему совпадению слева.
    fn find_child(&self, node_off: u32, segment: &str) -> Option<u32> {
        let num = self.node_field(node_off, NODE_NUM_CHILDREN)?;
        let array = self.node_field(node_off, NODE_CHILDREN)?;
        let seg = segment.as_bytes();

        let mut bottom: i64 = 0;
        let mut top: i64 = num as i64 - 1;
        while top >= bottom {
            let mid = (top + bottom) / 2;
            let child_off = self.u32_at(array as usize + mid as usize * 4)?;
            let name = self.node_name(child_off)?.as_bytes();

            let mut cmp = std::cmp::Ordering::Equal;
            for i in 0..seg.len() {
                let c = name.get(i).copied().unwrap_or(0);
                match c.cmp(&seg[i]) {
                    std::cmp::Ordering::Equal => continue,
                    other => {
                        cmp = other;
                        break;
                    }
                }
            }
            if cmp == std::cmp::Ordering::Equal && name.len() > seg.len() {
                cmp = std::cmp::Ordering::Greater;
            }
            match cmp {
                std::cmp::Ordering::Equal => return Some(child_off),
                std::cmp::Ordering::Less => bottom = mid + 1,
                std::cmp::Ordering::Greater => top = mid - 1,
            }
        }
        None
    }

    /// Основной lookup: (context_index, type_index); NO_INDEX = не найдено.
    pub fn get_property_info_indexes(&self, name: &str) -> (u32, u32) {
        let mut ctx = NO_INDEX;
        let mut ty = NO_INDEX;
        let Some(root) = self.u32_at(INFO_OFF_ROOT) else {
            return (ctx, ty);
        };

        let mut node = root;
        let mut remaining = name;
        loop {
            // Значение самого узла — самый грубый матч этого уровня.
            if let Some(c) = self.node_field(node, NODE_CONTEXT) {
                if c != NO_INDEX {
                    ctx = c;
                }
            }
            if let Some(t) = self.node_field(node, NODE_TYPE) {
                if t != NO_INDEX {
                    ty = t;
                }
            }
            // Префиксы по определению длиннее пути узла — проверяются после.
            self.check_prefix_match(node, remaining, &mut ctx, &mut ty);

            let Some(dot) = remaining.find('.') else {
                break;
            };
            match self.find_child(node, &remaining[..dot]) {
                Some(child) => {
                    node = child;
                    remaining = &remaining[dot + 1..];
                }
                None => break,
            }
        }

        // Терминальный узел: точные совпадения сильнее накопленных префиксов;
        // NO_INDEX в записи означает "взять накопленное".
        let num_exact = self.node_field(node, NODE_NUM_EXACT).unwrap_or(0);
        if let Some(array) = self.node_field(node, NODE_EXACT) {
            for i in 0..num_exact {
                let entry = array as usize + (i as usize) * INFO_ENTRY_SIZE;
                let Some(name_off) = self.u32_at(entry + ENTRY_NAME * 4) else {
                    continue;
                };
                if self.c_string_at(name_off) == Some(remaining) {
                    let ec = self.u32_at(entry + ENTRY_CONTEXT * 4).unwrap_or(NO_INDEX);
                    let et = self.u32_at(entry + ENTRY_TYPE * 4).unwrap_or(NO_INDEX);
                    return (
                        if ec != NO_INDEX { ec } else { ctx },
                        if et != NO_INDEX { et } else { ty },
                    );
                }
            }
        }
        self.check_prefix_match(node, remaining, &mut ctx, &mut ty);
        (ctx, ty)
    }

    pub fn get_property_info(&self, name: &str) -> (Option<&str>, Option<&str>) {
        let (ctx, ty) = self.get_property_info_indexes(name);
        let context = if ctx == NO_INDEX { None } else { self.context(ctx) };
        let type_name = if ty == NO_INDEX { None } else { self.type_name(ty) };
        (context, type_name)
    }
}

// -------- serializer --------

/// Одна строка описания: имя (или префикс, или `*`), контекст, тип,
/// точный ли матч.
#[derive(Debug, Clone)]
pub struct PropertyInfoEntry {
    pub name: String,
    pub context: String,
    pub type_name: String,
    pub exact: bool,
}

struct BuildNode {
    context: u32,
    type_index: u32,
    children: BTreeMap<String, BuildNode>,
    prefixes: Vec<(String, u32, u32)>,
    exacts: Vec<(String, u32, u32)>,
}

impl BuildNode {
    fn new() -> BuildNode {
        BuildNode {
            context: NO_INDEX,
            type_index: NO_INDEX,
            children: BTreeMap::new(),
            prefixes: Vec::new(),
            exacts: Vec::new(),
        }
    }
}

struct StringPool {
    bytes: Vec<u8>,
    offsets: BTreeMap<String, u32>,
}

impl StringPool {
    fn new() -> StringPool {
        StringPool {
            bytes: Vec::new(),
            offsets: BTreeMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(off) = self.offsets.get(s) {
            return *off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(s.to_string(), off);
        off
    }
}

/// Собрать байты info-файла из записей описания.
///
/// Контексты и типы дедуплицируются и сортируются (binary search на этапе
/// назначения индексов и потом у любого потребителя массивов); дети узлов
/// сортируются по имени. `*` превращается в пустой префикс на корне и
/// матчит любое имя.
pub fn build_info_file(entries: &[PropertyInfoEntry]) -> Result<Vec<u8>> {
    let mut contexts: Vec<String> = entries.iter().map(|e| e.context.clone()).collect();
    contexts.sort();
    contexts.dedup();
    let mut types: Vec<String> = entries.iter().map(|e| e.type_name.clone()).collect();
    types.sort();
    types.dedup();

    let mut root = BuildNode::new();
    for entry in entries {
        if entry.name.is_empty() {
            bail!("empty property name in info entry");
        }
        let ctx = contexts
            .binary_search(&entry.context)
            .map_err(|_| anyhow!("context \"{}\" was not interned", entry.context))?
            as u32;
        let ty = types
            .binary_search(&entry.type_name)
            .map_err(|_| anyhow!("type \"{}\" was not interned", entry.type_name))?
            as u32;

        if entry.name == "*" {
            root.prefixes.push((String::new(), ctx, ty));
            continue;
        }

        if let Some(path) = entry.name.strip_suffix('.') {
            // Имя из одних полных сегментов: значение вешается на узел.
            let mut node = &mut root;
            for seg in path.split('.') {
                if seg.is_empty() {
                    bail!("empty segment in info entry \"{}\"", entry.name);
                }
                node = node.children.entry(seg.to_string()).or_insert_with(BuildNode::new);
            }
            node.context = ctx;
            node.type_index = ty;
        } else {
            let mut segs: Vec<&str> = entry.name.split('.').collect();
            let Some(last) = segs.pop() else {
                bail!("empty property name in info entry");
            };
            if last.is_empty() || segs.iter().any(|s| s.is_empty()) {
                bail!("empty segment in info entry \"{}\"", entry.name);
            }
            let mut node = &mut root;
            for seg in segs {
                node = node.children.entry(seg.to_string()).or_insert_with(BuildNode::new);
            }
            if entry.exact {
                node.exacts.push((last.to_string(), ctx, ty));
            } else {
                node.prefixes.push((last.to_string(), ctx, ty));
            }
        }
    }

    // Пул строк собирается заранее: он лежит сразу за заголовком, и все
    // name_offset финальны ещё до сериализации узлов.
    let mut pool = StringPool::new();
    for c in &contexts {
        pool.intern(c);
    }
    for t in &types {
        pool.intern(t);
    }
    intern_node_strings(&mut pool, &root, "");

    let mut out: Vec<u8> = Vec::new();
    out.resize(INFO_HEADER_SIZE, 0);
    let strings_offset = out.len() as u32;
    out.extend_from_slice(&pool.bytes);
    while out.len() % 4 != 0 {
        out.push(0);
    }

    let contexts_offset = out.len() as u32;
    for c in &contexts {
        let off = strings_offset + pool.offsets[c.as_str()];
        out.write_u32::<LittleEndian>(off)?;
    }
    let types_offset = out.len() as u32;
    for t in &types {
        let off = strings_offset + pool.offsets[t.as_str()];
        out.write_u32::<LittleEndian>(off)?;
    }

    let root_offset = serialize_node(&mut out, strings_offset, &pool, &root, "")?;

    let size = out.len() as u32;
    patch_u32(&mut out, INFO_OFF_VERSION, INFO_VERSION);
    patch_u32(&mut out, INFO_OFF_MIN_VERSION, INFO_MIN_SUPPORTED_VERSION);
    patch_u32(&mut out, INFO_OFF_SIZE, size);
    patch_u32(&mut out, INFO_OFF_CONTEXTS, contexts_offset);
    patch_u32(&mut out, INFO_OFF_TYPES, types_offset);
    patch_u32(&mut out, INFO_OFF_ROOT, root_offset);
    patch_u32(&mut out, INFO_OFF_STRINGS, strings_offset);
    patch_u32(&mut out, INFO_OFF_NUM_CONTEXTS, contexts.len() as u32);
    patch_u32(&mut out, INFO_OFF_NUM_TYPES, types.len() as u32);
    Ok(out)
}

fn intern_node_strings(pool: &mut StringPool, node: &BuildNode, name: &str) {
    pool.intern(name);
    for (p, _, _) in &node.prefixes {
        pool.intern(p);
    }
    for (e, _, _) in &node.exacts {
        pool.intern(e);
    }
    for (child_name, child) in &node.children {
        intern_node_strings(pool, child, child_name);
    }
}

/// Дети пишутся раньше родителя, их смещения уже известны к моменту записи
/// массива; корень уходит в файл последним.
fn serialize_node(
    out: &mut Vec<u8>,
    strings_offset: u32,
    pool: &StringPool,
    node: &BuildNode,
    name: &str,
) -> Result<u32> {
    let mut child_offsets = Vec::with_capacity(node.children.len());
    for (child_name, child) in &node.children {
        child_offsets.push(serialize_node(out, strings_offset, pool, child, child_name)?);
    }

    let children_array = out.len() as u32;
    for off in &child_offsets {
        out.write_u32::<LittleEndian>(*off)?;
    }

    let prefixes_array = out.len() as u32;
    for (p, ctx, ty) in &node.prefixes {
        out.write_u32::<LittleEndian>(strings_offset + pool.offsets[p.as_str()])?;
        out.write_u32::<LittleEndian>(p.len() as u32)?;
        out.write_u32::<LittleEndian>(*ctx)?;
        out.write_u32::<LittleEndian>(*ty)?;
    }

    let exacts_array = out.len() as u32;
    for (e, ctx, ty) in &node.exacts {
        out.write_u32::<LittleEndian>(strings_offset + pool.offsets[e.as_str()])?;
        out.write_u32::<LittleEndian>(e.len() as u32)?;
        out.write_u32::<LittleEndian>(*ctx)?;
        out.write_u32::<LittleEndian>(*ty)?;
    }

    let node_offset = out.len() as u32;
    out.write_u32::<LittleEndian>(strings_offset + pool.offsets[name])?;
    out.write_u32::<LittleEndian>(node.context)?;
    out.write_u32::<LittleEndian>(node.type_index)?;
    out.write_u32::<LittleEndian>(node.children.len() as u32)?;
    out.write_u32::<LittleEndian>(children_array)?;
    out.write_u32::<LittleEndian>(node.prefixes.len() as u32)?;
    out.write_u32::<LittleEndian>(prefixes_array)?;
    out.write_u32::<LittleEndian>(node.exacts.len() as u32)?;
    out.write_u32::<LittleEndian>(exacts_array)?;
    debug_assert_eq!(out.len() as u32, node_offset + INFO_NODE_SIZE as u32);
    Ok(node_offset)
}

fn patch_u32(out: &mut [u8], off: usize, value: u32) {
    out[off..off + 4].copy_from_slice(&value.to_le_bytes());
}
