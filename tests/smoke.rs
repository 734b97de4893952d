// tests/smoke.rs
//
// Сквозной сценарий split-стора:
// - area_init создаёт области по property_contexts;
// - add/get/update/delete работают и бампают глобальный serial;
// - маршрутизация по самому длинному префиксу, '*' в хвосте;
// - запись физически ложится в область своего тега.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;

use propstore::{PropArea, Store, StoreConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("propstore-{}-{}-{}", prefix, pid, t))
}

fn write_contexts(dir: &PathBuf, text: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("property_contexts"), text).unwrap();
}

#[test]
fn smoke_init_add_get_update_delete() -> Result<()> {
    let root = unique_root("smoke");
    write_contexts(
        &root,
        "# системные свойства\n\
         sys. ctx_sys\n\
         * ctx_default\n",
    );
    let cfg = StoreConfig::new(&root);

    let mut xattr_failed = false;
    let store = Store::area_init(&cfg, &mut xattr_failed)?;
    assert!(store.rw(), "area_init must yield a writable store");

    // 1) add + get, serial растёт ровно на 1
    let s0 = store.area_serial()?;
    store.add("a.b.c", "hello")?;
    assert_eq!(store.get("a.b.c"), "hello");
    let s1 = store.area_serial()?;
    assert_eq!(s1, s0 + 1, "add must bump the global serial by one");

    // 2) update по хэндлу
    let rec = store.find("a.b.c").expect("a.b.c must exist");
    store.update(rec, "world")?;
    assert_eq!(store.get("a.b.c"), "world");
    let s2 = store.area_serial()?;
    assert_eq!(s2, s1 + 1, "update must bump the global serial by one");

    // 3) промах неотличим от пустого значения
    assert_eq!(store.get("no.such.name"), "");

    // 4) delete: значение исчезает, serial бампается
    store.delete("a.b.c", false)?;
    assert_eq!(store.get("a.b.c"), "");
    assert!(store.find("a.b.c").is_none());
    let s3 = store.area_serial()?;
    assert_eq!(s3, s2 + 1);

    // 5) удаление несуществующего — ошибка, serial не трогается
    assert!(store.delete("a.b.c", false).is_err());
    assert_eq!(store.area_serial()?, s3);

    Ok(())
}

#[test]
fn routing_longest_prefix_wins() -> Result<()> {
    let root = unique_root("routing");
    write_contexts(
        &root,
        "persist. ctx_a\n\
         persist.sys. ctx_b\n\
         * ctx_c\n",
    );
    let cfg = StoreConfig::new(&root);

    let mut xf = false;
    let store = Store::area_init(&cfg, &mut xf)?;

    assert_eq!(store.get_context("persist.sys.foo"), Some("ctx_b"));
    assert_eq!(store.get_context("persist.bar"), Some("ctx_a"));
    assert_eq!(store.get_context("other"), Some("ctx_c"));

    store.add("persist.sys.foo", "1")?;
    store.add("persist.bar", "2")?;
    store.add("other", "3")?;
    assert_eq!(store.get("persist.sys.foo"), "1");
    assert_eq!(store.get("persist.bar"), "2");
    assert_eq!(store.get("other"), "3");

    // Запись обязана лежать в файле своего тега, и только в нём.
    let area_b = PropArea::open_ro(&root.join("ctx_b"))?;
    assert!(area_b.find("persist.sys.foo").is_some());
    assert!(area_b.find("persist.bar").is_none());
    let area_a = PropArea::open_ro(&root.join("ctx_a"))?;
    assert!(area_a.find("persist.bar").is_some());
    assert!(area_a.find("persist.sys.foo").is_none());

    Ok(())
}

#[test]
fn reader_store_sees_writer_changes() -> Result<()> {
    let root = unique_root("reader");
    write_contexts(&root, "* ctx_all\n");
    let cfg = StoreConfig::new(&root);

    let mut xf = false;
    let writer = Store::area_init(&cfg, &mut xf)?;
    writer.add("svc.state", "starting")?;

    // Отдельный экземпляр-читатель поверх тех же файлов.
    let reader = Store::open(&cfg)?;
    assert_eq!(reader.get("svc.state"), "starting");

    let rec = writer.find("svc.state").unwrap();
    writer.update(rec, "running")?;
    assert_eq!(reader.get("svc.state"), "running");
    assert_eq!(reader.area_serial()?, writer.area_serial()?);

    Ok(())
}

#[test]
fn second_writer_is_rejected_by_lock() -> Result<()> {
    let root = unique_root("two-writers");
    write_contexts(&root, "* ctx_all\n");
    let cfg = StoreConfig::new(&root);

    let mut xf = false;
    let _writer = Store::area_init(&cfg, &mut xf)?;
    assert!(
        Store::area_init(&cfg, &mut xf).is_err(),
        "second area_init must fail while the first writer is alive"
    );
    Ok(())
}

#[test]
fn invalid_names_are_rejected() -> Result<()> {
    let root = unique_root("badnames");
    write_contexts(&root, "* ctx_all\n");
    let cfg = StoreConfig::new(&root);

    let mut xf = false;
    let store = Store::area_init(&cfg, &mut xf)?;

    for bad in ["", ".x", "x.", "a..b", "a b", "имя"] {
        assert!(store.add(bad, "v").is_err(), "name {:?} must be rejected", bad);
    }
    // Значение с NUL внутри не лезет в C-строку области.
    assert!(store.add("a.b", "v\0v").is_err());
    Ok(())
}
