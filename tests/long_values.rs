// tests/long_values.rs
//
// Long-записи: значение длиннее инлайн-буфера разрешено только ro.-именам,
// легаси-чтение отдаёт диагностику, полный доступ — через read_callback.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;

use propstore::consts::{LONG_LEGACY_ERROR, PROP_VALUE_MAX};
use propstore::{Store, StoreConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("propstore-{}-{}-{}", prefix, pid, t))
}

fn new_store(prefix: &str) -> Result<Store> {
    let root = unique_root(prefix);
    fs::create_dir_all(&root)?;
    fs::write(root.join("property_contexts"), "* ctx_all\n")?;
    let mut xf = false;
    Ok(Store::area_init(&StoreConfig::new(&root), &mut xf)?)
}

#[test]
fn ro_long_value_via_callback() -> Result<()> {
    let store = new_store("ro-long")?;
    let big = "x".repeat(200);
    store.add("ro.big", &big)?;

    // Легаси-путь видит константную диагностику.
    assert_eq!(store.get("ro.big"), LONG_LEGACY_ERROR);

    // Коллбек получает полное значение.
    let rec = store.find("ro.big").unwrap();
    assert!(rec.is_long());
    let got = store.read_callback(rec, |name, value, _serial| {
        assert_eq!(name, "ro.big");
        value.to_vec()
    })?;
    assert_eq!(got, big.as_bytes());
    Ok(())
}

#[test]
fn long_value_refused_for_mutable_names() -> Result<()> {
    let store = new_store("rw-long")?;
    let big = "y".repeat(PROP_VALUE_MAX);
    assert!(
        store.add("sys.too.big", &big).is_err(),
        "non-ro names must reject values >= PROP_VALUE_MAX"
    );
    Ok(())
}

#[test]
fn long_records_never_update() -> Result<()> {
    let store = new_store("long-frozen")?;
    store.add("ro.fingerprint", &"z".repeat(150))?;
    let rec = store.find("ro.fingerprint").unwrap();
    assert!(store.update(rec, "short").is_err());
    Ok(())
}

#[test]
fn boundary_value_is_still_inline() -> Result<()> {
    let store = new_store("boundary")?;
    // PROP_VALUE_MAX - 1 байт + NUL заполняют инлайн-буфер ровно.
    let edge = "e".repeat(PROP_VALUE_MAX - 1);
    store.add("sys.edge", &edge)?;
    let rec = store.find("sys.edge").unwrap();
    assert!(!rec.is_long());
    assert_eq!(store.get("sys.edge"), edge);
    Ok(())
}

#[test]
fn read_callback_copies_mutable_values_consistently() -> Result<()> {
    let store = new_store("cb-mutable")?;
    store.add("svc.mode", "idle")?;
    let rec = store.find("svc.mode").unwrap();
    let (value, serial) = store.read_callback(rec, |_n, v, s| (v.to_vec(), s))?;
    assert_eq!(value, b"idle");
    assert_eq!(serial, rec.serial());
    Ok(())
}
