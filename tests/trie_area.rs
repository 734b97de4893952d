// tests/trie_area.rs
//
// Уровень области: trie, обход, удаление с prune, переполнение арены.

use std::path::PathBuf;

use anyhow::Result;

use propstore::consts::{PA_SIZE_DEFAULT, PROP_VALUE_MAX};
use propstore::PropArea;

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("propstore-trie-{}-{}-{}", prefix, pid, t))
}

fn new_area(prefix: &str, size: usize) -> Result<(PropArea, PathBuf)> {
    let path = unique_path(prefix);
    let mut xf = false;
    let pa = PropArea::create_rw(&path, size, None, &mut xf)?;
    Ok((pa, path))
}

fn collect_names(pa: &PropArea) -> Vec<String> {
    let mut names = Vec::new();
    pa.foreach(&mut |rec| names.push(rec.name().to_string()));
    names
}

#[test]
fn foreach_walks_in_bst_order() -> Result<()> {
    let (pa, _path) = new_area("order", PA_SIZE_DEFAULT)?;
    // Вставка вразнобой; порядок обхода уровня — (длина, лексикографика).
    for name in ["bb", "a", "ccc", "ab", "z"] {
        pa.add(name, "v")?;
    }
    assert_eq!(collect_names(&pa), vec!["a", "z", "ab", "bb", "ccc"]);
    Ok(())
}

#[test]
fn nested_names_share_path_nodes() -> Result<()> {
    let (pa, _path) = new_area("nested", PA_SIZE_DEFAULT)?;
    pa.add("net.dns1", "8.8.8.8")?;
    pa.add("net.dns2", "1.1.1.1")?;
    pa.add("net", "up")?;

    assert!(pa.find("net").is_some());
    assert!(pa.find("net.dns1").is_some());
    assert!(pa.find("net.dns2").is_some());
    // Промежуточный узел без записи — не промах всего пути.
    pa.add("a.b.c.d", "deep")?;
    assert!(pa.find("a.b").is_none(), "path node without a record");
    assert!(pa.find("a.b.c.d").is_some());
    Ok(())
}

#[test]
fn bytes_used_is_monotonic_and_bounded() -> Result<()> {
    let (pa, _path) = new_area("monotonic", PA_SIZE_DEFAULT)?;
    let mut last = pa.bytes_used();
    for i in 0..50 {
        pa.add(&format!("key.number{}", i), "value")?;
        let used = pa.bytes_used();
        assert!(used >= last, "bytes_used must never shrink");
        assert!(
            used as usize <= pa.data_size(),
            "bytes_used must stay within the arena"
        );
        last = used;
    }
    // Удаление не возвращает байты арене.
    assert!(pa.remove("key.number0", false));
    assert_eq!(pa.bytes_used(), last);
    Ok(())
}

#[test]
fn remove_detaches_and_zeroes() -> Result<()> {
    let (pa, _path) = new_area("remove", PA_SIZE_DEFAULT)?;
    pa.add("gone.soon", "bye")?;
    let rec = pa.find("gone.soon").unwrap();

    assert!(pa.remove("gone.soon", false));
    assert!(pa.find("gone.soon").is_none());
    // Байты записи занулены: стереотипный читатель со старым хэндлом видит
    // пустую строку, не мусор.
    assert_eq!(rec.name(), "");
    assert!(!pa.remove("gone.soon", false), "double remove is a miss");
    Ok(())
}

#[test]
fn prune_clears_empty_subtrees() -> Result<()> {
    let (pa, _path) = new_area("prune", PA_SIZE_DEFAULT)?;
    pa.add("a.b", "v")?;
    assert!(pa.remove("a.b", true));
    pa.add("a.c", "w")?;

    // Ровно одна запись; от ветки "b" не осталось достижимых узлов.
    assert_eq!(collect_names(&pa), vec!["a.c"]);
    assert!(pa.find("a.b").is_none());
    assert_eq!(pa.find("a.c").unwrap().name(), "a.c");
    Ok(())
}

#[test]
fn prune_keeps_subtrees_with_records() -> Result<()> {
    let (pa, _path) = new_area("prune-keep", PA_SIZE_DEFAULT)?;
    pa.add("x.y.z", "deep")?;
    pa.add("x.y", "mid")?;
    assert!(pa.remove("x.y.z", true));
    // Узел x.y несёт запись — его поддерево живо.
    assert_eq!(collect_names(&pa), vec!["x.y"]);
    assert_eq!(pa.find("x.y").unwrap().name(), "x.y");
    Ok(())
}

#[test]
fn arena_exhaustion_is_an_error_not_corruption() -> Result<()> {
    let (pa, _path) = new_area("exhaust", 8192)?;
    let value = "v".repeat(PROP_VALUE_MAX - 1);
    let mut added = Vec::new();
    let mut failed = false;
    for i in 0..200 {
        let name = format!("fill.key{:03}", i);
        match pa.add(&name, &value) {
            Ok(_) => added.push(name),
            Err(_) => {
                failed = true;
                break;
            }
        }
    }
    assert!(failed, "8 KiB arena must fill up");
    assert!(!added.is_empty());
    // Даже упёршись, арена не вылезает за свои границы.
    assert!(pa.bytes_used() as usize <= pa.data_size());
    // Всё, что успело добавиться, читается.
    for name in &added {
        assert!(pa.find(name).is_some(), "{} must survive exhaustion", name);
    }
    Ok(())
}

#[test]
fn readonly_mapping_refuses_mutations() -> Result<()> {
    let (pa, path) = new_area("ro", PA_SIZE_DEFAULT)?;
    pa.add("fixed.name", "1")?;
    drop(pa);

    let ro = PropArea::open_ro(&path)?;
    assert!(!ro.rw());
    assert_eq!(ro.find("fixed.name").unwrap().name(), "fixed.name");
    assert!(ro.add("new.name", "2").is_err());
    assert!(!ro.remove("fixed.name", false));
    Ok(())
}
