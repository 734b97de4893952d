//! CLI поверх фасада: инициализация стора, get/set/del/list/watch/serial и
//! компиляция info-файла из текстового описания.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::StoreConfig;
use crate::infofile::{build_info_file, PropertyInfoEntry};
use crate::lock::acquire_exclusive_lock;
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(
    name = "propstore",
    version,
    about = "Shared-memory property registry (one writer, wait-free readers)",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Создать области стора по конфигу контекстов (writer, единожды).
    Init {
        #[arg(long)]
        dir: PathBuf,
        /// Явный путь к property_contexts (по умолчанию <dir>/property_contexts).
        #[arg(long)]
        contexts: Option<PathBuf>,
        #[arg(long)]
        area_size: Option<usize>,
    },
    /// Прочитать значение.
    Get {
        #[arg(long)]
        dir: PathBuf,
        name: String,
    },
    /// Установить значение: update существующей записи, иначе add.
    Set {
        #[arg(long)]
        dir: PathBuf,
        name: String,
        value: String,
    },
    /// Удалить запись.
    Del {
        #[arg(long)]
        dir: PathBuf,
        name: String,
        /// Вычистить опустевшие поддеревья trie.
        #[arg(long, default_value_t = false)]
        prune: bool,
    },
    /// Перечислить все доступные записи.
    List {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Ждать изменений: конкретного имени или любого.
    Watch {
        #[arg(long)]
        dir: PathBuf,
        name: Option<String>,
        /// Таймаут одного ожидания, мс (по умолчанию ждать вечно).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Показать глобальный serial.
    Serial {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Скомпилировать info-файл из текстового описания
    /// `<имя> <контекст> [<тип>] [exact|prefix]`.
    CompileInfo {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
}

#[derive(Serialize)]
struct ListEntry {
    name: String,
    value: String,
    serial: u32,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init {
            dir,
            contexts,
            area_size,
        } => {
            let mut cfg = StoreConfig::from_env(&dir);
            if let Some(path) = contexts {
                cfg.contexts_files = vec![path];
            }
            if let Some(size) = area_size {
                cfg.area_size = size;
            }
            let mut xattr_failed = false;
            let store = Store::area_init(&cfg, &mut xattr_failed)?;
            if xattr_failed {
                log::warn!("area labels were not applied (no xattr support here?)");
            }
            println!("initialized property store at {}", dir.display());
            println!("serial = {}", store.area_serial()?);
            Ok(())
        }

        Cmd::Get { dir, name } => {
            let store = open(&dir)?;
            println!("{}", store.get(&name));
            Ok(())
        }

        Cmd::Set { dir, name, value } => {
            // Мутаторы сериализуются через writer-lock: дождаться очереди,
            // а не отлететь, если кто-то ещё пишет.
            let _lock = acquire_exclusive_lock(&dir)?;
            let store = open(&dir)?;
            if !store.rw() {
                bail!("store at {} is not writable from here", dir.display());
            }
            match store.find(&name) {
                Some(rec) => store.update(rec, &value)?,
                None => store.add(&name, &value)?,
            }
            Ok(())
        }

        Cmd::Del { dir, name, prune } => {
            let _lock = acquire_exclusive_lock(&dir)?;
            let store = open(&dir)?;
            store.delete(&name, prune)
        }

        Cmd::List { dir, json } => {
            let store = open(&dir)?;
            let mut entries: Vec<ListEntry> = Vec::new();
            store.foreach(&mut |rec| {
                let _ = store.read_callback(rec, |name, value, serial| {
                    entries.push(ListEntry {
                        name: name.to_string(),
                        value: String::from_utf8_lossy(value).into_owned(),
                        serial,
                    });
                });
            });
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in &entries {
                    println!("[{}]: [{}]", e.name, e.value);
                }
            }
            Ok(())
        }

        Cmd::Watch {
            dir,
            name,
            timeout_ms,
        } => {
            let store = open(&dir)?;
            let timeout = timeout_ms.map(Duration::from_millis);
            match name {
                Some(name) => {
                    let rec = store
                        .find(&name)
                        .ok_or_else(|| anyhow!("no such property \"{}\"", name))?;
                    let mut serial = rec.serial();
                    loop {
                        match store.wait(Some(rec), serial, timeout)? {
                            Some(new_serial) => {
                                serial = new_serial;
                                let value = store.read(rec, None)?;
                                println!("{} = [{}] (serial {})", name, value, serial);
                            }
                            None => bail!("timed out waiting for \"{}\"", name),
                        }
                    }
                }
                None => {
                    let mut serial = store.area_serial()?;
                    loop {
                        match store.wait(None, serial, timeout)? {
                            Some(new_serial) => {
                                serial = new_serial;
                                println!("store serial -> {}", serial);
                            }
                            None => bail!("timed out waiting for store changes"),
                        }
                    }
                }
            }
        }

        Cmd::Serial { dir } => {
            let store = open(&dir)?;
            println!("{}", store.area_serial()?);
            Ok(())
        }

        Cmd::CompileInfo { input, output } => {
            let text = std::fs::read_to_string(&input)?;
            let entries = parse_info_description(&text)?;
            let bytes = build_info_file(&entries)?;
            std::fs::write(&output, &bytes)?;
            println!(
                "compiled {} entries into {} ({} bytes)",
                entries.len(),
                output.display(),
                bytes.len()
            );
            Ok(())
        }
    }
}

fn open(dir: &std::path::Path) -> Result<Store> {
    Store::open(&StoreConfig::from_env(dir))
}

/// Строка описания: `<имя> <контекст> [<тип>] [exact|prefix]`; `#` —
/// комментарий. Тип по умолчанию — "string", матч по умолчанию — prefix.
fn parse_info_description(text: &str) -> Result<Vec<PropertyInfoEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else { continue };
        if name.starts_with('#') {
            continue;
        }
        let Some(context) = tokens.next() else {
            bail!("line {}: missing context for \"{}\"", lineno + 1, name);
        };

        let mut type_name = "string".to_string();
        let mut exact = false;
        for token in tokens {
            match token {
                "exact" => exact = true,
                "prefix" => exact = false,
                other => type_name = other.to_string(),
            }
        }
        entries.push(PropertyInfoEntry {
            name: name.to_string(),
            context: context.to_string(),
            type_name,
            exact,
        });
    }
    Ok(entries)
}
