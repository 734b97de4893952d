//! Фасад стора: роутер + глобальный serial + операции над записями.
//!
//! Читательский экземпляр (`Store::open`) мапит области read-only и ничем
//! не блокируется; writer (`Store::area_init`) создаёт области, держит
//! эксклюзивный файловый lock и после каждой мутации бампает глобальный
//! serial с futex-пробуждением ждущих.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{debug, error, warn};

use crate::area::PropArea;
use crate::config::StoreConfig;
use crate::consts::{serial_value_len, PROP_NAME_MAX, PROP_VALUE_MAX, RO_PREFIX};
use crate::contexts::{Contexts, IndexedContexts, PreSplitContexts, SplitContexts};
use crate::futex::{futex_wait, futex_wake_all, FutexWait};
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::record::RecordRef;

pub struct Store {
    contexts: Box<dyn Contexts>,
    _lock: Option<LockGuard>,
}

#[inline]
fn is_read_only(name: &str) -> bool {
    name.starts_with(RO_PREFIX)
}

impl Store {
    /// Открыть существующий стор (читатель; RW достаётся тому, кому его
    /// отдаст файловая система, то есть root-у).
    ///
    /// Выбор роутера: путь-файл — pre-split; каталог с читаемым info-файлом —
    /// indexed; иначе split по текстовым конфигам.
    pub fn open(cfg: &StoreConfig) -> Result<Store> {
        cfg.validate()?;
        let contexts: Box<dyn Contexts> = if cfg.dir.is_file() {
            Box::new(PreSplitContexts::initialize(&cfg.dir)?)
        } else {
            let info_path = cfg.info_file_path();
            if info_path.is_file() {
                Box::new(IndexedContexts::initialize(
                    false,
                    &cfg.dir,
                    &info_path,
                    cfg.area_size,
                    None,
                )?)
            } else {
                Box::new(SplitContexts::initialize(
                    false,
                    &cfg.dir,
                    &cfg.contexts_files,
                    cfg.area_size,
                    None,
                )?)
            }
        };
        Ok(Store {
            contexts,
            _lock: None,
        })
    }

    /// Создать области и открыть стор writer-ом (единожды при старте
    /// системы). Требует, чтобы файлов областей ещё не было; второй писатель
    /// отлетает на файловом lock-е. Неудача xattr-метки не фатальна и
    /// репортится через `xattr_failed`.
    pub fn area_init(cfg: &StoreConfig, xattr_failed: &mut bool) -> Result<Store> {
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.dir)?;
        let lock = try_acquire_exclusive_lock(&cfg.dir)?;
        debug!("writer lock held at {}", lock.path().display());

        *xattr_failed = false;
        let info_path = cfg.info_file_path();
        let contexts: Box<dyn Contexts> = if info_path.is_file() {
            Box::new(IndexedContexts::initialize(
                true,
                &cfg.dir,
                &info_path,
                cfg.area_size,
                Some(xattr_failed),
            )?)
        } else {
            Box::new(SplitContexts::initialize(
                true,
                &cfg.dir,
                &cfg.contexts_files,
                cfg.area_size,
                Some(xattr_failed),
            )?)
        };
        Ok(Store {
            contexts,
            _lock: Some(lock),
        })
    }

    pub fn rw(&self) -> bool {
        self.contexts.rw()
    }

    /// Текущее значение глобального serial (растёт на каждой мутации).
    pub fn area_serial(&self) -> Result<u32> {
        let pa = self
            .contexts
            .serial_area()
            .ok_or_else(|| anyhow!("store has no serial area"))?;
        Ok(pa.serial().load(Ordering::Acquire))
    }

    /// Найти запись. Промах и отказ в маршрутизации неразличимы для
    /// вызывающего; отказ дополнительно логируется.
    pub fn find(&self, name: &str) -> Option<RecordRef> {
        match self.contexts.get_prop_area(name) {
            Some(pa) => pa.find(name),
            None => {
                warn!("access denied finding property \"{}\"", name);
                None
            }
        }
    }

    /// Прочитать значение по имени. Отсутствие имени неотличимо от пустого
    /// значения — так задумано.
    pub fn get(&self, name: &str) -> String {
        match self.find(name) {
            Some(rec) => self.read(rec, None).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Seqlock-чтение записи. `name_out` (если задан) получает имя,
    /// обрезанное по легаси-лимиту с предупреждением: такие имена надо
    /// читать через `read_callback`.
    pub fn read(&self, rec: RecordRef, name_out: Option<&mut String>) -> Result<String> {
        let pa = self
            .contexts
            .get_prop_area(rec.name())
            .ok_or_else(|| anyhow!("could not find area for \"{}\"", rec.name()))?;

        let mut buf = [0u8; PROP_VALUE_MAX];
        let serial = pa.read_record(rec, &mut buf);
        let len = serial_value_len(serial).min(PROP_VALUE_MAX - 1);

        if let Some(out) = name_out {
            let name = rec.name();
            out.clear();
            if name.len() >= PROP_NAME_MAX {
                error!(
                    "property name \"{}\" is >= {} and was truncated; use read_callback",
                    name, PROP_NAME_MAX
                );
                out.push_str(&name[..PROP_NAME_MAX - 1]);
            } else {
                out.push_str(name);
            }
        }
        if is_read_only(rec.name()) && rec.is_long() {
            error!(
                "property \"{}\" has a long value; get/read return a diagnostic, use read_callback",
                rec.name()
            );
        }
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    /// Чтение с доставкой байтов значения напрямую. Для `ro.`-имён seqlock
    /// не нужен (значение не меняется никогда) — коллбек получает указатель
    /// в область, включая полные long-значения; прочие имена копируются под
    /// seqlock в стековый буфер.
    pub fn read_callback<R>(&self, rec: RecordRef, f: impl FnOnce(&str, &[u8], u32) -> R) -> Result<R> {
        if is_read_only(rec.name()) {
            let serial = rec.serial();
            if let Some(long) = rec.long_value() {
                return Ok(f(rec.name(), long, serial));
            }
            return Ok(f(rec.name(), rec.inline_value_bytes(), serial));
        }

        let pa = self
            .contexts
            .get_prop_area(rec.name())
            .ok_or_else(|| anyhow!("could not find area for \"{}\"", rec.name()))?;
        let mut buf = [0u8; PROP_VALUE_MAX];
        let serial = pa.read_record(rec, &mut buf);
        let len = serial_value_len(serial).min(PROP_VALUE_MAX - 1);
        Ok(f(rec.name(), &buf[..len], serial))
    }

    /// Обновить существующую запись (writer-only, короткие значения).
    pub fn update(&self, rec: RecordRef, value: &str) -> Result<()> {
        if value.len() >= PROP_VALUE_MAX {
            bail!(
                "value too long for \"{}\": {} >= {}",
                rec.name(),
                value.len(),
                PROP_VALUE_MAX
            );
        }
        if !self.contexts.rw() {
            bail!("store is read-only");
        }
        let serial_pa = self
            .contexts
            .serial_area()
            .ok_or_else(|| anyhow!("store has no serial area"))?;
        let pa = self.contexts.get_prop_area(rec.name()).ok_or_else(|| {
            error!("could not find area for \"{}\"", rec.name());
            anyhow!("could not find area for \"{}\"", rec.name())
        })?;

        pa.update_record(rec, value)?;
        Self::bump_serial(serial_pa);
        Ok(())
    }

    /// Добавить запись (writer-only). Значения длиной >= value max разрешены
    /// только `ro.`-именам (иммутабельные long-записи).
    pub fn add(&self, name: &str, value: &str) -> Result<()> {
        if value.len() >= PROP_VALUE_MAX && !is_read_only(name) {
            bail!(
                "value too long for \"{}\": {} >= {}",
                name,
                value.len(),
                PROP_VALUE_MAX
            );
        }
        if name.is_empty() {
            bail!("empty property name");
        }
        if !self.contexts.rw() {
            bail!("store is read-only");
        }
        let serial_pa = self
            .contexts
            .serial_area()
            .ok_or_else(|| anyhow!("store has no serial area"))?;
        let pa = self.contexts.get_prop_area(name).ok_or_else(|| {
            error!("access denied adding property \"{}\"", name);
            anyhow!("access denied adding property \"{}\"", name)
        })?;

        pa.add(name, value)?;
        Self::bump_serial(serial_pa);
        Ok(())
    }

    /// Удалить запись (writer-only). `prune` дополнительно вычищает
    /// опустевшие поддеревья — звать только пока читатели не ходят по trie.
    pub fn delete(&self, name: &str, prune: bool) -> Result<()> {
        if !self.contexts.rw() {
            bail!("store is read-only");
        }
        let serial_pa = self
            .contexts
            .serial_area()
            .ok_or_else(|| anyhow!("store has no serial area"))?;
        let pa = self.contexts.get_prop_area(name).ok_or_else(|| {
            error!("access denied deleting property \"{}\"", name);
            anyhow!("access denied deleting property \"{}\"", name)
        })?;

        if !pa.remove(name, prune) {
            bail!("no such property \"{}\"", name);
        }
        Self::bump_serial(serial_pa);
        Ok(())
    }

    fn bump_serial(serial_pa: &PropArea) {
        let word = serial_pa.serial();
        // Мутатор один; release-store делает мутацию видимой каждому, кто
        // увидел новый serial.
        word.store(word.load(Ordering::Relaxed).wrapping_add(1), Ordering::Release);
        futex_wake_all(word);
    }

    /// Тег доступа (контекст) имени.
    pub fn get_context(&self, name: &str) -> Option<&str> {
        self.contexts.get_context(name)
    }

    /// Обход всех записей доступных областей. Снапшота по стору нет:
    /// конкурентные вставки видны частично.
    pub fn foreach(&self, f: &mut dyn FnMut(RecordRef)) {
        self.contexts.for_each(f);
    }

    /// n-я запись в порядке обхода (линейный поиск через foreach).
    pub fn find_nth(&self, n: usize) -> Option<RecordRef> {
        let mut current = 0usize;
        let mut result: Option<RecordRef> = None;
        self.foreach(&mut |rec| {
            if current == n && result.is_none() {
                result = Some(rec);
            }
            current += 1;
        });
        result
    }

    /// Ждать изменения глобального serial относительно `old_serial`.
    pub fn wait_any(&self, old_serial: u32) -> Result<u32> {
        match self.wait(None, old_serial, None)? {
            Some(s) => Ok(s),
            None => unreachable!("wait without timeout cannot time out"),
        }
    }

    /// Ждать изменения serial-слова записи (или глобального, если записи
    /// нет). `Ok(None)` — таймаут, старый serial остаётся в силе.
    pub fn wait(
        &self,
        rec: Option<RecordRef>,
        old_serial: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<u32>> {
        let word: &AtomicU32 = match &rec {
            Some(r) => r.serial_atomic(),
            None => self
                .contexts
                .serial_area()
                .ok_or_else(|| anyhow!("store has no serial area"))?
                .serial(),
        };

        loop {
            if futex_wait(word, old_serial, timeout) == FutexWait::TimedOut {
                return Ok(None);
            }
            let new_serial = word.load(Ordering::Acquire);
            if new_serial != old_serial {
                return Ok(Some(new_serial));
            }
        }
    }

    /// Переоценить доступ ко всем областям (повторная инициализация ничего
    /// не сносит — только это).
    pub fn reset_access(&self) {
        self.contexts.reset_access();
    }
}

/// Удобный конструктор читателя с env-конфигурацией.
pub fn open_store(dir: &Path) -> Result<Store> {
    Store::open(&StoreConfig::from_env(dir))
}
