//! Write buffering with journaled flush points.
//!
//! Writes to tables opened through [`Flushable`] stay in memory until
//! [`Flushable::flush`]. A flush first persists a dirty marker carrying the
//! next flush id, then applies every buffered write and table drop, then
//! records the new flush id and clears the marker. A marker found on open means
//! a flush was interrupted halfway, which is reported as
//! [`StoreError::DirtyFlush`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{Entries, IteratorPool, Producer, Result, StoreError, Table};

/// Key prefix reserved for flush metadata in the `main` table.
pub const FLUSH_PREFIX: &[u8] = b"!flush/";

/// Key holding the id of the latest complete flush.
pub const FLUSH_ID_KEY: &[u8] = b"!flush/id";

const DIRTY_KEY: &[u8] = b"!flush/dirty";

const META_TABLE: &str = "main";

type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

struct FlushableTable {
    inner: Arc<dyn Table>,
    overlay: Mutex<Overlay>,
    pool: IteratorPool,
}

impl Table for FlushableTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let overlay = self.overlay.lock();
        match overlay.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.inner.get(key),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.overlay.lock().insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.overlay.lock().insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Entries> {
        let _token = self.pool.acquire();
        let overlay = self.overlay.lock();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.inner.scan_prefix(prefix)?.into_iter().collect();
        for (key, value) in overlay
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }
}

/// Buffers writes of an underlying producer and applies them atomically per flush.
pub struct Flushable {
    producer: Arc<dyn Producer>,
    tables: Mutex<BTreeMap<String, Arc<FlushableTable>>>,
    dropped: Mutex<BTreeSet<String>>,
    flush_id: AtomicU64,
    flush_lock: Mutex<()>,
    pool: IteratorPool,
}

impl Flushable {
    /// Opens the journal, failing if the previous flush was interrupted.
    pub fn open(producer: Arc<dyn Producer>, pool: IteratorPool) -> Result<Self> {
        let meta = producer.open_table(META_TABLE)?;
        if let Some(dirty) = meta.get(DIRTY_KEY)? {
            return Err(StoreError::DirtyFlush(decode_id(&dirty)?));
        }
        let flush_id = meta
            .get(FLUSH_ID_KEY)?
            .map(|raw| decode_id(&raw))
            .transpose()?
            .unwrap_or_default();
        debug!(flush_id, "opened flush journal");
        Ok(Self {
            producer,
            tables: Mutex::new(BTreeMap::new()),
            dropped: Mutex::new(BTreeSet::new()),
            flush_id: AtomicU64::new(flush_id),
            flush_lock: Mutex::new(()),
            pool,
        })
    }

    /// Id of the latest complete flush; zero before the first one.
    pub fn flush_id(&self) -> u64 {
        self.flush_id.load(Ordering::Acquire)
    }

    /// Number of buffered writes not yet flushed.
    pub fn pending_writes(&self) -> usize {
        self.tables
            .lock()
            .values()
            .map(|table| table.overlay.lock().len())
            .sum()
    }

    /// Applies all buffered writes and returns the new flush id.
    pub fn flush(&self) -> Result<u64> {
        let _guard = self.flush_lock.lock();
        let next = self.flush_id() + 1;
        let meta = self.producer.open_table(META_TABLE)?;

        meta.put(DIRTY_KEY, &next.to_be_bytes())?;
        self.producer.sync()?;

        let dropped = std::mem::take(&mut *self.dropped.lock());
        for name in &dropped {
            self.producer.drop_table(name)?;
        }

        let tables: Vec<_> = self.tables.lock().values().cloned().collect();
        let mut written = 0;
        for table in tables {
            let mut overlay = table.overlay.lock();
            for (key, value) in overlay.iter() {
                match value {
                    Some(value) => table.inner.put(key, value)?,
                    None => table.inner.delete(key)?,
                }
            }
            written += overlay.len();
            overlay.clear();
        }

        meta.put(FLUSH_ID_KEY, &next.to_be_bytes())?;
        meta.delete(DIRTY_KEY)?;
        self.producer.sync()?;
        self.flush_id.store(next, Ordering::Release);
        debug!(flush_id = next, written, dropped = dropped.len(), "flushed");
        Ok(next)
    }

    /// Discards all buffered writes.
    pub fn discard(&self) {
        let tables = self.tables.lock();
        let discarded: usize = tables
            .values()
            .map(|table| std::mem::take(&mut *table.overlay.lock()).len())
            .sum();
        if discarded > 0 {
            warn!(discarded, "discarded unflushed writes");
        }
        self.dropped.lock().clear();
    }
}

impl Producer for Flushable {
    fn open_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }
        self.dropped.lock().remove(name);
        let table = Arc::new(FlushableTable {
            inner: self.producer.open_table(name)?,
            overlay: Mutex::new(Overlay::new()),
            pool: self.pool.clone(),
        });
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let dropped = self.dropped.lock();
        let mut names: BTreeSet<String> = self.producer.table_names()?.into_iter().collect();
        names.extend(self.tables.lock().keys().cloned());
        Ok(names.into_iter().filter(|name| !dropped.contains(name)).collect())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.tables.lock().remove(name);
        self.dropped.lock().insert(name.to_string());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.flush().map(|_| ())
    }
}

fn decode_id(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::corrupted(META_TABLE, "flush id is not 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}
