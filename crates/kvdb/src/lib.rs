//! Key-value substrate.
//!
//! A [`Producer`] hands out named [`Table`]s. Two producers exist: an in-memory
//! one for tests and ephemeral nodes, and one backed by sled for real data
//! directories. [`Flushable`] wraps either and buffers all writes until
//! [`Flushable::flush`], which applies them under a journaled flush id so that
//! a restart always sees the state of the latest complete flush.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::sync::Arc;

mod datadir;
pub use datadir::{DataDir, ErrlockError};

mod error;
pub use error::StoreError;

mod flushable;
pub use flushable::{FLUSH_ID_KEY, FLUSH_PREFIX, Flushable};

mod memory;
pub use memory::MemoryProducer;

mod pool;
pub use pool::{IteratorPool, IteratorToken};

mod sled_db;
pub use sled_db::SledProducer;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Key-value pairs returned by a snapshot scan, in key order.
pub type Entries = Vec<(Vec<u8>, Vec<u8>)>;

/// A named key-value table.
pub trait Table: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Snapshot of all entries whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Entries>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Opens named tables over one storage engine.
pub trait Producer: Send + Sync {
    fn open_table(&self, name: &str) -> Result<Arc<dyn Table>>;

    fn table_names(&self) -> Result<Vec<String>>;

    fn drop_table(&self, name: &str) -> Result<()>;

    /// Makes everything written so far durable.
    fn sync(&self) -> Result<()>;
}
