use std::{path::Path, sync::Arc};

use crate::{Entries, Producer, Result, StoreError, Table};

impl Table for sled::Tree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(sled::Tree::get(self, key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Entries> {
        sled::Tree::scan_prefix(self, prefix)
            .map(|entry| {
                let (key, value) = entry?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }
}

/// Producer backed by a sled database; each table is a sled tree.
#[derive(Clone)]
pub struct SledProducer {
    db: sled::Db,
}

impl SledProducer {
    /// Opens or creates the database at `path`.
    ///
    /// Sled's background flusher is off: durability comes from [`Producer::sync`]
    /// alone, and the directory lock is released as soon as the last handle
    /// is dropped, so the same process can reopen it right away.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let db = sled::Config::new().path(path).flush_every_ms(None).open()?;
        Ok(Self { db })
    }
}

impl Producer for SledProducer {
    fn open_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        Ok(Arc::new(self.db.open_tree(name)?))
    }

    fn table_names(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|name| String::from_utf8(name.to_vec()).ok())
            // sled's implicit default tree
            .filter(|name| name != "__sled__default")
            .collect())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.db.drop_tree(name)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let producer = SledProducer::open(dir.path()).unwrap();
            let table = producer.open_table("lachesis-1").unwrap();
            table.put(b"k", b"v").unwrap();
            producer.sync().unwrap();
        }
        let producer = SledProducer::open(dir.path()).unwrap();
        assert_eq!(producer.table_names().unwrap(), vec!["lachesis-1".to_string()]);
        let table = producer.open_table("lachesis-1").unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(table.scan_prefix(b"").unwrap().len(), 1);
    }

    #[test]
    fn reopens_right_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0u8..20 {
            let producer = SledProducer::open(dir.path()).unwrap();
            let table = producer.open_table("main").unwrap();
            if round > 0 {
                assert_eq!(table.get(b"round").unwrap(), Some(vec![round - 1]));
            }
            table.put(b"round", &[round]).unwrap();
            producer.sync().unwrap();
            drop(table);
            drop(producer);
        }
    }
}
