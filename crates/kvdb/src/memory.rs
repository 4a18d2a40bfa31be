use std::{collections::BTreeMap, sync::Arc};

use parking_lot::{Mutex, RwLock};

use crate::{Entries, Producer, Result, Table};

#[derive(Default)]
struct MemoryTable {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Table for MemoryTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Entries> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Producer keeping every table in memory. Cloning shares the tables.
#[derive(Clone, Default)]
pub struct MemoryProducer {
    tables: Arc<Mutex<BTreeMap<String, Arc<MemoryTable>>>>,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Producer for MemoryProducer {
    fn open_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        let table = self.tables.lock().entry(name.to_string()).or_default().clone();
        Ok(table)
    }

    fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.tables.lock().keys().cloned().collect())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.tables.lock().remove(name);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_shared_and_scannable() {
        let producer = MemoryProducer::new();
        let table = producer.open_table("main").unwrap();
        table.put(b"a/1", b"x").unwrap();
        table.put(b"a/2", b"y").unwrap();
        table.put(b"b/1", b"z").unwrap();

        let again = producer.open_table("main").unwrap();
        assert_eq!(again.get(b"a/2").unwrap(), Some(b"y".to_vec()));
        assert_eq!(
            again.scan_prefix(b"a/").unwrap(),
            vec![(b"a/1".to_vec(), b"x".to_vec()), (b"a/2".to_vec(), b"y".to_vec())]
        );

        producer.drop_table("main").unwrap();
        assert!(producer.table_names().unwrap().is_empty());
    }
}
