use std::sync::RwLock;

use indexmap::IndexMap;

use super::{Database, StorageError};

/// In-memory backend for tests and ephemeral deployments. Tables and rows
/// keep insertion order so iteration is deterministic.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<IndexMap<String, IndexMap<String, String>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, IndexMap<String, IndexMap<String, String>>>, StorageError> {
        self.tables
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_owned()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, IndexMap<String, IndexMap<String, String>>>, StorageError> {
        self.tables
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_owned()))
    }
}

impl Database for MemoryDatabase {
    fn get(&self, table: &str, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .read()?
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&self, table: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.write()?
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        if let Some(rows) = self.write()?.get_mut(table) {
            rows.shift_remove(key);
        }
        Ok(())
    }

    fn contains(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .read()?
            .get(table)
            .map(|rows| rows.contains_key(key))
            .unwrap_or(false))
    }

    fn count(&self, table: &str) -> Result<usize, StorageError> {
        Ok(self.read()?.get(table).map(|rows| rows.len()).unwrap_or(0))
    }

    fn keys(&self, table: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .read()?
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default())
    }
}
