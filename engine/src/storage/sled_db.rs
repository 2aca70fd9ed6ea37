use std::path::Path;

use log::trace;

use super::{Database, StorageError};

/// Durable backend over a sled database, one tree per table
pub struct SledDatabase {
    db: sled::Db,
}

impl SledDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(backend)?;
        Ok(Self { db })
    }

    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    fn tree(&self, table: &str) -> Result<sled::Tree, StorageError> {
        self.db.open_tree(table).map_err(backend)
    }
}

fn backend(error: sled::Error) -> StorageError {
    StorageError::Backend(error.to_string())
}

impl Database for SledDatabase {
    fn get(&self, table: &str, key: &str) -> Result<Option<String>, StorageError> {
        let value = self.tree(table)?.get(key).map_err(backend)?;
        match value {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| StorageError::Backend("non utf-8 value in store".to_owned()))?,
            )),
            None => Ok(None),
        }
    }

    fn put(&self, table: &str, key: &str, value: &str) -> Result<(), StorageError> {
        trace!("sled put {}/{}", table, key);
        self.tree(table)?
            .insert(key, value.as_bytes())
            .map_err(backend)?;
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        self.tree(table)?.remove(key).map_err(backend)?;
        Ok(())
    }

    fn contains(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        self.tree(table)?.contains_key(key).map_err(backend)
    }

    fn count(&self, table: &str) -> Result<usize, StorageError> {
        Ok(self.tree(table)?.len())
    }

    fn keys(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in self.tree(table)?.iter() {
            let (key, _) = entry.map_err(backend)?;
            keys.push(
                String::from_utf8(key.to_vec())
                    .map_err(|_| StorageError::Backend("non utf-8 key in store".to_owned()))?,
            );
        }
        Ok(keys)
    }
}
