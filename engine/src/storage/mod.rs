// Namespaced persistent maps over a pluggable key/value backend.
//
// Every piece of durable engine state lives in a `StorableDict` whose table
// prefix is derived from a hierarchy of `StorableDir` namespaces through
// `key_join`, so two dicts can never collide. Values are stored as the JSON
// form of their type.

mod memory;
mod sled_db;

pub use memory::MemoryDatabase;
pub use sled_db::SledDatabase;

use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored value could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("missing key '{key}' in table '{table}'")]
    MissingKey { table: String, key: String },
}

/// The persistent key/value backend consumed by the engine. Rows are keyed
/// by a `(table, key)` pair of strings; implementations must be safe to
/// share between tasks and atomic per operation.
pub trait Database: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<String>, StorageError>;
    fn put(&self, table: &str, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError>;
    fn contains(&self, table: &str, key: &str) -> Result<bool, StorageError>;
    fn count(&self, table: &str) -> Result<usize, StorageError>;
    fn keys(&self, table: &str) -> Result<Vec<String>, StorageError>;
}

/// Joins a sequence of strings into a storage key.
///
/// The length framing makes the encoding injective so distinct part
/// sequences can never produce the same prefix.
pub fn key_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| format!("[{}:{}]", part.len(), part))
        .collect::<Vec<_>>()
        .join("||")
}

/// A logical folder in the storage namespace
#[derive(Debug, Clone)]
pub struct StorableDir {
    base_key: Vec<String>,
}

impl StorableDir {
    pub fn base_key(&self) -> &[String] {
        &self.base_key
    }
}

/// Builds namespaces and persistent dicts over a shared backend
#[derive(Clone)]
pub struct StorableFactory {
    db: Arc<dyn Database>,
}

impl StorableFactory {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// A new namespace, nested under `parent` when given
    pub fn make_dir(&self, name: &str, parent: Option<&StorableDir>) -> StorableDir {
        let mut base_key = match parent {
            Some(parent) => parent.base_key.clone(),
            None => vec![String::new()],
        };
        base_key.push(name.to_owned());
        StorableDir { base_key }
    }

    /// A new persistent map under `parent`, holding values of type `T`
    pub fn make_dict<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        parent: &StorableDir,
    ) -> StorableDict<T> {
        let mut parts = parent.base_key.clone();
        parts.push(name.to_owned());
        StorableDict {
            db: Arc::clone(&self.db),
            prefix: key_join(&parts),
            _marker: PhantomData,
        }
    }
}

/// A persistent map with string keys and JSON serialized values
pub struct StorableDict<T> {
    db: Arc<dyn Database>,
    prefix: String,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> StorableDict<T> {
    pub fn try_get(&self, key: &str) -> Result<Option<T>, StorageError> {
        trace!("storage try_get {}/{}", self.prefix, key);
        match self.db.get(&self.prefix, key)? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &str) -> Result<T, StorageError> {
        self.try_get(key)?.ok_or_else(|| StorageError::MissingKey {
            table: self.prefix.clone(),
            key: key.to_owned(),
        })
    }

    pub fn put(&self, key: &str, value: &T) -> Result<(), StorageError> {
        trace!("storage put {}/{}", self.prefix, key);
        let data = serde_json::to_string(value)?;
        self.db.put(&self.prefix, key, &data)
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        trace!("storage delete {}/{}", self.prefix, key);
        self.db.delete(&self.prefix, key)
    }

    pub fn contains(&self, key: &str) -> Result<bool, StorageError> {
        self.db.contains(&self.prefix, key)
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        self.db.count(&self.prefix)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.db.keys(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_join_is_injective() {
        let a = key_join(&["ab".into(), "c".into()]);
        let b = key_join(&["a".into(), "bc".into()]);
        let c = key_join(&["abc".into()]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(a, "[2:ab]||[1:c]");
    }

    #[test]
    fn test_root_prefix_shape() {
        let factory = StorableFactory::new(Arc::new(MemoryDatabase::new()));
        let root = factory.make_dir("aabb", None);
        assert_eq!(key_join(root.base_key()), "[0:]||[4:aabb]");
    }

    #[test]
    fn test_dict_operations() {
        let factory = StorableFactory::new(Arc::new(MemoryDatabase::new()));
        let root = factory.make_dir("root", None);
        let dict: StorableDict<u64> = factory.make_dict("numbers", &root);

        assert!(dict.is_empty().unwrap());
        assert!(dict.try_get("one").unwrap().is_none());
        assert!(matches!(
            dict.get("one"),
            Err(StorageError::MissingKey { .. })
        ));

        dict.put("one", &1).unwrap();
        dict.put("two", &2).unwrap();
        assert_eq!(dict.get("one").unwrap(), 1);
        assert!(dict.contains("two").unwrap());
        assert_eq!(dict.len().unwrap(), 2);
        assert_eq!(dict.keys().unwrap(), vec!["one".to_owned(), "two".to_owned()]);

        dict.delete("one").unwrap();
        assert!(!dict.contains("one").unwrap());
        assert_eq!(dict.len().unwrap(), 1);
    }

    #[test]
    fn test_nested_namespaces_are_isolated() {
        let factory = StorableFactory::new(Arc::new(MemoryDatabase::new()));
        let root = factory.make_dir("me", None);
        let inner = factory.make_dir("channel", Some(&root));

        let outer_dict: StorableDict<String> = factory.make_dict("data", &root);
        let inner_dict: StorableDict<String> = factory.make_dict("data", &inner);

        outer_dict.put("k", &"outer".to_owned()).unwrap();
        inner_dict.put("k", &"inner".to_owned()).unwrap();

        assert_eq!(outer_dict.get("k").unwrap(), "outer");
        assert_eq!(inner_dict.get("k").unwrap(), "inner");
        assert_eq!(outer_dict.len().unwrap(), 1);
    }
}
