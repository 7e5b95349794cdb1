//! In-process storage backed by a hash map

use super::{check_etag, Storage, StorageError, StorageResult, StoreItem};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    items: HashMap<String, (Value, String)>,
    next_etag: u64,
}

/// Volatile storage; ETags are a monotonically increasing counter
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))
    }

    /// Number of stored keys. Reads through a poisoned lock, where storage
    /// operations fail with `Unavailable` instead.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, keys: &[String]) -> StorageResult<HashMap<String, StoreItem>> {
        let inner = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                inner.items.get(key).map(|(value, etag)| {
                    (key.clone(), StoreItem::new(value.clone(), Some(etag.clone())))
                })
            })
            .collect())
    }

    async fn write(
        &self,
        changes: HashMap<String, StoreItem>,
    ) -> StorageResult<HashMap<String, String>> {
        let mut inner = self.lock()?;

        // Validate the whole batch before touching anything
        for (key, item) in &changes {
            let actual = inner.items.get(key).map(|(_, etag)| etag.as_str());
            check_etag(key, item.etag.as_deref(), actual)?;
        }

        let mut etags = HashMap::with_capacity(changes.len());
        for (key, item) in changes {
            inner.next_etag += 1;
            let etag = inner.next_etag.to_string();
            inner.items.insert(key.clone(), (item.value, etag.clone()));
            etags.insert(key, etag);
        }
        Ok(etags)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<()> {
        let mut inner = self.lock()?;
        for key in keys {
            inner.items.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ETAG_ANY;
    use serde_json::json;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_key_is_absent() {
        let storage = MemoryStorage::new();
        let items = storage.read(&keys(&["nope"])).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_len_counts_keys_after_poisoning() {
        let storage = MemoryStorage::new();
        storage
            .write(HashMap::from([("a".to_string(), StoreItem::new(json!(1), None))]))
            .await
            .unwrap();

        let panicked = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = storage.inner.lock().unwrap();
                panic!("writer died holding the lock");
            })
            .join()
        });
        assert!(panicked.is_err());

        assert_eq!(storage.len(), 1);
        assert!(!storage.is_empty());
        let err = storage.read(&keys(&["a"])).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_write_then_read_returns_etag() {
        let storage = MemoryStorage::new();
        let etags = storage
            .write(HashMap::from([(
                "a".to_string(),
                StoreItem::new(json!({"n": 1}), None),
            )]))
            .await
            .unwrap();

        let items = storage.read(&keys(&["a"])).await.unwrap();
        let item = &items["a"];
        assert_eq!(item.value, json!({"n": 1}));
        assert_eq!(item.etag.as_deref(), Some(etags["a"].as_str()));
    }

    #[tokio::test]
    async fn test_stale_etag_conflicts() {
        let storage = MemoryStorage::new();
        let first = storage
            .write(HashMap::from([("a".to_string(), StoreItem::new(json!(1), None))]))
            .await
            .unwrap();
        let etag = first["a"].clone();

        storage
            .write(HashMap::from([(
                "a".to_string(),
                StoreItem::new(json!(2), Some(etag.clone())),
            )]))
            .await
            .unwrap();

        let err = storage
            .write(HashMap::from([(
                "a".to_string(),
                StoreItem::new(json!(3), Some(etag)),
            )]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        let items = storage.read(&keys(&["a"])).await.unwrap();
        assert_eq!(items["a"].value, json!(2));
    }

    #[tokio::test]
    async fn test_wildcard_overwrites() {
        let storage = MemoryStorage::new();
        storage
            .write(HashMap::from([("a".to_string(), StoreItem::new(json!(1), None))]))
            .await
            .unwrap();
        storage
            .write(HashMap::from([("a".to_string(), StoreItem::overwrite(json!(9)))]))
            .await
            .unwrap();

        let items = storage.read(&keys(&["a"])).await.unwrap();
        assert_eq!(items["a"].value, json!(9));
        assert_ne!(items["a"].etag.as_deref(), Some(ETAG_ANY));
    }

    #[tokio::test]
    async fn test_conflict_leaves_batch_unapplied() {
        let storage = MemoryStorage::new();
        storage
            .write(HashMap::from([("held".to_string(), StoreItem::new(json!(1), None))]))
            .await
            .unwrap();

        let result = storage
            .write(HashMap::from([
                ("fresh".to_string(), StoreItem::new(json!("x"), None)),
                ("held".to_string(), StoreItem::new(json!(2), Some("999".to_string()))),
            ]))
            .await;
        assert!(result.is_err());

        let items = storage.read(&keys(&["fresh", "held"])).await.unwrap();
        assert!(!items.contains_key("fresh"));
        assert_eq!(items["held"].value, json!(1));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let storage = MemoryStorage::new();
        storage
            .write(HashMap::from([("a".to_string(), StoreItem::new(json!(1), None))]))
            .await
            .unwrap();
        storage.delete(&keys(&["a", "missing"])).await.unwrap();
        storage.delete(&keys(&["a"])).await.unwrap();
        assert!(storage.is_empty());
    }
}
