//! Key-value storage with optimistic concurrency
//!
//! Every write carries the ETag the writer last saw. A mismatch fails the
//! whole batch with [`StorageError::Conflict`]; the wildcard ETag `"*"` always
//! overwrites, and a missing ETag means "create only if absent".

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Wildcard ETag: write unconditionally
pub const ETAG_ANY: &str = "*";

/// A stored value together with its version token
#[derive(Debug, Clone, PartialEq)]
pub struct StoreItem {
    pub value: Value,
    /// On read: the current version. On write: the version the writer expects
    /// (`None` = key must not exist yet, `Some("*")` = overwrite).
    pub etag: Option<String>,
}

impl StoreItem {
    pub fn new(value: Value, etag: Option<String>) -> Self {
        Self { value, etag }
    }

    /// Item that overwrites whatever is stored
    pub fn overwrite(value: Value) -> Self {
        Self::new(value, Some(ETAG_ANY.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("ETag conflict on '{key}' (expected {expected:?}, found {actual:?})")]
    Conflict {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence contract for bot state
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the given keys; missing keys are simply absent from the result
    async fn read(&self, keys: &[String]) -> StorageResult<HashMap<String, StoreItem>>;

    /// Write a batch of changes, returning the new ETag of every key.
    ///
    /// The whole batch is checked before anything is applied, so a conflict on
    /// one key leaves every key untouched.
    async fn write(
        &self,
        changes: HashMap<String, StoreItem>,
    ) -> StorageResult<HashMap<String, String>>;

    /// Delete the given keys; deleting a missing key is not an error
    async fn delete(&self, keys: &[String]) -> StorageResult<()>;
}

/// Check a writer's expected ETag against the stored one
pub(crate) fn check_etag(
    key: &str,
    expected: Option<&str>,
    actual: Option<&str>,
) -> StorageResult<()> {
    let ok = match (expected, actual) {
        (Some(ETAG_ANY), _) | (None, None) => true,
        (Some(expected), Some(actual)) => expected == actual,
        (None, Some(_)) | (Some(_), None) => false,
    };
    if ok {
        Ok(())
    } else {
        tracing::warn!(key = %key, ?expected, ?actual, "Storage write rejected: ETag mismatch");
        Err(StorageError::Conflict {
            key: key.to_string(),
            expected: expected.map(String::from),
            actual: actual.map(String::from),
        })
    }
}

#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn read(&self, keys: &[String]) -> StorageResult<HashMap<String, StoreItem>> {
        (**self).read(keys).await
    }

    async fn write(
        &self,
        changes: HashMap<String, StoreItem>,
    ) -> StorageResult<HashMap<String, String>> {
        (**self).write(changes).await
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<()> {
        (**self).delete(keys).await
    }
}
