//! Remote object store contract.
//!
//! The propagator only needs a small capability set from the store that
//! holds policies and placement objects:
//!
//! - get/list/create/update/delete over named, namespaced, labeled objects
//! - optimistic concurrency keyed on `resourceVersion` (stale writes fail)
//! - a status patch merged against the originally-read object
//!
//! Transport and authentication are the implementation's concern. An
//! in-process implementation lives in [`memory`].

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use propagator_api::Resource;
use propagator_reconcile::Retryable;
use thiserror::Error;

pub use memory::{InMemoryStore, Operation, Snapshot};

/// Equality-based label selector.
pub type LabelSelector = BTreeMap<String, String>;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    /// The write was based on a stale resource version.
    #[error("conflict writing {kind} {namespace}/{name}: object has been modified")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub(crate) fn not_found<K: Resource>(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: K::KIND.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Map a `NotFound` result to `None`.
pub fn ignore_not_found<T>(result: StoreResult<T>) -> StoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remote object store interface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object. Fails with [`StoreError::NotFound`] when absent.
    async fn get<K: Resource>(&self, namespace: &str, name: &str) -> StoreResult<K>;

    /// List objects matching `selector`, in one namespace or across all of them.
    async fn list<K: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<K>>;

    /// Create an object. Identity fields are assigned by the store.
    async fn create<K: Resource>(&self, object: &K) -> StoreResult<K>;

    /// Replace an object. Fails with [`StoreError::Conflict`] when the
    /// object's resource version is stale.
    async fn update<K: Resource>(&self, object: &K) -> StoreResult<K>;

    /// Delete an object. Fails with [`StoreError::NotFound`] when absent.
    async fn delete<K: Resource>(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Merge the status difference between `original` and `updated` into
    /// the stored object, provided it is still at `original`'s version.
    async fn patch_status<K: Resource>(&self, original: &K, updated: &K) -> StoreResult<K>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_not_found() {
        let missing: StoreResult<u32> = Err(StoreError::NotFound {
            kind: "Policy".into(),
            namespace: "default".into(),
            name: "p1".into(),
        });
        assert_eq!(ignore_not_found(missing).unwrap(), None);

        let unavailable: StoreResult<u32> = Err(StoreError::Unavailable("down".into()));
        assert!(ignore_not_found(unavailable).is_err());

        assert_eq!(ignore_not_found(Ok(7)).unwrap(), Some(7));
    }

    #[test]
    fn test_retry_classification() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(StoreError::Conflict {
            kind: "Policy".into(),
            namespace: "default".into(),
            name: "p1".into(),
        }
        .is_retryable());
        assert!(!StoreError::Serialization("bad".into()).is_retryable());
    }
}
