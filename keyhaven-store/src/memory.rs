// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory persistence for ordered key-value data.
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::trace;

use crate::traits::{BatchOperation, Entry, KeyRange, KeyValueStore};

/// Ordered map of raw keys and values.
#[derive(Clone, Debug, Default)]
pub struct InnerMemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// An in-memory, ordered key-value store.
///
/// `MemoryStore` wraps an `InnerMemoryStore` with an `RwLock` and `Arc`, clones of a store share
/// the same underlying data. Convenience methods are provided to obtain a read- or write-lock on
/// the underlying store.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<InnerMemoryStore>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a read-lock on the store.
    pub fn read_store(&self) -> RwLockReadGuard<'_, InnerMemoryStore> {
        self.inner
            .read()
            .expect("acquire shared read access on store")
    }

    /// Obtain a write-lock on the store.
    pub fn write_store(&self) -> RwLockWriteGuard<'_, InnerMemoryStore> {
        self.inner
            .write()
            .expect("acquire exclusive write access on store")
    }

    /// Number of entries in the whole store.
    pub fn len(&self) -> usize {
        self.read_store().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_store().entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    type Error = Infallible;

    type Entries = std::vec::IntoIter<Result<Entry, Infallible>>;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.read_store().entries.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Self::Error> {
        self.write_store()
            .entries
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn del(&self, key: &[u8]) -> Result<(), Self::Error> {
        self.write_store().entries.remove(key);
        Ok(())
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<(), Self::Error> {
        trace!(operations = operations.len(), "apply batch");
        let mut store = self.write_store();
        for operation in operations {
            match operation {
                BatchOperation::Put { key, value } => {
                    store.entries.insert(key, value);
                }
                BatchOperation::Del { key } => {
                    store.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn clear(&self, range: &KeyRange) -> Result<(), Self::Error> {
        if range.is_empty() {
            return Ok(());
        }

        let mut store = self.write_store();
        let keys: Vec<Vec<u8>> = store
            .entries
            .range::<[u8], _>(range.bounds())
            .map(|(key, _)| key.to_owned())
            .collect();
        trace!(keys = keys.len(), "clear range");
        for key in keys {
            store.entries.remove(&key);
        }
        Ok(())
    }

    async fn iter(&self, range: &KeyRange) -> Result<Self::Entries, Self::Error> {
        if range.is_empty() {
            return Ok(Vec::new().into_iter());
        }

        let store = self.read_store();
        let entries = store.entries.range::<[u8], _>(range.bounds());
        let limit = range.limit.unwrap_or(usize::MAX);
        let result: Vec<Result<Entry, Infallible>> = if range.reverse {
            entries
                .rev()
                .take(limit)
                .map(|(key, value)| Ok((key.to_owned(), value.to_owned())))
                .collect()
        } else {
            entries
                .take(limit)
                .map(|(key, value)| Ok((key.to_owned(), value.to_owned())))
                .collect()
        };
        Ok(result.into_iter())
    }
}
