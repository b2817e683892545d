// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transparent encryption layer for key-value stores.
//!
//! [`EncryptedStore`] wraps any [`KeyValueStore`] so that the backend only ever sees ciphertext:
//! every value is signed-then-encrypted before it is written and decrypted-then-verified when it
//! is read again. Keys are not encrypted, they stay ordered and can be used for range queries.
//!
//! The key pair is installed after construction with [`EncryptedStore::set_key_pair`]. Until then
//! every read and write fails, no value can accidentally be written as plaintext.
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::trace;

use crate::traits::{BatchOperation, Entry, KeyRange, KeyValueStore, Sealer};

/// Key-value store encrypting all values with a key pair.
#[derive(Debug)]
pub struct EncryptedStore<S, C>
where
    C: Sealer,
{
    store: S,
    sealer: C,
    key_pair: Arc<RwLock<Option<C::KeyPair>>>,
}

// Manual implementation, deriving would require the key pair to be `Clone` only.
impl<S, C> Clone for EncryptedStore<S, C>
where
    S: Clone,
    C: Sealer + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sealer: self.sealer.clone(),
            key_pair: self.key_pair.clone(),
        }
    }
}

impl<S, C> EncryptedStore<S, C>
where
    S: KeyValueStore,
    C: Sealer + Clone,
{
    pub fn new(store: S, sealer: C) -> Self {
        Self {
            store,
            sealer,
            key_pair: Arc::new(RwLock::new(None)),
        }
    }

    /// Installs or replaces the key pair used for all following operations.
    pub fn set_key_pair(
        &self,
        key_pair: C::KeyPair,
    ) -> Result<(), EncryptedStoreError<S::Error, C::Error>> {
        let mut current = self
            .key_pair
            .write()
            .map_err(|_| EncryptedStoreError::LockPoisoned)?;
        *current = Some(key_pair);
        Ok(())
    }

    /// Removes the key pair, all following operations fail until a new one is installed.
    pub fn clear_key_pair(&self) -> Result<(), EncryptedStoreError<S::Error, C::Error>> {
        let mut current = self
            .key_pair
            .write()
            .map_err(|_| EncryptedStoreError::LockPoisoned)?;
        *current = None;
        Ok(())
    }

    /// Returns true if a key pair was installed.
    pub fn has_key_pair(&self) -> bool {
        self.key_pair
            .read()
            .map(|key_pair| key_pair.is_some())
            .unwrap_or(false)
    }

    fn key_pair(&self) -> Result<C::KeyPair, EncryptedStoreError<S::Error, C::Error>> {
        let key_pair = self
            .key_pair
            .read()
            .map_err(|_| EncryptedStoreError::LockPoisoned)?;
        key_pair.clone().ok_or(EncryptedStoreError::KeyPairNotSet)
    }

    fn seal(
        &self,
        value: &[u8],
        key_pair: &C::KeyPair,
    ) -> Result<Vec<u8>, EncryptedStoreError<S::Error, C::Error>> {
        self.sealer
            .sign_then_encrypt(value, key_pair)
            .map_err(EncryptedStoreError::Crypto)
    }
}

impl<S, C> KeyValueStore for EncryptedStore<S, C>
where
    S: KeyValueStore,
    C: Sealer + Clone,
{
    type Error = EncryptedStoreError<S::Error, C::Error>;

    type Entries = DecryptedEntries<S, C>;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        let key_pair = self.key_pair()?;
        let Some(ciphertext) = self
            .store
            .get(key)
            .await
            .map_err(EncryptedStoreError::Store)?
        else {
            return Ok(None);
        };
        let plaintext = self
            .sealer
            .decrypt_then_verify(&ciphertext, &key_pair)
            .map_err(EncryptedStoreError::Crypto)?;
        Ok(Some(plaintext))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Self::Error> {
        let key_pair = self.key_pair()?;
        let ciphertext = self.seal(value, &key_pair)?;
        self.store
            .put(key, &ciphertext)
            .await
            .map_err(EncryptedStoreError::Store)
    }

    async fn del(&self, key: &[u8]) -> Result<(), Self::Error> {
        self.key_pair()?;
        self.store.del(key).await.map_err(EncryptedStoreError::Store)
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<(), Self::Error> {
        let key_pair = self.key_pair()?;

        // Seal all values before touching the backend, a failure leaves it unchanged.
        let mut sealed = Vec::with_capacity(operations.len());
        for operation in operations {
            sealed.push(match operation {
                BatchOperation::Put { key, value } => BatchOperation::Put {
                    value: self.seal(&value, &key_pair)?,
                    key,
                },
                del @ BatchOperation::Del { .. } => del,
            });
        }

        trace!(operations = sealed.len(), "write encrypted batch");
        self.store
            .batch(sealed)
            .await
            .map_err(EncryptedStoreError::Store)
    }

    async fn clear(&self, range: &KeyRange) -> Result<(), Self::Error> {
        self.key_pair()?;
        self.store
            .clear(range)
            .await
            .map_err(EncryptedStoreError::Store)
    }

    async fn iter(&self, range: &KeyRange) -> Result<Self::Entries, Self::Error> {
        let key_pair = self.key_pair()?;
        let entries = self
            .store
            .iter(range)
            .await
            .map_err(EncryptedStoreError::Store)?;
        Ok(DecryptedEntries {
            entries,
            sealer: self.sealer.clone(),
            key_pair,
        })
    }
}

/// Iterator decrypting every value only when it is yielded.
pub struct DecryptedEntries<S, C>
where
    S: KeyValueStore,
    C: Sealer,
{
    entries: S::Entries,
    sealer: C,
    key_pair: C::KeyPair,
}

// Never print the key pair.
impl<S, C> std::fmt::Debug for DecryptedEntries<S, C>
where
    S: KeyValueStore,
    C: Sealer,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedEntries").finish_non_exhaustive()
    }
}

impl<S, C> Iterator for DecryptedEntries<S, C>
where
    S: KeyValueStore,
    C: Sealer,
{
    type Item = Result<Entry, EncryptedStoreError<S::Error, C::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.entries.next()? {
            Ok(entry) => entry,
            Err(err) => return Some(Err(EncryptedStoreError::Store(err))),
        };
        let (key, ciphertext) = entry;
        Some(
            self.sealer
                .decrypt_then_verify(&ciphertext, &self.key_pair)
                .map(|plaintext| (key, plaintext))
                .map_err(EncryptedStoreError::Crypto),
        )
    }
}

#[derive(Debug, Error)]
pub enum EncryptedStoreError<S, C> {
    #[error("key pair is not set")]
    KeyPairNotSet,

    #[error("key pair lock is poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Store(S),

    #[error(transparent)]
    Crypto(C),
}
