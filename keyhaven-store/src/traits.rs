// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trait definitions for ordered key-value backends and the sealing capability used to encrypt
//! values before they reach a backend.
use std::error::Error;
use std::fmt::Debug;
use std::ops::Bound;

/// Key-value pair as returned from range iterations.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Interface for ordered key-value backends.
///
/// Keys are ordered lexicographically as byte strings. Higher layers rely on this ordering, for
/// example to scan over all keys sharing a prefix or to find the "latest" entries by iterating in
/// reverse.
///
/// All methods take `&self`, implementations are expected to use interior mutability so one
/// physical backend can be shared by multiple (namespaced) users.
pub trait KeyValueStore {
    type Error: Error + 'static;

    /// Iterator over entries of a range query.
    type Entries: Iterator<Item = Result<Entry, Self::Error>>;

    /// Get the value stored under a key.
    ///
    /// Returns `None` when no value was found.
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>>;

    /// Insert or overwrite the value stored under a key.
    fn put(&self, key: &[u8], value: &[u8]) -> impl Future<Output = Result<(), Self::Error>>;

    /// Remove a key and its value, does nothing if the key does not exist.
    fn del(&self, key: &[u8]) -> impl Future<Output = Result<(), Self::Error>>;

    /// Apply a list of operations in one single, atomic write.
    ///
    /// Either all operations are applied or none.
    fn batch(
        &self,
        operations: Vec<BatchOperation>,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Remove all keys within the given range.
    ///
    /// Ordering and limit of the range are ignored.
    fn clear(&self, range: &KeyRange) -> impl Future<Output = Result<(), Self::Error>>;

    /// Query all entries within the given range, respecting ordering and limit of the range.
    fn iter(&self, range: &KeyRange) -> impl Future<Output = Result<Self::Entries, Self::Error>>;
}

/// Single write operation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

impl BatchOperation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        Self::Del { key: key.into() }
    }
}

/// Range of keys for iteration and range deletion.
///
/// Bounds are compared lexicographically on the raw key bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,

    /// Iterate from the highest to the lowest key.
    pub reverse: bool,

    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

impl KeyRange {
    /// Range over all keys.
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            reverse: false,
            limit: None,
        }
    }

    /// Range over all keys starting with the given prefix, including the prefix itself.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: Bound::Included(prefix.to_vec()),
            end: prefix_upper_bound(prefix),
            reverse: false,
            limit: None,
        }
    }

    /// Range over all keys between `start` (inclusive) and `end` (exclusive).
    pub fn between(start: &[u8], end: &[u8]) -> Self {
        Self {
            start: Bound::Included(start.to_vec()),
            end: Bound::Excluded(end.to_vec()),
            reverse: false,
            limit: None,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the key lies within the bounds of this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_start = match &self.start {
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
            Bound::Unbounded => true,
        };

        let below_end = match &self.end {
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
            Bound::Unbounded => true,
        };

        above_start && below_end
    }

    /// Returns true if no key can ever fall into this range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(start), Bound::Included(end)) => start > end,
            (Bound::Included(start), Bound::Excluded(end))
            | (Bound::Excluded(start), Bound::Included(end))
            | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
            _ => false,
        }
    }

    /// Bounds borrowed as byte slices, usable for ordered map range queries.
    pub fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (as_slice_bound(&self.start), as_slice_bound(&self.end))
    }

    /// Moves this range into the key space under the given prefix.
    ///
    /// Unbounded ends are confined to the prefix so the resulting range never reaches keys
    /// outside of it.
    pub fn within_prefix(&self, prefix: &[u8]) -> Self {
        let prefixed = |key: &Vec<u8>| {
            let mut bytes = prefix.to_vec();
            bytes.extend_from_slice(key);
            bytes
        };

        let start = match &self.start {
            Bound::Included(key) => Bound::Included(prefixed(key)),
            Bound::Excluded(key) => Bound::Excluded(prefixed(key)),
            Bound::Unbounded => Bound::Included(prefix.to_vec()),
        };

        let end = match &self.end {
            Bound::Included(key) => Bound::Included(prefixed(key)),
            Bound::Excluded(key) => Bound::Excluded(prefixed(key)),
            Bound::Unbounded => prefix_upper_bound(prefix),
        };

        Self {
            start,
            end,
            reverse: self.reverse,
            limit: self.limit,
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Smallest key which is larger than every key starting with `prefix`.
///
/// Trailing `0xff` bytes can not be incremented and are dropped, a prefix consisting only of them
/// has no upper bound.
pub fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Bound::Excluded(upper);
        }
    }
    Bound::Unbounded
}

/// Capability to sign-then-encrypt and decrypt-then-verify values with a key pair.
pub trait Sealer {
    type KeyPair: Clone + Debug;

    type Error: Error + 'static;

    /// Signs the data with the private key and encrypts the result for the public key of the
    /// same key pair.
    fn sign_then_encrypt(
        &self,
        data: &[u8],
        key_pair: &Self::KeyPair,
    ) -> Result<Vec<u8>, Self::Error>;

    /// Decrypts the data with the private key and verifies the signature with the public key
    /// of the same key pair.
    fn decrypt_then_verify(
        &self,
        data: &[u8],
        key_pair: &Self::KeyPair,
    ) -> Result<Vec<u8>, Self::Error>;
}
