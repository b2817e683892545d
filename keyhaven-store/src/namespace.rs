// SPDX-License-Identifier: MIT OR Apache-2.0

//! Partition one physical key-value backend into isolated sub-namespaces.
//!
//! Every key written through a [`Namespace`] is prefixed with `!<name>!`, where the name is
//! hex-encoded. Namespaces can be nested, for example to first separate data per local user and
//! then per feature:
//!
//! ```text
//! !616c696365!!47524f555053!<key>
//!  ^ "alice"    ^ "GROUPS"
//! ```
//!
//! Hex-encoding the names keeps the separator out of them, two different names can therefore
//! never produce prefixes where one is the beginning of the other.
use crate::traits::{BatchOperation, Entry, KeyRange, KeyValueStore};

const SEPARATOR: u8 = b'!';

/// Key-value store confined to a sub-namespace of another store.
#[derive(Clone, Debug)]
pub struct Namespace<S> {
    store: S,
    prefix: Vec<u8>,
}

impl<S> Namespace<S>
where
    S: KeyValueStore,
{
    /// Create a namespace with the given name on top of a store.
    pub fn new(store: S, name: &str) -> Self {
        Self {
            store,
            prefix: encode_name(name),
        }
    }

    /// Create a nested namespace inside this one.
    pub fn sub(&self, name: &str) -> Self
    where
        S: Clone,
    {
        let mut prefix = self.prefix.clone();
        prefix.extend(encode_name(name));
        Self {
            store: self.store.clone(),
            prefix,
        }
    }

    /// Raw key prefix of this namespace in the underlying store.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.prefix.len() + key.len());
        bytes.extend_from_slice(&self.prefix);
        bytes.extend_from_slice(key);
        bytes
    }
}

fn encode_name(name: &str) -> Vec<u8> {
    let mut prefix = vec![SEPARATOR];
    prefix.extend(hex::encode(name).into_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Iterator over entries of a namespace, with the namespace prefix stripped from every key.
#[derive(Debug)]
pub struct NamespacedEntries<I> {
    entries: I,
    prefix_len: usize,
}

impl<I, E> Iterator for NamespacedEntries<I>
where
    I: Iterator<Item = Result<Entry, E>>,
{
    type Item = Result<Entry, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entries.next()? {
                Ok((key, value)) if key.len() >= self.prefix_len => {
                    return Some(Ok((key[self.prefix_len..].to_vec(), value)));
                }
                // Entries outside of the namespace are never yielded.
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl<S> KeyValueStore for Namespace<S>
where
    S: KeyValueStore,
{
    type Error = S::Error;

    type Entries = NamespacedEntries<S::Entries>;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        self.store.get(&self.prefixed(key)).await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Self::Error> {
        self.store.put(&self.prefixed(key), value).await
    }

    async fn del(&self, key: &[u8]) -> Result<(), Self::Error> {
        self.store.del(&self.prefixed(key)).await
    }

    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<(), Self::Error> {
        let operations = operations
            .into_iter()
            .map(|operation| match operation {
                BatchOperation::Put { key, value } => BatchOperation::Put {
                    key: self.prefixed(&key),
                    value,
                },
                BatchOperation::Del { key } => BatchOperation::Del {
                    key: self.prefixed(&key),
                },
            })
            .collect();
        self.store.batch(operations).await
    }

    async fn clear(&self, range: &KeyRange) -> Result<(), Self::Error> {
        self.store.clear(&range.within_prefix(&self.prefix)).await
    }

    async fn iter(&self, range: &KeyRange) -> Result<Self::Entries, Self::Error> {
        let entries = self.store.iter(&range.within_prefix(&self.prefix)).await?;
        Ok(NamespacedEntries {
            entries,
            prefix_len: self.prefix.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::MemoryStore;
    use crate::traits::{BatchOperation, KeyRange, KeyValueStore};

    use super::Namespace;

    #[tokio::test]
    async fn isolates_namespaces() {
        let backend = MemoryStore::new();
        let alice = Namespace::new(backend.clone(), "alice");
        let bob = Namespace::new(backend.clone(), "bob");

        alice.put(b"key", b"alice's value").await.unwrap();
        bob.put(b"key", b"bob's value").await.unwrap();

        assert_eq!(
            alice.get(b"key").await.unwrap(),
            Some(b"alice's value".to_vec())
        );
        assert_eq!(bob.get(b"key").await.unwrap(), Some(b"bob's value".to_vec()));
        assert_eq!(backend.len(), 2);

        alice.clear(&KeyRange::all()).await.unwrap();
        assert_eq!(alice.get(b"key").await.unwrap(), None);
        assert_eq!(bob.get(b"key").await.unwrap(), Some(b"bob's value".to_vec()));
    }

    #[tokio::test]
    async fn names_never_overlap() {
        // Without encoding "a" would be a prefix of "a!".
        let backend = MemoryStore::new();
        let first = Namespace::new(backend.clone(), "a").sub("GROUPS");
        let second = Namespace::new(backend.clone(), "a!").sub("GROUPS");

        first.put(b"key", b"1").await.unwrap();
        second.put(b"key", b"2").await.unwrap();

        first.clear(&KeyRange::all()).await.unwrap();
        assert_eq!(second.get(b"key").await.unwrap(), Some(b"2".to_vec()));

        let parent = Namespace::new(backend.clone(), "a");
        parent.clear(&KeyRange::all()).await.unwrap();
        assert_eq!(second.get(b"key").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn iterate_strips_prefix() {
        let backend = MemoryStore::new();
        let groups = Namespace::new(backend.clone(), "alice").sub("GROUPS");
        let other = Namespace::new(backend.clone(), "alice").sub("OTHER");

        groups
            .batch(vec![
                BatchOperation::put(b"s!1!1".to_vec(), b"a".to_vec()),
                BatchOperation::put(b"s!1!2".to_vec(), b"b".to_vec()),
            ])
            .await
            .unwrap();
        other.put(b"s!1!3", b"c").await.unwrap();

        let entries: Vec<(Vec<u8>, Vec<u8>)> = groups
            .iter(&KeyRange::prefix(b"s!").reversed())
            .await
            .unwrap()
            .map(|entry| entry.unwrap())
            .collect();

        assert_eq!(
            entries,
            vec![
                (b"s!1!2".to_vec(), b"b".to_vec()),
                (b"s!1!1".to_vec(), b"a".to_vec())
            ]
        );
    }
}
