// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered key-value storage for keyhaven.
//!
//! Every higher-level persistence concern of keyhaven (locally cached group tickets, for example)
//! is built on one small interface, [`KeyValueStore`]: byte-string keys in lexicographic order
//! with point reads and writes, atomic batches, range deletion and range iteration.
//!
//! Two layers can be stacked on top of any backend:
//!
//! - [`Namespace`] confines all keys to an isolated sub-namespace, so one physical database can
//!   be shared by multiple local users and features.
//! - [`EncryptedStore`] signs-then-encrypts every value before it is written, the backend never
//!   sees plaintext.
//!
//! ```text
//! EncryptedStore<Namespace<MemoryStore>, Sealer>
//!        |               |         |
//!        |               |         +-- raw bytes in memory (or SQLite)
//!        |               +-- keys prefixed with !hex(identity)!!hex("GROUPS")!
//!        +-- values sealed with the user's key pair
//! ```
//!
//! An in-memory backend is available with the `memory` feature (enabled by default), a
//! persistent SQLite backend with the `sqlite` feature.
pub mod encrypted;
#[cfg(feature = "memory")]
pub mod memory;
pub mod namespace;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use encrypted::{EncryptedStore, EncryptedStoreError};
#[cfg(feature = "memory")]
pub use memory::MemoryStore;
pub use namespace::Namespace;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, SqliteStoreError};
pub use traits::{BatchOperation, Entry, KeyRange, KeyValueStore, Sealer};
