// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end encrypted group messaging.
//!
//! A group is a ratcheting group session shared by its participants: every participant holds the
//! same ordered sequence of epoch secrets and encrypts with the newest one. Each epoch is
//! distributed as a [`Ticket`], a session message together with the participants valid as of that
//! epoch.
//!
//! Tickets travel through three places:
//!
//! - cloud storage ([`CloudTicketStorage`]), the source of truth, which only hands tickets to
//!   their recipients,
//! - an encrypted local cache per identity ([`GroupLocalStorage`]) on top of any
//!   [`keyhaven_store::KeyValueStore`],
//! - an in-memory index of loaded groups ([`GroupCache`]).
//!
//! [`GroupManager`] keeps them in sync. [`Account`] is the entry point for applications: it
//! registers the local user with an identity directory ([`CardManager`]) and creates, loads,
//! finds and deletes [`Group`]s.
//!
//! Adding participants shares the existing epochs with them, removing participants rotates the
//! group into a new epoch which removed participants never receive. Only the initiator of a group
//! can change its participants.
pub mod account;
pub mod card;
mod cbor;
pub mod cloud;
pub mod config;
pub mod crypto;
pub mod data;
pub mod group;
pub mod key_loader;
pub mod latch;
pub mod local_storage;
pub mod manager;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod ticket;

pub use account::{Account, AccountError, AccountErrorFor};
pub use card::{Card, CardManager, Cards, FindUsersResult};
pub use cbor::CborError;
pub use cloud::{CloudTicketStorage, TicketStorageProvider};
pub use config::Config;
pub use crypto::{
    Crypto, CryptoError, GroupSession, GroupSessionMessage, KeyPair, NativeCrypto, PublicKey,
    SessionId,
};
pub use data::Data;
pub use group::{Group, GroupError, GroupErrorFor, MAX_PARTICIPANTS, MIN_PARTICIPANTS};
#[cfg(feature = "sqlite")]
pub use keyhaven_store::SqliteStore;
pub use key_loader::KeyLoader;
pub use local_storage::{GroupLocalStorage, LocalStorageError, RetrieveOptions};
pub use manager::{GroupCache, GroupManager};
pub use ticket::Ticket;
