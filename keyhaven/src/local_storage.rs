// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted local cache of group sessions.
//!
//! Every local identity gets its own namespace inside a shared backend, and every value is sealed
//! with the identity's key pair. Per session one info record and one record per ticket are kept:
//!
//! ```text
//! <session_id>                    -> GroupInfo { initiator }
//! <session_id>!<digits>!<epoch>   -> Ticket
//! ```
//!
//! The backend orders keys lexicographically, so the epoch number alone would sort `"10"` before
//! `"9"`. Prefixing it with its number of decimal digits (one base-36 character) makes shorter
//! numbers always sort first and numbers of equal length sort by value.
use std::collections::BTreeSet;

use keyhaven_store::{
    BatchOperation, EncryptedStore, EncryptedStoreError, KeyRange, KeyValueStore, Namespace,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::cbor::{CborError, decode_cbor, encode_cbor};
use crate::crypto::{Crypto, CryptoError, KeyPair, SessionId};
use crate::ticket::Ticket;

const NAMESPACE: &str = "GROUPS";

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Record describing a group, written once when the group is first cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub initiator: String,
}

/// Cached state of a group.
#[derive(Clone, Debug)]
pub struct RawGroup {
    pub info: GroupInfo,
    pub tickets: Vec<Ticket>,
}

/// Selects which tickets to retrieve, exactly one option needs to be set.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetrieveOptions {
    /// Most recent tickets, up to this number.
    pub ticket_count: Option<usize>,

    /// Exactly the ticket of this epoch.
    pub epoch_number: Option<u32>,
}

impl RetrieveOptions {
    pub fn ticket_count(ticket_count: usize) -> Self {
        Self {
            ticket_count: Some(ticket_count),
            epoch_number: None,
        }
    }

    pub fn epoch_number(epoch_number: u32) -> Self {
        Self {
            ticket_count: None,
            epoch_number: Some(epoch_number),
        }
    }
}

fn info_key(session_id: &SessionId) -> Vec<u8> {
    session_id.to_hex().into_bytes()
}

fn tickets_prefix(session_id: &SessionId) -> Vec<u8> {
    format!("{}!", session_id.to_hex()).into_bytes()
}

fn ticket_key(session_id: &SessionId, epoch_number: u32) -> Vec<u8> {
    let epoch = epoch_number.to_string();
    // A u32 has at most 10 decimal digits.
    let digits = BASE36_DIGITS[epoch.len()] as char;
    format!("{}!{}!{}", session_id.to_hex(), digits, epoch).into_bytes()
}

/// Encrypted, per-identity cache of group tickets.
#[derive(Clone, Debug)]
pub struct GroupLocalStorage<S, C>
where
    C: Crypto,
{
    store: EncryptedStore<Namespace<S>, C>,
}

impl<S, C> GroupLocalStorage<S, C>
where
    S: KeyValueStore + Clone,
    C: Crypto,
{
    pub fn new(identity: &str, backend: S, crypto: C) -> Self {
        let namespace = Namespace::new(backend, identity).sub(NAMESPACE);
        Self {
            store: EncryptedStore::new(namespace, crypto),
        }
    }

    /// Sets the key pair all records are sealed with, required before any other call.
    pub fn set_encryption_key_pair(
        &self,
        key_pair: KeyPair,
    ) -> Result<(), LocalStorageError<S::Error>> {
        self.store
            .set_key_pair(key_pair)
            .map_err(LocalStorageError::Store)
    }

    /// Forgets the key pair, records stay sealed until a key pair is set again.
    pub fn clear_encryption_key_pair(&self) -> Result<(), LocalStorageError<S::Error>> {
        self.store
            .clear_key_pair()
            .map_err(LocalStorageError::Store)
    }

    pub fn has_encryption_key_pair(&self) -> bool {
        self.store.has_key_pair()
    }

    /// Writes the info record and all tickets of a group in one batch.
    pub async fn store(&self, group: &RawGroup) -> Result<(), LocalStorageError<S::Error>> {
        let Some(last) = group.tickets.last() else {
            return Err(LocalStorageError::EmptyTickets);
        };
        let session_id = last.session_id();

        let mut operations = vec![BatchOperation::put(
            info_key(&session_id),
            encode_cbor(&group.info)?,
        )];
        for ticket in &group.tickets {
            operations.push(BatchOperation::put(
                ticket_key(&ticket.session_id(), ticket.epoch_number()),
                encode_cbor(ticket)?,
            ));
        }

        debug!(%session_id, tickets = group.tickets.len(), "store group in local cache");
        self.store
            .batch(operations)
            .await
            .map_err(LocalStorageError::Store)
    }

    /// Cached group with the selected tickets in ascending epoch order.
    ///
    /// Returns `None` if the group or the requested tickets are not cached.
    pub async fn retrieve(
        &self,
        session_id: &SessionId,
        options: RetrieveOptions,
    ) -> Result<Option<RawGroup>, LocalStorageError<S::Error>> {
        let tickets = match (options.ticket_count, options.epoch_number) {
            (Some(ticket_count), None) if ticket_count > 0 => Query::Latest(ticket_count),
            (None, Some(epoch_number)) => Query::Epoch(epoch_number),
            _ => return Err(LocalStorageError::InvalidRetrieveOptions),
        };

        let Some(info) = self
            .store
            .get(&info_key(session_id))
            .await
            .map_err(LocalStorageError::Store)?
        else {
            return Ok(None);
        };
        let info: GroupInfo = decode_cbor(&info[..])?;

        let tickets = match tickets {
            Query::Epoch(epoch_number) => {
                match self
                    .store
                    .get(&ticket_key(session_id, epoch_number))
                    .await
                    .map_err(LocalStorageError::Store)?
                {
                    Some(ticket) => vec![decode_cbor(&ticket[..])?],
                    None => Vec::new(),
                }
            }
            Query::Latest(ticket_count) => {
                let mut tickets = self.latest_tickets(session_id, ticket_count).await?;
                tickets.reverse();
                tickets
            }
        };

        if tickets.is_empty() {
            return Ok(None);
        }

        trace!(%session_id, tickets = tickets.len(), "retrieve group from local cache");
        Ok(Some(RawGroup { info, tickets }))
    }

    /// Newest tickets first.
    async fn latest_tickets(
        &self,
        session_id: &SessionId,
        ticket_count: usize,
    ) -> Result<Vec<Ticket>, LocalStorageError<S::Error>> {
        let range = KeyRange::prefix(&tickets_prefix(session_id))
            .reversed()
            .limited(ticket_count);
        let entries = self
            .store
            .iter(&range)
            .await
            .map_err(LocalStorageError::Store)?;

        let mut tickets = Vec::new();
        for entry in entries {
            let (_, value) = entry.map_err(LocalStorageError::Store)?;
            tickets.push(decode_cbor(&value[..])?);
        }
        Ok(tickets)
    }

    /// Appends the ticket of a new epoch to an already cached group.
    pub async fn push_ticket(&self, ticket: &Ticket) -> Result<(), LocalStorageError<S::Error>> {
        self.store
            .put(
                &ticket_key(&ticket.session_id(), ticket.epoch_number()),
                &encode_cbor(ticket)?,
            )
            .await
            .map_err(LocalStorageError::Store)
    }

    /// Adds identities to the participants of the most recent cached ticket.
    ///
    /// Does nothing if the group is not cached.
    pub async fn add_participants(
        &self,
        session_id: &SessionId,
        identities: &BTreeSet<String>,
    ) -> Result<(), LocalStorageError<S::Error>> {
        let Some(mut ticket) = self.latest_tickets(session_id, 1).await?.pop() else {
            trace!(%session_id, "group not cached, skip adding participants");
            return Ok(());
        };
        ticket.participants.extend(identities.iter().cloned());
        self.push_ticket(&ticket).await
    }

    /// Removes the info record and all tickets of a group.
    pub async fn delete(&self, session_id: &SessionId) -> Result<(), LocalStorageError<S::Error>> {
        debug!(%session_id, "delete group from local cache");
        self.store
            .clear(&KeyRange::prefix(&info_key(session_id)))
            .await
            .map_err(LocalStorageError::Store)
    }

    /// Removes all cached groups of this identity.
    pub async fn reset(&self) -> Result<(), LocalStorageError<S::Error>> {
        debug!("reset local group cache");
        self.store
            .clear(&KeyRange::all())
            .await
            .map_err(LocalStorageError::Store)
    }
}

enum Query {
    Latest(usize),
    Epoch(u32),
}

#[derive(Debug, Error)]
pub enum LocalStorageError<E> {
    #[error("can not store a group without tickets")]
    EmptyTickets,

    #[error("exactly one of ticket count or epoch number needs to be given")]
    InvalidRetrieveOptions,

    #[error(transparent)]
    Store(EncryptedStoreError<E, CryptoError>),

    #[error(transparent)]
    Cbor(#[from] CborError),
}
