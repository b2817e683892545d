// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::card::Card;
use crate::cbor::{CborError, encode_cbor};
use crate::cloud::{CloudTicketStorage, TicketStorageProvider};
use crate::crypto::{KeyPair, PublicKey, SessionId};
use crate::ticket::Ticket;

#[derive(Debug)]
struct StoredTicket {
    ticket: Ticket,
    signature: Vec<u8>,
    recipients: BTreeSet<String>,
}

#[derive(Debug)]
struct CloudSession {
    owner: String,
    tickets: BTreeMap<u32, StoredTicket>,
}

type Sessions = Arc<RwLock<HashMap<SessionId, CloudSession>>>;

/// Cloud ticket storage kept in memory and shared by all connected users.
///
/// Sessions belong to the identity which uploaded the first ticket. Tickets are signed on upload
/// and verified against the initiator's public key on retrieval.
#[derive(Clone, Debug, Default)]
pub struct MemoryCloud {
    sessions: Sessions,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recipients of a ticket, for inspection in tests.
    pub async fn recipients(
        &self,
        session_id: &SessionId,
        epoch_number: u32,
    ) -> Option<BTreeSet<String>> {
        let sessions = self.sessions.read().await;
        let stored = sessions.get(session_id)?.tickets.get(&epoch_number)?;
        Some(stored.recipients.clone())
    }
}

impl TicketStorageProvider for MemoryCloud {
    type Error = MemoryCloudError;

    type Storage = MemoryCloudStorage;

    fn connect(&self, identity: &str, key_pair: &KeyPair) -> Result<Self::Storage, Self::Error> {
        Ok(MemoryCloudStorage {
            sessions: self.sessions.clone(),
            identity: identity.to_owned(),
            key_pair: key_pair.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryCloudStorage {
    sessions: Sessions,
    identity: String,
    key_pair: KeyPair,
}

impl MemoryCloudStorage {
    fn owned<'a>(
        &self,
        sessions: &'a mut HashMap<SessionId, CloudSession>,
        session_id: &SessionId,
    ) -> Result<&'a mut CloudSession, MemoryCloudError> {
        let session = sessions
            .get_mut(session_id)
            .ok_or(MemoryCloudError::SessionNotFound(*session_id))?;
        if session.owner != self.identity {
            return Err(MemoryCloudError::PermissionDenied);
        }
        Ok(session)
    }
}

impl CloudTicketStorage for MemoryCloudStorage {
    type Error = MemoryCloudError;

    async fn store(&self, ticket: &Ticket, cards: &[Card]) -> Result<(), Self::Error> {
        let signature = self
            .key_pair
            .private_key
            .sign(&encode_cbor(ticket)?)
            .to_bytes()
            .to_vec();

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(ticket.session_id())
            .or_insert_with(|| CloudSession {
                owner: self.identity.clone(),
                tickets: BTreeMap::new(),
            });
        if session.owner != self.identity {
            return Err(MemoryCloudError::PermissionDenied);
        }

        let mut recipients: BTreeSet<String> =
            cards.iter().map(|card| card.identity.clone()).collect();
        recipients.insert(self.identity.clone());
        session.tickets.insert(
            ticket.epoch_number(),
            StoredTicket {
                ticket: ticket.clone(),
                signature,
                recipients,
            },
        );
        Ok(())
    }

    async fn retrieve(
        &self,
        session_id: &SessionId,
        initiator: &str,
        initiator_public_key: &PublicKey,
    ) -> Result<Vec<Ticket>, Self::Error> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        if session.owner != initiator {
            return Err(MemoryCloudError::VerificationFailed);
        }

        let mut tickets = Vec::new();
        for stored in session.tickets.values() {
            if !stored.recipients.contains(&self.identity) {
                continue;
            }
            if !initiator_public_key.verify(&encode_cbor(&stored.ticket)?, &stored.signature) {
                return Err(MemoryCloudError::VerificationFailed);
            }
            tickets.push(Ticket::new(
                stored.ticket.group_session_message().clone(),
                stored.recipients.clone(),
            ));
        }
        Ok(tickets)
    }

    async fn add_recipients(
        &self,
        session_id: &SessionId,
        cards: &[Card],
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.write().await;
        let session = self.owned(&mut sessions, session_id)?;
        for stored in session.tickets.values_mut() {
            stored
                .recipients
                .extend(cards.iter().map(|card| card.identity.clone()));
        }
        Ok(())
    }

    async fn remove_recipient(
        &self,
        session_id: &SessionId,
        identity: &str,
    ) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.write().await;
        let session = self.owned(&mut sessions, session_id)?;
        for stored in session.tickets.values_mut() {
            stored.recipients.remove(identity);
        }
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.write().await;
        self.owned(&mut sessions, session_id)?;
        sessions.remove(session_id);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MemoryCloudError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("only the owner of a session can change it")]
    PermissionDenied,

    #[error("ticket signature could not be verified")]
    VerificationFailed,

    #[error(transparent)]
    Cbor(#[from] CborError),
}
