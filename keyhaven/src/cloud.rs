// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport of group tickets through cloud storage.
//!
//! The cloud side enforces access per ticket: only recipients a ticket was shared with can
//! retrieve it. Tickets are signed by the group initiator who uploaded them, retrieval verifies
//! them against the initiator's public key.
use std::error::Error;

use crate::card::Card;
use crate::crypto::{KeyPair, PublicKey, SessionId};
use crate::ticket::Ticket;

/// Opens connections to the cloud ticket storage on behalf of a local user.
pub trait TicketStorageProvider {
    type Error: Error + 'static;

    type Storage: CloudTicketStorage<Error = Self::Error>;

    fn connect(&self, identity: &str, key_pair: &KeyPair) -> Result<Self::Storage, Self::Error>;
}

/// Cloud ticket storage as seen by one local user.
pub trait CloudTicketStorage {
    type Error: Error + 'static;

    /// Uploads a ticket and shares it with the given cards.
    fn store(
        &self,
        ticket: &Ticket,
        cards: &[Card],
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// All tickets of a session shared with the local user.
    ///
    /// Returns an empty list when the session is unknown or access was revoked. Participants of
    /// the returned tickets reflect the recipients they are currently shared with.
    fn retrieve(
        &self,
        session_id: &SessionId,
        initiator: &str,
        initiator_public_key: &PublicKey,
    ) -> impl Future<Output = Result<Vec<Ticket>, Self::Error>>;

    /// Shares all tickets of a session with additional cards.
    fn add_recipients(
        &self,
        session_id: &SessionId,
        cards: &[Card],
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Revokes access of one identity to all tickets of a session.
    fn remove_recipient(
        &self,
        session_id: &SessionId,
        identity: &str,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn delete(&self, session_id: &SessionId) -> impl Future<Output = Result<(), Self::Error>>;
}
