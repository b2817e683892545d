// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted group chat on top of a ratcheting group session.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use keyhaven_store::KeyValueStore;
use thiserror::Error;
use tracing::debug;

use crate::card::{Card, CardManager, Cards};
use crate::cloud::TicketStorageProvider;
use crate::crypto::{Crypto, CryptoError, GroupSession, SessionId};
use crate::data::Data;
use crate::latch::Latch;
use crate::local_storage::LocalStorageError;
use crate::manager::{CachedGroup, GroupManager};
use crate::ticket::Ticket;

/// Smallest number of participants a group can have, the initiator included.
pub const MIN_PARTICIPANTS: usize = 2;

/// Largest number of participants a group can have, the initiator included.
pub const MAX_PARTICIPANTS: usize = 100;

/// Group errors with the error types of the collaborators of a manager.
pub type GroupErrorFor<D, P, S> = GroupError<
    <D as CardManager>::Error,
    <P as TicketStorageProvider>::Error,
    <S as KeyValueStore>::Error,
>;

fn validate_participants_count<D, T, S>(count: usize) -> Result<(), GroupError<D, T, S>> {
    if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&count) {
        return Err(GroupError::InvalidParticipantsCount(count));
    }
    Ok(())
}

/// Handle to an end-to-end encrypted group.
///
/// Every participant holds the same sequence of epoch secrets. Removing participants rotates
/// into a new epoch which removed participants never receive, adding participants shares the
/// existing epochs with them.
///
/// Only the initiator who created the group can change its participants.
pub struct Group<C, D, P, S>
where
    C: Crypto,
{
    manager: GroupManager<C, D, P, S>,
    self_identity: String,
    initiator: String,
    participants: BTreeSet<String>,
    pub(crate) session: C::Session,
    pub(crate) latch: Latch,
}

impl<C, D, P, S> Group<C, D, P, S>
where
    C: Crypto,
    D: CardManager,
    P: TicketStorageProvider,
    S: KeyValueStore + Clone,
{
    /// Builds a group from tickets in any order.
    ///
    /// Participants are taken from the ticket with the highest epoch.
    pub(crate) async fn new(
        manager: GroupManager<C, D, P, S>,
        initiator: String,
        mut tickets: Vec<Ticket>,
    ) -> Result<Self, GroupErrorFor<D, P, S>> {
        tickets.sort_by_key(Ticket::epoch_number);
        let Some(last) = tickets.last() else {
            return Err(GroupError::EmptyTickets);
        };
        validate_participants_count(last.participants().len())?;
        let participants = last.participants().clone();

        let messages: Vec<_> = tickets
            .iter()
            .map(|ticket| ticket.group_session_message().clone())
            .collect();
        let session = manager
            .crypto()
            .import_group_session(&messages)
            .map_err(GroupError::Crypto)?;
        let latch = manager.latch(&session.session_id()).await;

        Ok(Self {
            self_identity: manager.identity().to_owned(),
            manager,
            initiator,
            participants,
            session,
            latch,
        })
    }

    pub(crate) async fn from_cached(
        manager: GroupManager<C, D, P, S>,
        cached: CachedGroup<C::Session>,
    ) -> Self {
        let latch = manager.latch(&cached.session.session_id()).await;
        Self {
            self_identity: manager.identity().to_owned(),
            manager,
            initiator: cached.initiator,
            participants: cached.participants,
            session: cached.session,
            latch,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.session_id()
    }

    pub fn current_epoch_number(&self) -> u32 {
        self.session.current_epoch_number()
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }

    /// True if the local user created this group and can change its participants.
    pub fn is_editable(&self) -> bool {
        self.initiator == self.self_identity
    }

    fn ensure_editable(&self) -> Result<(), GroupErrorFor<D, P, S>> {
        if !self.is_editable() {
            return Err(GroupError::PermissionDenied);
        }
        Ok(())
    }

    /// Encrypts and signs data with the current epoch.
    ///
    /// Text is returned as base64 text, bytes stay bytes.
    pub async fn encrypt(&self, data: impl Into<Data>) -> Result<Data, GroupErrorFor<D, P, S>> {
        let data = data.into();
        let key_pair = self.manager.key_pair().await?;
        let ciphertext = self
            .session
            .encrypt(data.as_bytes(), &key_pair.private_key)
            .map_err(GroupError::Crypto)?;
        Ok(Data::from_ciphertext(ciphertext, data.is_text()))
    }

    /// Verifies and decrypts data encrypted by a participant.
    ///
    /// With `encrypted_on` the sender card which was active at that time verifies the signature.
    /// Messages older than the ratchet window are decrypted with a snapshot of the group at their
    /// epoch taken from the local cache.
    pub async fn decrypt(
        &self,
        data: impl Into<Data>,
        sender_card: &Card,
        encrypted_on: Option<u64>,
    ) -> Result<Data, GroupErrorFor<D, P, S>> {
        let data = data.into();
        let ciphertext = data.ciphertext().map_err(|_| GroupError::InvalidEncoding)?;
        let (session_id, epoch_number) = self
            .session
            .parse_message(&ciphertext)
            .map_err(GroupError::Crypto)?;

        if session_id != self.session_id() {
            return Err(GroupError::MessageNotFromThisGroup);
        }

        let current_epoch_number = self.current_epoch_number();
        if epoch_number > current_epoch_number {
            return Err(GroupError::GroupIsOutdated);
        }

        let card = match encrypted_on {
            Some(timestamp) => sender_card.active_at(timestamp),
            None => sender_card,
        };

        let ratchet_window = self.manager.config().ratchet_window();
        let plaintext = if current_epoch_number - epoch_number < ratchet_window {
            self.session.decrypt(&ciphertext, &card.public_key)
        } else {
            debug!(%session_id, epoch_number, "decrypt with cached group snapshot");
            let snapshot = self
                .manager
                .retrieve_at_epoch(&session_id, epoch_number)
                .await?
                .ok_or(GroupError::LocalGroupNotFound(epoch_number))?;
            snapshot.session.decrypt(&ciphertext, &card.public_key)
        };

        let plaintext = plaintext.map_err(|err| match err {
            CryptoError::VerificationFailed => GroupError::DataVerificationFailed,
            err => GroupError::Crypto(err),
        })?;
        Data::from_plaintext(plaintext, data.is_text()).map_err(|_| GroupError::InvalidEncoding)
    }

    /// Pulls the latest tickets of this group from the cloud.
    pub async fn update(&mut self) -> Result<(), GroupErrorFor<D, P, S>> {
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(GroupError::IllegalInvocation)?;

        let initiator_card = self
            .manager
            .directory()
            .search_cards(std::slice::from_ref(&self.initiator))
            .await
            .map_err(GroupError::Directory)?
            .into_iter()
            .find(|card| card.identity == self.initiator)
            .ok_or_else(|| GroupError::CardNotFound(self.initiator.clone()))?;

        let group = self
            .manager
            .pull(&self.session_id(), &initiator_card)
            .await?;
        self.participants = group.participants;
        self.session = group.session;
        Ok(())
    }

    /// Shares the group with new participants.
    ///
    /// No new epoch is created, added participants can read all retained history. Cards of
    /// identities which already participate are ignored.
    pub async fn add(&mut self, cards: impl Into<Cards>) -> Result<(), GroupErrorFor<D, P, S>> {
        self.ensure_editable()?;
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(GroupError::IllegalInvocation)?;

        let mut missing = BTreeMap::new();
        for card in cards.into().into_vec() {
            if !self.participants.contains(&card.identity) {
                missing.entry(card.identity.clone()).or_insert(card);
            }
        }
        if missing.is_empty() {
            return Err(GroupError::InvalidChangeParticipants);
        }
        validate_participants_count(self.participants.len() + missing.len())?;

        let session_id = self.session_id();
        let identities: BTreeSet<String> = missing.keys().cloned().collect();
        let cards: Vec<Card> = missing.into_values().collect();
        self.manager.add_access(&session_id, &cards).await?;
        self.manager
            .add_participants(&session_id, &identities)
            .await?;

        self.participants.extend(identities);
        self.manager.index(self).await;
        debug!(%session_id, added = cards.len(), "added participants");
        Ok(())
    }

    /// Removes participants and rotates the group into a new epoch.
    ///
    /// Removed participants keep access to epochs they already had but never receive the new
    /// one. Cards of identities which do not participate are ignored.
    pub async fn remove(&mut self, cards: impl Into<Cards>) -> Result<(), GroupErrorFor<D, P, S>> {
        self.ensure_editable()?;
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(GroupError::IllegalInvocation)?;

        let removed: BTreeSet<String> = cards
            .into()
            .into_vec()
            .into_iter()
            .map(|card| card.identity)
            .filter(|identity| self.participants.contains(identity))
            .collect();
        if removed.is_empty() {
            return Err(GroupError::InvalidChangeParticipants);
        }
        let participants: BTreeSet<String> =
            self.participants.difference(&removed).cloned().collect();
        validate_participants_count(participants.len())?;

        let mut session = self.session.clone();
        let message = session.add_new_epoch().map_err(GroupError::Crypto)?;
        let ticket = Ticket::new(message, participants.clone());

        let identities: Vec<String> = participants.iter().cloned().collect();
        let cards = self
            .manager
            .directory()
            .search_cards(&identities)
            .await
            .map_err(GroupError::Directory)?;

        let session_id = self.session_id();
        self.manager.store_ticket(&ticket, &cards).await?;
        self.manager.remove_access(&session_id, &removed).await?;

        self.session = session;
        self.participants = participants;
        self.manager.index(self).await;
        debug!(
            %session_id,
            epoch = ticket.epoch_number(),
            removed = removed.len(),
            "removed participants"
        );
        Ok(())
    }

    /// Grants cloud access to a participant again, for example after they lost their local
    /// state and registered a new card.
    pub async fn re_add(&self, card: &Card) -> Result<(), GroupErrorFor<D, P, S>> {
        self.ensure_editable()?;
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(GroupError::IllegalInvocation)?;

        self.manager
            .add_access(&self.session_id(), std::slice::from_ref(card))
            .await
    }
}

impl<C, D, P, S> fmt::Debug for Group<C, D, P, S>
where
    C: Crypto,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("session_id", &self.session.session_id())
            .field("epoch_number", &self.session.current_epoch_number())
            .field("initiator", &self.initiator)
            .field("participants", &self.participants)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum GroupError<D, T, S> {
    #[error("group needs between 2 and 100 participants, got {0}")]
    InvalidParticipantsCount(usize),

    #[error("can not build a group without tickets")]
    EmptyTickets,

    #[error("given participants do not change the group")]
    InvalidChangeParticipants,

    #[error("group id needs to be at least {0} bytes long")]
    ShortGroupId(usize),

    #[error("only the group initiator can change participants")]
    PermissionDenied,

    #[error("message was encrypted for another group")]
    MessageNotFromThisGroup,

    #[error("message is from a newer epoch, update the group first")]
    GroupIsOutdated,

    #[error("no cached group snapshot at epoch {0}")]
    LocalGroupNotFound(u32),

    #[error("group was not found or access was revoked")]
    GroupNotFound,

    #[error("signature of the sender could not be verified")]
    DataVerificationFailed,

    #[error("data is not valid base64 or utf-8")]
    InvalidEncoding,

    #[error("local user needs to register first")]
    RegistrationRequired,

    #[error("another operation on this group is in progress")]
    IllegalInvocation,

    #[error("no card found for {0}")]
    CardNotFound(String),

    #[error(transparent)]
    Crypto(CryptoError),

    #[error("identity directory failed: {0}")]
    Directory(D),

    #[error("cloud ticket storage failed: {0}")]
    Cloud(T),

    #[error(transparent)]
    LocalStorage(LocalStorageError<S>),
}
