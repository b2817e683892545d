// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

use keyhaven_store::KeyValueStore;
use thiserror::Error;
use tracing::{debug, info};

use crate::card::{Card, CardManager, Cards, FindUsersResult};
use crate::cloud::TicketStorageProvider;
use crate::config::Config;
use crate::crypto::{Crypto, CryptoError, GroupSession, SessionId};
use crate::group::{Group, GroupError, GroupErrorFor};
use crate::key_loader::KeyLoader;
use crate::latch::Latch;
use crate::local_storage::LocalStorageError;
use crate::manager::{GroupCache, GroupManager};
use crate::ticket::Ticket;

/// Account-level error types of the collaborators of an account.
pub type AccountErrorFor<D, P, S> = AccountError<
    <D as CardManager>::Error,
    <P as TicketStorageProvider>::Error,
    <S as KeyValueStore>::Error,
>;

/// Local user with their key pair, published card and groups.
pub struct Account<C, D, P, S>
where
    C: Crypto,
{
    manager: GroupManager<C, D, P, S>,
    latch: Latch,
}

impl<C, D, P, S> Account<C, D, P, S>
where
    C: Crypto,
    D: CardManager,
    P: TicketStorageProvider,
    S: KeyValueStore + Clone,
{
    pub fn new(
        config: Config,
        crypto: C,
        directory: D,
        provider: P,
        backend: S,
        cache: GroupCache<C::Session>,
    ) -> Self {
        let key_loader = KeyLoader::new(config.identity());
        Self {
            manager: GroupManager::new(
                config, crypto, directory, provider, key_loader, backend, cache,
            ),
            latch: Latch::default(),
        }
    }

    pub fn identity(&self) -> &str {
        self.manager.identity()
    }

    pub fn manager(&self) -> &GroupManager<C, D, P, S> {
        &self.manager
    }

    pub async fn has_local_key_pair(&self) -> bool {
        self.manager.key_loader().has_key_pair().await
    }

    /// Generates a key pair and publishes a card for it.
    pub async fn register(&self) -> Result<Card, AccountErrorFor<D, P, S>> {
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(AccountError::IllegalInvocation)?;

        if self.has_local_key_pair().await {
            return Err(AccountError::AlreadyRegistered);
        }

        let key_pair = self
            .manager
            .crypto()
            .generate_key_pair()
            .map_err(AccountError::Crypto)?;
        let card = self
            .manager
            .directory()
            .publish_card(self.identity(), &key_pair)
            .await
            .map_err(AccountError::Directory)?;

        self.manager
            .local_storage()
            .set_encryption_key_pair(key_pair.clone())
            .map_err(AccountError::LocalStorage)?;
        self.manager.key_loader().set_key_pair(key_pair).await;

        info!(identity = self.identity(), card_id = %card.id, "registered account");
        Ok(card)
    }

    /// Revokes all published cards of this identity and removes all local state.
    pub async fn unregister(&self) -> Result<(), AccountErrorFor<D, P, S>> {
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(AccountError::IllegalInvocation)?;

        if !self.has_local_key_pair().await {
            return Err(AccountError::RegistrationRequired);
        }

        let directory = self.manager.directory();
        let cards = directory
            .search_cards(&[self.identity().to_owned()])
            .await
            .map_err(AccountError::Directory)?;
        for card in cards {
            directory
                .revoke_card(&card.id)
                .await
                .map_err(AccountError::Directory)?;
        }

        self.clear_local_state().await?;
        info!(identity = self.identity(), "unregistered account");
        Ok(())
    }

    /// Removes cached groups and the local key pair.
    pub async fn cleanup(&self) -> Result<(), AccountErrorFor<D, P, S>> {
        let _guard = self
            .latch
            .try_acquire()
            .ok_or(AccountError::IllegalInvocation)?;
        self.clear_local_state().await
    }

    async fn clear_local_state(&self) -> Result<(), AccountErrorFor<D, P, S>> {
        let local_storage = self.manager.local_storage();
        if local_storage.has_encryption_key_pair() {
            local_storage
                .reset()
                .await
                .map_err(AccountError::LocalStorage)?;
            local_storage
                .clear_encryption_key_pair()
                .map_err(AccountError::LocalStorage)?;
        }
        self.manager.key_loader().clear().await;
        self.manager.cache().clear().await;
        debug!(identity = self.identity(), "cleared local state");
        Ok(())
    }

    /// Latest cards of the given identities.
    pub async fn find_users(
        &self,
        identities: &[String],
    ) -> Result<FindUsersResult, AccountErrorFor<D, P, S>> {
        let mut result: FindUsersResult = self
            .manager
            .directory()
            .search_cards(identities)
            .await
            .map_err(AccountError::Directory)?
            .into_iter()
            .map(|card| (card.identity.clone(), card))
            .collect();

        for identity in identities {
            if !result.contains_key(identity) {
                return Err(AccountError::CardNotFound(identity.clone()));
            }
        }
        result.retain(|identity, _| identities.contains(identity));
        Ok(result)
    }

    fn session_id(&self, group_id: &[u8]) -> Result<SessionId, GroupErrorFor<D, P, S>> {
        let min_length = self.manager.config().group_id_min_length();
        if group_id.len() < min_length {
            return Err(GroupError::ShortGroupId(min_length));
        }
        Ok(self.manager.crypto().calculate_group_session_id(group_id))
    }

    /// Creates a group with the local user as initiator.
    ///
    /// The local user is always a participant, whether their card is given or not.
    pub async fn create_group(
        &self,
        group_id: impl AsRef<[u8]>,
        participants: impl Into<Cards>,
    ) -> Result<Group<C, D, P, S>, GroupErrorFor<D, P, S>> {
        let session_id = self.session_id(group_id.as_ref())?;
        if !self.has_local_key_pair().await {
            return Err(GroupError::RegistrationRequired);
        }

        let cards: Vec<Card> = participants
            .into()
            .into_vec()
            .into_iter()
            .filter(|card| card.identity != self.identity())
            .collect();
        let mut identities: BTreeSet<String> =
            cards.iter().map(|card| card.identity.clone()).collect();
        identities.insert(self.identity().to_owned());

        let session = self
            .manager
            .crypto()
            .generate_group_session(session_id)
            .map_err(GroupError::Crypto)?;
        let ticket = Ticket::new(session.current_epoch_message(), identities);
        self.manager.store(ticket, &cards).await
    }

    /// Pulls a group shared with the local user from the cloud.
    pub async fn load_group(
        &self,
        group_id: impl AsRef<[u8]>,
        initiator_card: &Card,
    ) -> Result<Group<C, D, P, S>, GroupErrorFor<D, P, S>> {
        let session_id = self.session_id(group_id.as_ref())?;
        self.manager.pull(&session_id, initiator_card).await
    }

    /// Group from memory, or from the local cache if it is not loaded yet.
    pub async fn get_group(
        &self,
        group_id: impl AsRef<[u8]>,
    ) -> Result<Option<Group<C, D, P, S>>, GroupErrorFor<D, P, S>> {
        let session_id = self.session_id(group_id.as_ref())?;
        if let Some(group) = self.manager.retrieve(&session_id).await {
            return Ok(Some(group));
        }
        self.manager.restore(&session_id).await
    }

    /// Deletes a group everywhere, only the initiator can do this.
    pub async fn delete_group(
        &self,
        group_id: impl AsRef<[u8]>,
    ) -> Result<(), GroupErrorFor<D, P, S>> {
        let session_id = self.session_id(group_id.as_ref())?;
        let group = self
            .get_group(group_id)
            .await?
            .ok_or(GroupError::GroupNotFound)?;
        if !group.is_editable() {
            return Err(GroupError::PermissionDenied);
        }

        let _guard = group
            .latch
            .try_acquire()
            .ok_or(GroupError::IllegalInvocation)?;
        self.manager.delete(&session_id).await
    }
}

#[derive(Debug, Error)]
pub enum AccountError<D, T, S> {
    #[error("account is already registered")]
    AlreadyRegistered,

    #[error("local user needs to register first")]
    RegistrationRequired,

    #[error("another account operation is in progress")]
    IllegalInvocation,

    #[error("no card found for {0}")]
    CardNotFound(String),

    #[error(transparent)]
    Crypto(CryptoError),

    #[error("identity directory failed: {0}")]
    Directory(D),

    #[error(transparent)]
    LocalStorage(LocalStorageError<S>),

    #[error(transparent)]
    Group(#[from] GroupError<D, T, S>),
}
