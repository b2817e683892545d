// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use keyhaven_store::KeyValueStore;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::card::{Card, CardManager};
use crate::cloud::{CloudTicketStorage, TicketStorageProvider};
use crate::config::Config;
use crate::crypto::{Crypto, KeyPair, SessionId};
use crate::group::{Group, GroupError, GroupErrorFor};
use crate::key_loader::KeyLoader;
use crate::latch::Latch;
use crate::local_storage::{GroupInfo, GroupLocalStorage, RawGroup, RetrieveOptions};
use crate::ticket::Ticket;

/// Last known state of a group, shared between all handles to the same session.
#[derive(Clone, Debug)]
pub(crate) struct CachedGroup<T> {
    pub(crate) initiator: String,
    pub(crate) participants: BTreeSet<String>,
    pub(crate) session: T,
}

/// In-memory index of groups by session id.
///
/// Passed in when creating an account so the index can be shared or inspected, it is never a
/// process-wide global.
#[derive(Debug)]
pub struct GroupCache<T> {
    groups: Arc<RwLock<HashMap<SessionId, CachedGroup<T>>>>,
}

impl<T> GroupCache<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.groups.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.read().await.is_empty()
    }

    pub(crate) async fn get(&self, session_id: &SessionId) -> Option<CachedGroup<T>> {
        self.groups.read().await.get(session_id).cloned()
    }

    pub(crate) async fn insert(&self, session_id: SessionId, group: CachedGroup<T>) {
        self.groups.write().await.insert(session_id, group);
    }

    pub(crate) async fn remove(&self, session_id: &SessionId) {
        self.groups.write().await.remove(session_id);
    }

    pub(crate) async fn clear(&self) {
        self.groups.write().await.clear();
    }
}

impl<T> Clone for GroupCache<T> {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups.clone(),
        }
    }
}

impl<T> Default for GroupCache<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

struct ManagerInner<C, D, P, S>
where
    C: Crypto,
{
    config: Config,
    crypto: C,
    directory: D,
    provider: P,
    key_loader: KeyLoader,
    local_storage: GroupLocalStorage<S, C>,
    cache: GroupCache<C::Session>,
    latches: Mutex<HashMap<SessionId, Latch>>,
}

/// Coordinates group tickets between cloud storage, the local cache and the in-memory index.
///
/// Cloud storage is the source of truth. Every successful cloud write is mirrored into the local
/// cache of the current identity, every group built from tickets is indexed by its session id.
///
/// Clones share all state.
pub struct GroupManager<C, D, P, S>
where
    C: Crypto,
{
    inner: Arc<ManagerInner<C, D, P, S>>,
}

impl<C, D, P, S> Clone for GroupManager<C, D, P, S>
where
    C: Crypto,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, D, P, S> GroupManager<C, D, P, S>
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
        key_loader: KeyLoader,
        backend: S,
        cache: GroupCache<C::Session>,
    ) -> Self {
        let local_storage = GroupLocalStorage::new(config.identity(), backend, crypto.clone());
        Self {
            inner: Arc::new(ManagerInner {
                config,
                crypto,
                directory,
                provider,
                key_loader,
                local_storage,
                cache,
                latches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        self.inner.config.identity()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn crypto(&self) -> &C {
        &self.inner.crypto
    }

    pub fn directory(&self) -> &D {
        &self.inner.directory
    }

    pub fn key_loader(&self) -> &KeyLoader {
        &self.inner.key_loader
    }

    pub fn local_storage(&self) -> &GroupLocalStorage<S, C> {
        &self.inner.local_storage
    }

    pub fn cache(&self) -> &GroupCache<C::Session> {
        &self.inner.cache
    }

    pub(crate) async fn key_pair(&self) -> Result<KeyPair, GroupErrorFor<D, P, S>> {
        self.inner
            .key_loader
            .key_pair()
            .await
            .ok_or(GroupError::RegistrationRequired)
    }

    /// Latch shared by all handles of the same group.
    pub(crate) async fn latch(&self, session_id: &SessionId) -> Latch {
        self.inner
            .latches
            .lock()
            .await
            .entry(*session_id)
            .or_default()
            .clone()
    }

    async fn cloud(&self) -> Result<P::Storage, GroupErrorFor<D, P, S>> {
        let key_pair = self.key_pair().await?;
        self.inner
            .provider
            .connect(self.identity(), &key_pair)
            .map_err(GroupError::Cloud)
    }

    async fn local(&self) -> Result<&GroupLocalStorage<S, C>, GroupErrorFor<D, P, S>> {
        let local_storage = &self.inner.local_storage;
        if !local_storage.has_encryption_key_pair() {
            let key_pair = self.key_pair().await?;
            local_storage
                .set_encryption_key_pair(key_pair)
                .map_err(GroupError::LocalStorage)?;
        }
        Ok(local_storage)
    }

    pub(crate) async fn index(&self, group: &Group<C, D, P, S>) {
        self.inner
            .cache
            .insert(
                group.session_id(),
                CachedGroup {
                    initiator: group.initiator().to_owned(),
                    participants: group.participants().clone(),
                    session: group.session.clone(),
                },
            )
            .await;
    }

    /// Publishes the first ticket of a new group and shares it with the given cards.
    pub async fn store(
        &self,
        ticket: Ticket,
        cards: &[Card],
    ) -> Result<Group<C, D, P, S>, GroupErrorFor<D, P, S>> {
        let session_id = ticket.session_id();
        let group = Group::new(
            self.clone(),
            self.identity().to_owned(),
            vec![ticket.clone()],
        )
        .await?;

        let cloud = self.cloud().await?;
        cloud
            .store(&ticket, cards)
            .await
            .map_err(GroupError::Cloud)?;

        self.local()
            .await?
            .store(&RawGroup {
                info: GroupInfo {
                    initiator: self.identity().to_owned(),
                },
                tickets: vec![ticket],
            })
            .await
            .map_err(GroupError::LocalStorage)?;

        self.index(&group).await;
        debug!(%session_id, participants = group.participants().len(), "created group");
        Ok(group)
    }

    /// Fetches all tickets of a group from the cloud and refreshes the local state.
    ///
    /// When the cloud returns nothing, access was revoked or the group was deleted. Local state of
    /// the group is then evicted.
    pub async fn pull(
        &self,
        session_id: &SessionId,
        initiator_card: &Card,
    ) -> Result<Group<C, D, P, S>, GroupErrorFor<D, P, S>> {
        let cloud = self.cloud().await?;
        let tickets = cloud
            .retrieve(
                session_id,
                &initiator_card.identity,
                &initiator_card.public_key,
            )
            .await
            .map_err(GroupError::Cloud)?;

        if tickets.is_empty() {
            warn!(%session_id, "group not available in cloud, evict local state");
            self.local()
                .await?
                .delete(session_id)
                .await
                .map_err(GroupError::LocalStorage)?;
            self.inner.cache.remove(session_id).await;
            return Err(GroupError::GroupNotFound);
        }

        let group = Group::new(
            self.clone(),
            initiator_card.identity.clone(),
            tickets.clone(),
        )
        .await?;

        self.local()
            .await?
            .store(&RawGroup {
                info: GroupInfo {
                    initiator: initiator_card.identity.clone(),
                },
                tickets,
            })
            .await
            .map_err(GroupError::LocalStorage)?;

        self.index(&group).await;
        debug!(
            %session_id,
            epoch = group.current_epoch_number(),
            "pulled group from cloud"
        );
        Ok(group)
    }

    /// Group from the in-memory index.
    pub async fn retrieve(&self, session_id: &SessionId) -> Option<Group<C, D, P, S>> {
        let cached = self.inner.cache.get(session_id).await?;
        Some(Group::from_cached(self.clone(), cached).await)
    }

    /// Rebuilds a group from the local cache and indexes it.
    pub async fn restore(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Group<C, D, P, S>>, GroupErrorFor<D, P, S>> {
        let ticket_count = self.config().ratchet_window() as usize;
        let Some(raw) = self
            .local()
            .await?
            .retrieve(session_id, RetrieveOptions::ticket_count(ticket_count))
            .await
            .map_err(GroupError::LocalStorage)?
        else {
            return Ok(None);
        };

        let group = Group::new(self.clone(), raw.info.initiator, raw.tickets).await?;
        self.index(&group).await;
        debug!(%session_id, "restored group from local cache");
        Ok(Some(group))
    }

    /// Snapshot of a group pinned at an older epoch, built from the local cache.
    ///
    /// The snapshot is not indexed.
    pub async fn retrieve_at_epoch(
        &self,
        session_id: &SessionId,
        epoch_number: u32,
    ) -> Result<Option<Group<C, D, P, S>>, GroupErrorFor<D, P, S>> {
        let Some(raw) = self
            .local()
            .await?
            .retrieve(session_id, RetrieveOptions::epoch_number(epoch_number))
            .await
            .map_err(GroupError::LocalStorage)?
        else {
            return Ok(None);
        };

        let group = Group::new(self.clone(), raw.info.initiator, raw.tickets).await?;
        Ok(Some(group))
    }

    /// Shares all tickets of a group with additional cards in the cloud.
    pub async fn add_access(
        &self,
        session_id: &SessionId,
        cards: &[Card],
    ) -> Result<(), GroupErrorFor<D, P, S>> {
        self.cloud()
            .await?
            .add_recipients(session_id, cards)
            .await
            .map_err(GroupError::Cloud)
    }

    /// Records added participants in the locally cached latest ticket.
    pub async fn add_participants(
        &self,
        session_id: &SessionId,
        identities: &BTreeSet<String>,
    ) -> Result<(), GroupErrorFor<D, P, S>> {
        self.local()
            .await?
            .add_participants(session_id, identities)
            .await
            .map_err(GroupError::LocalStorage)
    }

    /// Revokes cloud access of the given identities, one at a time.
    pub async fn remove_access(
        &self,
        session_id: &SessionId,
        identities: &BTreeSet<String>,
    ) -> Result<(), GroupErrorFor<D, P, S>> {
        let cloud = self.cloud().await?;
        for identity in identities {
            cloud
                .remove_recipient(session_id, identity)
                .await
                .map_err(GroupError::Cloud)?;
        }
        Ok(())
    }

    /// Publishes the ticket of a new epoch and appends it to the local cache.
    pub async fn store_ticket(
        &self,
        ticket: &Ticket,
        cards: &[Card],
    ) -> Result<(), GroupErrorFor<D, P, S>> {
        self.cloud()
            .await?
            .store(ticket, cards)
            .await
            .map_err(GroupError::Cloud)?;

        self.local()
            .await?
            .push_ticket(ticket)
            .await
            .map_err(GroupError::LocalStorage)
    }

    /// Removes a group from cloud storage, the local cache and the index.
    pub async fn delete(&self, session_id: &SessionId) -> Result<(), GroupErrorFor<D, P, S>> {
        self.cloud()
            .await?
            .delete(session_id)
            .await
            .map_err(GroupError::Cloud)?;

        self.local()
            .await?
            .delete(session_id)
            .await
            .map_err(GroupError::LocalStorage)?;

        self.inner.cache.remove(session_id).await;
        debug!(%session_id, "deleted group");
        Ok(())
    }
}
