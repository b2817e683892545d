// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::card::{Card, CardManager};
use crate::crypto::KeyPair;

/// Identity directory kept in memory, with a logical clock for card timestamps.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    cards: Arc<RwLock<BTreeMap<String, Card>>>,
    clock: Arc<AtomicU64>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the most recently published card.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

impl CardManager for MemoryDirectory {
    type Error = MemoryDirectoryError;

    async fn search_cards(&self, identities: &[String]) -> Result<Vec<Card>, Self::Error> {
        let cards = self.cards.read().await;
        Ok(identities
            .iter()
            .filter_map(|identity| cards.get(identity).cloned())
            .collect())
    }

    async fn publish_card(&self, identity: &str, key_pair: &KeyPair) -> Result<Card, Self::Error> {
        let mut cards = self.cards.write().await;
        let created_at = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let card = Card {
            id: key_pair.public_key.to_hex(),
            identity: identity.to_owned(),
            public_key: key_pair.public_key,
            created_at,
            previous_card: cards.remove(identity).map(Box::new),
        };
        cards.insert(identity.to_owned(), card.clone());
        Ok(card)
    }

    async fn revoke_card(&self, card_id: &str) -> Result<(), Self::Error> {
        let mut cards = self.cards.write().await;
        let identity = cards
            .iter()
            .find(|(_, card)| card.id == card_id)
            .map(|(identity, _)| identity.clone())
            .ok_or_else(|| MemoryDirectoryError::CardNotFound(card_id.to_owned()))?;
        cards.remove(&identity);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MemoryDirectoryError {
    #[error("card {0} not found")]
    CardNotFound(String),
}
