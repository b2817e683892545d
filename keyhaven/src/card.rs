// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identity directory mapping identities to their public key cards.
use std::collections::BTreeMap;
use std::error::Error;

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PublicKey};

/// Published public key of an identity.
///
/// Rotating a key publishes a new card which points at the card it replaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub identity: String,
    pub public_key: PublicKey,

    /// Publishing time in milliseconds.
    pub created_at: u64,

    pub previous_card: Option<Box<Card>>,
}

impl Card {
    /// Version of this card which was active at the given time.
    ///
    /// Falls back to the oldest known version if the timestamp predates all of them.
    pub fn active_at(&self, timestamp: u64) -> &Card {
        let mut card = self;
        while card.created_at > timestamp {
            match &card.previous_card {
                Some(previous) => card = previous,
                None => break,
            }
        }
        card
    }
}

/// Latest cards of found identities.
pub type FindUsersResult = BTreeMap<String, Card>;

/// Either a single card or a set of found users, accepted wherever multiple participants can be
/// given.
#[derive(Clone, Debug)]
pub enum Cards {
    Single(Card),
    Many(FindUsersResult),
}

impl Cards {
    pub fn into_vec(self) -> Vec<Card> {
        match self {
            Cards::Single(card) => vec![card],
            Cards::Many(cards) => cards.into_values().collect(),
        }
    }
}

impl From<Card> for Cards {
    fn from(value: Card) -> Self {
        Cards::Single(value)
    }
}

impl From<&Card> for Cards {
    fn from(value: &Card) -> Self {
        Cards::Single(value.clone())
    }
}

impl From<FindUsersResult> for Cards {
    fn from(value: FindUsersResult) -> Self {
        Cards::Many(value)
    }
}

impl From<Vec<Card>> for Cards {
    fn from(value: Vec<Card>) -> Self {
        Cards::Many(
            value
                .into_iter()
                .map(|card| (card.identity.clone(), card))
                .collect(),
        )
    }
}

/// Interface to search, publish and revoke identity cards.
pub trait CardManager {
    type Error: Error + 'static;

    /// Latest cards of the given identities, unknown identities are omitted.
    fn search_cards(
        &self,
        identities: &[String],
    ) -> impl Future<Output = Result<Vec<Card>, Self::Error>>;

    /// Publishes a card for the key pair, replacing a previous card of the same identity.
    fn publish_card(
        &self,
        identity: &str,
        key_pair: &KeyPair,
    ) -> impl Future<Output = Result<Card, Self::Error>>;

    fn revoke_card(&self, card_id: &str) -> impl Future<Output = Result<(), Self::Error>>;
}
