// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::MAX_EPOCHS_COUNT;

/// Number of epochs a group can ratchet back through in memory before falling back to the local
/// cache.
pub const DEFAULT_RATCHET_WINDOW: u32 = 50;

/// Minimum length of application-level group ids in bytes.
pub const DEFAULT_GROUP_ID_MIN_LENGTH: usize = 10;

/// Configuration for an account.
///
/// Deserialized configurations go through the same checks as the builder methods.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UncheckedConfig")]
pub struct Config {
    /// Identity of the local user.
    pub(crate) identity: String,

    /// Messages older than this many epochs are decrypted through a snapshot from the local
    /// cache instead of the in-memory session.
    pub(crate) ratchet_window: u32,

    pub(crate) group_id_min_length: usize,
}

#[derive(Deserialize)]
struct UncheckedConfig {
    identity: String,
    ratchet_window: u32,
    group_id_min_length: usize,
}

impl From<UncheckedConfig> for Config {
    fn from(value: UncheckedConfig) -> Self {
        Config::new(&value.identity)
            .with_ratchet_window(value.ratchet_window)
            .with_group_id_min_length(value.group_id_min_length)
    }
}

impl Config {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_owned(),
            ratchet_window: DEFAULT_RATCHET_WINDOW,
            group_id_min_length: DEFAULT_GROUP_ID_MIN_LENGTH,
        }
    }

    /// Sets the ratchet window, clamped to the epochs a session actually holds.
    pub fn with_ratchet_window(mut self, ratchet_window: u32) -> Self {
        self.ratchet_window = ratchet_window.clamp(1, MAX_EPOCHS_COUNT as u32);
        self
    }

    pub fn with_group_id_min_length(mut self, group_id_min_length: usize) -> Self {
        self.group_id_min_length = group_id_min_length;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn ratchet_window(&self) -> u32 {
        self.ratchet_window
    }

    pub fn group_id_min_length(&self) -> usize {
        self.group_id_min_length
    }
}
