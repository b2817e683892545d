// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::crypto::KeyPair;

/// Local key pair of the current user, shared by all clones.
///
/// Holds no key pair before the user registered or after a cleanup.
#[derive(Clone, Debug)]
pub struct KeyLoader {
    identity: String,
    key_pair: Arc<RwLock<Option<KeyPair>>>,
}

impl KeyLoader {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_owned(),
            key_pair: Arc::new(RwLock::new(None)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn key_pair(&self) -> Option<KeyPair> {
        self.key_pair.read().await.clone()
    }

    pub async fn has_key_pair(&self) -> bool {
        self.key_pair.read().await.is_some()
    }

    pub async fn set_key_pair(&self, key_pair: KeyPair) {
        *self.key_pair.write().await = Some(key_pair);
    }

    pub async fn clear(&self) {
        *self.key_pair.write().await = None;
    }
}
