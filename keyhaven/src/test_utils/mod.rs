// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory directory and cloud storage, plus helpers to set up accounts sharing them.
mod cloud;
mod directory;

use keyhaven_store::MemoryStore;

pub use cloud::{MemoryCloud, MemoryCloudError, MemoryCloudStorage};
pub use directory::{MemoryDirectory, MemoryDirectoryError};

use crate::account::Account;
use crate::config::Config;
use crate::crypto::NativeCrypto;
use crate::manager::GroupCache;

pub type TestAccount = Account<NativeCrypto, MemoryDirectory, MemoryCloud, MemoryStore>;

/// Directory and cloud storage shared by all accounts of a test.
#[derive(Clone, Debug, Default)]
pub struct TestNetwork {
    pub directory: MemoryDirectory,
    pub cloud: MemoryCloud,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account with its own device storage and group cache.
    pub fn account(&self, config: Config, seed: u8) -> TestAccount {
        self.account_with_storage(config, seed, MemoryStore::new())
    }

    /// Account on a given device storage, to simulate reopening the same device.
    pub fn account_with_storage(
        &self,
        config: Config,
        seed: u8,
        backend: MemoryStore,
    ) -> TestAccount {
        Account::new(
            config,
            NativeCrypto::from_seed([seed; 32]),
            self.directory.clone(),
            self.cloud.clone(),
            backend,
            GroupCache::new(),
        )
    }

    /// Account which is already registered with the directory.
    pub async fn registered(&self, identity: &str, seed: u8) -> TestAccount {
        let account = self.account(Config::new(identity), seed);
        account
            .register()
            .await
            .expect("register test account");
        account
    }
}

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
