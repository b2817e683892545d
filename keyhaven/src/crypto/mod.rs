// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic capabilities consumed by groups and the encrypted local cache.
//!
//! [`Crypto`] and [`GroupSession`] are the narrow interfaces the group logic is written against,
//! [`NativeCrypto`] is the default implementation based on Ed25519, X25519, HKDF-SHA256 and
//! XChaCha20-Poly1305.
mod hkdf;
mod keys;
mod native;
mod xchacha20;

use std::fmt;

use keyhaven_store::Sealer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::CborError;

pub use self::hkdf::HkdfError;
pub use keys::{KeyError, KeyPair, PUBLIC_KEY_SIZE, PrivateKey, PublicKey};
pub use native::{MAX_EPOCHS_COUNT, NativeCrypto, NativeGroupSession};
pub use xchacha20::XAeadError;

/// Identifier of a group session, derived from the application-level group id.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(#[serde(with = "serde_bytes")] [u8; 32]);

impl SessionId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionId").field(&self.to_hex()).finish()
    }
}

/// Exported state of one epoch of a group session.
///
/// Importing all messages of a session, in any order, reconstructs the session at its latest
/// epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSessionMessage {
    pub session_id: SessionId,
    pub epoch_number: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl GroupSessionMessage {
    pub fn new(session_id: SessionId, epoch_number: u32, data: Vec<u8>) -> Self {
        Self {
            session_id,
            epoch_number,
            data,
        }
    }
}

/// Key generation, group session management and sealing of values to a key pair.
pub trait Crypto: Sealer<KeyPair = KeyPair, Error = CryptoError> + Clone {
    type Session: GroupSession + Clone;

    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError>;

    /// Derives the session id of a group from its application-level id.
    fn calculate_group_session_id(&self, id: &[u8]) -> SessionId;

    /// Starts a new group session at epoch 0.
    fn generate_group_session(&self, session_id: SessionId) -> Result<Self::Session, CryptoError>;

    /// Reconstructs a group session from exported epoch messages.
    ///
    /// All messages need to belong to the same session, the resulting session is at the highest
    /// epoch found.
    fn import_group_session(
        &self,
        messages: &[GroupSessionMessage],
    ) -> Result<Self::Session, CryptoError>;
}

/// Handle on a group session with epoch-based keys.
pub trait GroupSession {
    fn session_id(&self) -> SessionId;

    fn current_epoch_number(&self) -> u32;

    /// Signs the data with the sender's private key and encrypts it with the current epoch.
    fn encrypt(&self, data: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>, CryptoError>;

    /// Decrypts a group message from any epoch this session still knows about and verifies the
    /// sender's signature.
    fn decrypt(&self, data: &[u8], public_key: &PublicKey) -> Result<Vec<u8>, CryptoError>;

    /// Reads session id and epoch number of a group message without decrypting it.
    fn parse_message(&self, data: &[u8]) -> Result<(SessionId, u32), CryptoError>;

    /// Advances the session to a new epoch with fresh key material.
    fn add_new_epoch(&mut self) -> Result<GroupSessionMessage, CryptoError>;

    /// Message of the current epoch.
    fn current_epoch_message(&self) -> GroupSessionMessage;

    /// Messages of all epochs this session still holds, in ascending order.
    fn export(&self) -> Vec<GroupSessionMessage>;
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("message belongs to session {0}, expected {1}")]
    SessionIdMismatch(SessionId, SessionId),

    #[error("epoch {0} is unknown to this session")]
    EpochNotFound(u32),

    #[error("can not import a group session without messages")]
    EmptyGroupSessionMessages,

    #[error("invalid group session message for epoch {0}")]
    InvalidGroupSessionMessage(u32),

    #[error("maximum epoch number reached")]
    EpochOverflow,

    #[error(transparent)]
    Aead(#[from] XAeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error("unable to collect enough randomness")]
    NotEnoughRandomness,

    #[error("random number generator lock is poisoned")]
    RngLockPoisoned,

    #[error(transparent)]
    Cbor(#[from] CborError),

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
}
