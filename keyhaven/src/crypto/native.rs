// SPDX-License-Identifier: MIT OR Apache-2.0

//! Default implementation of the crypto capabilities.
//!
//! ## Group sessions
//!
//! Every epoch of a group session holds a random 256-bit secret. A group message is encrypted
//! with a key derived from the secret of the sender's current epoch:
//!
//! ```text
//! key        = HKDF-SHA256(salt = session_id, ikm = epoch_secret, info = "keyhaven-group-message")
//! header     = CBOR { session_id, epoch_number }
//! payload    = CBOR { data, signature = Ed25519(header || data) }
//! ciphertext = XChaCha20-Poly1305(key, nonce, payload, aad = header)
//! message    = CBOR { session_id, epoch_number, nonce, ciphertext }
//! ```
//!
//! Sessions keep the secrets of the last [`MAX_EPOCHS_COUNT`] epochs, messages of older epochs
//! can not be decrypted anymore by the same session.
//!
//! ## Sealing
//!
//! Values are sealed to a key pair by signing them with its private key and encrypting the signed
//! payload with a key derived from an ephemeral X25519 agreement with its public key.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use keyhaven_store::Sealer;
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{SeedableRng, TryRngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tracing::trace;
use zeroize::ZeroizeOnDrop;

use crate::cbor::{decode_cbor, encode_cbor};
use crate::crypto::hkdf::hkdf;
use crate::crypto::keys::{KeyPair, PrivateKey, PublicKey};
use crate::crypto::xchacha20::{XAeadKey, XAeadNonce, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::{Crypto, CryptoError, GroupSession, GroupSessionMessage, SessionId};

/// Maximum number of epochs a group session can still decrypt messages for.
pub const MAX_EPOCHS_COUNT: usize = 50;

const SECRET_SIZE: usize = 32;

const GROUP_MESSAGE_INFO: &[u8] = b"keyhaven-group-message";

const SEAL_INFO: &[u8] = b"keyhaven-seal";

#[derive(Serialize, Deserialize)]
struct SignedPayload {
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SealedBox {
    #[serde(with = "serde_bytes")]
    ephemeral_public: [u8; 32],
    #[serde(with = "serde_bytes")]
    nonce: XAeadNonce,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

#[derive(Serialize)]
struct MessageHeader {
    session_id: SessionId,
    epoch_number: u32,
}

#[derive(Serialize, Deserialize)]
struct GroupMessage {
    session_id: SessionId,
    epoch_number: u32,
    #[serde(with = "serde_bytes")]
    nonce: XAeadNonce,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

/// ChaCha20 stream shared by a crypto instance and all group sessions it created.
#[derive(Debug)]
struct Entropy(Mutex<ChaCha20Rng>);

impl Entropy {
    fn fill<const N: usize>(&self) -> Result<[u8; N], CryptoError> {
        let mut rng = self.0.lock().map_err(|_| CryptoError::RngLockPoisoned)?;
        let mut bytes = [0u8; N];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::NotEnoughRandomness)?;
        Ok(bytes)
    }

    fn epoch_secret(&self) -> Result<EpochSecret, CryptoError> {
        Ok(EpochSecret(self.fill()?))
    }
}

/// Key material of one epoch, wiped from memory when dropped.
#[derive(Clone, ZeroizeOnDrop)]
struct EpochSecret([u8; SECRET_SIZE]);

impl EpochSecret {
    fn from_message(message: &GroupSessionMessage) -> Result<Self, CryptoError> {
        let bytes = message
            .data
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidGroupSessionMessage(message.epoch_number))?;
        Ok(Self(bytes))
    }

    fn message_key(&self, session_id: &SessionId) -> Result<XAeadKey, CryptoError> {
        Ok(hkdf(session_id.as_bytes(), &self.0, GROUP_MESSAGE_INFO)?)
    }

    fn to_message(&self, session_id: SessionId, epoch_number: u32) -> GroupSessionMessage {
        GroupSessionMessage::new(session_id, epoch_number, self.0.to_vec())
    }
}

impl PartialEq for EpochSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for EpochSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EpochSecret(***)")
    }
}

/// Crypto capabilities based on Ed25519, X25519, HKDF-SHA256 and XChaCha20-Poly1305.
#[derive(Clone, Debug)]
pub struct NativeCrypto {
    entropy: Arc<Entropy>,
}

impl Default for NativeCrypto {
    fn default() -> Self {
        Self {
            entropy: Arc::new(Entropy(Mutex::new(ChaCha20Rng::from_os_rng()))),
        }
    }
}

impl NativeCrypto {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl NativeCrypto {
    /// Deterministic randomness for reproducible tests.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            entropy: Arc::new(Entropy(Mutex::new(ChaCha20Rng::from_seed(seed)))),
        }
    }
}

fn seal_key(
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
    shared_secret: &[u8; 32],
) -> Result<XAeadKey, CryptoError> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(recipient_public);
    Ok(hkdf(&salt, shared_secret, SEAL_INFO)?)
}

impl Sealer for NativeCrypto {
    type KeyPair = KeyPair;

    type Error = CryptoError;

    fn sign_then_encrypt(
        &self,
        data: &[u8],
        key_pair: &KeyPair,
    ) -> Result<Vec<u8>, CryptoError> {
        let signature = key_pair.private_key.sign(data);
        let payload = encode_cbor(&SignedPayload {
            data: data.to_vec(),
            signature: signature.to_bytes().to_vec(),
        })?;

        let ephemeral = x25519_dalek::StaticSecret::from(self.entropy.fill::<32>()?);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let recipient_public = key_pair.public_key.to_x25519();
        let shared_secret = ephemeral.diffie_hellman(&recipient_public);

        let key = seal_key(
            ephemeral_public.as_bytes(),
            recipient_public.as_bytes(),
            shared_secret.as_bytes(),
        )?;
        let nonce: XAeadNonce = self.entropy.fill()?;
        let ciphertext = x_aead_encrypt(&key, &payload, nonce, &[])?;

        Ok(encode_cbor(&SealedBox {
            ephemeral_public: ephemeral_public.to_bytes(),
            nonce,
            ciphertext,
        })?)
    }

    fn decrypt_then_verify(
        &self,
        data: &[u8],
        key_pair: &KeyPair,
    ) -> Result<Vec<u8>, CryptoError> {
        let sealed: SealedBox = decode_cbor(data)?;

        let secret = key_pair.private_key.to_x25519();
        let recipient_public = key_pair.public_key.to_x25519();
        let shared_secret =
            secret.diffie_hellman(&x25519_dalek::PublicKey::from(sealed.ephemeral_public));

        let key = seal_key(
            &sealed.ephemeral_public,
            recipient_public.as_bytes(),
            shared_secret.as_bytes(),
        )?;
        let payload = x_aead_decrypt(&key, &sealed.ciphertext, sealed.nonce, &[])?;
        let payload: SignedPayload = decode_cbor(&payload[..])?;

        if !key_pair.public_key.verify(&payload.data, &payload.signature) {
            return Err(CryptoError::VerificationFailed);
        }

        Ok(payload.data)
    }
}

impl Crypto for NativeCrypto {
    type Session = NativeGroupSession;

    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let bytes: [u8; 32] = self.entropy.fill()?;
        Ok(KeyPair::new(PrivateKey::from_bytes(&bytes)))
    }

    fn calculate_group_session_id(&self, id: &[u8]) -> SessionId {
        let digest = Sha512::digest(id);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest[..32]);
        SessionId::from_bytes(bytes)
    }

    fn generate_group_session(
        &self,
        session_id: SessionId,
    ) -> Result<NativeGroupSession, CryptoError> {
        let secret = self.entropy.epoch_secret()?;
        trace!(%session_id, "generate group session");
        Ok(NativeGroupSession {
            session_id,
            current_epoch: 0,
            epochs: BTreeMap::from([(0, secret)]),
            entropy: self.entropy.clone(),
        })
    }

    fn import_group_session(
        &self,
        messages: &[GroupSessionMessage],
    ) -> Result<NativeGroupSession, CryptoError> {
        let Some(first) = messages.first() else {
            return Err(CryptoError::EmptyGroupSessionMessages);
        };

        let session_id = first.session_id;
        let mut epochs = BTreeMap::new();
        for message in messages {
            if message.session_id != session_id {
                return Err(CryptoError::SessionIdMismatch(message.session_id, session_id));
            }
            let secret = EpochSecret::from_message(message)?;
            // The same epoch imported twice has to carry the same secret.
            if epochs
                .insert(message.epoch_number, secret.clone())
                .is_some_and(|previous| previous != secret)
            {
                return Err(CryptoError::InvalidGroupSessionMessage(message.epoch_number));
            }
        }

        while epochs.len() > MAX_EPOCHS_COUNT {
            epochs.pop_first();
        }

        let current_epoch = epochs
            .last_key_value()
            .map(|(epoch_number, _)| *epoch_number)
            .ok_or(CryptoError::EmptyGroupSessionMessages)?;

        trace!(%session_id, current_epoch, "import group session");
        Ok(NativeGroupSession {
            session_id,
            current_epoch,
            epochs,
            entropy: self.entropy.clone(),
        })
    }
}

/// Group session holding the secrets of its most recent epochs.
#[derive(Clone, Debug)]
pub struct NativeGroupSession {
    session_id: SessionId,
    current_epoch: u32,
    epochs: BTreeMap<u32, EpochSecret>,
    entropy: Arc<Entropy>,
}

impl NativeGroupSession {
    fn message_key(&self, epoch_number: u32) -> Result<XAeadKey, CryptoError> {
        self.epochs
            .get(&epoch_number)
            .ok_or(CryptoError::EpochNotFound(epoch_number))?
            .message_key(&self.session_id)
    }
}

impl GroupSession for NativeGroupSession {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn current_epoch_number(&self) -> u32 {
        self.current_epoch
    }

    fn encrypt(&self, data: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
        let epoch_number = self.current_epoch;
        let header = encode_cbor(&MessageHeader {
            session_id: self.session_id,
            epoch_number,
        })?;
        let key = self.message_key(epoch_number)?;

        let mut signed = header.clone();
        signed.extend_from_slice(data);
        let payload = encode_cbor(&SignedPayload {
            data: data.to_vec(),
            signature: private_key.sign(&signed).to_bytes().to_vec(),
        })?;

        let nonce: XAeadNonce = self.entropy.fill()?;
        let ciphertext = x_aead_encrypt(&key, &payload, nonce, &header)?;

        Ok(encode_cbor(&GroupMessage {
            session_id: self.session_id,
            epoch_number,
            nonce,
            ciphertext,
        })?)
    }

    fn decrypt(&self, data: &[u8], public_key: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        let message: GroupMessage = decode_cbor(data)?;
        if message.session_id != self.session_id {
            return Err(CryptoError::SessionIdMismatch(
                message.session_id,
                self.session_id,
            ));
        }

        let key = self.message_key(message.epoch_number)?;
        let header = encode_cbor(&MessageHeader {
            session_id: message.session_id,
            epoch_number: message.epoch_number,
        })?;
        let payload = x_aead_decrypt(&key, &message.ciphertext, message.nonce, &header)?;
        let payload: SignedPayload = decode_cbor(&payload[..])?;

        let mut signed = header;
        signed.extend_from_slice(&payload.data);
        if !public_key.verify(&signed, &payload.signature) {
            return Err(CryptoError::VerificationFailed);
        }

        Ok(payload.data)
    }

    fn parse_message(&self, data: &[u8]) -> Result<(SessionId, u32), CryptoError> {
        let message: GroupMessage = decode_cbor(data)?;
        Ok((message.session_id, message.epoch_number))
    }

    fn add_new_epoch(&mut self) -> Result<GroupSessionMessage, CryptoError> {
        let epoch_number = self
            .current_epoch
            .checked_add(1)
            .ok_or(CryptoError::EpochOverflow)?;
        let secret = self.entropy.epoch_secret()?;
        let message = secret.to_message(self.session_id, epoch_number);

        self.epochs.insert(epoch_number, secret);
        while self.epochs.len() > MAX_EPOCHS_COUNT {
            self.epochs.pop_first();
        }
        self.current_epoch = epoch_number;

        trace!(session_id = %self.session_id, epoch_number, "add new epoch");
        Ok(message)
    }

    fn current_epoch_message(&self) -> GroupSessionMessage {
        match self.epochs.get(&self.current_epoch) {
            Some(secret) => secret.to_message(self.session_id, self.current_epoch),
            // The current epoch is never pruned.
            None => GroupSessionMessage::new(self.session_id, self.current_epoch, Vec::new()),
        }
    }

    fn export(&self) -> Vec<GroupSessionMessage> {
        self.epochs
            .iter()
            .map(|(epoch_number, secret)| secret.to_message(self.session_id, *epoch_number))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use keyhaven_store::Sealer;

    use crate::crypto::{Crypto, CryptoError, GroupSession, XAeadError};

    use super::{MAX_EPOCHS_COUNT, NativeCrypto};

    #[test]
    fn seal_and_open() {
        let crypto = NativeCrypto::from_seed([1; 32]);
        let key_pair = crypto.generate_key_pair().unwrap();
        let other_key_pair = crypto.generate_key_pair().unwrap();

        let sealed = crypto.sign_then_encrypt(b"cached ticket", &key_pair).unwrap();
        assert_ne!(sealed, b"cached ticket".to_vec());
        assert_eq!(
            crypto.decrypt_then_verify(&sealed, &key_pair).unwrap(),
            b"cached ticket".to_vec()
        );

        assert_matches!(
            crypto.decrypt_then_verify(&sealed, &other_key_pair),
            Err(CryptoError::Aead(XAeadError::Decrypt(_)))
        );
    }

    #[test]
    fn session_id_is_deterministic() {
        let crypto = NativeCrypto::from_seed([1; 32]);
        assert_eq!(
            crypto.calculate_group_session_id(b"group-of-friends"),
            crypto.calculate_group_session_id(b"group-of-friends")
        );
        assert_ne!(
            crypto.calculate_group_session_id(b"group-of-friends"),
            crypto.calculate_group_session_id(b"group-of-enemies")
        );
    }

    #[test]
    fn encrypt_and_decrypt_across_imported_sessions() {
        let crypto = NativeCrypto::from_seed([2; 32]);
        let alice = crypto.generate_key_pair().unwrap();
        let session_id = crypto.calculate_group_session_id(b"group-of-friends");

        let mut session = crypto.generate_group_session(session_id).unwrap();
        let epoch_0 = session.current_epoch_message();
        let epoch_1 = session.add_new_epoch().unwrap();
        let epoch_2 = session.add_new_epoch().unwrap();

        // Import works in any order.
        let imported = crypto
            .import_group_session(&[epoch_2, epoch_0, epoch_1])
            .unwrap();
        assert_eq!(imported.current_epoch_number(), 2);
        assert_eq!(imported.session_id(), session_id);
        assert_eq!(imported.export(), session.export());

        let message = session.encrypt(b"hello", &alice.private_key).unwrap();
        assert_eq!(imported.parse_message(&message).unwrap(), (session_id, 2));
        assert_eq!(
            imported.decrypt(&message, &alice.public_key).unwrap(),
            b"hello".to_vec()
        );
    }

    #[test]
    fn verification_and_session_mismatch() {
        let crypto = NativeCrypto::from_seed([3; 32]);
        let alice = crypto.generate_key_pair().unwrap();
        let mallory = crypto.generate_key_pair().unwrap();

        let session = crypto
            .generate_group_session(crypto.calculate_group_session_id(b"group-of-friends"))
            .unwrap();
        let other_session = crypto
            .generate_group_session(crypto.calculate_group_session_id(b"other-group"))
            .unwrap();

        let message = session.encrypt(b"hello", &alice.private_key).unwrap();
        assert_matches!(
            session.decrypt(&message, &mallory.public_key),
            Err(CryptoError::VerificationFailed)
        );
        assert_matches!(
            other_session.decrypt(&message, &alice.public_key),
            Err(CryptoError::SessionIdMismatch(_, _))
        );
        assert_matches!(
            crypto.import_group_session(&[
                session.current_epoch_message(),
                other_session.current_epoch_message()
            ]),
            Err(CryptoError::SessionIdMismatch(_, _))
        );
        assert_matches!(
            crypto.import_group_session(&[]),
            Err(CryptoError::EmptyGroupSessionMessages)
        );
    }

    #[test]
    fn old_epochs_are_dropped() {
        let crypto = NativeCrypto::from_seed([4; 32]);
        let alice = crypto.generate_key_pair().unwrap();
        let mut session = crypto
            .generate_group_session(crypto.calculate_group_session_id(b"group-of-friends"))
            .unwrap();

        let first_message = session.encrypt(b"first", &alice.private_key).unwrap();
        for _ in 0..MAX_EPOCHS_COUNT {
            session.add_new_epoch().unwrap();
        }

        assert_eq!(session.current_epoch_number(), MAX_EPOCHS_COUNT as u32);
        assert_eq!(session.export().len(), MAX_EPOCHS_COUNT);
        assert_matches!(
            session.decrypt(&first_message, &alice.public_key),
            Err(CryptoError::EpochNotFound(0))
        );

        // Epoch 1 is the oldest one still held.
        let snapshot = crypto
            .import_group_session(&[session.export()[0].clone()])
            .unwrap();
        assert_eq!(snapshot.current_epoch_number(), 1);
    }

    #[test]
    fn seeded_randomness_is_reproducible() {
        let key_pair_1 = NativeCrypto::from_seed([5; 32]).generate_key_pair().unwrap();
        let key_pair_2 = NativeCrypto::from_seed([5; 32]).generate_key_pair().unwrap();
        let key_pair_3 = NativeCrypto::from_seed([6; 32]).generate_key_pair().unwrap();
        assert_eq!(key_pair_1.public_key, key_pair_2.public_key);
        assert_ne!(key_pair_1.public_key, key_pair_3.public_key);
    }

    #[test]
    fn conflicting_epoch_secrets_are_rejected() {
        let crypto = NativeCrypto::from_seed([7; 32]);
        let session_id = crypto.calculate_group_session_id(b"group-of-friends");
        let session = crypto.generate_group_session(session_id).unwrap();
        let other = crypto.generate_group_session(session_id).unwrap();

        // Importing the same epoch twice is fine as long as the secrets agree.
        let imported = crypto
            .import_group_session(&[
                session.current_epoch_message(),
                session.current_epoch_message(),
            ])
            .unwrap();
        assert_eq!(imported.export(), session.export());

        assert_matches!(
            crypto.import_group_session(&[
                session.current_epoch_message(),
                other.current_epoch_message()
            ]),
            Err(CryptoError::InvalidGroupSessionMessage(0))
        );

        let mut truncated = session.current_epoch_message();
        truncated.data.pop();
        assert_matches!(
            crypto.import_group_session(&[truncated]),
            Err(CryptoError::InvalidGroupSessionMessage(0))
        );
    }
}
