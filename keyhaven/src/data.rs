// SPDX-License-Identifier: MIT OR Apache-2.0

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Plaintext or ciphertext handed to and returned from groups.
///
/// Text in means text out: encrypting text returns base64-encoded ciphertext and decrypting text
/// expects base64-encoded ciphertext and returns UTF-8 text. Bytes stay bytes in both directions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Data {
    Text(String),
    Bytes(Vec<u8>),
}

impl Data {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Data::Text(text) => text.as_bytes(),
            Data::Bytes(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(text) => Some(text),
            Data::Bytes(_) => None,
        }
    }

    pub(crate) fn is_text(&self) -> bool {
        matches!(self, Data::Text(_))
    }

    /// Raw ciphertext, decoding base64 for text.
    pub(crate) fn ciphertext(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            Data::Text(text) => STANDARD.decode(text),
            Data::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// Wraps ciphertext the same way the plaintext was given.
    pub(crate) fn from_ciphertext(ciphertext: Vec<u8>, text: bool) -> Self {
        if text {
            Data::Text(STANDARD.encode(ciphertext))
        } else {
            Data::Bytes(ciphertext)
        }
    }

    /// Wraps plaintext the same way the ciphertext was given.
    pub(crate) fn from_plaintext(
        plaintext: Vec<u8>,
        text: bool,
    ) -> Result<Self, std::string::FromUtf8Error> {
        if text {
            Ok(Data::Text(String::from_utf8(plaintext)?))
        } else {
            Ok(Data::Bytes(plaintext))
        }
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Text(value.to_owned())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Text(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Bytes(value)
    }
}

impl From<&[u8]> for Data {
    fn from(value: &[u8]) -> Self {
        Data::Bytes(value.to_vec())
    }
}
