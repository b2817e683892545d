// SPDX-License-Identifier: MIT OR Apache-2.0

//! [CBOR] encoding of group messages, sealed values, tickets and local cache records.
//!
//! Decoding is strict: a buffer has to contain exactly one value, trailing bytes are rejected so
//! that two different byte strings never decode to the same record.
//!
//! [CBOR]: https://cbor.io/
use std::any::type_name;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub(crate) fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CborError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|err| CborError::Encode(type_name::<T>(), err.to_string()))?;
    Ok(bytes)
}

pub(crate) fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CborError> {
    let mut reader = bytes;
    let value = ciborium::de::from_reader(&mut reader)
        .map_err(|err| CborError::Decode(type_name::<T>(), err.to_string()))?;
    if !reader.is_empty() {
        return Err(CborError::TrailingBytes(type_name::<T>(), reader.len()));
    }
    Ok(value)
}

#[derive(Debug, Error)]
pub enum CborError {
    #[error("could not encode {0}: {1}")]
    Encode(&'static str, String),

    #[error("could not decode {0}: {1}")]
    Decode(&'static str, String),

    #[error("{1} unexpected bytes after {0}")]
    TrailingBytes(&'static str, usize),
}
