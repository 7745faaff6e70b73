//! ## Tether wire layer
//!
//! Everything that crosses a peer boundary is defined here: identity keys
//! and request signatures, object identifiers, the self-contained
//! capability tuple, integer-indexed argument slots, the stream records
//! exchanged on a session, and the frame codec that multiplexes many
//! logical streams onto one reliable byte stream.
//!
//! The crate is deliberately runtime-free. It owns no sockets and holds no
//! locks; the root crate feeds it bytes and reads back records.

pub mod capability;
pub mod frame;
pub mod identity;
pub mod oid;
pub mod record;
pub mod slots;

use serde::{Serialize, de::DeserializeOwned};

/// Errors produced while encoding or decoding wire values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("timestamp out of range")]
    StaleTimestamp,
}

/// Encode a value as self-describing CBOR.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from self-describing CBOR.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    ciborium::de::from_reader(bytes).map_err(|e| Error::Decode(e.to_string()))
}
