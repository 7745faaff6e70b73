//! Opaque object identifiers.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// A 128-bit object identifier, unique within the issuing peer for the
/// lifetime of that peer process. The text form is base58.
///
/// ```
/// use tether_codec::oid::Oid;
///
/// let oid: Oid = "9BYzAer6QtbStWaJLKusZT".parse().unwrap();
///
/// assert_eq!(oid.as_bytes(), &[0x42u8; 16]);
/// assert_eq!(oid.to_string(), "9BYzAer6QtbStWaJLKusZT");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid([u8; 16]);

impl Oid {
    /// Mint a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);

        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self)
    }
}

impl FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Decode(e.to_string()))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::Decode("oid must be 16 bytes".to_string()))?;

        Ok(Self(bytes))
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <serde_bytes::ByteBuf>::deserialize(deserializer)?;
        let bytes: [u8; 16] = bytes
            .into_vec()
            .try_into()
            .map_err(|_| serde::de::Error::custom("oid must be 16 bytes"))?;

        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_oids_do_not_collide() {
        let a = Oid::random();
        let b = Oid::random();

        assert_ne!(a, b);
    }

    #[test]
    fn text_roundtrip() {
        let oid = Oid::random();

        assert_eq!(oid.to_string().parse::<Oid>().unwrap(), oid);
    }
}
