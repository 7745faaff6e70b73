//! Peer identity and request signing.
//!
//! A peer generates an ephemeral ed25519 keypair at startup. Its identity
//! string is the base58 of the public key, carried verbatim in the hello
//! record and in the `public-key` header of every signed request. The
//! transport never decides authorization; it only proves possession of the
//! key named in the headers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Requests whose timestamp is further than this from the local clock are
/// rejected regardless of signature validity.
pub const MAX_CLOCK_SKEW_SECS: i64 = 600;

/// A peer identity: an ed25519 public key.
///
/// The display form is the base58 of the key bytes.
///
/// ```
/// use tether_codec::identity::PeerId;
///
/// let id: PeerId = "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi"
///     .parse()
///     .unwrap();
///
/// assert_eq!(id.as_bytes(), &[1u8; 32]);
/// assert_eq!(
///     id.to_string(),
///     "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi"
/// );
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Verify an ed25519 signature made by this peer.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| Error::InvalidIdentity(e.to_string()))?;
        let signature =
            Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;

        key.verify(message, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidIdentity(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdentity("key must be 32 bytes".to_string()))?;

        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <serde_bytes::ByteBuf>::deserialize(deserializer)?;
        let bytes: [u8; 32] = bytes
            .into_vec()
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be 32 bytes"))?;

        Ok(Self(bytes))
    }
}

/// The long-lived signing keypair of a peer process.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
    public: PeerId,
}

impl Keypair {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        let public = PeerId(secret.verifying_key().to_bytes());

        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let secret = SigningKey::from_bytes(bytes);
        let public = PeerId(secret.verifying_key().to_bytes());

        Self { secret, public }
    }

    pub fn public(&self) -> PeerId {
        self.public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.secret.sign(message).to_bytes()
    }

    /// Produce the three signed headers for a request.
    ///
    /// Returns `(public-key, timestamp, signature)`, all in their wire text
    /// form.
    pub fn sign_request(&self, method: &str, path: &str) -> (String, String, String) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let signature = self.sign(signing_payload(method, path, &timestamp).as_bytes());

        (
            self.public.to_string(),
            timestamp,
            bs58::encode(signature).into_string(),
        )
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.public)
    }
}

/// The ASCII string covered by a request signature.
///
/// ```
/// use tether_codec::identity::signing_payload;
///
/// assert_eq!(
///     signing_payload("POST", "/_rpc/ref/abc", "2026-01-02T03:04:05Z"),
///     "POST /_rpc/ref/abc 2026-01-02T03:04:05Z"
/// );
/// ```
pub fn signing_payload(method: &str, path: &str, timestamp: &str) -> String {
    format!("{} {} {}", method, path, timestamp)
}

/// Verify the signed headers of a request against the local clock.
///
/// Returns the declared peer identity on success. Ownership of the target
/// object is checked separately by the dispatcher; this only proves that
/// the caller holds the named key and that the timestamp is fresh.
pub fn verify_request(
    public_key: &str,
    timestamp: &str,
    signature: &str,
    method: &str,
    path: &str,
) -> Result<PeerId, Error> {
    let peer: PeerId = public_key.parse()?;

    let when = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| Error::StaleTimestamp)?
        .with_timezone(&Utc);
    let skew = Utc::now().signed_duration_since(when);
    if skew.abs() > TimeDelta::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(Error::StaleTimestamp);
    }

    let signature = bs58::decode(signature)
        .into_vec()
        .map_err(|_| Error::InvalidSignature)?;
    peer.verify(signing_payload(method, path, timestamp).as_bytes(), &signature)?;

    Ok(peer)
}
