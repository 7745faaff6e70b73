//! The self-contained capability tuple.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::oid::Oid;

/// Contact string for a peer that cannot be dialed over a network; the
/// session to it rides a subprocess pipe.
pub const DIAL_STDIO: &str = "dial-stdio";

/// State sufficient for the issuing peer to reconstruct a capability's
/// vtable after a restart.
///
/// The payload is opaque to everyone but the registrar for
/// `interface`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreState {
    pub interface: String,
    pub payload: ciborium::Value,
}

impl RestoreState {
    pub fn new<T: Serialize>(interface: &str, payload: &T) -> Result<Self, crate::Error> {
        Ok(Self {
            interface: interface.to_string(),
            payload: ciborium::Value::serialized(payload)
                .map_err(|e| crate::Error::Encode(e.to_string()))?,
        })
    }

    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::Error> {
        self.payload
            .deserialized()
            .map_err(|e| crate::Error::Decode(e.to_string()))
    }
}

/// An unforgeable reference to a remote object.
///
/// Capabilities are self-contained: anyone holding one knows where to
/// invoke it (`address`), what identity must sign invocations
/// (`user_key`), and which peer issued it (`issuer_key`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub oid: Oid,
    /// Contact string: `host:port`, `unix:/path`, or [`DIAL_STDIO`].
    pub address: String,
    /// The peer permitted to invoke this capability.
    pub user_key: PeerId,
    /// The peer that minted the oid.
    pub issuer_key: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreState>,
    /// Set when the object is hosted over the bidirectional session that
    /// carried it, rather than at `address`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
}

impl Capability {
    /// Whether the capability can be re-minted by its issuer after a
    /// restart.
    pub fn restorable(&self) -> bool {
        self.restore.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn sample() -> Capability {
        Capability {
            oid: Oid::random(),
            address: "127.0.0.1:7171".to_string(),
            user_key: Keypair::generate().public(),
            issuer_key: Keypair::generate().public(),
            restore: Some(RestoreState::new("meter", &"probe-1").unwrap()),
            inline: false,
        }
    }

    #[test]
    fn encode_roundtrip() {
        let capability = sample();
        let bytes = crate::to_vec(&capability).unwrap();

        assert_eq!(crate::from_slice::<Capability>(&bytes).unwrap(), capability);
    }

    #[test]
    fn absent_restore_state_stays_absent() {
        let mut capability = sample();
        capability.restore = None;

        let bytes = crate::to_vec(&capability).unwrap();
        let decoded: Capability = crate::from_slice(&bytes).unwrap();

        assert!(!decoded.restorable());
    }
}
