//! Integer-indexed argument and result slots.
//!
//! Arguments and results travel as a CBOR map from slot index to value.
//! A slot can be absent, which is distinct from holding a zero value; a
//! handler that never assigns slot 2 produces a map without key 2.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::Error;
use crate::capability::Capability;

/// An ordered set of optional, integer-indexed values.
///
/// ```
/// use tether_codec::slots::Slots;
///
/// let mut slots = Slots::default();
/// slots.set(0, &"probe-1").unwrap();
/// slots.set(2, &42.0f32).unwrap();
///
/// assert_eq!(slots.get::<String>(0).unwrap(), "probe-1");
/// assert_eq!(slots.get::<f32>(2).unwrap(), 42.0);
/// assert!(slots.opt::<String>(1).unwrap().is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slots(BTreeMap<u32, ciborium::Value>);

impl Slots {
    /// Assign a slot, replacing any previous value.
    pub fn set<T: Serialize>(&mut self, index: u32, value: &T) -> Result<(), Error> {
        let value =
            ciborium::Value::serialized(value).map_err(|e| Error::Encode(e.to_string()))?;
        self.0.insert(index, value);

        Ok(())
    }

    /// Read a required slot.
    pub fn get<T: DeserializeOwned>(&self, index: u32) -> Result<T, Error> {
        match self.0.get(&index) {
            None => Err(Error::Decode(format!("missing slot {}", index))),
            Some(value) => value
                .deserialized()
                .map_err(|e| Error::Decode(format!("slot {}: {}", index, e))),
        }
    }

    /// Read an optional slot. Absence decodes to `None`.
    pub fn opt<T: DeserializeOwned>(&self, index: u32) -> Result<Option<T>, Error> {
        match self.0.get(&index) {
            None => Ok(None),
            Some(value) => value
                .deserialized()
                .map(Some)
                .map_err(|e| Error::Decode(format!("slot {}: {}", index, e))),
        }
    }

    /// Read a capability out of a slot.
    pub fn capability(&self, index: u32) -> Result<Capability, Error> {
        self.get(index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.0.contains_key(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every capability carried in any slot, with its index.
    pub fn capabilities(&self) -> Vec<(u32, Capability)> {
        self.0
            .iter()
            .filter_map(|(index, value)| {
                value
                    .deserialized::<Capability>()
                    .ok()
                    .map(|capability| (*index, capability))
            })
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        crate::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }

        crate::from_slice(bytes)
    }
}
