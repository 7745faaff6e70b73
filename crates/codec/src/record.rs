//! Records exchanged on a session's logical streams.
//!
//! A request/response exchange is one stream: the initiator sends a
//! [`StreamPayload::Request`] head, body chunks, then half-closes; the
//! responder answers with a [`StreamPayload::Response`] head, body chunks,
//! and a final [`StreamPayload::Trailers`] record. A call-stream exchange
//! keeps the stream open and both sides trade [`ChannelRecord`]s instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::identity::PeerId;
use crate::oid::Oid;

/// Protocol version carried in the hello record.
pub const PROTOCOL_VERSION: u32 = 1;

pub mod header {
    //! Names of the headers carried on request heads.

    pub const PUBLIC_KEY: &str = "public-key";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SIGNATURE: &str = "signature";
    pub const CONTACT_ADDR: &str = "contact-addr";
    pub const AUTHORIZATION: &str = "authorization";
    pub const TARGET_PUBLIC_KEY: &str = "target-public-key";
    pub const DEADLINE: &str = "deadline";
    pub const TRACEPARENT: &str = "traceparent";
}

pub mod trailer {
    //! Names of the trailer fields.

    pub const STATUS: &str = "status";
    pub const ERROR: &str = "error";
    pub const ERROR_CATEGORY: &str = "error-category";
    pub const ERROR_CODE: &str = "error-code";
}

/// Terminal status of a request/response exchange, carried out-of-band
/// after the body so clients can branch before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Unknown,
    UnknownCapability,
    Panic,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::Unknown => "unknown",
            Status::UnknownCapability => "unknown-capability",
            Status::Panic => "panic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ok" => Status::Ok,
            "error" => Status::Error,
            "unknown" => Status::Unknown,
            "unknown-capability" => Status::UnknownCapability,
            "panic" => Status::Panic,
            _ => return None,
        })
    }

    /// Whether a response body is meaningful under this status.
    pub fn has_body(&self) -> bool {
        matches!(self, Status::Ok | Status::Error)
    }
}

/// The head record of a request stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl RequestHead {
    pub fn new(method: &str, path: String) -> Self {
        Self {
            method: method.to_string(),
            path,
            headers: BTreeMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.insert(name.to_string(), value);
    }
}

/// The head record of a response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }
}

/// Out-of-band trailers sent after the response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trailers(pub BTreeMap<String, String>);

impl Trailers {
    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn with_status(status: Status) -> Self {
        let mut trailers = Self::default();
        trailers
            .0
            .insert(trailer::STATUS.to_string(), status.as_str().to_string());

        trailers
    }

    /// Trailers for a handler error carrying a category/code/message trio.
    pub fn error(category: &str, code: &str, message: &str) -> Self {
        let mut trailers = Self::with_status(Status::Error);
        trailers
            .0
            .insert(trailer::ERROR_CATEGORY.to_string(), category.to_string());
        trailers
            .0
            .insert(trailer::ERROR_CODE.to_string(), code.to_string());
        trailers
            .0
            .insert(trailer::ERROR.to_string(), message.to_string());

        trailers
    }

    pub fn panic(message: &str) -> Self {
        let mut trailers = Self::with_status(Status::Panic);
        trailers
            .0
            .insert(trailer::ERROR.to_string(), message.to_string());

        trailers
    }

    pub fn unknown(message: &str) -> Self {
        let mut trailers = Self::with_status(Status::Unknown);
        trailers
            .0
            .insert(trailer::ERROR.to_string(), message.to_string());

        trailers
    }

    pub fn status(&self) -> Option<Status> {
        self.0.get(trailer::STATUS).and_then(|s| Status::parse(s))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// First record on every session, in both directions.
///
/// Stands in for the transport peer certificate: it carries the ed25519
/// public key verbatim. Sessions accepted on a unix socket or a subprocess
/// pipe may omit the key; object-bound requests are still signed
/// per-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PeerId>,
    /// Contact string at which the sender can be dialed, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_addr: Option<String>,
}

/// Response body of `POST /_rpc/identify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub peer: PeerId,
    /// The address the server observed the client dialing from.
    pub observed_addr: String,
}

/// Records exchanged on a call-stream control stream and on callback
/// sub-streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelRecord {
    /// Head of a callback sub-stream: invoke `method` on the inline
    /// capability `oid`. Argument slots follow as a body payload.
    Call { oid: Oid, method: String },
    /// Terminal success on a control stream; result slots follow.
    Result,
    /// Terminal success on a callback sub-stream; result slots follow.
    Ok,
    /// The callee dropped the inline capability `oid`.
    Deref { oid: Oid },
    /// Terminal failure, on either stream kind.
    Error {
        category: String,
        code: String,
        message: String,
    },
}

/// One framed payload on a logical stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum StreamPayload {
    Hello(Hello),
    Request(RequestHead),
    Response(ResponseHead),
    Body {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Trailers(Trailers),
    Channel(ChannelRecord),
}

impl StreamPayload {
    pub fn body(data: Vec<u8>) -> Self {
        Self::Body { data }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        crate::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        crate::from_slice(bytes)
    }
}
