//! ## Tether
//!
//! A distributed capability-based RPC framework composing the services
//! of a container runtime. A peer mints unforgeable object references,
//! serves them over any number of multiplexed sessions, and invokes
//! references minted by others; capabilities can be passed in both
//! directions, re-resolved after a restart, and advertised cluster-wide
//! as singleton actors through an external KV.
//!
//! ```no_run
//! use service::{Context, Interface};
//! use tether::{Peer, PeerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Peer::new(PeerOptions::default())?;
//!     server.expose(Interface::new("meter").method(
//!         "readTemperature",
//!         |_cx, mut call: tether::Call| async move {
//!             let name: String = call.arg(0)?;
//!             call.set(0, &42.0f32)?;
//!             call.set(1, &name)?;
//!             Ok(call)
//!         },
//!     ));
//!     let address = server.listen_tcp("127.0.0.1:0").await?;
//!
//!     let client = Peer::new(PeerOptions::default())?;
//!     let meter = client.resolve(&address.to_string(), "meter").await?;
//!
//!     let mut args = codec::slots::Slots::default();
//!     args.set(0, &"probe-1")?;
//!     let results = meter.call(&Context::background(), "readTemperature", args).await?;
//!     assert_eq!(results.get::<f32>(0)?, 42.0);
//!
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod auth;
pub mod kv;
pub mod transport;

mod channel;
mod client;
mod peer;
mod server;

pub use actor::{ActorOptions, ActorRegistry};
pub use channel::Callbacks;
pub use client::CapClient;
pub use kv::{Kv, KvEvent, LeaseId, MemoryKv};
pub use peer::{Peer, PeerOptions};

// The wire and service layers are part of the public surface; handlers
// are written against their types.
pub use codec::capability::{Capability, RestoreState};
pub use codec::identity::{Keypair, PeerId};
pub use codec::oid::Oid;
pub use codec::slots::Slots;
pub use service::{ActorState, Call, Context, Error, Interface};
