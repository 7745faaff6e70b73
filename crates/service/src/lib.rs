//! ## Tether service layer
//!
//! The state and dispatch core of the framework: the capability registry
//! that owns every live vtable, the interface/`Call` abstractions method
//! handlers are written against, the request/response dispatch algorithm
//! with its trailer protocol and panic shield, and the registrars that
//! rebuild capabilities after a peer restart.
//!
//! Transport, endpoints and client plumbing live in the root crate; this
//! crate never touches a socket.

pub mod context;
pub mod dispatch;
pub mod error;
pub mod interface;
pub mod registry;
pub mod restore;

pub use context::Context;
pub use dispatch::{Dispatcher, Handled, Outcome};
pub use error::Error;
pub use interface::{
    ActorState, Around, Call, CallbackClient, CloseHook, Interface, Linker, Minter,
};
pub use registry::{Held, Registry, RegistryOptions};
pub use restore::{Restorer, Restorers};
