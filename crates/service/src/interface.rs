//! Interface vtables and the `Call` abstraction handlers run against.
//!
//! An interface is a table of named method handlers plus three optional
//! hooks polled by the dispatcher: an around hook entered before the
//! handler and committed after a normal return, a restore state making
//! capabilities minted from the vtable survivable across restarts, and a
//! close hook fired when a capability's ref-count reaches zero.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use futures::future::BoxFuture;

use codec::capability::{Capability, RestoreState};
use codec::identity::PeerId;
use codec::slots::Slots;

use crate::context::Context;
use crate::error::Error;

/// A method handler. Takes the call by value and hands it back with the
/// result slots assigned.
pub type HandlerFn =
    Arc<dyn Fn(Context, Call) -> BoxFuture<'static, Result<Call, Error>> + Send + Sync>;

/// Mints capabilities into the local registry. Implemented by the
/// registry; threaded through so handlers can return new objects.
pub trait Minter: Send + Sync {
    fn mint(&self, interface: Arc<Interface>, user_key: PeerId) -> Capability;
}

/// Builds invocable clients for capabilities embedded in call arguments.
///
/// In channel mode the linker routes inline capabilities back over the
/// session that carried the call; elsewhere it dials the capability's
/// address.
#[async_trait]
pub trait Linker: Send + Sync {
    async fn link(&self, capability: &Capability) -> Result<Arc<dyn CallbackClient>, Error>;
}

/// A minimal client for a capability resolved out of call arguments.
#[async_trait]
pub trait CallbackClient: Send + Sync {
    async fn invoke(&self, method: &str, args: Slots) -> Result<Slots, Error>;

    /// Drop the capability. Idempotent; signals the owner that the
    /// reference is gone.
    async fn close(&self);
}

/// Hook entered before a handler runs and committed after it returns
/// normally. The commit half never runs when the handler panics.
#[async_trait]
pub trait Around: Send + Sync {
    async fn enter(&self, cx: &Context) -> Result<(), Error>;
    async fn commit(&self, cx: &Context) -> Result<(), Error>;
}

/// Fired exactly once when a held capability's ref-count reaches zero.
/// Must not block; it runs off the caller's thread.
pub trait CloseHook: Send + Sync {
    fn close(&self);
}

impl<F: Fn() + Send + Sync> CloseHook for F {
    fn close(&self) {
        self()
    }
}

/// Checkpointable actor state. A vtable value carrying this is
/// checkpointed through the external KV around every call when the
/// interface is registered as an actor.
pub trait ActorState: Send + Sync {
    fn snapshot(&self) -> Result<Vec<u8>, Error>;
    fn restore(&self, state: &[u8]) -> Result<(), Error>;
}

struct Method {
    handler: HandlerFn,
}

/// A table of method handlers for one object type.
///
/// Immutable once minted into the registry; build it fully before
/// exposing it.
pub struct Interface {
    name: String,
    methods: HashMap<String, Method>,
    around: Option<Arc<dyn Around>>,
    restore: Option<RestoreState>,
    close: Option<Arc<dyn CloseHook>>,
    state: Option<Arc<dyn ActorState>>,
}

impl Interface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: HashMap::new(),
            around: None,
            restore: None,
            close: None,
            state: None,
        }
    }

    /// Register a method handler.
    pub fn method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Context, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Call, Error>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |cx, call| Box::pin(handler(cx, call)));
        self.methods.insert(name.to_string(), Method { handler });

        self
    }

    pub fn around(mut self, hook: Arc<dyn Around>) -> Self {
        self.around = Some(hook);

        self
    }

    /// Mark capabilities minted from this vtable as restorable.
    pub fn restorable(mut self, state: RestoreState) -> Self {
        self.restore = Some(state);

        self
    }

    pub fn on_close<H: CloseHook + 'static>(mut self, hook: H) -> Self {
        self.close = Some(Arc::new(hook));

        self
    }

    pub fn with_state(mut self, state: Arc<dyn ActorState>) -> Self {
        self.state = Some(state);

        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self, method: &str) -> Option<HandlerFn> {
        self.methods.get(method).map(|m| m.handler.clone())
    }

    pub fn around_hook(&self) -> Option<&Arc<dyn Around>> {
        self.around.as_ref()
    }

    pub fn restore_state(&self) -> Option<&RestoreState> {
        self.restore.as_ref()
    }

    pub fn close_hook(&self) -> Option<&Arc<dyn CloseHook>> {
        self.close.as_ref()
    }

    pub fn actor_state(&self) -> Option<&Arc<dyn ActorState>> {
        self.state.as_ref()
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One in-flight invocation, as seen by its handler.
pub struct Call {
    caller: PeerId,
    args: Slots,
    results: Slots,
    minter: Arc<dyn Minter>,
    linker: Option<Arc<dyn Linker>>,
}

impl Call {
    pub fn new(
        caller: PeerId,
        args: Slots,
        minter: Arc<dyn Minter>,
        linker: Option<Arc<dyn Linker>>,
    ) -> Self {
        Self {
            caller,
            args,
            results: Slots::default(),
            minter,
            linker,
        }
    }

    /// The identity that signed this invocation.
    pub fn caller(&self) -> PeerId {
        self.caller
    }

    /// Decode a required argument slot.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, index: u32) -> Result<T, Error> {
        self.args.get(index).map_err(Error::from)
    }

    /// Decode an optional argument slot.
    pub fn opt_arg<T: serde::de::DeserializeOwned>(&self, index: u32) -> Result<Option<T>, Error> {
        self.args.opt(index).map_err(Error::from)
    }

    pub fn args(&self) -> &Slots {
        &self.args
    }

    /// Assign a result slot.
    pub fn set<T: serde::Serialize>(&mut self, index: u32, value: &T) -> Result<(), Error> {
        self.results.set(index, value).map_err(Error::from)
    }

    pub fn results(&self) -> &Slots {
        &self.results
    }

    pub fn into_results(self) -> Slots {
        self.results
    }

    /// Mint a fresh capability for the caller and hand it out through a
    /// result or return value.
    pub fn mint(&self, interface: Arc<Interface>) -> Capability {
        self.minter.mint(interface, self.caller)
    }

    /// Build a client for a capability embedded in an argument slot.
    pub async fn client(&self, index: u32) -> Result<Arc<dyn CallbackClient>, Error> {
        let capability = self.args.capability(index)?;
        let linker = self
            .linker
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no linker for embedded capability".into()))?;

        linker.link(&capability).await
    }
}
