//! Restart-safe capability reconstruction.
//!
//! A peer registers one reconstruction function per interface name at
//! process start. When a client presents a restore state minted by a
//! previous incarnation of this peer, the registrar rebuilds the vtable
//! and the registry mints a replacement capability. Reconstruction is
//! serialized per interface name.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use codec::capability::{Capability, RestoreState};
use codec::identity::PeerId;

use crate::error::Error;
use crate::interface::Interface;
use crate::registry::Registry;

/// Rebuilds a vtable from a restore state.
#[async_trait]
pub trait Restorer: Send + Sync {
    async fn restore(&self, state: &RestoreState) -> Result<Arc<Interface>, Error>;
}

struct FnRestorer<F>(F);

#[async_trait]
impl<F> Restorer for FnRestorer<F>
where
    F: Fn(&RestoreState) -> Result<Arc<Interface>, Error> + Send + Sync,
{
    async fn restore(&self, state: &RestoreState) -> Result<Arc<Interface>, Error> {
        (self.0)(state)
    }
}

#[derive(Default)]
pub struct Restorers {
    map: RwLock<HashMap<String, Arc<dyn Restorer>>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Restorers {
    pub fn register(&self, interface: &str, restorer: Arc<dyn Restorer>) {
        self.map.write().insert(interface.to_string(), restorer);
    }

    /// Register a synchronous reconstruction function.
    pub fn register_fn<F>(&self, interface: &str, restorer: F)
    where
        F: Fn(&RestoreState) -> Result<Arc<Interface>, Error> + Send + Sync + 'static,
    {
        self.register(interface, Arc::new(FnRestorer(restorer)));
    }

    fn gate(&self, interface: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .entry(interface.to_string())
            .or_default()
            .clone()
    }

    /// Serve one `/_rpc/reresolve` request: rebuild the vtable and mint a
    /// replacement capability for the requesting peer.
    pub async fn reresolve(
        &self,
        registry: &Registry,
        state: &RestoreState,
        user_key: PeerId,
    ) -> Result<Capability, Error> {
        let restorer = self
            .map
            .read()
            .get(&state.interface)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("no registrar for interface {:?}", state.interface))
            })?;

        let gate = self.gate(&state.interface);
        let _serialized = gate.lock().await;

        let interface = restorer.restore(state).await?;

        Ok(registry.mint(interface, user_key))
    }
}
