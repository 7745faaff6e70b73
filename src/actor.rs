//! Cluster-wide singleton actors.
//!
//! An actor is a named capability whose address is advertised through
//! the external KV under a lease. Exactly one peer owns a name at a
//! time; the others watch and take over when the owner's key disappears.
//! Vtable values carrying actor state are checkpointed through the KV
//! around every call.

use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use service::{ActorState, Around, Context, Error, Interface};

use crate::client::CapClient;
use crate::kv::{Kv, KvEvent, LeaseId};
use crate::peer::Peer;

/// Keyspace for name → contact address advertisements.
pub const REGISTRY_PREFIX: &str = "/actor/registry/";
/// Keyspace for checkpointed actor state.
pub const STATE_PREFIX: &str = "/actor/state/";

/// Default advertisement lease; renewed at half this interval.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

fn registry_key(name: &str) -> String {
    format!("{}{}", REGISTRY_PREFIX, name)
}

fn state_key(name: &str) -> String {
    format!("{}{}", STATE_PREFIX, name)
}

pub struct ActorOptions {
    pub lease_ttl: Duration,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

struct Owned {
    lease: LeaseId,
}

struct Inner {
    peer: Peer,
    kv: Arc<dyn Kv>,
    lease_ttl: Duration,
    closing: CancellationToken,
    owned: Mutex<HashMap<String, Owned>>,
}

/// The distributed name → capability registry.
#[derive(Clone)]
pub struct ActorRegistry {
    inner: Arc<Inner>,
}

impl ActorRegistry {
    pub fn new(peer: Peer, kv: Arc<dyn Kv>, options: ActorOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer,
                kv,
                lease_ttl: options.lease_ttl,
                closing: CancellationToken::new(),
                owned: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Advertise `interface` under its name and keep contending for
    /// ownership until the registry closes.
    ///
    /// Returns as soon as the supervisor is running; ownership may be
    /// held by another peer at that point.
    pub fn register(&self, interface: Interface) -> Result<(), Error> {
        if self.inner.closing.is_cancelled() {
            return Err(Error::Closed("actor registry closed".to_string()));
        }

        let interface = Arc::new(with_checkpoint(self.inner.kv.clone(), interface));
        tokio::spawn(supervise(self.inner.clone(), interface));

        Ok(())
    }

    /// Resolve the current owner of a name.
    pub async fn client(&self, name: &str) -> Result<CapClient, Error> {
        let value = self
            .inner
            .kv
            .get(&registry_key(name))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no actor registered as {:?}", name)))?;
        let address = String::from_utf8(value)
            .map_err(|_| Error::InvalidArgument("malformed actor address".to_string()))?;

        self.inner.peer.resolve(&address, name).await
    }

    /// Stop contending: compare-and-delete every owned key, then release
    /// the leases.
    pub async fn close(&self) {
        self.inner.closing.cancel();

        let owned: Vec<_> = self.inner.owned.lock().drain().collect();
        let address = self.inner.peer.registry().address();
        for (name, owned) in owned {
            let _ = self
                .inner
                .kv
                .delete_if_eq(&registry_key(&name), address.as_bytes())
                .await;
            let _ = self.inner.kv.release(owned.lease).await;
            self.inner.peer.registry().unexpose(&name);
        }
    }
}

/// Install the state-checkpoint hook when the vtable value carries
/// actor state.
fn with_checkpoint(kv: Arc<dyn Kv>, interface: Interface) -> Interface {
    let Some(state) = interface.actor_state().cloned() else {
        return interface;
    };
    let key = state_key(interface.name());

    interface.around(Arc::new(CheckpointAround { kv, key, state }))
}

/// Loads persisted state before each call and writes it back after.
/// Load/store failures are logged, never surfaced to the call.
struct CheckpointAround {
    kv: Arc<dyn Kv>,
    key: String,
    state: Arc<dyn ActorState>,
}

#[async_trait]
impl Around for CheckpointAround {
    async fn enter(&self, _cx: &Context) -> Result<(), Error> {
        match self.kv.get(&self.key).await {
            Ok(Some(bytes)) => {
                if let Err(error) = self.state.restore(&bytes) {
                    log::warn!("actor state load failed: key={}, error={}", self.key, error);
                }
            }
            Ok(None) => {}
            Err(error) => {
                log::warn!("actor state read failed: key={}, error={}", self.key, error);
            }
        }

        Ok(())
    }

    async fn commit(&self, _cx: &Context) -> Result<(), Error> {
        match self.state.snapshot() {
            Ok(bytes) => {
                if let Err(error) = self.kv.put(&self.key, &bytes).await {
                    log::warn!("actor state store failed: key={}, error={}", self.key, error);
                }
            }
            Err(error) => {
                log::warn!("actor state snapshot failed: key={}, error={}", self.key, error);
            }
        }

        Ok(())
    }
}

/// Per-name supervisor: contend for the key, hold it while owned, fall
/// back to watching when another peer holds it.
async fn supervise(inner: Arc<Inner>, interface: Arc<Interface>) {
    let name = interface.name().to_string();
    let key = registry_key(&name);

    while !inner.closing.is_cancelled() {
        match acquire(&inner, &key).await {
            Ok(Some(lease)) => {
                log::info!("actor registered: name={}", name);
                inner.peer.registry().expose(interface.clone());
                inner.owned.lock().insert(name.clone(), Owned { lease });

                let retry = hold(&inner, &key, lease).await;

                inner.owned.lock().remove(&name);
                inner.peer.registry().unexpose(&name);
                if !retry {
                    return;
                }
            }
            Ok(None) => {
                log::debug!("actor owned elsewhere, watching: name={}", name);
                if !wait_for_vacancy(&inner, &key).await {
                    return;
                }
            }
            Err(error) => {
                log::warn!("actor registration failed: name={}, error={}", name, error);
                tokio::select! {
                    _ = inner.closing.cancelled() => return,
                    _ = tokio::time::sleep(inner.lease_ttl / 2) => {}
                }
            }
        }
    }
}

/// One transaction attempt. `Ok(Some(lease))` means this peer now owns
/// the key under that lease.
async fn acquire(inner: &Arc<Inner>, key: &str) -> Result<Option<LeaseId>, Error> {
    let address = inner.peer.registry().address();
    let lease = inner.kv.grant(inner.lease_ttl).await?;

    if inner
        .kv
        .put_if_absent(key, address.as_bytes(), Some(lease))
        .await?
    {
        return Ok(Some(lease));
    }

    // Lost the transaction. A leftover advertisement of our own address
    // (a previous incarnation) is reclaimed; anything else is a live
    // owner.
    if inner.kv.get(key).await?.as_deref() == Some(address.as_bytes())
        && inner.kv.delete_if_eq(key, address.as_bytes()).await?
        && inner
            .kv
            .put_if_absent(key, address.as_bytes(), Some(lease))
            .await?
    {
        return Ok(Some(lease));
    }

    inner.kv.release(lease).await?;

    Ok(None)
}

/// Keep the lease alive and watch the key while owning it. Returns
/// whether the supervisor should contend again.
async fn hold(inner: &Arc<Inner>, key: &str, lease: LeaseId) -> bool {
    let mut watch = match inner.kv.watch(key).await {
        Ok(watch) => watch,
        Err(error) => {
            log::warn!("actor watch failed: key={}, error={}", key, error);
            return true;
        }
    };
    let mut renew = tokio::time::interval(inner.lease_ttl / 2);
    renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    renew.tick().await;

    loop {
        tokio::select! {
            _ = inner.closing.cancelled() => return false,
            _ = renew.tick() => {
                if let Err(error) = inner.kv.keep_alive(lease).await {
                    log::warn!("actor lease lost: key={}, error={}", key, error);
                    return true;
                }
            }
            event = watch.recv() => match event {
                Some(KvEvent::Put(_)) => {}
                Some(KvEvent::Delete) => {
                    log::warn!("actor advertisement deleted: key={}", key);
                    return true;
                }
                // Watch canceled: re-establish it, and treat a missing
                // key as a lost advertisement.
                None => {
                    match inner.kv.watch(key).await {
                        Ok(reestablished) => watch = reestablished,
                        Err(_) => return true,
                    }
                    match inner.kv.get(key).await {
                        Ok(Some(_)) => {}
                        _ => return true,
                    }
                }
            }
        }
    }
}

/// Wait until the key disappears so the supervisor can contend again.
/// Returns false when the registry is closing.
async fn wait_for_vacancy(inner: &Arc<Inner>, key: &str) -> bool {
    loop {
        let mut watch = match inner.kv.watch(key).await {
            Ok(watch) => watch,
            Err(_) => {
                tokio::select! {
                    _ = inner.closing.cancelled() => return false,
                    _ = tokio::time::sleep(inner.lease_ttl / 2) => continue,
                }
            }
        };

        // The key may have vanished between the failed transaction and
        // the watch; check once after establishing it.
        match inner.kv.get(key).await {
            Ok(None) => return true,
            Ok(Some(_)) => {}
            Err(_) => continue,
        }

        loop {
            tokio::select! {
                _ = inner.closing.cancelled() => return false,
                event = watch.recv() => match event {
                    Some(KvEvent::Delete) => return true,
                    Some(KvEvent::Put(_)) => {}
                    None => break,
                }
            }
        }
    }
}
