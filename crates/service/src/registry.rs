//! The capability registry.
//!
//! Owns every live vtable behind a map keyed by oid; everything handed
//! out elsewhere is an opaque handle. All operations are atomic with
//! respect to the registry lock, and the lock is never held across I/O.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicI64, AtomicU64, Ordering},
};
use std::thread;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

use codec::capability::{Capability, RestoreState};
use codec::identity::PeerId;
use codec::oid::Oid;

use crate::error::Error;
use crate::interface::{Interface, Minter};

/// Capabilities idle longer than this are removed by the sweeper, firing
/// their close hooks exactly as a final deref would.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A coarse seconds counter advanced by the sweeper thread. Cheaper than
/// reading the clock on every touch.
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Server-side record of one live capability.
pub struct Held {
    vtable: Arc<Interface>,
    user_key: PeerId,
    refs: AtomicI64,
    last_contact: AtomicU64,
    restore: Option<RestoreState>,
}

impl Held {
    pub fn vtable(&self) -> &Arc<Interface> {
        &self.vtable
    }

    pub fn user_key(&self) -> PeerId {
        self.user_key
    }

    pub fn refs(&self) -> i64 {
        self.refs.load(Ordering::Relaxed)
    }
}

pub struct RegistryOptions {
    pub issuer: PeerId,
    /// Contact string baked into minted capabilities. Can be replaced
    /// later when the peer learns its observed address.
    pub address: String,
    pub idle_timeout: Duration,
}

pub struct Registry {
    issuer: PeerId,
    address: RwLock<String>,
    caps: RwLock<HashMap<Oid, Arc<Held>>>,
    names: RwLock<HashMap<String, Arc<Interface>>>,
    timer: Timer,
    idle_secs: u64,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Arc<Self> {
        let this = Arc::new(Self {
            issuer: options.issuer,
            address: RwLock::new(options.address),
            caps: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            timer: Timer::default(),
            idle_secs: options.idle_timeout.as_secs().max(1),
        });

        // Background sweeper: advances the coarse clock and collects
        // capabilities nobody has contacted within the idle window.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || Self::sweep(this_));

        this
    }

    fn sweep(this: Weak<Self>) {
        let mut idle = Vec::new();

        while let Some(this) = this.upgrade() {
            let now = this.timer.add();

            {
                let caps = this.caps.read();
                for (oid, held) in caps.iter() {
                    if now.saturating_sub(held.last_contact.load(Ordering::Relaxed))
                        > this.idle_secs
                    {
                        idle.push(*oid);
                    }
                }
            }

            for oid in idle.drain(..) {
                log::warn!("capability expired idle: oid={}", oid);
                let _ = this.deref_by(&oid, i64::MAX);
            }

            drop(this);
            thread::sleep(Duration::from_secs(1));
        }
    }

    pub fn issuer(&self) -> PeerId {
        self.issuer
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    pub fn set_address(&self, address: String) {
        *self.address.write() = address;
    }

    /// Register a bootstrap vtable under a persistent name.
    pub fn expose(&self, interface: Arc<Interface>) {
        self.names
            .write()
            .insert(interface.name().to_string(), interface);
    }

    pub fn unexpose(&self, name: &str) {
        self.names.write().remove(name);
    }

    pub fn exposed(&self, name: &str) -> Option<Arc<Interface>> {
        self.names.read().get(name).cloned()
    }

    /// Mint a fresh capability over `interface` for `user_key`.
    pub fn mint(&self, interface: Arc<Interface>, user_key: PeerId) -> Capability {
        let oid = Oid::random();
        let restore = interface.restore_state().cloned();
        let held = Arc::new(Held {
            vtable: interface,
            user_key,
            refs: AtomicI64::new(1),
            last_contact: AtomicU64::new(self.timer.get()),
            restore: restore.clone(),
        });

        self.caps.write().insert(oid, held);

        Capability {
            oid,
            address: self.address(),
            user_key,
            issuer_key: self.issuer,
            restore,
            inline: false,
        }
    }

    /// Resolve a bootstrap name to a fresh capability.
    pub fn lookup(&self, name: &str, user_key: PeerId) -> Result<Capability, Error> {
        let interface = self
            .exposed(name)
            .ok_or_else(|| Error::NotFound(format!("no exposed interface {:?}", name)))?;

        Ok(self.mint(interface, user_key))
    }

    /// Mint a new oid sharing an existing capability's vtable and
    /// lifecycle, owned by a different peer.
    pub fn reexport(&self, oid: &Oid, user_key: PeerId) -> Result<Capability, Error> {
        let held = self
            .resolve(oid)
            .ok_or_else(|| Error::NotFound(format!("unknown capability {}", oid)))?;

        Ok(self.mint(held.vtable.clone(), user_key))
    }

    /// Look up a live capability, refreshing its contact stamp.
    pub fn resolve(&self, oid: &Oid) -> Option<Arc<Held>> {
        let held = self.caps.read().get(oid).cloned()?;
        held.last_contact.store(self.timer.get(), Ordering::Relaxed);

        Some(held)
    }

    pub fn add_ref(&self, oid: &Oid) -> Result<(), Error> {
        // Under the read lock the entry cannot be concurrently removed,
        // so the increment never resurrects a dead oid.
        let caps = self.caps.read();
        let held = caps
            .get(oid)
            .ok_or_else(|| Error::NotFound(format!("unknown capability {}", oid)))?;
        held.refs.fetch_add(1, Ordering::SeqCst);
        held.last_contact.store(self.timer.get(), Ordering::Relaxed);

        Ok(())
    }

    pub fn deref(&self, oid: &Oid) -> Result<(), Error> {
        self.deref_by(oid, 1)
    }

    fn deref_by(&self, oid: &Oid, count: i64) -> Result<(), Error> {
        let removed = {
            let mut caps = self.caps.write();
            let held = caps
                .get(oid)
                .ok_or_else(|| Error::NotFound(format!("unknown capability {}", oid)))?;

            if held.refs.fetch_sub(count, Ordering::SeqCst) <= count {
                caps.remove(oid)
            } else {
                None
            }
        };

        // The close hook runs off this thread; deref never blocks on it.
        if let Some(held) = removed
            && let Some(hook) = held.vtable.close_hook().cloned()
        {
            thread::spawn(move || hook.close());
        }

        Ok(())
    }

    pub fn touch(&self, oid: &Oid) {
        if let Some(held) = self.caps.read().get(oid) {
            held.last_contact.store(self.timer.get(), Ordering::Relaxed);
        }
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.caps.read().contains_key(oid)
    }

    pub fn len(&self) -> usize {
        self.caps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.read().is_empty()
    }
}

impl Minter for Registry {
    fn mint(&self, interface: Arc<Interface>, user_key: PeerId) -> Capability {
        Registry::mint(self, interface, user_key)
    }
}
