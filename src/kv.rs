//! The external KV the actor registry advertises through.
//!
//! The trait mirrors the lease/transaction/watch surface of an
//! etcd-style store; deployments bind their store of choice. The
//! in-memory implementation ships for tests and single-node use and
//! honors the same semantics, including lease expiry.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use service::Error;

pub type LeaseId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum KvEvent {
    Put(Vec<u8>),
    Delete,
}

/// Events observed on one watched key.
pub type KvWatch = mpsc::Receiver<KvEvent>;

#[async_trait]
pub trait Kv: Send + Sync {
    /// Grant a lease; keys put under it vanish when it expires.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, Error>;

    /// Push a lease's expiry out by its full ttl.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), Error>;

    /// Release a lease, deleting the keys it holds.
    async fn release(&self, lease: LeaseId) -> Result<(), Error>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Transactionally create `key` when absent. Returns whether the put
    /// happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<bool, Error>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Compare-and-delete. Returns whether the key was deleted.
    async fn delete_if_eq(&self, key: &str, expect: &[u8]) -> Result<bool, Error>;

    /// Watch one key for puts and deletes, starting from now.
    async fn watch(&self, key: &str) -> Result<KvWatch, Error>;
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: Vec<String>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: HashMap<String, Vec<mpsc::Sender<KvEvent>>>,
    next_lease: LeaseId,
}

impl State {
    fn notify(&mut self, key: &str, event: KvEvent) {
        if let Some(watchers) = self.watchers.get_mut(key) {
            watchers.retain(|w| w.try_send(event.clone()).is_ok());
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            None => false,
            Some(entry) => {
                if let Some(lease) = entry.lease
                    && let Some(lease) = self.leases.get_mut(&lease)
                {
                    lease.keys.retain(|k| k != key);
                }
                self.notify(key, KvEvent::Delete);
                true
            }
        }
    }
}

/// Process-local [`Kv`] with real lease expiry.
#[derive(Clone)]
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));

        // Lease reaper; coarse 100ms resolution is plenty for the ttls
        // the actor registry uses.
        let state_: Weak<Mutex<State>> = Arc::downgrade(&state);
        thread::spawn(move || {
            while let Some(state) = state_.upgrade() {
                {
                    let mut state = state.lock();
                    let now = Instant::now();
                    let expired: Vec<LeaseId> = state
                        .leases
                        .iter()
                        .filter(|(_, lease)| lease.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();

                    for id in expired {
                        if let Some(lease) = state.leases.remove(&id) {
                            log::debug!("kv lease expired: lease={}", id);
                            for key in lease.keys {
                                state.delete(&key);
                            }
                        }
                    }
                }

                drop(state);
                thread::sleep(Duration::from_millis(100));
            }
        });

        Self { state }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, Error> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), Error> {
        let mut state = self.state.lock();
        let lease = state
            .leases
            .get_mut(&lease)
            .ok_or_else(|| Error::NotFound("lease expired".to_string()))?;
        lease.deadline = Instant::now() + lease.ttl;

        Ok(())
    }

    async fn release(&self, lease: LeaseId) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(lease) = state.leases.remove(&lease) {
            for key in lease.keys {
                state.delete(&key);
            }
        }

        Ok(())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease: None,
            },
        );
        state.notify(key, KvEvent::Put(value.to_vec()));

        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock();
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        if let Some(lease) = lease {
            let lease = state
                .leases
                .get_mut(&lease)
                .ok_or_else(|| Error::NotFound("lease expired".to_string()))?;
            lease.keys.push(key.to_string());
        }

        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease,
            },
        );
        state.notify(key, KvEvent::Put(value.to_vec()));

        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.state.lock().entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete_if_eq(&self, key: &str, expect: &[u8]) -> Result<bool, Error> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if entry.value == expect => Ok(state.delete(key)),
            _ => Ok(false),
        }
    }

    async fn watch(&self, key: &str) -> Result<KvWatch, Error> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .lock()
            .watchers
            .entry(key.to_string())
            .or_default()
            .push(tx);

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_is_single_winner() {
        let kv = MemoryKv::new();
        let lease = kv.grant(Duration::from_secs(5)).await.unwrap();

        assert!(kv.put_if_absent("/k", b"a", Some(lease)).await.unwrap());
        assert!(!kv.put_if_absent("/k", b"b", None).await.unwrap());
        assert_eq!(kv.get("/k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn lease_expiry_deletes_and_notifies() {
        let kv = MemoryKv::new();
        let lease = kv.grant(Duration::from_millis(150)).await.unwrap();
        kv.put_if_absent("/k", b"a", Some(lease)).await.unwrap();
        let mut watch = kv.watch("/k").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), watch.recv())
            .await
            .unwrap();

        assert_eq!(event, Some(KvEvent::Delete));
        assert_eq!(kv.get("/k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keep_alive_defers_expiry() {
        let kv = MemoryKv::new();
        let lease = kv.grant(Duration::from_millis(300)).await.unwrap();
        kv.put_if_absent("/k", b"a", Some(lease)).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            kv.keep_alive(lease).await.unwrap();
        }

        assert_eq!(kv.get("/k").await.unwrap(), Some(b"a".to_vec()));
        kv.release(lease).await.unwrap();
        assert_eq!(kv.get("/k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_delete_checks_the_value() {
        let kv = MemoryKv::new();
        kv.put("/k", b"a").await.unwrap();

        assert!(!kv.delete_if_eq("/k", b"b").await.unwrap());
        assert!(kv.delete_if_eq("/k", b"a").await.unwrap());
        assert!(!kv.delete_if_eq("/k", b"a").await.unwrap());
    }
}
