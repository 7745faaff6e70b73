mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tether::actor::{ActorOptions, ActorRegistry};
use tether::{
    ActorState, Call, Context, Error, Interface, Kv, MemoryKv, Peer, PeerOptions, Slots,
};

use common::init_logs;

fn options() -> ActorOptions {
    ActorOptions {
        lease_ttl: Duration::from_secs(2),
    }
}

/// A billing actor that reports which peer served the call.
fn billing(marker: &str) -> Interface {
    let marker = marker.to_string();

    Interface::new("billing").method("whoami", move |_cx, mut call: Call| {
        let marker = marker.clone();
        async move {
            call.set(0, &marker)?;
            Ok(call)
        }
    })
}

async fn peer_on_loopback() -> Peer {
    let peer = Peer::new(PeerOptions::default()).unwrap();
    peer.listen_tcp("127.0.0.1:0").await.unwrap();
    peer
}

async fn owner_of(registry: &ActorRegistry, name: &str) -> String {
    for _ in 0..200 {
        if let Ok(client) = registry.client(name).await
            && let Ok(results) = client
                .call(&Context::background(), "whoami", Slots::default())
                .await
        {
            return results.get::<String>(0).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    panic!("no owner for actor {}", name);
}

#[tokio::test]
async fn exactly_one_peer_wins_registration() {
    init_logs();

    let kv = Arc::new(MemoryKv::new());

    let a = peer_on_loopback().await;
    let b = peer_on_loopback().await;
    let registry_a = ActorRegistry::new(a.clone(), kv.clone(), options());
    let registry_b = ActorRegistry::new(b.clone(), kv.clone(), options());

    registry_a.register(billing("peer-a")).unwrap();
    registry_b.register(billing("peer-b")).unwrap();

    // Exactly one wins; the advertisement names its address.
    let caller = peer_on_loopback().await;
    let registry_c = ActorRegistry::new(caller.clone(), kv.clone(), options());
    let owner = owner_of(&registry_c, "billing").await;
    assert!(owner == "peer-a" || owner == "peer-b");

    let advertised = kv.get("/actor/registry/billing").await.unwrap().unwrap();
    let expected = if owner == "peer-a" {
        a.registry().address()
    } else {
        b.registry().address()
    };
    assert_eq!(advertised, expected.into_bytes());

    registry_a.close().await;
    registry_b.close().await;
    registry_c.close().await;
    a.close().await;
    b.close().await;
    caller.close().await;
}

#[tokio::test]
async fn the_watcher_takes_over_when_the_owner_leaves() {
    init_logs();

    let kv = Arc::new(MemoryKv::new());

    let a = peer_on_loopback().await;
    let b = peer_on_loopback().await;
    let registry_a = ActorRegistry::new(a.clone(), kv.clone(), options());
    let registry_b = ActorRegistry::new(b.clone(), kv.clone(), options());

    registry_a.register(billing("peer-a")).unwrap();

    let caller = peer_on_loopback().await;
    let registry_c = ActorRegistry::new(caller.clone(), kv.clone(), options());
    assert_eq!(owner_of(&registry_c, "billing").await, "peer-a");

    registry_b.register(billing("peer-b")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(owner_of(&registry_c, "billing").await, "peer-a");

    // The owner leaves; the watcher claims the name within a lease
    // period.
    registry_a.close().await;
    for _ in 0..200 {
        if owner_of(&registry_c, "billing").await == "peer-b" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(owner_of(&registry_c, "billing").await, "peer-b");

    registry_b.close().await;
    registry_c.close().await;
    a.close().await;
    b.close().await;
    caller.close().await;
}

#[tokio::test]
async fn missing_actor_is_not_found() {
    init_logs();

    let kv = Arc::new(MemoryKv::new());
    let peer = peer_on_loopback().await;
    let registry = ActorRegistry::new(peer.clone(), kv, options());

    let error = registry.client("billing").await.unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));

    peer.close().await;
}

/// An actor whose state is a single counter checkpointed through the KV.
struct CounterState {
    value: AtomicU64,
}

impl ActorState for CounterState {
    fn snapshot(&self) -> Result<Vec<u8>, Error> {
        Ok(self.value.load(Ordering::SeqCst).to_be_bytes().to_vec())
    }

    fn restore(&self, state: &[u8]) -> Result<(), Error> {
        let bytes: [u8; 8] = state
            .try_into()
            .map_err(|_| Error::InvalidArgument("counter state".to_string()))?;
        self.value.store(u64::from_be_bytes(bytes), Ordering::SeqCst);

        Ok(())
    }
}

fn counting_billing() -> Interface {
    let state = Arc::new(CounterState {
        value: AtomicU64::new(0),
    });
    let state_ = state.clone();

    Interface::new("billing")
        .with_state(state.clone())
        .method("charge", move |_cx, mut call: Call| {
            let state = state_.clone();
            async move {
                let total = state.value.fetch_add(1, Ordering::SeqCst) + 1;
                call.set(0, &total)?;
                Ok(call)
            }
        })
}

#[tokio::test]
async fn actor_state_survives_a_handoff() {
    init_logs();

    let kv = Arc::new(MemoryKv::new());

    let a = peer_on_loopback().await;
    let registry_a = ActorRegistry::new(a.clone(), kv.clone(), options());
    registry_a.register(counting_billing()).unwrap();

    let caller = peer_on_loopback().await;
    let registry_c = ActorRegistry::new(caller.clone(), kv.clone(), options());

    let mut last = 0u64;
    for _ in 0..3 {
        let client = registry_c.client("billing").await.unwrap();
        let results = client
            .call(&Context::background(), "charge", Slots::default())
            .await
            .unwrap();
        last = results.get::<u64>(0).unwrap();
        client.close().await;
    }
    assert_eq!(last, 3);

    // Hand the actor to a fresh peer; its counter resumes from the
    // checkpoint, not from zero.
    registry_a.close().await;
    a.close().await;

    let b = peer_on_loopback().await;
    let registry_b = ActorRegistry::new(b.clone(), kv.clone(), options());
    registry_b.register(counting_billing()).unwrap();

    let total = loop {
        if let Ok(client) = registry_c.client("billing").await {
            if let Ok(results) = client
                .call(&Context::background(), "charge", Slots::default())
                .await
            {
                break results.get::<u64>(0).unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(total, 4);

    registry_b.close().await;
    registry_c.close().await;
    b.close().await;
    caller.close().await;
}
