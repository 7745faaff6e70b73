#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether::{Call, Interface};

pub fn init_logs() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

/// The meter interface from the bootstrap scenario, plus a method that
/// panics and one that fails with a typed error.
pub fn meter() -> Interface {
    Interface::new("meter")
        .method("readTemperature", |_cx, mut call: Call| async move {
            let name: String = call.arg(0)?;
            call.set(0, &42.0f32)?;
            call.set(1, &name)?;
            Ok(call)
        })
        .method("explode", |_cx, _call: Call| async move {
            panic!("boom")
        })
}

/// Spin until `check` passes or the deadline hits.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    panic!("timed out waiting for {}", what);
}

/// A shared counter for close-hook assertions.
pub fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone) {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_ = counter.clone();

    (counter, move || {
        counter_.fetch_add(1, Ordering::SeqCst);
    })
}
