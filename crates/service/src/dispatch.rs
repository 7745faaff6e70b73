//! The dispatch core.
//!
//! Maps one authenticated request onto a handler invocation and encodes
//! the outcome into the trailer protocol: a body is only meaningful under
//! `status ∈ {ok, error}`, every other status is diagnostic and carries
//! no structured body.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures::FutureExt;

use codec::identity::PeerId;
use codec::oid::Oid;
use codec::record::Trailers;
use codec::slots::Slots;

use crate::context::Context;
use crate::error::Error;
use crate::interface::{Call, Interface, Linker, Minter};
use crate::registry::Registry;

/// The wire-facing result of one request/response dispatch.
#[derive(Debug)]
pub struct Outcome {
    pub status: u16,
    pub body: Vec<u8>,
    pub trailers: Trailers,
}

impl Outcome {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            trailers: Trailers::ok(),
        }
    }

    pub fn error(error: &Error) -> Self {
        Self {
            status: 500,
            body: error.message().into_bytes(),
            trailers: Trailers::error(error.category(), error.code(), &error.message()),
        }
    }

    /// 403 with no body and no status trailer; clients branch on the
    /// response code alone.
    pub fn unauthorized() -> Self {
        Self {
            status: 403,
            body: Vec::new(),
            trailers: Trailers::default(),
        }
    }

    pub fn unknown_capability() -> Self {
        Self {
            status: 404,
            body: Vec::new(),
            trailers: Trailers::with_status(codec::record::Status::UnknownCapability),
        }
    }

    pub fn unknown(message: &str) -> Self {
        Self {
            status: 404,
            body: Vec::new(),
            trailers: Trailers::unknown(message),
        }
    }

    pub fn panicked(message: &str) -> Self {
        Self {
            status: 500,
            body: Vec::new(),
            trailers: Trailers::panic(message),
        }
    }
}

/// What running a handler produced, before trailer encoding. Shared by
/// the request/response path and the call-stream path.
pub enum Handled {
    Ok(Slots),
    UnknownMethod,
    Failed(Error),
    Panicked(String),
}

pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run one method handler under the panic shield and the around
    /// hook pairing rules.
    ///
    /// Takes the vtable rather than a registry entry so the call-stream
    /// path can dispatch inline vtables that were never minted.
    pub async fn invoke(
        &self,
        vtable: &Arc<Interface>,
        caller: PeerId,
        method: &str,
        args: Slots,
        cx: Context,
        linker: Option<Arc<dyn Linker>>,
    ) -> Handled {
        let Some(handler) = vtable.handler(method) else {
            return Handled::UnknownMethod;
        };

        let minter: Arc<dyn Minter> = self.registry.clone();
        let call = Call::new(caller, args, minter, linker);

        let around = vtable.around_hook().cloned();
        if let Some(hook) = &around
            && let Err(error) = hook.enter(&cx).await
        {
            return Handled::Failed(error);
        }

        match AssertUnwindSafe(handler(cx.clone(), call)).catch_unwind().await {
            Err(payload) => {
                let message = panic_message(payload);
                log::error!(
                    "handler panicked: interface={}, method={}, error={}\n{}",
                    vtable.name(),
                    method,
                    message,
                    std::backtrace::Backtrace::force_capture(),
                );

                // No commit after a panic; the hook pairing is enter-only.
                Handled::Panicked(message)
            }
            Ok(result) => {
                if let Some(hook) = &around
                    && let Err(error) = hook.commit(&cx).await
                {
                    return Handled::Failed(error);
                }

                match result {
                    Ok(call) => Handled::Ok(call.into_results()),
                    Err(error) => Handled::Failed(error),
                }
            }
        }
    }

    /// The request/response dispatch algorithm for
    /// `POST /_rpc/call/<oid>/<method>`.
    ///
    /// The caller identity has already been authenticated against its
    /// signature; ownership of the target object is checked here, where
    /// the capability record lives.
    pub async fn call(
        &self,
        caller: PeerId,
        oid: &str,
        method: &str,
        body: &[u8],
        cx: Context,
        linker: Option<Arc<dyn Linker>>,
    ) -> Outcome {
        let Ok(oid) = Oid::from_str(oid) else {
            return Outcome::unknown_capability();
        };
        let Some(held) = self.registry.resolve(&oid) else {
            return Outcome::unknown_capability();
        };
        if held.user_key() != caller {
            log::warn!("capability ownership mismatch: oid={}, caller={}", oid, caller);
            return Outcome::unauthorized();
        }

        let args = match Slots::decode(body) {
            Ok(args) => args,
            Err(error) => return Outcome::error(&Error::from(error)),
        };

        match self.invoke(held.vtable(), caller, method, args, cx, linker).await {
            Handled::UnknownMethod => Outcome::unknown("unknown method"),
            Handled::Panicked(message) => Outcome::panicked(&message),
            Handled::Failed(error) => Outcome::error(&error),
            Handled::Ok(results) => match results.encode() {
                Ok(body) => Outcome::ok(body),
                Err(error) => Outcome::error(&Error::from(error)),
            },
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use codec::identity::Keypair;
    use codec::record::Status;

    use crate::interface::{Around, Interface};
    use crate::registry::{DEFAULT_IDLE_TIMEOUT, RegistryOptions};

    fn registry() -> Arc<Registry> {
        Registry::new(RegistryOptions {
            issuer: Keypair::generate().public(),
            address: "127.0.0.1:0".to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    fn meter() -> Interface {
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
            .method("reject", |_cx, _call: Call| async move {
                Err(Error::fault("billing", "quota", "quota exhausted"))
            })
    }

    #[tokio::test]
    async fn call_returns_results_under_ok_trailer() {
        let registry = registry();
        let user = Keypair::generate().public();
        let capability = registry.mint(Arc::new(meter()), user);
        let dispatcher = Dispatcher::new(registry);

        let mut args = Slots::default();
        args.set(0, &"probe-1").unwrap();

        let outcome = dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "readTemperature",
                &args.encode().unwrap(),
                Context::background(),
                None,
            )
            .await;

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.trailers.status(), Some(Status::Ok));

        let results = Slots::decode(&outcome.body).unwrap();
        assert_eq!(results.get::<f32>(0).unwrap(), 42.0);
        assert_eq!(results.get::<String>(1).unwrap(), "probe-1");
    }

    #[tokio::test]
    async fn unknown_oid_has_no_body() {
        let registry = registry();
        let user = Keypair::generate().public();
        let dispatcher = Dispatcher::new(registry);

        let outcome = dispatcher
            .call(
                user,
                &Oid::random().to_string(),
                "readTemperature",
                &[],
                Context::background(),
                None,
            )
            .await;

        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.trailers.status(), Some(Status::UnknownCapability));
        assert!(outcome.body.is_empty());
    }

    #[tokio::test]
    async fn foreign_caller_is_rejected() {
        let registry = registry();
        let user = Keypair::generate().public();
        let thief = Keypair::generate().public();
        let capability = registry.mint(Arc::new(meter()), user);
        let dispatcher = Dispatcher::new(registry);

        let outcome = dispatcher
            .call(
                thief,
                &capability.oid.to_string(),
                "readTemperature",
                &[],
                Context::background(),
                None,
            )
            .await;

        assert_eq!(outcome.status, 403);
        assert_eq!(outcome.trailers.status(), None);
    }

    #[tokio::test]
    async fn panic_is_shielded_and_capability_survives() {
        let registry = registry();
        let user = Keypair::generate().public();
        let capability = registry.mint(Arc::new(meter()), user);
        let dispatcher = Dispatcher::new(registry.clone());

        let outcome = dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "explode",
                &[],
                Context::background(),
                None,
            )
            .await;

        assert_eq!(outcome.trailers.status(), Some(Status::Panic));
        assert_eq!(outcome.trailers.get("error"), Some("boom"));
        assert!(registry.contains(&capability.oid));

        // A later call on the same capability succeeds.
        let mut args = Slots::default();
        args.set(0, &"probe-1").unwrap();
        let outcome = dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "readTemperature",
                &args.encode().unwrap(),
                Context::background(),
                None,
            )
            .await;
        assert_eq!(outcome.trailers.status(), Some(Status::Ok));
    }

    #[tokio::test]
    async fn typed_faults_carry_their_trio() {
        let registry = registry();
        let user = Keypair::generate().public();
        let capability = registry.mint(Arc::new(meter()), user);
        let dispatcher = Dispatcher::new(registry);

        let outcome = dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "reject",
                &[],
                Context::background(),
                None,
            )
            .await;

        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.trailers.status(), Some(Status::Error));
        assert_eq!(outcome.trailers.get("error-category"), Some("billing"));
        assert_eq!(outcome.trailers.get("error-code"), Some("quota"));
        assert_eq!(outcome.body, b"quota exhausted");
    }

    #[tokio::test]
    async fn unknown_method_is_distinct_from_unknown_capability() {
        let registry = registry();
        let user = Keypair::generate().public();
        let capability = registry.mint(Arc::new(meter()), user);
        let dispatcher = Dispatcher::new(registry);

        let outcome = dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "readHumidity",
                &[],
                Context::background(),
                None,
            )
            .await;

        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.trailers.status(), Some(Status::Unknown));
        assert_eq!(outcome.trailers.get("error"), Some("unknown method"));
    }

    struct CountingAround {
        entered: AtomicUsize,
        committed: AtomicUsize,
    }

    #[async_trait]
    impl Around for CountingAround {
        async fn enter(&self, _cx: &Context) -> Result<(), Error> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn commit(&self, _cx: &Context) -> Result<(), Error> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn around_commit_is_paired_except_on_panic() {
        let registry = registry();
        let user = Keypair::generate().public();
        let hook = Arc::new(CountingAround {
            entered: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        });

        let interface = meter().around(hook.clone());
        let capability = registry.mint(Arc::new(interface), user);
        let dispatcher = Dispatcher::new(registry);

        let mut args = Slots::default();
        args.set(0, &"probe-1").unwrap();
        dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "readTemperature",
                &args.encode().unwrap(),
                Context::background(),
                None,
            )
            .await;
        assert_eq!(hook.entered.load(Ordering::SeqCst), 1);
        assert_eq!(hook.committed.load(Ordering::SeqCst), 1);

        dispatcher
            .call(
                user,
                &capability.oid.to_string(),
                "explode",
                &[],
                Context::background(),
                None,
            )
            .await;
        assert_eq!(hook.entered.load(Ordering::SeqCst), 2);
        assert_eq!(hook.committed.load(Ordering::SeqCst), 1);

        // Give the panic shield's logging a moment; nothing else runs.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
