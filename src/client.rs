//! The client side of a capability.
//!
//! A client signs every request with its peer's key, pools one session
//! per contact address, retries once through a fresh session on
//! connection-level failures, and transparently re-resolves restorable
//! capabilities when the issuer restarted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use codec::capability::Capability;
use codec::identity::PeerId;
use codec::record::{ResponseHead, Status, Trailers, trailer};
use codec::slots::Slots;
use service::error::BUILTIN_CATEGORY;
use service::{Context, Error};

use crate::channel::{self, Callbacks};
use crate::peer::Shared;
use crate::transport::Session;

pub(crate) struct ClientShared {
    peer: Arc<Shared>,
    capability: RwLock<Capability>,
    closed: AtomicBool,
}

/// A handle to one remote capability. Cheap to clone; all clones share
/// the underlying reference.
#[derive(Clone)]
pub struct CapClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for CapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapClient").finish()
    }
}

/// What a request/response exchange produced, after trailer decoding.
pub(crate) enum Reply {
    Ok(Vec<u8>),
    UnknownCapability,
}

pub(crate) fn classify(
    response: ResponseHead,
    body: Vec<u8>,
    trailers: Trailers,
) -> Result<Reply, Error> {
    if response.status == 403 {
        return Err(Error::Unauthorized("rejected by peer".to_string()));
    }

    let message = |fallback: &str| {
        trailers
            .get(trailer::ERROR)
            .map(str::to_string)
            .unwrap_or_else(|| fallback.to_string())
    };

    match trailers.status() {
        None => Err(Error::Transport(
            "response carried no status trailer".to_string(),
        )),
        Some(Status::Ok) => Ok(Reply::Ok(body)),
        Some(Status::UnknownCapability) => Ok(Reply::UnknownCapability),
        Some(Status::Unknown) => Err(Error::NotFound(message("unknown path or method"))),
        Some(Status::Panic) => Err(Error::RemotePanic(message("panic"))),
        Some(Status::Error) => {
            let category = trailers
                .get(trailer::ERROR_CATEGORY)
                .unwrap_or(BUILTIN_CATEGORY);
            let code = trailers.get(trailer::ERROR_CODE).unwrap_or("transport");
            let fallback = String::from_utf8_lossy(&body).to_string();
            let message = trailers.get(trailer::ERROR).unwrap_or(fallback.as_str());

            Err(Error::from_trio(category, code, message))
        }
    }
}

/// Classify a reply where `unknown-capability` is as terminal as any
/// other failure.
pub(crate) fn expect_ok(
    response: ResponseHead,
    body: Vec<u8>,
    trailers: Trailers,
) -> Result<Vec<u8>, Error> {
    match classify(response, body, trailers)? {
        Reply::Ok(body) => Ok(body),
        Reply::UnknownCapability => Err(Error::NotFound("unknown capability".to_string())),
    }
}

impl CapClient {
    pub(crate) fn adopt(peer: Arc<Shared>, capability: Capability) -> Self {
        let shared = Arc::new(ClientShared {
            peer,
            capability: RwLock::new(capability),
            closed: AtomicBool::new(false),
        });
        shared.peer.track_client(&shared);

        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    /// The capability this client currently points at. Replaced in place
    /// after a successful re-resolution.
    pub fn capability(&self) -> Capability {
        self.shared.capability.read().clone()
    }

    /// Invoke a method in request/response mode.
    pub async fn call(&self, cx: &Context, method: &str, args: Slots) -> Result<Slots, Error> {
        let body = args.encode()?;

        let mut redialed = false;
        let mut reresolved = false;
        loop {
            let capability = self.capability();
            let path = format!("/_rpc/call/{}/{}", capability.oid, method);

            let reply = match self.exchange(cx, "POST", &path, body.clone()).await {
                Ok(reply) => reply,
                // Connection-level failures get exactly one retry
                // through a fresh session.
                Err(Error::Transport(error)) if !redialed => {
                    log::debug!("retrying through a fresh session: {}", error);
                    self.shared.peer.evict_session(&capability.address);
                    redialed = true;
                    continue;
                }
                Err(error) => return Err(error),
            };

            match reply {
                Reply::Ok(body) => return Ok(Slots::decode(&body)?),
                Reply::UnknownCapability => {
                    if !capability.restorable() || reresolved {
                        return Err(Error::NotFound("unknown capability".to_string()));
                    }
                    reresolved = true;
                    self.reresolve(cx, &capability).await?;
                }
            }
        }
    }

    /// Invoke a method that takes caller-side callbacks; the call rides
    /// an inline-capability channel.
    pub async fn call_with_callbacks(
        &self,
        cx: &Context,
        method: &str,
        args: Slots,
        callbacks: Callbacks,
    ) -> Result<Slots, Error> {
        let capability = self.capability();
        let session = self.session(&capability).await?;

        channel::run_call_stream(
            &self.shared.peer,
            &session,
            &capability,
            method,
            args,
            callbacks,
            cx,
        )
        .await
    }

    /// Allocate a callback set for this capability's issuer.
    pub fn callbacks(&self) -> Callbacks {
        let capability = self.capability();

        Callbacks::new(
            self.shared.peer.keypair.public(),
            capability.issuer_key,
            self.shared.peer.registry.address(),
        )
    }

    /// Increment the remote reference count.
    pub async fn add_ref(&self) -> Result<(), Error> {
        self.object_op("ref").await
    }

    /// Decrement the remote reference count.
    pub async fn deref(&self) -> Result<(), Error> {
        self.object_op("deref").await
    }

    /// Mint a sibling capability bound to another peer's key.
    pub async fn reexport(&self, target: PeerId) -> Result<Capability, Error> {
        let capability = self.capability();
        let path = format!("/_rpc/reexport/{}", capability.oid);
        let cx = Context::background();

        let session = self.session(&capability).await?;
        let mut head = self.shared.peer.signed_head("POST", &path, &cx);
        head.set_header(
            codec::record::header::TARGET_PUBLIC_KEY,
            target.to_string(),
        );

        let (response, body, trailers) = session.request(head, Vec::new()).await?;
        let body = expect_ok(response, body, trailers)?;

        Ok(codec::from_slice(&body)?)
    }

    /// Drop the capability: one best-effort deref, once.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.deref().await {
            log::debug!("deref on close failed: {}", error);
        }
    }

    async fn object_op(&self, op: &str) -> Result<(), Error> {
        let capability = self.capability();
        let path = format!("/_rpc/{}/{}", op, capability.oid);

        match self.exchange(&Context::background(), "POST", &path, Vec::new()).await? {
            Reply::Ok(_) => Ok(()),
            Reply::UnknownCapability => Err(Error::NotFound("unknown capability".to_string())),
        }
    }

    async fn session(&self, capability: &Capability) -> Result<Session, Error> {
        self.shared.peer.session(&capability.address).await
    }

    /// One signed request/response exchange against the capability's
    /// address, honoring the context deadline.
    async fn exchange(
        &self,
        cx: &Context,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Reply, Error> {
        let capability = self.capability();
        let session = self.session(&capability).await?;
        let head = self.shared.peer.signed_head(method, path, cx);

        let exchanged = match cx.deadline() {
            None => session.request(head, body).await?,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::timeout(remaining, session.request(head, body))
                    .await
                    .map_err(|_| Error::Timeout)??
            }
        };

        let (response, body, trailers) = exchanged;
        classify(response, body, trailers)
    }

    /// Present the capability's restore state to the issuer and swap in
    /// the replacement capability.
    async fn reresolve(&self, cx: &Context, capability: &Capability) -> Result<(), Error> {
        let Some(state) = &capability.restore else {
            return Err(Error::NotFound("capability is not restorable".to_string()));
        };

        log::info!(
            "re-resolving capability: oid={}, interface={}",
            capability.oid,
            state.interface
        );

        let session = self.session(capability).await?;
        let head = self.shared.peer.signed_head("POST", "/_rpc/reresolve", cx);
        let (response, body, trailers) =
            session.request(head, codec::to_vec(state)?).await?;
        let body = expect_ok(response, body, trailers)?;
        let replacement: Capability = codec::from_slice(&body)?;

        *self.shared.capability.write() = replacement;

        Ok(())
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        // Last handle gone without an explicit close: deref best-effort
        // when a runtime is around to carry it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let peer = self.peer.clone();
            let capability = self.capability.read().clone();
            handle.spawn(async move {
                let path = format!("/_rpc/deref/{}", capability.oid);
                let head = peer.signed_head("POST", &path, &Context::background());
                if let Ok(session) = peer.session(&capability.address).await {
                    let _ = session.request(head, Vec::new()).await;
                }
            });
        }
    }
}
