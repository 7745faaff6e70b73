//! The inline-capability channel.
//!
//! When a caller passes callbacks, the call rides a long-lived
//! bidirectional stream instead of a request/response exchange. The
//! control stream carries the framed request and, from the server,
//! `result`/`deref`/`error` records; each callback invocation is a
//! short-lived sub-stream opened by the server on the same session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use codec::capability::Capability;
use codec::frame::RESET_CANCELED;
use codec::identity::PeerId;
use codec::oid::Oid;
use codec::record::{ChannelRecord, RequestHead, ResponseHead, StreamPayload};
use codec::slots::Slots;
use service::error::BUILTIN_CATEGORY;
use service::{CallbackClient, Context, Error, Handled, Interface, Linker};

use crate::client::CapClient;
use crate::peer::Shared;
use crate::server;
use crate::transport::{RpcStream, Session, StreamSender};

/// Callback vtables a caller attaches to one invocation.
///
/// Each pushed interface is allocated a local oid and handed back as a
/// capability value to embed in the argument slots. The vtables are
/// registered on the session for the duration of the call.
pub struct Callbacks {
    issuer: PeerId,
    user: PeerId,
    address: String,
    entries: Vec<(Oid, Arc<Interface>)>,
}

impl Callbacks {
    pub(crate) fn new(issuer: PeerId, user: PeerId, address: String) -> Self {
        Self {
            issuer,
            user,
            address,
            entries: Vec::new(),
        }
    }

    /// Attach a callback vtable, receiving the capability to embed in
    /// the arguments.
    pub fn push(&mut self, interface: Interface) -> Capability {
        let oid = Oid::random();
        self.entries.push((oid, Arc::new(interface)));

        Capability {
            oid,
            address: self.address.clone(),
            user_key: self.user,
            issuer_key: self.issuer,
            restore: None,
            inline: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes a call's inline vtables from the session map when the call
/// ends, however it ends. Close hooks only fire on deref records.
struct InlineGuard {
    session: Session,
    oids: Vec<Oid>,
}

impl Drop for InlineGuard {
    fn drop(&mut self) {
        for oid in &self.oids {
            self.session.inline_remove(oid);
        }
    }
}

/// Client half: drive one call-stream invocation to completion.
pub(crate) async fn run_call_stream(
    shared: &Arc<Shared>,
    session: &Session,
    capability: &Capability,
    method: &str,
    args: Slots,
    callbacks: Callbacks,
    cx: &Context,
) -> Result<Slots, Error> {
    let mut guard = InlineGuard {
        session: session.clone(),
        oids: Vec::new(),
    };
    for (oid, interface) in callbacks.entries {
        session.inline_insert(oid, interface);
        guard.oids.push(oid);
    }

    let path = format!("/_rpc/callstream/{}/{}", capability.oid, method);
    let head = shared.signed_head("CONNECT", &path, cx);

    let mut stream = session.open().await?;
    stream.send(&StreamPayload::Request(head)).await?;
    stream.send(&StreamPayload::body(args.encode()?)).await?;

    let result = drive_call(session, &mut stream, &mut guard, cx).await;

    // Release our half so the remote forgets the stream; after a reset
    // this is a no-op on the wire.
    let _ = stream.finish().await;

    result
}

async fn drive_call(
    session: &Session,
    stream: &mut RpcStream,
    guard: &mut InlineGuard,
    cx: &Context,
) -> Result<Slots, Error> {
    loop {
        let payload = tokio::select! {
            payload = stream.recv() => payload?,
            _ = cx.done() => {
                let _ = stream.reset(RESET_CANCELED).await;
                return Err(if cx.deadline().is_some_and(|d| std::time::Instant::now() >= d) {
                    Error::Timeout
                } else {
                    Error::Closed("canceled".to_string())
                });
            }
        };

        match payload {
            Some(StreamPayload::Response(ResponseHead { status: 200, .. })) => {}
            Some(StreamPayload::Response(head)) => {
                return Err(match head.status {
                    403 => Error::Unauthorized("rejected by peer".to_string()),
                    404 => Error::NotFound("unknown capability".to_string()),
                    status => Error::Transport(format!("call stream refused: {}", status)),
                });
            }
            Some(StreamPayload::Channel(ChannelRecord::Deref { oid })) => {
                if let Some(interface) = session.inline_remove(&oid) {
                    guard.oids.retain(|o| o != &oid);
                    if let Some(hook) = interface.close_hook() {
                        hook.close();
                    }
                }
            }
            Some(StreamPayload::Channel(ChannelRecord::Result)) => {
                let body = match stream.recv().await? {
                    Some(StreamPayload::Body { data }) => data,
                    _ => return Err(Error::Transport("result without body".to_string())),
                };
                return Ok(Slots::decode(&body)?);
            }
            Some(StreamPayload::Channel(ChannelRecord::Error {
                category,
                code,
                message,
            })) => {
                return Err(Error::from_trio(&category, &code, &message));
            }
            Some(StreamPayload::Trailers(_)) => {}
            Some(other) => {
                log::debug!("stray payload on control stream: {:?}", kind(&other));
            }
            None => {
                return Err(Error::Closed(
                    "call terminated before a result arrived".to_string(),
                ));
            }
        }
    }
}

/// Server half: serve `CONNECT /_rpc/callstream/<oid>/<method>`.
pub(crate) async fn handle_callstream(
    shared: Arc<Shared>,
    session: Session,
    mut stream: RpcStream,
    head: RequestHead,
) {
    let caller = match server::authenticate(&shared, &head) {
        Ok(caller) => caller,
        Err(outcome) => {
            server::respond(&stream, outcome).await;
            return;
        }
    };

    let Some(rest) = head.path.strip_prefix("/_rpc/callstream/") else {
        server::respond(&stream, service::Outcome::unknown("unknown path")).await;
        return;
    };
    let Some((oid, method)) = rest.split_once('/') else {
        server::respond(&stream, service::Outcome::unknown("unknown path")).await;
        return;
    };
    let (_, held) = match server::object_bound(&shared, oid, caller) {
        Ok(bound) => bound,
        Err(outcome) => {
            server::respond(&stream, outcome).await;
            return;
        }
    };

    if stream
        .send(&StreamPayload::Response(ResponseHead::new(200)))
        .await
        .is_err()
    {
        return;
    }

    let args = loop {
        match stream.recv().await {
            Ok(Some(StreamPayload::Body { data })) => match Slots::decode(&data) {
                Ok(args) => break args,
                Err(error) => {
                    let _ = send_error(&stream.sender(), &Error::from(error)).await;
                    let _ = stream.finish().await;
                    return;
                }
            },
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
    };

    let cx = server::derive_context(&session, &head);
    let linker = Arc::new(SessionLinker {
        shared: shared.clone(),
        session: session.clone(),
        control: Some(stream.sender()),
        cx: cx.clone(),
        created: Mutex::new(Vec::new()),
    });

    let mut handler = Box::pin(shared.dispatcher.invoke(
        held.vtable(),
        caller,
        method,
        args,
        cx.clone(),
        Some(linker.clone() as Arc<dyn Linker>),
    ));

    // Watch the control stream while the handler runs: a reset from the
    // client cancels the call at its next suspension point.
    let mut watching = true;
    let handled = loop {
        tokio::select! {
            handled = &mut handler => break handled,
            payload = stream.recv(), if watching => match payload {
                Ok(Some(_)) => {}
                Ok(None) => watching = false,
                Err(_) => {
                    watching = false;
                    cx.cancel();
                }
            },
        }
    };

    // Deref records for dropped inline clients must precede the
    // terminal record; the shared control sender keeps them ordered.
    linker.close_created().await;

    let sender = stream.sender();
    let result = match handled {
        Handled::Ok(results) => match results.encode() {
            Ok(body) => {
                let sent = sender
                    .send(&StreamPayload::Channel(ChannelRecord::Result))
                    .await;
                match sent {
                    Ok(()) => sender.send(&StreamPayload::body(body)).await,
                    Err(error) => Err(error),
                }
            }
            Err(error) => send_error(&sender, &Error::from(error)).await,
        },
        Handled::UnknownMethod => {
            send_error(&sender, &Error::NotFound("unknown method".to_string())).await
        }
        Handled::Failed(error) => send_error(&sender, &error).await,
        Handled::Panicked(message) => {
            sender
                .send(&StreamPayload::Channel(ChannelRecord::Error {
                    category: BUILTIN_CATEGORY.to_string(),
                    code: "panic".to_string(),
                    message,
                }))
                .await
        }
    };

    if let Err(error) = result {
        log::debug!("call stream teardown: {}", error);
    }
    let _ = stream.finish().await;
}

async fn send_error(sender: &StreamSender, error: &Error) -> Result<(), Error> {
    sender
        .send(&StreamPayload::Channel(ChannelRecord::Error {
            category: error.category().to_string(),
            code: error.code().to_string(),
            message: error.message(),
        }))
        .await
}

/// Caller half of a callback invocation: the remote opened a sub-stream
/// against one of our inline capabilities.
pub(crate) async fn handle_callback(
    shared: Arc<Shared>,
    session: Session,
    mut stream: RpcStream,
    oid: Oid,
    method: String,
) {
    let Some(interface) = session.inline_get(&oid) else {
        let _ = send_error(
            &stream.sender(),
            &Error::NotFound("unknown inline capability".to_string()),
        )
        .await;
        let _ = stream.finish().await;
        return;
    };

    let args = match stream.read_body().await.and_then(|b| Ok(Slots::decode(&b)?)) {
        Ok(args) => args,
        Err(error) => {
            let _ = send_error(&stream.sender(), &error).await;
            let _ = stream.finish().await;
            return;
        }
    };

    let caller = session.remote_key().unwrap_or_else(|| shared.keypair.public());
    let cx = Context::background().with_cancel(session.closed().child_token());

    let handled = shared
        .dispatcher
        .invoke(&interface, caller, &method, args, cx, None)
        .await;

    let sender = stream.sender();
    let result = match handled {
        Handled::Ok(results) => match results.encode() {
            Ok(body) => {
                let sent = sender.send(&StreamPayload::Channel(ChannelRecord::Ok)).await;
                match sent {
                    Ok(()) => sender.send(&StreamPayload::body(body)).await,
                    Err(error) => Err(error),
                }
            }
            Err(error) => send_error(&sender, &Error::from(error)).await,
        },
        Handled::UnknownMethod => {
            send_error(&sender, &Error::NotFound("unknown method".to_string())).await
        }
        Handled::Failed(error) => send_error(&sender, &error).await,
        Handled::Panicked(message) => send_error(&sender, &Error::RemotePanic(message)).await,
    };

    if let Err(error) = result {
        log::debug!("callback teardown: {}", error);
    }
    let _ = stream.finish().await;
}

/// Linker used on the request/response path: embedded capabilities are
/// dialed at their address; inline ones have no session to ride.
pub(crate) fn request_linker(shared: &Arc<Shared>, session: &Session) -> Arc<dyn Linker> {
    Arc::new(SessionLinker {
        shared: shared.clone(),
        session: session.clone(),
        control: None,
        cx: Context::background(),
        created: Mutex::new(Vec::new()),
    })
}

/// Builds clients for capabilities found in call arguments.
pub(crate) struct SessionLinker {
    shared: Arc<Shared>,
    session: Session,
    control: Option<StreamSender>,
    cx: Context,
    created: Mutex<Vec<Arc<InlineClient>>>,
}

impl SessionLinker {
    /// Close every inline client the handler left open, emitting their
    /// deref records before the call's terminal record.
    pub(crate) async fn close_created(&self) {
        let created: Vec<_> = self.created.lock().drain(..).collect();
        for client in created {
            client.close().await;
        }
    }
}

#[async_trait]
impl Linker for SessionLinker {
    async fn link(&self, capability: &Capability) -> Result<Arc<dyn CallbackClient>, Error> {
        if capability.inline {
            let control = self.control.clone().ok_or_else(|| {
                Error::InvalidArgument(
                    "inline capability outside a call stream".to_string(),
                )
            })?;

            let client = Arc::new(InlineClient {
                session: self.session.clone(),
                control,
                oid: capability.oid,
                cx: self.cx.clone(),
                closed: AtomicBool::new(false),
            });
            self.created.lock().push(client.clone());

            return Ok(client);
        }

        Ok(Arc::new(DialClient(CapClient::adopt(
            self.shared.clone(),
            capability.clone(),
        ))))
    }
}

/// Client for an inline capability: invocations open callback
/// sub-streams on the session that carried the call.
pub(crate) struct InlineClient {
    session: Session,
    control: StreamSender,
    oid: Oid,
    cx: Context,
    closed: AtomicBool,
}

#[async_trait]
impl CallbackClient for InlineClient {
    async fn invoke(&self, method: &str, args: Slots) -> Result<Slots, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("inline capability dropped".to_string()));
        }
        // Canceled callers get no further callbacks.
        if self.cx.is_canceled() {
            return Err(Error::Closed("canceled".to_string()));
        }

        let mut stream = self.session.open().await?;
        stream
            .send(&StreamPayload::Channel(ChannelRecord::Call {
                oid: self.oid,
                method: method.to_string(),
            }))
            .await?;
        stream.send(&StreamPayload::body(args.encode()?)).await?;
        stream.finish().await?;

        loop {
            let payload = tokio::select! {
                payload = stream.recv() => payload?,
                _ = self.cx.done() => {
                    let _ = stream.reset(RESET_CANCELED).await;
                    return Err(Error::Closed("canceled".to_string()));
                }
            };

            match payload {
                Some(StreamPayload::Channel(ChannelRecord::Ok)) => {
                    let body = match stream.recv().await? {
                        Some(StreamPayload::Body { data }) => data,
                        _ => return Err(Error::Transport("ok without body".to_string())),
                    };
                    return Ok(Slots::decode(&body)?);
                }
                Some(StreamPayload::Channel(ChannelRecord::Error {
                    category,
                    code,
                    message,
                })) => {
                    return Err(Error::from_trio(&category, &code, &message));
                }
                Some(_) => {}
                None => {
                    return Err(Error::Closed(
                        "callback ended before a result arrived".to_string(),
                    ));
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sent = self
            .control
            .send(&StreamPayload::Channel(ChannelRecord::Deref {
                oid: self.oid,
            }))
            .await;
        if let Err(error) = sent {
            log::debug!("deref record dropped: oid={}, error={}", self.oid, error);
        }
    }
}

/// Client for a non-inline embedded capability: a plain capability
/// client dialed at the carried address.
struct DialClient(CapClient);

#[async_trait]
impl CallbackClient for DialClient {
    async fn invoke(&self, method: &str, args: Slots) -> Result<Slots, Error> {
        self.0.call(&Context::background(), method, args).await
    }

    async fn close(&self) {
        self.0.close().await;
    }
}

fn kind(payload: &StreamPayload) -> &'static str {
    match payload {
        StreamPayload::Hello(_) => "hello",
        StreamPayload::Request(_) => "request",
        StreamPayload::Response(_) => "response",
        StreamPayload::Body { .. } => "body",
        StreamPayload::Trailers(_) => "trailers",
        StreamPayload::Channel(_) => "channel",
    }
}
