//! The `/_rpc` endpoints served on every session.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use codec::frame::RESET_GOING_AWAY;
use codec::identity::{PeerId, verify_request};
use codec::oid::Oid;
use codec::record::{
    ChannelRecord, Identify, RequestHead, ResponseHead, StreamPayload, header,
};
use service::{Context, Error, Held, Outcome};

use crate::channel;
use crate::peer::Shared;
use crate::transport::{Incoming, RpcStream, Session};

pub(crate) async fn serve_session(shared: Arc<Shared>, session: Session, mut incoming: Incoming) {
    loop {
        let stream = tokio::select! {
            stream = incoming.recv() => stream,
            _ = shared.cancel.cancelled() => {
                session.close();
                break;
            }
        };
        let Some(stream) = stream else {
            break;
        };

        tokio::spawn(handle_stream(shared.clone(), session.clone(), stream));
    }
}

async fn handle_stream(shared: Arc<Shared>, session: Session, mut stream: RpcStream) {
    match stream.recv().await {
        Ok(Some(StreamPayload::Request(head))) => {
            if head.method == "CONNECT" {
                channel::handle_callstream(shared, session, stream, head).await;
            } else {
                handle_request(shared, session, stream, head).await;
            }
        }
        Ok(Some(StreamPayload::Channel(ChannelRecord::Call { oid, method }))) => {
            channel::handle_callback(shared, session, stream, oid, method).await;
        }
        Ok(other) => {
            log::debug!("unexpected stream opener: {:?}", other.map(|_| ()));
            let _ = stream.reset(RESET_GOING_AWAY).await;
        }
        Err(error) => {
            log::debug!("stream died before a request arrived: {}", error);
        }
    }
}

async fn handle_request(
    shared: Arc<Shared>,
    session: Session,
    mut stream: RpcStream,
    head: RequestHead,
) {
    let body = match stream.read_body().await {
        Ok(body) => body,
        Err(error) => {
            log::debug!("request body read failed: {}", error);
            return;
        }
    };

    let outcome = route(&shared, &session, &head, &body).await;
    respond(&stream, outcome).await;
}

pub(crate) async fn respond(stream: &RpcStream, outcome: Outcome) {
    let sender = stream.sender();
    let mut result = sender
        .send(&StreamPayload::Response(ResponseHead::new(outcome.status)))
        .await;
    if result.is_ok() && !outcome.body.is_empty() {
        result = sender.send(&StreamPayload::body(outcome.body)).await;
    }
    if result.is_ok() {
        result = sender.send(&StreamPayload::Trailers(outcome.trailers)).await;
    }
    if result.is_ok() {
        result = sender.finish().await;
    }
    if let Err(error) = result {
        log::debug!("response write failed: {}", error);
    }
}

async fn route(
    shared: &Arc<Shared>,
    session: &Session,
    head: &RequestHead,
    body: &[u8],
) -> Outcome {
    let caller = match authenticate(shared, head) {
        Ok(caller) => caller,
        Err(outcome) => return outcome,
    };

    let Some(rest) = head.path.strip_prefix("/_rpc/") else {
        return Outcome::unknown("unknown path");
    };
    let segments: Vec<&str> = rest.splitn(3, '/').collect();
    let cx = derive_context(session, head);

    match segments.as_slice() {
        ["identify"] => {
            let identify = Identify {
                peer: shared.keypair.public(),
                observed_addr: session.peer_addr().to_string(),
            };
            match codec::to_vec(&identify) {
                Ok(body) => Outcome::ok(body),
                Err(error) => Outcome::error(&Error::from(error)),
            }
        }
        ["lookup", name] => match shared.registry.lookup(name, caller) {
            Ok(capability) => capability_body(&capability),
            Err(error) => Outcome::error(&error),
        },
        ["reresolve"] => {
            let state = match codec::from_slice(body) {
                Ok(state) => state,
                Err(error) => return Outcome::error(&Error::from(error)),
            };
            match shared
                .restorers
                .reresolve(&shared.registry, &state, caller)
                .await
            {
                Ok(capability) => capability_body(&capability),
                Err(error) => Outcome::error(&error),
            }
        }
        ["reexport", oid] => {
            let Some(target) = head.header(header::TARGET_PUBLIC_KEY) else {
                return Outcome::error(&Error::InvalidArgument(
                    "missing target-public-key header".to_string(),
                ));
            };
            let target: PeerId = match target.parse() {
                Ok(target) => target,
                Err(error) => return Outcome::error(&Error::from(error)),
            };

            let (oid, _) = match object_bound(shared, oid, caller) {
                Ok(bound) => bound,
                Err(outcome) => return outcome,
            };
            match shared.registry.reexport(&oid, target) {
                Ok(capability) => capability_body(&capability),
                Err(_) => Outcome::unknown_capability(),
            }
        }
        ["ref", oid] => {
            let (oid, _) = match object_bound(shared, oid, caller) {
                Ok(bound) => bound,
                Err(outcome) => return outcome,
            };
            match shared.registry.add_ref(&oid) {
                Ok(()) => Outcome::ok(Vec::new()),
                Err(_) => Outcome::unknown_capability(),
            }
        }
        ["deref", oid] => {
            let (oid, _) = match object_bound(shared, oid, caller) {
                Ok(bound) => bound,
                Err(outcome) => return outcome,
            };
            match shared.registry.deref(&oid) {
                Ok(()) => Outcome::ok(Vec::new()),
                Err(_) => Outcome::unknown_capability(),
            }
        }
        ["call", oid, method] => {
            let linker = channel::request_linker(shared, session);
            shared
                .dispatcher
                .call(caller, oid, method, body, cx, Some(linker))
                .await
        }
        _ => Outcome::unknown("unknown path"),
    }
}

fn capability_body(capability: &codec::capability::Capability) -> Outcome {
    match codec::to_vec(capability) {
        Ok(body) => Outcome::ok(body),
        Err(error) => Outcome::error(&Error::from(error)),
    }
}

/// Verify the bearer token (when required) and the signed headers.
pub(crate) fn authenticate(shared: &Shared, head: &RequestHead) -> Result<PeerId, Outcome> {
    if let Some(bearer) = &shared.bearer {
        let Some(authorization) = head.header(header::AUTHORIZATION) else {
            log::warn!("request without bearer token: path={}", head.path);
            return Err(Outcome::unauthorized());
        };
        if let Err(error) = bearer.verify(authorization) {
            log::warn!("bearer rejected: path={}, error={}", head.path, error);
            return Err(Outcome::unauthorized());
        }
    }

    let (Some(public_key), Some(timestamp), Some(signature)) = (
        head.header(header::PUBLIC_KEY),
        head.header(header::TIMESTAMP),
        head.header(header::SIGNATURE),
    ) else {
        log::warn!("request without signed headers: path={}", head.path);
        return Err(Outcome::unauthorized());
    };

    match verify_request(public_key, timestamp, signature, &head.method, &head.path) {
        Ok(peer) => Ok(peer),
        Err(error) => {
            log::warn!("request signature rejected: path={}, error={}", head.path, error);
            Err(Outcome::unauthorized())
        }
    }
}

/// Resolve an object-bound path segment and check capability ownership.
pub(crate) fn object_bound(
    shared: &Shared,
    oid: &str,
    caller: PeerId,
) -> Result<(Oid, Arc<Held>), Outcome> {
    let Ok(oid) = Oid::from_str(oid) else {
        return Err(Outcome::unknown_capability());
    };
    let Some(held) = shared.registry.resolve(&oid) else {
        return Err(Outcome::unknown_capability());
    };
    if held.user_key() != caller {
        log::warn!("capability ownership mismatch: oid={}, caller={}", oid, caller);
        return Err(Outcome::unauthorized());
    }

    Ok((oid, held))
}

/// Derive the handler context from the session and the request headers.
pub(crate) fn derive_context(session: &Session, head: &RequestHead) -> Context {
    let mut cx = Context::background().with_cancel(session.closed().child_token());

    if let Some(deadline) = head.header(header::DEADLINE)
        && let Ok(when) = DateTime::parse_from_rfc3339(deadline)
    {
        let remaining = (when.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();
        cx = cx.with_deadline(Instant::now() + remaining);
    }
    if let Some(traceparent) = head.header(header::TRACEPARENT) {
        cx = cx.with_traceparent(traceparent.to_string());
    }

    cx
}
