//! A peer: one process participating in the capability mesh.
//!
//! The peer owns the identity keypair, the capability registry, the
//! reconstruction registrars, and the known-addresses session pool. It
//! listens on any number of transports and serves the `/_rpc` endpoints
//! on every session, dialed or accepted.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use chrono::{SecondsFormat, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::net::{TcpListener, UnixListener};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use codec::capability::{Capability, DIAL_STDIO};
use codec::identity::{Keypair, PeerId};
use codec::record::{Hello, Identify, PROTOCOL_VERSION, RequestHead, Status, header};
use service::registry::DEFAULT_IDLE_TIMEOUT;
use service::{Context, Dispatcher, Error, Interface, Registry, RegistryOptions, Restorers};

use crate::auth::BearerVerifier;
use crate::client::{CapClient, ClientShared};
use crate::server;
use crate::transport::{self, Incoming, Session};

/// Options for building a [`Peer`].
pub struct PeerOptions {
    /// Reuse a keypair instead of generating an ephemeral one. A peer
    /// that restarts with the same keypair keeps its identity.
    pub keypair: Option<Keypair>,

    /// Contact string other peers should dial. Learned from the first
    /// listener when unset.
    pub contact_addr: Option<String>,

    /// Bearer token attached to every outgoing request.
    pub token: Option<String>,

    /// JWKS document; when set, every incoming request must carry a
    /// valid bearer token signed by one of its keys.
    pub bearer_jwks: Option<String>,

    /// Idle window after which untouched capabilities are collected.
    pub idle_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            keypair: None,
            contact_addr: None,
            token: None,
            bearer_jwks: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) keypair: Keypair,
    pub(crate) registry: Arc<Registry>,
    pub(crate) restorers: Arc<Restorers>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) bearer: Option<BearerVerifier>,
    pub(crate) token: Option<String>,
    pub(crate) cancel: CancellationToken,
    sessions: Mutex<HashMap<String, Session>>,
    clients: Mutex<Vec<Weak<ClientShared>>>,
}

impl Shared {
    pub(crate) fn hello(&self) -> Hello {
        let contact = self.registry.address();

        Hello {
            version: PROTOCOL_VERSION,
            public_key: Some(self.keypair.public()),
            contact_addr: (!contact.is_empty()).then_some(contact),
        }
    }

    /// Build a signed request head carrying the common headers.
    pub(crate) fn signed_head(&self, method: &str, path: &str, cx: &Context) -> RequestHead {
        let (public_key, timestamp, signature) = self.keypair.sign_request(method, path);

        let mut head = RequestHead::new(method, path.to_string());
        head.set_header(header::PUBLIC_KEY, public_key);
        head.set_header(header::TIMESTAMP, timestamp);
        head.set_header(header::SIGNATURE, signature);

        let contact = self.registry.address();
        if !contact.is_empty() {
            head.set_header(header::CONTACT_ADDR, contact);
        }
        if let Some(token) = &self.token {
            head.set_header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(deadline) = cx.deadline() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let when = Utc::now()
                + TimeDelta::from_std(remaining).unwrap_or_else(|_| TimeDelta::seconds(0));
            head.set_header(
                header::DEADLINE,
                when.to_rfc3339_opts(SecondsFormat::Nanos, true),
            );
        }
        if let Some(traceparent) = cx.traceparent() {
            head.set_header(header::TRACEPARENT, traceparent.to_string());
        }

        head
    }

    /// Serve every stream the remote opens on a session.
    pub(crate) fn install_session(self: &Arc<Self>, session: Session, incoming: Incoming) {
        tokio::spawn(server::serve_session(
            self.clone(),
            session,
            incoming,
        ));
    }

    /// Fetch the pooled session for a contact address, dialing on demand.
    pub(crate) async fn session(self: &Arc<Self>, address: &str) -> Result<Session, Error> {
        if let Some(session) = self.sessions.lock().get(address)
            && !session.is_closed()
        {
            return Ok(session.clone());
        }

        let (session, incoming) = transport::dial(address, self.hello()).await?;
        self.install_session(session.clone(), incoming);
        self.sessions
            .lock()
            .insert(address.to_string(), session.clone());

        self.identify(&session).await;

        Ok(session)
    }

    /// Register an already-established session (accepted subprocess,
    /// stdio) under a contact address.
    pub(crate) fn adopt_session(self: &Arc<Self>, address: &str, session: Session, incoming: Incoming) {
        self.install_session(session.clone(), incoming);
        self.sessions.lock().insert(address.to_string(), session);
    }

    /// Drop a pooled session that failed, so the next call re-dials.
    pub(crate) fn evict_session(&self, address: &str) {
        self.sessions.lock().remove(address);
    }

    /// Exchange identities on a fresh session; best-effort.
    async fn identify(self: &Arc<Self>, session: &Session) {
        let head = self.signed_head("POST", "/_rpc/identify", &Context::background());
        match session.request(head, Vec::new()).await {
            Ok((_, body, trailers)) if trailers.status() == Some(Status::Ok) => {
                match codec::from_slice::<Identify>(&body) {
                    Ok(identify) => log::debug!(
                        "identified: peer={}, observed_addr={}",
                        identify.peer,
                        identify.observed_addr
                    ),
                    Err(error) => log::debug!("identify decode failed: {}", error),
                }
            }
            Ok(_) => log::debug!("identify rejected by {}", session.peer_addr()),
            Err(error) => log::debug!("identify failed: {}", error),
        }
    }

    pub(crate) fn track_client(&self, client: &Arc<ClientShared>) {
        let mut clients = self.clients.lock();
        clients.retain(|c| c.upgrade().is_some());
        clients.push(Arc::downgrade(client));
    }
}

/// One process in the capability mesh. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    pub(crate) shared: Arc<Shared>,
}

impl Peer {
    pub fn new(options: PeerOptions) -> Result<Self, Error> {
        let keypair = options.keypair.unwrap_or_else(Keypair::generate);
        let registry = Registry::new(RegistryOptions {
            issuer: keypair.public(),
            address: options.contact_addr.unwrap_or_default(),
            idle_timeout: options.idle_timeout,
        });

        let bearer = match options.bearer_jwks.as_deref() {
            None => None,
            Some(document) => Some(BearerVerifier::from_jwks(document)?),
        };

        log::info!("peer starting: identity={}", keypair.public());

        Ok(Self {
            shared: Arc::new(Shared {
                dispatcher: Dispatcher::new(registry.clone()),
                restorers: Arc::new(Restorers::default()),
                registry,
                keypair,
                bearer,
                token: options.token,
                cancel: CancellationToken::new(),
                sessions: Mutex::new(HashMap::new()),
                clients: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn identity(&self) -> PeerId {
        self.shared.keypair.public()
    }

    pub fn keypair(&self) -> Keypair {
        self.shared.keypair.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Expose a bootstrap vtable under its interface name.
    pub fn expose(&self, interface: Interface) {
        self.shared.registry.expose(Arc::new(interface));
    }

    pub fn unexpose(&self, name: &str) {
        self.shared.registry.unexpose(name);
    }

    /// Register a reconstruction function for restorable capabilities of
    /// one interface.
    pub fn register_restorer<F>(&self, interface: &str, restorer: F)
    where
        F: Fn(&codec::capability::RestoreState) -> Result<Arc<Interface>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.shared.restorers.register_fn(interface, restorer);
    }

    /// Bind a TCP listener and serve sessions from it. Returns the bound
    /// address; the first listener also becomes the peer's contact
    /// address when none was configured.
    pub async fn listen_tcp(&self, address: &str) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Transport(format!("bind {}: {}", address, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;

        if self.shared.registry.address().is_empty() {
            self.shared.registry.set_address(local.to_string());
        }

        let shared = self.shared.clone();
        let hello = shared.hello();
        let cancel = shared.cancel.clone();
        tokio::spawn(async move {
            transport::accept_tcp(listener, cancel, hello, move |session, incoming| {
                shared.install_session(session, incoming);
            })
            .await;
        });

        log::info!("listening: tcp={}", local);

        Ok(local)
    }

    /// Bind a filesystem socket and serve sessions from it.
    pub async fn listen_unix(&self, path: &str) -> Result<(), Error> {
        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Transport(format!("bind {}: {}", path, e)))?;

        if self.shared.registry.address().is_empty() {
            self.shared.registry.set_address(format!("unix:{}", path));
        }

        let shared = self.shared.clone();
        let hello = shared.hello();
        let cancel = shared.cancel.clone();
        tokio::spawn(async move {
            transport::accept_unix(listener, cancel, hello, move |session, incoming| {
                shared.install_session(session, incoming);
            })
            .await;
        });

        log::info!("listening: unix={}", path);

        Ok(())
    }

    /// Launch a subprocess peer and bridge its stdio into a session
    /// reachable at the `dial-stdio` address.
    pub async fn attach_command(&self, command: Command) -> Result<(), Error> {
        let (session, incoming) = transport::attach_command(command, self.shared.hello())?;
        session.handshake().await?;
        self.shared.adopt_session(DIAL_STDIO, session, incoming);

        Ok(())
    }

    /// Serve the parent peer over this process's own stdio; the
    /// subprocess half of [`Peer::attach_command`].
    pub fn serve_stdio(&self) {
        if self.shared.registry.address().is_empty() {
            self.shared.registry.set_address(DIAL_STDIO.to_string());
        }

        let (session, incoming) = transport::serve_stdio(self.shared.hello());
        self.shared.adopt_session(DIAL_STDIO, session, incoming);
    }

    /// Resolve a named bootstrap capability on a remote peer.
    pub async fn resolve(&self, address: &str, name: &str) -> Result<CapClient, Error> {
        let session = self.shared.session(address).await?;

        let path = format!("/_rpc/lookup/{}", name);
        let head = self
            .shared
            .signed_head("POST", &path, &Context::background());
        let (response, body, trailers) = session.request(head, Vec::new()).await?;

        let body = crate::client::expect_ok(response, body, trailers)?;
        let capability: Capability = codec::from_slice(&body)?;

        Ok(self.client(capability))
    }

    /// Adopt a capability received through results or arguments.
    pub fn client(&self, capability: Capability) -> CapClient {
        CapClient::adopt(self.shared.clone(), capability)
    }

    /// Shut the peer down: stop listeners, deref owned remote
    /// capabilities best-effort, and drop every session.
    pub async fn close(&self) {
        let clients: Vec<_> = {
            let mut clients = self.shared.clients.lock();
            clients.drain(..).filter_map(|c| c.upgrade()).collect()
        };
        for client in clients {
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                CapClient::from_shared(client).close(),
            )
            .await;
        }

        self.shared.cancel.cancel();

        let sessions: Vec<_> = self.shared.sessions.lock().drain().collect();
        for (_, session) in sessions {
            session.close();
        }

        log::info!("peer closed: identity={}", self.identity());
    }
}
