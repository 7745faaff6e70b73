//! One multiplexed session over one reliable byte stream.
//!
//! A session carries any number of logical streams (frame-level
//! multiplexing, see [`codec::frame`]) plus the per-session state the
//! framework needs: the remote hello, and the map from oid to inline
//! vtable for capabilities passed to us over this session.
//!
//! Locks in here guard map operations only and are never held across
//! I/O; all writing funnels through one queue drained by a writer task,
//! which also gives every stream a total order on the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use codec::frame::{Frame, FrameCodec, FrameKind, RESET_CANCELED, RESET_GOING_AWAY};
use codec::oid::Oid;
use codec::record::{Hello, RequestHead, ResponseHead, StreamPayload, Trailers};
use service::{Error, Interface};

/// How long a dialer waits for the remote hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound events routed to one logical stream.
enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset(u8),
}

struct Core {
    out: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<StreamEvent>>>,
    inline: Mutex<HashMap<Oid, Arc<Interface>>>,
    next_stream: AtomicU32,
    remote: watch::Sender<Option<Hello>>,
    closed: CancellationToken,
    peer_addr: String,
}

impl Core {
    async fn send_frame(&self, frame: Frame) -> Result<(), Error> {
        self.out
            .send(frame)
            .await
            .map_err(|_| Error::Transport("session closed".to_string()))
    }
}

/// A live session with one remote peer. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
}

/// Streams the remote side opened on this session.
pub type Incoming = mpsc::Receiver<RpcStream>;

impl Session {
    /// Drive a session over `io`.
    ///
    /// The dialer passes `initiator = true` and allocates odd stream ids;
    /// the acceptor allocates even ones. Both sides announce themselves
    /// with `hello` on stream 0 before anything else.
    pub fn spawn<T>(io: T, initiator: bool, hello: Hello, peer_addr: String) -> (Self, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (remote_tx, _) = watch::channel(None);

        let core = Arc::new(Core {
            out: out_tx,
            streams: Mutex::new(HashMap::new()),
            inline: Mutex::new(HashMap::new()),
            next_stream: AtomicU32::new(if initiator { 1 } else { 2 }),
            remote: remote_tx,
            closed: CancellationToken::new(),
            peer_addr,
        });

        // Writer task: the only place frames touch the socket.
        let closed = core.closed.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, FrameCodec);
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(error) = sink.send(frame).await {
                                log::debug!("session write failed: {}", error);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = closed.cancelled() => break,
                }
            }
        });

        // Reader task: demultiplex frames onto per-stream queues.
        let reader_core = core.clone();
        tokio::spawn(async move {
            let mut source = FramedRead::new(read_half, FrameCodec);
            loop {
                let frame = tokio::select! {
                    frame = source.next() => frame,
                    _ = reader_core.closed.cancelled() => None,
                };
                let Some(Ok(frame)) = frame else {
                    break;
                };

                Core::route(&reader_core, frame, &incoming_tx).await;
            }

            // Tear down: wake every pending reader.
            reader_core.closed.cancel();
            reader_core.streams.lock().clear();
        });

        // Announce ourselves before any stream can be opened; the queue
        // is empty here, so this cannot fail or reorder.
        if let Ok(bytes) = StreamPayload::Hello(hello).encode() {
            let _ = core.out.try_send(Frame::data(0, bytes));
        }

        (Self { core }, incoming_rx)
    }

    /// Wait for the remote hello, failing when the session dies first.
    pub async fn handshake(&self) -> Result<Hello, Error> {
        let mut watcher = self.core.remote.subscribe();

        let wait = async {
            loop {
                if let Some(hello) = watcher.borrow_and_update().clone() {
                    return Ok(hello);
                }
                watcher
                    .changed()
                    .await
                    .map_err(|_| Error::Transport("session closed".to_string()))?;
            }
        };

        tokio::select! {
            hello = wait => hello,
            _ = self.core.closed.cancelled() => {
                Err(Error::Transport("session closed".to_string()))
            }
            _ = tokio::time::sleep(HELLO_TIMEOUT) => {
                Err(Error::Transport("hello timed out".to_string()))
            }
        }
    }

    pub fn remote_hello(&self) -> Option<Hello> {
        self.core.remote.borrow().clone()
    }

    pub fn remote_key(&self) -> Option<codec::identity::PeerId> {
        self.core.remote.borrow().as_ref().and_then(|h| h.public_key)
    }

    /// The transport address of the remote end, as observed locally.
    pub fn peer_addr(&self) -> &str {
        &self.core.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_cancelled() || self.core.out.is_closed()
    }

    pub fn close(&self) {
        self.core.closed.cancel();
    }

    pub fn closed(&self) -> CancellationToken {
        self.core.closed.clone()
    }

    /// Open a new logical stream.
    pub async fn open(&self) -> Result<RpcStream, Error> {
        let id = self.core.next_stream.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.core.streams.lock().insert(id, tx);
        self.core.send_frame(Frame::open(id)).await?;

        Ok(RpcStream {
            id,
            rx,
            core: self.core.clone(),
        })
    }

    /// One request/response exchange: head, body, half-close, then read
    /// the response head, body chunks and trailers.
    pub async fn request(
        &self,
        head: RequestHead,
        body: Vec<u8>,
    ) -> Result<(ResponseHead, Vec<u8>, Trailers), Error> {
        let mut stream = self.open().await?;
        stream.send(&StreamPayload::Request(head)).await?;
        if !body.is_empty() {
            stream.send(&StreamPayload::body(body)).await?;
        }
        stream.finish().await?;

        let mut response: Option<ResponseHead> = None;
        let mut body = Vec::new();
        loop {
            match stream.recv().await? {
                Some(StreamPayload::Response(head)) => response = Some(head),
                Some(StreamPayload::Body { data }) => body.extend_from_slice(&data),
                Some(StreamPayload::Trailers(trailers)) => {
                    let head = response
                        .ok_or_else(|| Error::Transport("trailers before head".to_string()))?;
                    return Ok((head, body, trailers));
                }
                Some(other) => {
                    return Err(Error::Transport(format!(
                        "unexpected payload in response: {:?}",
                        payload_kind(&other)
                    )));
                }
                None => {
                    return Err(Error::Closed(
                        "stream ended before trailers".to_string(),
                    ));
                }
            }
        }
    }

    /// Register an inline vtable for the lifetime of one call.
    pub fn inline_insert(&self, oid: Oid, interface: Arc<Interface>) {
        self.core.inline.lock().insert(oid, interface);
    }

    pub fn inline_get(&self, oid: &Oid) -> Option<Arc<Interface>> {
        self.core.inline.lock().get(oid).cloned()
    }

    /// Remove an inline vtable, returning it so the caller can fire its
    /// close hook.
    pub fn inline_remove(&self, oid: &Oid) -> Option<Arc<Interface>> {
        self.core.inline.lock().remove(oid)
    }
}

impl Core {
    async fn route(core: &Arc<Self>, frame: Frame, incoming: &mpsc::Sender<RpcStream>) {
        if frame.stream == 0 {
            if frame.kind == FrameKind::Data
                && let Ok(StreamPayload::Hello(hello)) = StreamPayload::decode(&frame.payload)
            {
                // send_replace stores the hello even when nobody has
                // subscribed yet.
                core.remote.send_replace(Some(hello));
            }
            return;
        }

        match frame.kind {
            FrameKind::Open => {
                let (tx, rx) = mpsc::channel(64);
                core.streams.lock().insert(frame.stream, tx);

                let stream = RpcStream {
                    id: frame.stream,
                    rx,
                    core: core.clone(),
                };
                if incoming.send(stream).await.is_err() {
                    core.streams.lock().remove(&frame.stream);
                }
            }
            FrameKind::Data => {
                core.deliver(frame.stream, StreamEvent::Data(frame.payload)).await;
            }
            FrameKind::Fin => {
                core.deliver(frame.stream, StreamEvent::Fin).await;
                core.streams.lock().remove(&frame.stream);
            }
            FrameKind::Reset => {
                let code = frame.reset_code().unwrap_or(RESET_GOING_AWAY);
                core.deliver(frame.stream, StreamEvent::Reset(code)).await;
                core.streams.lock().remove(&frame.stream);
            }
        }
    }

    async fn deliver(&self, stream: u32, event: StreamEvent) {
        let sender = self.streams.lock().get(&stream).cloned();
        let Some(sender) = sender else {
            return;
        };

        // The receiver half may be gone when the local task lost
        // interest; drop the routing entry so later frames short-circuit.
        if sender.send(event).await.is_err() {
            self.streams.lock().remove(&stream);
        }
    }
}

/// One logical stream on a session.
pub struct RpcStream {
    id: u32,
    rx: mpsc::Receiver<StreamEvent>,
    core: Arc<Core>,
}

impl RpcStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// A cloneable write-only handle to this stream.
    pub fn sender(&self) -> StreamSender {
        StreamSender {
            id: self.id,
            core: self.core.clone(),
        }
    }

    pub async fn send(&self, payload: &StreamPayload) -> Result<(), Error> {
        self.sender().send(payload).await
    }

    /// Half-close: no more payloads from this side.
    pub async fn finish(&self) -> Result<(), Error> {
        self.core.send_frame(Frame::fin(self.id)).await
    }

    /// Abort the stream with a reset code.
    pub async fn reset(&self, code: u8) -> Result<(), Error> {
        self.core.send_frame(Frame::reset(self.id, code)).await
    }

    /// Receive the next payload. `None` means the remote half-closed.
    pub async fn recv(&mut self) -> Result<Option<StreamPayload>, Error> {
        match self.rx.recv().await {
            None => Err(Error::Transport("session closed".to_string())),
            Some(StreamEvent::Data(bytes)) => Ok(Some(StreamPayload::decode(&bytes)?)),
            Some(StreamEvent::Fin) => Ok(None),
            Some(StreamEvent::Reset(RESET_CANCELED)) => {
                Err(Error::Closed("canceled by peer".to_string()))
            }
            Some(StreamEvent::Reset(_)) => Err(Error::Transport("stream reset".to_string())),
        }
    }

    /// Read body payloads until the remote half-closes, concatenating the
    /// chunks.
    pub async fn read_body(&mut self) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        loop {
            match self.recv().await? {
                None => return Ok(body),
                Some(StreamPayload::Body { data }) => body.extend_from_slice(&data),
                Some(other) => {
                    return Err(Error::Transport(format!(
                        "unexpected payload in body: {:?}",
                        payload_kind(&other)
                    )));
                }
            }
        }
    }
}

/// Write-only handle to a stream; lets a handler task and its callback
/// clients share one ordered control stream.
#[derive(Clone)]
pub struct StreamSender {
    id: u32,
    core: Arc<Core>,
}

impl StreamSender {
    pub async fn send(&self, payload: &StreamPayload) -> Result<(), Error> {
        let bytes = payload.encode()?;
        self.core.send_frame(Frame::data(self.id, bytes)).await
    }

    pub async fn finish(&self) -> Result<(), Error> {
        self.core.send_frame(Frame::fin(self.id)).await
    }
}

fn payload_kind(payload: &StreamPayload) -> &'static str {
    match payload {
        StreamPayload::Hello(_) => "hello",
        StreamPayload::Request(_) => "request",
        StreamPayload::Response(_) => "response",
        StreamPayload::Body { .. } => "body",
        StreamPayload::Trailers(_) => "trailers",
        StreamPayload::Channel(_) => "channel",
    }
}
