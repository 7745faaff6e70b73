//! Transport: dialing, listening, and the local bridges.
//!
//! Every byte stream — TCP socket, unix socket, subprocess pipe — feeds
//! the same session multiplexer. One session is established per accepted
//! client; the unix and subprocess paths skip transport-level client
//! identity (requests are still signed per-request).

pub mod session;

use std::path::PathBuf;
use std::process::Stdio;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use codec::capability::DIAL_STDIO;
use codec::record::Hello;
use service::Error;

pub use session::{Incoming, RpcStream, Session, StreamSender};

/// A parsed contact string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port`
    Tcp(String),
    /// `unix:/path`
    Unix(PathBuf),
    /// The sentinel `dial-stdio`: reachable only over an already
    /// attached subprocess pipe.
    Stdio,
}

impl Address {
    pub fn parse(address: &str) -> Result<Self, Error> {
        if address == DIAL_STDIO {
            return Ok(Self::Stdio);
        }
        if let Some(path) = address.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if address.contains(':') {
            return Ok(Self::Tcp(address.to_string()));
        }

        Err(Error::InvalidArgument(format!(
            "unparseable contact address {:?}",
            address
        )))
    }
}

/// Dial a contact address and run the hello exchange.
pub async fn dial(address: &str, hello: Hello) -> Result<(Session, Incoming), Error> {
    let (session, incoming) = match Address::parse(address)? {
        Address::Tcp(address) => {
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|e| Error::Transport(format!("dial {}: {}", address, e)))?;
            let _ = stream.set_nodelay(true);
            Session::spawn(stream, true, hello, address)
        }
        Address::Unix(path) => {
            let stream = UnixStream::connect(&path)
                .await
                .map_err(|e| Error::Transport(format!("dial {}: {}", path.display(), e)))?;
            Session::spawn(stream, true, hello, format!("unix:{}", path.display()))
        }
        Address::Stdio => {
            return Err(Error::Transport(
                "dial-stdio peers cannot be dialed; attach the subprocess".to_string(),
            ));
        }
    };

    session.handshake().await?;

    Ok((session, incoming))
}

/// Accept TCP sessions until the token is canceled, handing each one to
/// `install`.
pub async fn accept_tcp<F>(listener: TcpListener, closed: CancellationToken, hello: Hello, install: F)
where
    F: Fn(Session, Incoming),
{
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = closed.cancelled() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let (session, incoming) =
                    Session::spawn(stream, false, hello.clone(), addr.to_string());
                install(session, incoming);
            }
            Err(error) => {
                log::warn!("tcp accept failed: {}", error);
            }
        }
    }
}

/// Accept unix-socket sessions until the token is canceled.
///
/// Unlike the network listener, no client identity is required at the
/// session level.
pub async fn accept_unix<F>(
    listener: UnixListener,
    closed: CancellationToken,
    hello: Hello,
    install: F,
) where
    F: Fn(Session, Incoming),
{
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = closed.cancelled() => break,
        };

        match accepted {
            Ok((stream, _)) => {
                let (session, incoming) =
                    Session::spawn(stream, false, hello.clone(), "unix".to_string());
                install(session, incoming);
            }
            Err(error) => {
                log::warn!("unix accept failed: {}", error);
            }
        }
    }
}

/// Launch a command and bridge its stdout/stdin into a session, reusing
/// all of the session machinery without a network.
pub fn attach_command(mut command: Command, hello: Hello) -> Result<(Session, Incoming), Error> {
    command.stdin(Stdio::piped()).stdout(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| Error::Transport(format!("spawn subprocess: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Transport("subprocess stdout unavailable".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transport("subprocess stdin unavailable".to_string()))?;

    let io = tokio::io::join(stdout, stdin);
    let (session, incoming) = Session::spawn(io, true, hello, DIAL_STDIO.to_string());

    // Reap the child when it exits; the session notices EOF on its own.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => log::info!("attached subprocess exited: {}", status),
            Err(error) => log::warn!("attached subprocess wait failed: {}", error),
        }
    });

    Ok((session, incoming))
}

/// Serve the parent peer over our own stdio; the subprocess half of
/// [`attach_command`].
pub fn serve_stdio(hello: Hello) -> (Session, Incoming) {
    let io = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    Session::spawn(io, false, hello, DIAL_STDIO.to_string())
}
