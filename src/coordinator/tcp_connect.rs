/**
 * coordinator/tcp_connect.rs
 *
 * Outbound TCP connects that never block the main loop.
 *
 * Every attempt runs its blocking connect() on a short-lived worker thread
 * and hands the result back over a oneshot channel. The owner polls the
 * registry once per tick; only resolved attempts are reported, each exactly
 * once, together with the tag it was started with.
 */

use super::types::AddressFamily;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, trace, warn};

/// Why an attempt failed. Never fatal; the owner decides what comes next.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no {family} address for {host}:{port}")]
    NoAddress {
        host: String,
        port: u16,
        family: AddressFamily,
    },

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect worker exited without a result")]
    WorkerLost,
}

/// What to connect to, and from where
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
    /// Local address to bind before connecting
    pub bind_addr: Option<SocketAddr>,
    /// Set SO_REUSEADDR (and SO_REUSEPORT on unix) so a sibling socket
    /// may share the local port
    pub reuse_address: bool,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            family: AddressFamily::Unspecified,
            bind_addr: None,
            reuse_address: false,
        }
    }

    pub fn family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    /// Bind to `addr` first. The target family follows the bind address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.family = AddressFamily::of(&addr);
        self.bind_addr = Some(addr);
        self.reuse_address = true;
        self
    }

    pub fn reuse_address(mut self) -> Self {
        self.reuse_address = true;
        self
    }
}

/// Handle for a started attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

/// Result of a resolved attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(TcpStream),
    Failed(ConnectError),
}

struct ConnectionAttempt<T> {
    id: AttemptId,
    tag: T,
    endpoint: String,
    result: oneshot::Receiver<Result<TcpStream, ConnectError>>,
    killed: bool,
}

/// All in-flight connects of one owner. `T` says what each attempt is for.
pub struct ConnectorRegistry<T> {
    attempts: Vec<ConnectionAttempt<T>>,
    next_id: u64,
}

impl<T> Default for ConnectorRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectorRegistry<T> {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
            next_id: 0,
        }
    }

    /// Start connecting. Returns immediately unless no worker thread could
    /// be spawned, in which case the connect runs inline.
    pub fn start(&mut self, request: ConnectRequest, tag: T) -> AttemptId {
        let id = AttemptId(self.next_id);
        self.next_id += 1;

        let endpoint = format!("{}:{}", request.host, request.port);
        let (tx, mut rx) = oneshot::channel();

        let worker_request = request.clone();
        let spawned = thread::Builder::new()
            .name("tcp-connect".into())
            .spawn(move || {
                // Receiver gone means the registry was dropped; the socket closes here
                let _ = tx.send(connect(&worker_request));
            });

        if let Err(e) = spawned {
            warn!(%endpoint, error = %e, "could not spawn connect worker, connecting inline");
            let (tx, inline_rx) = oneshot::channel();
            let _ = tx.send(connect(&request));
            rx = inline_rx;
        }

        debug!(%endpoint, bind = ?request.bind_addr, "connect started");
        self.attempts.push(ConnectionAttempt {
            id,
            tag,
            endpoint,
            result: rx,
            killed: false,
        });
        id
    }

    /// Collect every attempt that resolved since the last poll.
    /// Killed attempts are reaped silently; their sockets are closed.
    pub fn poll(&mut self) -> Vec<(T, ConnectOutcome)> {
        let mut resolved = Vec::new();
        let mut still_pending = Vec::with_capacity(self.attempts.len());

        for mut attempt in self.attempts.drain(..) {
            let outcome = match attempt.result.try_recv() {
                Ok(Ok(stream)) => ConnectOutcome::Connected(stream),
                Ok(Err(e)) => ConnectOutcome::Failed(e),
                Err(TryRecvError::Empty) => {
                    still_pending.push(attempt);
                    continue;
                }
                Err(TryRecvError::Closed) => ConnectOutcome::Failed(ConnectError::WorkerLost),
            };

            if attempt.killed {
                trace!(endpoint = %attempt.endpoint, "reaped killed connect attempt");
                continue;
            }

            match &outcome {
                ConnectOutcome::Connected(_) => debug!(endpoint = %attempt.endpoint, "connected"),
                ConnectOutcome::Failed(e) => debug!(endpoint = %attempt.endpoint, error = %e, "connect failed"),
            }
            resolved.push((attempt.tag, outcome));
        }

        self.attempts = still_pending;
        resolved
    }

    /// Mark every in-flight attempt dead. Nothing is reported for them;
    /// they are still reaped by `poll` once their worker finishes.
    pub fn kill_all(&mut self) {
        for attempt in &mut self.attempts {
            attempt.killed = true;
        }
    }

    /// Attempts not yet reaped, killed ones included
    pub fn in_flight(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_pending(&self, id: AttemptId) -> bool {
        self.attempts.iter().any(|a| a.id == id && !a.killed)
    }
}

/// Blocking connect, run on the worker
fn connect(request: &ConnectRequest) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = (request.host.as_str(), request.port)
        .to_socket_addrs()
        .map_err(|source| ConnectError::Resolve {
            host: request.host.clone(),
            port: request.port,
            source,
        })?
        .filter(|addr| request.family.accepts(addr))
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match connect_one(addr, request) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(%addr, error = %e, "address failed, trying next");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ConnectError::NoAddress {
        host: request.host.clone(),
        port: request.port,
        family: request.family,
    }))
}

fn connect_one(addr: SocketAddr, request: &ConnectRequest) -> Result<TcpStream, ConnectError> {
    let connect_err = |source| ConnectError::Connect { addr, source };

    if !request.reuse_address && request.bind_addr.is_none() {
        return TcpStream::connect(addr).map_err(connect_err);
    }

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(connect_err)?;

    socket.set_reuse_address(true).map_err(connect_err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(connect_err)?;

    if let Some(bind_addr) = request.bind_addr {
        socket
            .bind(&bind_addr.into())
            .map_err(|source| ConnectError::Bind { addr: bind_addr, source })?;
    }

    socket.connect(&addr.into()).map_err(connect_err)?;
    Ok(socket.into())
}
