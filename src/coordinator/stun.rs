/**
 * coordinator/stun.rs
 *
 * STUN probes: one TCP connection per (token, address family) to the STUN
 * server, whose only purpose is to make the NAT allocate a public port for
 * a local port we can reuse for the real peer connection.
 *
 * A probe socket is written once and never read. Reading it while a sibling
 * socket shares its local port lets some systems hand the sibling's packets
 * to the probe.
 */

use super::protocol::StunRequest;
use super::tcp_connect::ConnectRequest;
use super::types::AddressFamily;
use super::CoordinatorError;
use crate::packet::PacketError;
use socket2::{Domain, Socket, Type};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StunError {
    #[error("failed to send STUN request: {0}")]
    Send(#[from] io::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Observable state of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Connecting,
    /// Connected and request sent; the local address is pinned
    Open(SocketAddr),
    /// Closed for use; the socket stays until the peer connect reusing
    /// its port resolves
    Parked(SocketAddr),
    Failed,
}

enum Probe {
    Connecting,
    Open { socket: TcpStream, local_addr: SocketAddr },
    Parked { _socket: TcpStream, local_addr: SocketAddr },
    Failed,
}

impl Probe {
    fn state(&self) -> ProbeState {
        match self {
            Probe::Connecting => ProbeState::Connecting,
            Probe::Open { local_addr, .. } => ProbeState::Open(*local_addr),
            Probe::Parked { local_addr, .. } => ProbeState::Parked(*local_addr),
            Probe::Failed => ProbeState::Failed,
        }
    }
}

/// What happened to a probe that resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Pinned(SocketAddr),
    /// This family failed; others for the token are still alive
    Failed,
    /// Every family of the token has now failed
    AllFailed,
    /// Token or family was closed while connecting; socket dropped
    Stale,
}

/// All probes, keyed by token then family
pub struct StunSessions {
    host: String,
    port: u16,
    probes: HashMap<String, BTreeMap<AddressFamily, Probe>>,
}

impl StunSessions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            probes: HashMap::new(),
        }
    }

    /// Register a probe for (token, family) and return the connect to run for it
    pub fn begin_probe(&mut self, token: &str, family: AddressFamily) -> ConnectRequest {
        debug!(token, %family, "starting STUN probe");
        self.probes
            .entry(token.to_string())
            .or_default()
            .insert(family, Probe::Connecting);

        // Reuse flags let the peer connect bind the same port later
        ConnectRequest::new(self.host.clone(), self.port)
            .family(family)
            .reuse_address()
    }

    /// The probe connection is up: send the request and pin its local address
    pub fn on_connected(&mut self, token: &str, family: AddressFamily, mut socket: TcpStream) -> ProbeResult {
        let Some(probe) = self.probe_mut(token, family) else {
            debug!(token, %family, "STUN probe connected after close, dropping");
            return ProbeResult::Stale;
        };
        if !matches!(probe, Probe::Connecting) {
            return ProbeResult::Stale;
        }

        let sent = (|| -> Result<SocketAddr, StunError> {
            let local_addr = socket.local_addr()?;
            let frame = StunRequest {
                token: token.to_string(),
                family,
            }
            .to_packet()
            .into_frame()?;
            socket.write_all(&frame)?;
            Ok(local_addr)
        })();

        match sent {
            Ok(local_addr) => {
                info!(token, %family, %local_addr, "STUN probe pinned local address");
                *probe = Probe::Open { socket, local_addr };
                ProbeResult::Pinned(local_addr)
            }
            Err(e) => {
                warn!(token, %family, error = %e, "STUN probe failed");
                self.on_failed(token, family)
            }
        }
    }

    /// The probe connection could not be made
    pub fn on_failed(&mut self, token: &str, family: AddressFamily) -> ProbeResult {
        let Some(families) = self.probes.get_mut(token) else {
            return ProbeResult::Stale;
        };
        let Some(probe) = families.get_mut(&family) else {
            return ProbeResult::Stale;
        };
        *probe = Probe::Failed;

        if families.values().all(|p| matches!(p, Probe::Failed)) {
            ProbeResult::AllFailed
        } else {
            ProbeResult::Failed
        }
    }

    /// Take the pinned local address of an open probe for a peer connect.
    /// The probe is closed for further use but its socket is parked until
    /// `close` so the NAT mapping survives the peer's SYN.
    pub fn begin_peer_connect(&mut self, token: &str, family: AddressFamily) -> Result<SocketAddr, CoordinatorError> {
        let unknown = || CoordinatorError::UnknownStunProbe {
            token: token.to_string(),
            family,
        };
        let probe = self.probe_mut(token, family).ok_or_else(unknown)?;

        match std::mem::replace(probe, Probe::Failed) {
            Probe::Open { socket, local_addr } => {
                *probe = Probe::Parked { _socket: socket, local_addr };
                Ok(local_addr)
            }
            other => {
                *probe = other;
                Err(unknown())
            }
        }
    }

    /// Close one family's probe, or every probe of the token. Safe to repeat.
    pub fn close(&mut self, token: &str, family: Option<AddressFamily>) {
        match family {
            Some(family) => {
                if let Some(families) = self.probes.get_mut(token) {
                    if families.remove(&family).is_some() {
                        debug!(token, %family, "closed STUN probe");
                    }
                    if families.is_empty() {
                        self.probes.remove(token);
                    }
                }
            }
            None => {
                if self.probes.remove(token).is_some() {
                    debug!(token, "closed all STUN probes");
                }
            }
        }
    }

    pub fn close_all(&mut self) {
        self.probes.clear();
    }

    pub fn has_token(&self, token: &str) -> bool {
        self.probes.contains_key(token)
    }

    pub fn state(&self, token: &str, family: AddressFamily) -> Option<ProbeState> {
        self.probes.get(token)?.get(&family).map(Probe::state)
    }

    /// Number of probe sockets currently held open (parked ones included)
    pub fn open_sockets(&self) -> usize {
        self.probes
            .values()
            .flat_map(|f| f.values())
            .filter(|p| matches!(p, Probe::Open { .. } | Probe::Parked { .. }))
            .count()
    }

    fn probe_mut(&mut self, token: &str, family: AddressFamily) -> Option<&mut Probe> {
        self.probes.get_mut(token)?.get_mut(&family)
    }
}

/// Families to probe on this host: IPv4 always, IPv6 when enabled and the
/// host can create IPv6 sockets.
pub fn supported_families(enable_ipv6: bool) -> Vec<AddressFamily> {
    let mut families = vec![AddressFamily::Ipv4];
    if enable_ipv6 && Socket::new(Domain::IPV6, Type::STREAM, None).is_ok() {
        families.push(AddressFamily::Ipv6);
    }
    families
}
