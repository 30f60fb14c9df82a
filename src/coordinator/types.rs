/**
 * coordinator/types.rs
 *
 * Core types for the Coordinator protocol
 */

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Address family a STUN probe or peer connection is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Unspecified = 0,
    Ipv4 = 1,
    Ipv6 = 2,
}

impl AddressFamily {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unspecified),
            1 => Some(Self::Ipv4),
            2 => Some(Self::Ipv6),
            _ => None,
        }
    }

    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::Ipv4,
            SocketAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Whether `addr` may be used for this family
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Unspecified => true,
            Self::Ipv4 => addr.is_ipv4(),
            Self::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "any"),
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// How reachable our server is, as detected by the Coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    Unknown = 0,
    Isolated = 1,
    Direct = 2,
    Stun = 3,
}

impl ConnectionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Isolated),
            2 => Some(Self::Direct),
            3 => Some(Self::Stun),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Isolated => write!(f, "isolated"),
            Self::Direct => write!(f, "direct"),
            Self::Stun => write!(f, "stun"),
        }
    }
}

/// Who may see a registered server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerGameType {
    FriendsOnly = 0,
    Public = 1,
}

/// Server-role state, surfaced to the UI through the registration observer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerRegistration {
    /// Empty until the Coordinator acknowledged us
    pub join_key: String,
    pub connection_type: ConnectionType,
    /// When the next UPDATE heartbeat is due
    pub next_update: Option<Instant>,
}

impl ServerRegistration {
    pub fn is_registered(&self) -> bool {
        !self.join_key.is_empty()
    }
}

/// Per-join state machine (client role)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    /// CONNECT sent, waiting for the Coordinator to assign a token
    Requested,
    /// Token known, waiting for the Coordinator's next instruction
    TokenAssigned,
    DirectConnecting,
    StunProbing,
    StunConnecting(AddressFamily),
}

/// Coordinator session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}
