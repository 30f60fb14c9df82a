/**
 * coordinator/protocol.rs
 *
 * Coordinator and STUN wire messages
 */

use super::types::{AddressFamily, ConnectionType, ServerGameType};
use crate::game_info::{GameInfo, GameInfoError};
use crate::packet::{Packet, PacketError, HOSTNAME_LENGTH, JOIN_KEY_LENGTH, TOKEN_LENGTH};
use thiserror::Error;

/// Coordinator protocol version we speak
pub const COORDINATOR_VERSION: u8 = 1;

/// STUN protocol version we speak
pub const STUN_VERSION: u8 = 1;

/// Only packet type on the STUN link
pub const PACKET_STUN_CLIENT_STUN: u8 = 0;

/// Coordinator packet types. The numbering is part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    ClientRegister = 0,
    ServerRegisterAck = 1,
    ClientUpdate = 2,
    ClientListing = 3,
    ServerListing = 4,
    ClientConnect = 5,
    ServerConnecting = 6,
    ServerConnectFailed = 7,
    ClientConnectFailed = 8,
    ServerDirectConnect = 9,
    ServerStunRequest = 10,
    ServerStunConnect = 11,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use PacketType::*;
        Some(match value {
            0 => ClientRegister,
            1 => ServerRegisterAck,
            2 => ClientUpdate,
            3 => ClientListing,
            4 => ServerListing,
            5 => ClientConnect,
            6 => ServerConnecting,
            7 => ServerConnectFailed,
            8 => ClientConnectFailed,
            9 => ServerDirectConnect,
            10 => ServerStunRequest,
            11 => ServerStunConnect,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("unexpected packet {0:?} in this direction")]
    UnexpectedPacket(PacketType),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid connection type {0}")]
    InvalidConnectionType(u8),

    #[error("invalid address family {0}")]
    InvalidFamily(u8),

    #[error("invalid game type {0}")]
    InvalidGameType(u8),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    GameInfo(#[from] GameInfoError),
}

/// Messages sent to the Coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Register {
        game_type: ServerGameType,
        local_port: u16,
        info: GameInfo,
    },
    Update {
        info: GameInfo,
    },
    Listing,
    Connect {
        join_key: String,
    },
    /// A strategy we were running for this token failed
    ConnectFailed {
        token: String,
    },
}

/// Messages received from the Coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    RegisterAck {
        join_key: String,
        connection_type: ConnectionType,
    },
    /// One batch of a listing; an empty batch ends the listing
    Listing {
        servers: Vec<GameInfo>,
    },
    Connecting {
        token: String,
        join_key: String,
    },
    /// The Coordinator ran out of strategies for this token
    ConnectFailed {
        token: String,
    },
    DirectConnect {
        token: String,
        host: String,
        port: u16,
    },
    StunRequest {
        token: String,
    },
    StunConnect {
        token: String,
        family: AddressFamily,
        host: String,
        port: u16,
    },
}

fn read_version(p: &mut Packet) -> Result<(), ProtocolError> {
    match p.read_u8()? {
        COORDINATOR_VERSION => Ok(()),
        other => Err(ProtocolError::UnsupportedVersion(other)),
    }
}

fn read_family(p: &mut Packet) -> Result<AddressFamily, ProtocolError> {
    let raw = p.read_u8()?;
    AddressFamily::from_u8(raw).ok_or(ProtocolError::InvalidFamily(raw))
}

fn packet_type_of(p: &Packet) -> Result<PacketType, ProtocolError> {
    let raw = p.packet_type();
    PacketType::from_u8(raw).ok_or(ProtocolError::UnknownPacketType(raw))
}

impl ClientMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Register { .. } => PacketType::ClientRegister,
            Self::Update { .. } => PacketType::ClientUpdate,
            Self::Listing => PacketType::ClientListing,
            Self::Connect { .. } => PacketType::ClientConnect,
            Self::ConnectFailed { .. } => PacketType::ClientConnectFailed,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut p = Packet::new(self.packet_type() as u8);
        p.write_u8(COORDINATOR_VERSION);
        match self {
            Self::Register { game_type, local_port, info } => {
                p.write_u8(*game_type as u8).write_u16(*local_port);
                info.write_to(&mut p);
            }
            Self::Update { info } => info.write_to(&mut p),
            Self::Listing => {}
            Self::Connect { join_key } => {
                p.write_string(join_key, JOIN_KEY_LENGTH);
            }
            Self::ConnectFailed { token } => {
                p.write_string(token, TOKEN_LENGTH);
            }
        }
        p
    }

    /// Decode a client packet; this is the Coordinator's side of the link
    pub fn decode(p: &mut Packet) -> Result<Self, ProtocolError> {
        let packet_type = packet_type_of(p)?;
        read_version(p)?;
        Ok(match packet_type {
            PacketType::ClientRegister => {
                let game_type = match p.read_u8()? {
                    0 => ServerGameType::FriendsOnly,
                    1 => ServerGameType::Public,
                    other => return Err(ProtocolError::InvalidGameType(other)),
                };
                Self::Register {
                    game_type,
                    local_port: p.read_u16()?,
                    info: GameInfo::read_from(p)?,
                }
            }
            PacketType::ClientUpdate => Self::Update {
                info: GameInfo::read_from(p)?,
            },
            PacketType::ClientListing => Self::Listing,
            PacketType::ClientConnect => Self::Connect {
                join_key: p.read_string(JOIN_KEY_LENGTH)?,
            },
            PacketType::ClientConnectFailed => Self::ConnectFailed {
                token: p.read_string(TOKEN_LENGTH)?,
            },
            other => return Err(ProtocolError::UnexpectedPacket(other)),
        })
    }
}

impl ServerMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::RegisterAck { .. } => PacketType::ServerRegisterAck,
            Self::Listing { .. } => PacketType::ServerListing,
            Self::Connecting { .. } => PacketType::ServerConnecting,
            Self::ConnectFailed { .. } => PacketType::ServerConnectFailed,
            Self::DirectConnect { .. } => PacketType::ServerDirectConnect,
            Self::StunRequest { .. } => PacketType::ServerStunRequest,
            Self::StunConnect { .. } => PacketType::ServerStunConnect,
        }
    }

    pub fn decode(p: &mut Packet) -> Result<Self, ProtocolError> {
        Ok(match packet_type_of(p)? {
            PacketType::ServerRegisterAck => {
                let join_key = p.read_string(JOIN_KEY_LENGTH)?;
                let raw = p.read_u8()?;
                let connection_type =
                    ConnectionType::from_u8(raw).ok_or(ProtocolError::InvalidConnectionType(raw))?;
                Self::RegisterAck { join_key, connection_type }
            }
            PacketType::ServerListing => {
                let count = p.read_u16()?;
                let mut servers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    servers.push(GameInfo::read_from(p)?);
                }
                Self::Listing { servers }
            }
            PacketType::ServerConnecting => Self::Connecting {
                token: p.read_string(TOKEN_LENGTH)?,
                join_key: p.read_string(JOIN_KEY_LENGTH)?,
            },
            PacketType::ServerConnectFailed => Self::ConnectFailed {
                token: p.read_string(TOKEN_LENGTH)?,
            },
            PacketType::ServerDirectConnect => Self::DirectConnect {
                token: p.read_string(TOKEN_LENGTH)?,
                host: p.read_string(HOSTNAME_LENGTH)?,
                port: p.read_u16()?,
            },
            PacketType::ServerStunRequest => Self::StunRequest {
                token: p.read_string(TOKEN_LENGTH)?,
            },
            PacketType::ServerStunConnect => Self::StunConnect {
                token: p.read_string(TOKEN_LENGTH)?,
                family: read_family(p)?,
                host: p.read_string(HOSTNAME_LENGTH)?,
                port: p.read_u16()?,
            },
            other => return Err(ProtocolError::UnexpectedPacket(other)),
        })
    }

    /// Encode as the Coordinator would
    pub fn to_packet(&self) -> Packet {
        let mut p = Packet::new(self.packet_type() as u8);
        match self {
            Self::RegisterAck { join_key, connection_type } => {
                p.write_string(join_key, JOIN_KEY_LENGTH).write_u8(*connection_type as u8);
            }
            Self::Listing { servers } => {
                p.write_u16(servers.len() as u16);
                for info in servers {
                    info.write_to(&mut p);
                }
            }
            Self::Connecting { token, join_key } => {
                p.write_string(token, TOKEN_LENGTH).write_string(join_key, JOIN_KEY_LENGTH);
            }
            Self::ConnectFailed { token } | Self::StunRequest { token } => {
                p.write_string(token, TOKEN_LENGTH);
            }
            Self::DirectConnect { token, host, port } => {
                p.write_string(token, TOKEN_LENGTH)
                    .write_string(host, HOSTNAME_LENGTH)
                    .write_u16(*port);
            }
            Self::StunConnect { token, family, host, port } => {
                p.write_string(token, TOKEN_LENGTH)
                    .write_u8(*family as u8)
                    .write_string(host, HOSTNAME_LENGTH)
                    .write_u16(*port);
            }
        }
        p
    }
}

/// The single frame sent on a STUN probe connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunRequest {
    pub token: String,
    pub family: AddressFamily,
}

impl StunRequest {
    pub fn to_packet(&self) -> Packet {
        let mut p = Packet::new(PACKET_STUN_CLIENT_STUN);
        p.write_u8(STUN_VERSION)
            .write_string(&self.token, TOKEN_LENGTH)
            .write_u8(self.family as u8);
        p
    }

    /// Decode as the STUN server would
    pub fn decode(p: &mut Packet) -> Result<Self, ProtocolError> {
        if p.packet_type() != PACKET_STUN_CLIENT_STUN {
            return Err(ProtocolError::UnknownPacketType(p.packet_type()));
        }
        let version = p.read_u8()?;
        if version != STUN_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(Self {
            token: p.read_string(TOKEN_LENGTH)?,
            family: read_family(p)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reread(p: Packet) -> Packet {
        Packet::from_frame(p.into_frame().unwrap()).unwrap()
    }

    #[test]
    fn test_connect_layout() {
        let msg = ClientMessage::Connect { join_key: "ABCD1234".into() };
        let frame = msg.to_packet().into_frame().unwrap();

        assert_eq!(frame[2], PacketType::ClientConnect as u8);
        assert_eq!(frame[3], COORDINATOR_VERSION);
        assert_eq!(&frame[4..], b"ABCD1234\0");
    }

    #[test]
    fn test_stun_connect_decodes() {
        let msg = ServerMessage::StunConnect {
            token: "T2".into(),
            family: AddressFamily::Ipv4,
            host: "198.51.100.7".into(),
            port: 40123,
        };
        let mut p = reread(msg.to_packet());
        assert_eq!(ServerMessage::decode(&mut p).unwrap(), msg);
    }

    #[test]
    fn test_client_packet_from_coordinator_rejected() {
        let mut p = reread(ClientMessage::Listing.to_packet());
        assert_eq!(
            ServerMessage::decode(&mut p),
            Err(ProtocolError::UnexpectedPacket(PacketType::ClientListing))
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut p = reread(Packet::new(200));
        assert_eq!(ServerMessage::decode(&mut p), Err(ProtocolError::UnknownPacketType(200)));
    }

    #[test]
    fn test_bad_connection_type_rejected() {
        let mut p = Packet::new(PacketType::ServerRegisterAck as u8);
        p.write_string("KEY", JOIN_KEY_LENGTH).write_u8(9);
        assert_eq!(
            ServerMessage::decode(&mut reread(p)),
            Err(ProtocolError::InvalidConnectionType(9))
        );
    }

    #[test]
    fn test_truncated_direct_connect_rejected() {
        let mut p = Packet::new(PacketType::ServerDirectConnect as u8);
        p.write_string("T1", TOKEN_LENGTH).write_string("203.0.113.5", HOSTNAME_LENGTH);
        assert!(matches!(
            ServerMessage::decode(&mut reread(p)),
            Err(ProtocolError::Packet(PacketError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_stun_request_layout() {
        let req = StunRequest { token: "T2".into(), family: AddressFamily::Ipv6 };
        let frame = req.to_packet().into_frame().unwrap();
        assert_eq!(&frame[2..], &[PACKET_STUN_CLIENT_STUN, STUN_VERSION, b'T', b'2', 0, 2]);
    }
}
