/**
 * packet.rs
 *
 * Length-prefixed binary packets shared by the Coordinator and STUN links.
 *
 * Frame layout:
 *   u16  size of the whole frame, size field included (little-endian)
 *   u8   packet type
 *   ...  payload
 */

use thiserror::Error;

/// Largest frame either side may send
pub const MAX_PACKET_SIZE: usize = 32767;

/// Bytes taken by the size field
pub const SIZE_FIELD_LEN: usize = 2;

/// Field lengths, terminator included
pub const JOIN_KEY_LENGTH: usize = 64;
pub const TOKEN_LENGTH: usize = 64;
pub const HOSTNAME_LENGTH: usize = 80;
pub const NAME_LENGTH: usize = 80;
pub const REVISION_LENGTH: usize = 33;
pub const GRF_NAME_LENGTH: usize = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: wanted {wanted} bytes at offset {offset}, frame is {len} bytes")]
    Truncated { offset: usize, wanted: usize, len: usize },

    #[error("unterminated string at offset {0}")]
    UnterminatedString(usize),

    #[error("packet too large: {0} bytes (max {MAX_PACKET_SIZE})")]
    TooLarge(usize),

    #[error("invalid frame size {0}")]
    InvalidSize(usize),

    #[error("empty packet, no type byte")]
    Empty,
}

/// A single packet, either being built for sending or being read after receipt.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    pos: usize,
}

impl Packet {
    /// Start an outgoing packet of the given type
    pub fn new(packet_type: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0]);
        buf.push(packet_type);
        Self { buf, pos: SIZE_FIELD_LEN + 1 }
    }

    /// Wrap a complete received frame (size field included).
    /// The read cursor is placed right after the type byte.
    pub fn from_frame(frame: Vec<u8>) -> Result<Self, PacketError> {
        if frame.len() < SIZE_FIELD_LEN {
            return Err(PacketError::InvalidSize(frame.len()));
        }
        let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        if declared != frame.len() {
            return Err(PacketError::InvalidSize(declared));
        }
        if frame.len() == SIZE_FIELD_LEN {
            return Err(PacketError::Empty);
        }
        Ok(Self { buf: frame, pos: SIZE_FIELD_LEN + 1 })
    }

    pub fn packet_type(&self) -> u8 {
        self.buf[SIZE_FIELD_LEN]
    }

    /// Seal the packet and return the bytes to put on the wire
    pub fn into_frame(mut self) -> Result<Vec<u8>, PacketError> {
        let len = self.buf.len();
        if len > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(len));
        }
        self.buf[..SIZE_FIELD_LEN].copy_from_slice(&(len as u16).to_le_bytes());
        Ok(self.buf)
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Write a NUL-terminated string, cut down to `max_len - 1` bytes
    pub fn write_string(&mut self, value: &str, max_len: usize) -> &mut Self {
        let value = value.split('\0').next().unwrap_or_default();
        self.buf.extend_from_slice(truncate_str(value, max_len.saturating_sub(1)).as_bytes());
        self.buf.push(0);
        self
    }

    fn take(&mut self, wanted: usize) -> Result<&[u8], PacketError> {
        if self.remaining() < wanted {
            return Err(PacketError::Truncated {
                offset: self.pos,
                wanted,
                len: self.buf.len(),
            });
        }
        let start = self.pos;
        self.pos += wanted;
        Ok(&self.buf[start..self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a NUL-terminated string. The whole field is consumed, but only
    /// the first `max_len - 1` bytes are kept.
    pub fn read_string(&mut self, max_len: usize) -> Result<String, PacketError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(PacketError::UnterminatedString(self.pos))?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(truncate_str(&text, max_len.saturating_sub(1)).to_string())
    }
}

/// Longest prefix of `value` not exceeding `max` bytes that ends on a char boundary
pub fn truncate_str(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Split complete frames off the front of `buf`.
/// Partial trailing data is left in place for the next read.
pub fn split_frames(buf: &mut Vec<u8>) -> Result<Vec<Packet>, PacketError> {
    let mut packets = Vec::new();
    let mut consumed = 0;

    while buf.len() - consumed >= SIZE_FIELD_LEN {
        let size = u16::from_le_bytes([buf[consumed], buf[consumed + 1]]) as usize;
        if size <= SIZE_FIELD_LEN || size > MAX_PACKET_SIZE {
            return Err(PacketError::InvalidSize(size));
        }
        if buf.len() - consumed < size {
            break;
        }
        packets.push(Packet::from_frame(buf[consumed..consumed + size].to_vec())?);
        consumed += size;
    }

    buf.drain(..consumed);
    Ok(packets)
}
