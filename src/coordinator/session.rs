/**
 * coordinator/session.rs
 *
 * Non-blocking packet stream over the Coordinator TCP session, and the
 * reconnect backoff schedule.
 */

use crate::packet::{split_frames, Packet, PacketError};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection closed by peer")]
    Closed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Framed packets over a non-blocking TCP stream
pub struct PacketStream {
    stream: TcpStream,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl PacketStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbound: Vec::new(),
            outbound: Vec::new(),
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Queue a packet; it goes out on the next `flush`
    pub fn send(&mut self, packet: Packet) -> Result<(), PacketError> {
        self.outbound.extend_from_slice(&packet.into_frame()?);
        Ok(())
    }

    /// Write as much of the queue as the socket takes without blocking
    pub fn flush(&mut self) -> Result<(), StreamError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(StreamError::Closed),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drain whatever arrived and return the complete packets, in order.
    /// A peer close is only reported once every buffered packet was returned.
    pub fn receive(&mut self) -> Result<Vec<Packet>, StreamError> {
        let mut buf = [0u8; 4096];
        let mut closed = false;

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let packets = split_frames(&mut self.inbound)?;
        if closed && packets.is_empty() {
            return Err(StreamError::Closed);
        }
        Ok(packets)
    }
}

/// Exponential reconnect delay: starts at `min`, doubles per failure,
/// capped at `max`, back to `min` after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
            next_attempt: None,
        }
    }

    /// Schedule the next attempt after a failure or session loss
    pub fn schedule(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_attempt = Some(now + delay);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.next_attempt = None;
    }

    /// Whether a scheduled attempt is due. Unscheduled means "go now".
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }
}
