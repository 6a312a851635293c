//! Control protocol wire format.
//!
//! Every control message is a single fixed-size UDP datagram. All
//! multi-byte integers are big-endian.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |      Op       |            Padding            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Remote Address                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Remote Port          |          Detour Port          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! In a request the detour port is the client's preferred port (a hint, may
//! be zero). In a response it is the port the client must actually use.
//! The client's own address never travels in the payload; the daemon takes
//! it from the datagram's source.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::ProtocolError;
use crate::mapping::Mapping;

/// The only supported protocol version.
pub const VERSION: u8 = 1;

/// Size of every control frame in bytes.
pub const FRAME_LEN: usize = 12;

/// Well-known daemon control port.
pub const DEFAULT_PORT: u16 = 45672;

const OFF_VERSION: usize = 0;
const OFF_OP: usize = 1;
const OFF_REMOTE_ADDR: usize = 4;
const OFF_REMOTE_PORT: usize = 8;
const OFF_DETOUR_PORT: usize = 10;

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Client to daemon.
    Request = 0,
    /// Daemon to client.
    Response = 1,
}

impl TryFrom<u8> for Op {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(ProtocolError::UnknownOp(other)),
        }
    }
}

/// A decoded control frame, independent of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Request or response.
    pub op: Op,
    /// Remote endpoint address.
    pub remote_ip: Ipv4Addr,
    /// Remote endpoint port.
    pub remote_port: u16,
    /// Preferred port in a request, assigned port in a response.
    pub detour_port: u16,
}

impl Frame {
    /// Serialises the frame. Padding is always written as zero.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[OFF_VERSION] = VERSION;
        buf[OFF_OP] = self.op as u8;
        buf[OFF_REMOTE_ADDR..OFF_REMOTE_ADDR + 4].copy_from_slice(&self.remote_ip.octets());
        buf[OFF_REMOTE_PORT..OFF_REMOTE_PORT + 2].copy_from_slice(&self.remote_port.to_be_bytes());
        buf[OFF_DETOUR_PORT..OFF_DETOUR_PORT + 2].copy_from_slice(&self.detour_port.to_be_bytes());
        buf
    }

    /// Parses a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if `buf` is not exactly [`FRAME_LEN`] bytes,
    /// the version is not [`VERSION`], or the op byte is unknown. Padding is
    /// not checked.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let buf: &[u8; FRAME_LEN] = buf
            .try_into()
            .map_err(|_| ProtocolError::Length(buf.len()))?;

        if buf[OFF_VERSION] != VERSION {
            return Err(ProtocolError::Version(buf[OFF_VERSION]));
        }
        let op = Op::try_from(buf[OFF_OP])?;

        Ok(Self {
            op,
            remote_ip: Ipv4Addr::new(
                buf[OFF_REMOTE_ADDR],
                buf[OFF_REMOTE_ADDR + 1],
                buf[OFF_REMOTE_ADDR + 2],
                buf[OFF_REMOTE_ADDR + 3],
            ),
            remote_port: u16::from_be_bytes([buf[OFF_REMOTE_PORT], buf[OFF_REMOTE_PORT + 1]]),
            detour_port: u16::from_be_bytes([buf[OFF_DETOUR_PORT], buf[OFF_DETOUR_PORT + 1]]),
        })
    }

    /// Decodes a frame and checks that it carries `expected`.
    fn decode_expecting(buf: &[u8], expected: Op) -> Result<Self, ProtocolError> {
        let frame = Self::decode(buf)?;
        if frame.op != expected {
            return Err(ProtocolError::UnexpectedOp {
                found: frame.op,
                expected,
            });
        }
        Ok(frame)
    }
}

/// A detour request as seen by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Sender address, taken from the transport.
    pub client_ip: Ipv4Addr,
    /// Remote endpoint address.
    pub remote_ip: Ipv4Addr,
    /// Remote endpoint port.
    pub remote_port: u16,
    /// Client's preferred detour port.
    pub detour_port: u16,
}

impl Request {
    /// Creates a request frame payload for the client side.
    #[must_use]
    pub fn frame(remote: SocketAddrV4, detour_port: u16) -> Frame {
        Frame {
            op: Op::Request,
            remote_ip: *remote.ip(),
            remote_port: remote.port(),
            detour_port,
        }
    }

    /// Decodes a request received from `client_ip`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on a malformed frame or a response op.
    pub fn decode(buf: &[u8], client_ip: Ipv4Addr) -> Result<Self, ProtocolError> {
        let frame = Frame::decode_expecting(buf, Op::Request)?;
        Ok(Self {
            client_ip,
            remote_ip: frame.remote_ip,
            remote_port: frame.remote_port,
            detour_port: frame.detour_port,
        })
    }

    /// Returns the remote endpoint.
    #[must_use]
    pub const fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }
}

/// The daemon's answer: the remote endpoint echoed back with the final
/// detour port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Remote endpoint address, echoed from the request.
    pub remote_ip: Ipv4Addr,
    /// Remote endpoint port, echoed from the request.
    pub remote_port: u16,
    /// Port assigned on the detour host.
    pub detour_port: u16,
}

impl Response {
    #[must_use]
    pub const fn for_mapping(mapping: &Mapping) -> Self {
        Self {
            remote_ip: mapping.remote_ip,
            remote_port: mapping.remote_port,
            detour_port: mapping.detour_port,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        Frame {
            op: Op::Response,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            detour_port: self.detour_port,
        }
        .encode()
    }

    /// Decodes a response frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on a malformed frame or a request op.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let frame = Frame::decode_expecting(buf, Op::Response)?;
        Ok(Self {
            remote_ip: frame.remote_ip,
            remote_port: frame.remote_port,
            detour_port: frame.detour_port,
        })
    }

    #[must_use]
    pub const fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }
}
