//! Error types for the detour daemon.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

use crate::mapping::Mapping;
use crate::protocol::{FRAME_LEN, Op, VERSION};

/// Result type alias for detour operations.
pub type Result<T> = std::result::Result<T, DetourError>;

/// Errors that can occur while serving or requesting detours.
#[derive(Debug, Error)]
pub enum DetourError {
    /// Malformed control frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The port allocator gave up.
    #[error("no free detour port for client {client} after {attempts} attempts")]
    ResourceExhausted {
        /// Client the port was being allocated for.
        client: Ipv4Addr,
        /// Number of candidates drawn.
        attempts: u32,
    },

    /// Packet-filter command failed.
    #[error(transparent)]
    RuleInstall(#[from] RuleInstallError),

    /// Rule store invariant violation.
    #[error("rule store error: {0}")]
    Store(#[from] StoreError),

    /// The daemon never answered.
    #[error("no response from {daemon} after {attempts} attempts")]
    NoResponse {
        /// Daemon control address.
        daemon: SocketAddr,
        /// Number of requests sent.
        attempts: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A datagram that is not a valid control frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame is not exactly [`FRAME_LEN`] bytes.
    #[error("frame length {0} does not match expected {expected}", expected = FRAME_LEN)]
    Length(usize),

    /// Version byte is not [`VERSION`].
    #[error("frame version {0} does not match expected {expected}", expected = VERSION)]
    Version(u8),

    /// Op byte is neither request nor response.
    #[error("unknown op {0}")]
    UnknownOp(u8),

    /// Op byte is valid but not the one expected here.
    #[error("unexpected op {found:?}, expected {expected:?}")]
    UnexpectedOp {
        /// Op carried by the frame.
        found: Op,
        /// Op the receiver accepts.
        expected: Op,
    },

    /// Datagram arrived from a non-IPv4 endpoint.
    #[error("sender {0} is not an IPv4 endpoint")]
    NonIpv4Sender(SocketAddr),
}

/// Failure of an external packet-filter command.
#[derive(Debug, Error)]
pub enum RuleInstallError {
    /// The tool could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully.
    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    Command {
        /// Full command line.
        command: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// No installed rule matched on removal.
    #[error("no rule in chain {chain} matches `{rule}`")]
    NotFound {
        /// Chain that was searched.
        chain: String,
        /// Rule that was looked for.
        rule: String,
    },
}

/// Rule store index violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Another mapping of this client already uses the detour port.
    #[error("client {client} already holds detour port {detour_port}")]
    PortTaken {
        /// Client address.
        client: Ipv4Addr,
        /// Conflicting detour port.
        detour_port: u16,
    },

    /// The client already has a mapping for this remote endpoint.
    #[error("client {client} already has a mapping for {remote}")]
    RemoteTaken {
        /// Client address.
        client: Ipv4Addr,
        /// Remote endpoint.
        remote: SocketAddrV4,
    },

    /// The mapping to remove is not in the store.
    #[error("mapping not present: {0}")]
    Missing(Mapping),
}
