//! Detour client.
//!
//! The protocol has no error response: a request the daemon cannot serve is
//! simply never answered. The client therefore resends after a timeout and
//! gives up after a fixed number of attempts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{DetourError, Result};
use crate::protocol::{FRAME_LEN, Request, Response};

/// Time to wait for a response before resending, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Time to wait for a response before resending.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);

/// Number of requests sent before giving up.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Requests detour ports from a daemon.
#[derive(Debug, Clone)]
pub struct DetourClient {
    daemon: SocketAddr,
    timeout: Duration,
    attempts: u32,
}

impl DetourClient {
    /// Creates a client for the daemon at `daemon`.
    #[must_use]
    pub const fn new(daemon: SocketAddr) -> Self {
        Self {
            daemon,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Sets the per-attempt response timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of requests sent before giving up. Zero is treated as
    /// one.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Returns the daemon address.
    #[must_use]
    pub const fn daemon(&self) -> SocketAddr {
        self.daemon
    }

    /// Asks the daemon for a detour to `remote`, preferring `detour_port`
    /// (zero for no preference). Returns the port to connect to on the
    /// detour host.
    ///
    /// Datagrams that are malformed or answer a different remote are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DetourError::NoResponse`] if no matching response arrived
    /// within the configured attempts, or an I/O error if the socket fails.
    pub async fn request(&self, remote: SocketAddrV4, detour_port: u16) -> Result<u16> {
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.daemon).await?;

        let frame = Request::frame(remote, detour_port).encode();
        let mut buf = [0u8; FRAME_LEN * 2];

        for attempt in 1..=self.attempts {
            tracing::debug!(daemon = %self.daemon, %remote, detour_port, attempt, "sending detour request");
            socket.send(&frame).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                    Err(_elapsed) => break,
                    Ok(Ok(len)) => len,
                    // ICMP port unreachable from a previous send.
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                    Ok(Err(e)) => return Err(e.into()),
                };

                match Response::decode(&buf[..len]) {
                    Ok(response) if response.remote() == remote => {
                        return Ok(response.detour_port);
                    }
                    Ok(response) => {
                        tracing::debug!(remote = %response.remote(), "ignoring response for another remote");
                    }
                    Err(e) => tracing::debug!(error = %e, "ignoring malformed response"),
                }
            }
        }

        Err(DetourError::NoResponse {
            daemon: self.daemon,
            attempts: self.attempts,
        })
    }
}
