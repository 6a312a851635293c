//! Detour port allocation.

use std::io;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{DetourError, Result};
use crate::listeners::ListenerProbe;
use crate::store::RuleStore;

/// IANA suggested ephemeral port range.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Default number of candidates drawn before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 128;

/// Picks detour ports that are free for a client.
///
/// A candidate is accepted only if the client does not already hold it and
/// no non-loopback TCP listener on this host is bound to it. Candidates are
/// drawn uniformly at random from the ephemeral range; the search stops
/// after `max_attempts` draws.
pub struct PortAllocator {
    probe: Box<dyn ListenerProbe>,
    rng: StdRng,
    range: RangeInclusive<u16>,
    max_attempts: u32,
}

impl PortAllocator {
    /// Creates an allocator over [`EPHEMERAL_PORTS`] with an entropy-seeded
    /// RNG.
    #[must_use]
    pub fn new(probe: Box<dyn ListenerProbe>) -> Self {
        Self {
            probe,
            rng: StdRng::from_entropy(),
            range: EPHEMERAL_PORTS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Replaces the random source, e.g. with a seeded one.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Sets the attempt cap. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Restricts candidates to `range`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    #[must_use]
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        assert!(!range.is_empty(), "port range must not be empty");
        self.range = range;
        self
    }

    /// Returns true if a live service on this host owns `port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener table cannot be read.
    pub fn is_restricted(&self, port: u16) -> io::Result<bool> {
        self.probe.is_listening(port)
    }

    /// Draws a port that `client_ip` does not hold and that is not
    /// restricted.
    ///
    /// # Errors
    ///
    /// Returns [`DetourError::ResourceExhausted`] if no acceptable port was
    /// drawn within the attempt cap, or an I/O error from the listener probe.
    pub fn allocate(&mut self, store: &RuleStore, client_ip: Ipv4Addr) -> Result<u16> {
        for attempt in 1..=self.max_attempts {
            let port = self.rng.gen_range(self.range.clone());
            if store.port_in_use_by_client(client_ip, port) || self.is_restricted(port)? {
                tracing::trace!(client = %client_ip, port, attempt, "detour port candidate rejected");
                continue;
            }
            return Ok(port);
        }

        Err(DetourError::ResourceExhausted {
            client: client_ip,
            attempts: self.max_attempts,
        })
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
