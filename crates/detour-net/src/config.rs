//! Daemon configuration.
//!
//! Configuration is loaded from multiple sources, later ones overriding
//! earlier ones:
//!
//! 1. Default values
//! 2. Configuration file (`/etc/detour/detourd.toml`)
//! 3. Environment variables (`DETOUR_*`, e.g. `DETOUR_DETOUR_IP`)
//!
//! Command-line flags are applied on top by the daemon binary.
//!
//! ## Example Configuration File
//!
//! ```toml
//! bind = "0.0.0.0:45672"
//! detour_ip = "10.0.2.1"
//! backend = "nftables"
//! max_alloc_attempts = 128
//! enable_ip_forward = true
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{DetourError, Result};
use crate::firewall::FirewallBackend;
use crate::port_alloc::DEFAULT_MAX_ATTEMPTS;
use crate::protocol::DEFAULT_PORT;

/// Detour daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control socket address.
    pub bind: SocketAddr,
    /// Address rules rewrite to. Detected from the default route if unset.
    pub detour_ip: Option<Ipv4Addr>,
    /// Packet-filter backend. Detected if unset.
    pub backend: Option<FirewallBackend>,
    /// Port allocation attempt cap.
    pub max_alloc_attempts: u32,
    /// Turn on `net.ipv4.ip_forward` at startup.
    pub enable_ip_forward: bool,
    /// Destination used to pick the local address when `detour_ip` is unset.
    pub probe_address: SocketAddr,
    /// Record rules instead of installing them.
    pub dry_run: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            detour_ip: None,
            backend: None,
            max_alloc_attempts: DEFAULT_MAX_ATTEMPTS,
            enable_ip_forward: true,
            probe_address: SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)),
            dry_run: false,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from the system file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source exists but cannot be parsed.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from(system_config_path())
    }

    /// Loads configuration from a specific file. A missing file is treated
    /// as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a source exists but cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DETOUR_"))
            .extract()
    }

    /// Checks values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`DetourError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.max_alloc_attempts == 0 {
            return Err(DetourError::Config(
                "max_alloc_attempts must be at least 1".to_string(),
            ));
        }
        if !self.bind.is_ipv4() {
            return Err(DetourError::Config(format!(
                "bind address {} is not IPv4",
                self.bind
            )));
        }
        if self.detour_ip.is_some_and(|ip| ip.is_unspecified()) {
            return Err(DetourError::Config(
                "detour_ip must be a concrete address".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the system-wide configuration file path.
#[must_use]
pub fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/detour/detourd.toml")
}
