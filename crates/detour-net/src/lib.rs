//! # detour-net
//!
//! NAT detour control plane.
//!
//! A detour host sits beside the direct path between a client and a server.
//! A client asks the detour daemon, over a small UDP protocol, to redirect
//! its connections to `remote_ip:remote_port` through the detour host. The
//! daemon answers with a detour port and installs a pair of NAT rules so
//! that a TCP connection to `detour_ip:detour_port` reaches the remote
//! server, with the remote seeing the detour host as the peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   detour-net                     │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │               DetourServer                 │  │
//! │  │  - decode / resolve / respond              │  │
//! │  │  - uninstall everything on exit            │  │
//! │  └────────────────────────────────────────────┘  │
//! │  ┌───────────┐ ┌──────────────┐ ┌─────────────┐  │
//! │  │ RuleStore │ │PortAllocator │ │RuleInstaller│  │
//! │  │ 2 indices │ │ + listeners  │ │ iptables/nft│  │
//! │  └───────────┘ └──────────────┘ └─────────────┘  │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │       protocol (12-byte UDP frames)        │  │
//! │  └────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod firewall;
pub mod host;
pub mod listeners;
pub mod mapping;
pub mod port_alloc;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::DetourClient;
pub use config::DaemonConfig;
pub use error::{DetourError, Result};
pub use firewall::{FirewallBackend, NatFirewall, RecordingInstaller, RuleInstaller};
pub use mapping::Mapping;
pub use port_alloc::PortAllocator;
pub use server::{DetourServer, ServerStats};
pub use store::RuleStore;
