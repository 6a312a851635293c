//! `detour request` - obtain a detour port.
//!
//! Prints the endpoint to connect to instead of the remote, e.g.
//!
//! ```text
//! $ detour request --daemon 10.0.2.1 --remote 10.0.3.2:5201 --port 5201
//! 10.0.2.1:5201
//! ```

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use detour_net::DetourClient;
use detour_net::client::{DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT_MS};
use detour_net::protocol::DEFAULT_PORT;

/// Arguments for `detour request`.
#[derive(Debug, Args)]
pub struct RequestArgs {
    /// Daemon address, IP or IP:PORT (default port 45672)
    #[arg(long, value_parser = parse_daemon_addr)]
    pub daemon: SocketAddr,

    /// Remote endpoint to reach through the detour host
    #[arg(long)]
    pub remote: SocketAddrV4,

    /// Preferred detour port (0 lets the daemon choose)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Response timeout per attempt, in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout: u64,

    /// Requests sent in total before giving up
    #[arg(long, default_value_t = DEFAULT_ATTEMPTS)]
    pub attempts: u32,
}

/// Executes the request subcommand.
pub async fn execute(args: RequestArgs) -> Result<()> {
    let client = DetourClient::new(args.daemon)
        .with_timeout(Duration::from_millis(args.timeout))
        .with_attempts(args.attempts);

    let detour_port = client
        .request(args.remote, args.port)
        .await
        .with_context(|| format!("Detour request for {} failed", args.remote))?;

    if args.port != 0 && detour_port != args.port {
        tracing::info!(requested = args.port, assigned = detour_port, "preferred port was taken");
    }
    println!("{}", SocketAddr::new(client.daemon().ip(), detour_port));
    Ok(())
}

/// Parses `IP` or `IP:PORT`, defaulting the port to the daemon's.
fn parse_daemon_addr(s: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
        .map_err(|_| format!("invalid daemon address `{s}`"))
}
