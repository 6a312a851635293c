use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use detour_net::firewall::{FirewallBackend, NatFirewall, RecordingInstaller, RuleInstaller};
use detour_net::listeners::ProcNetListeners;
use detour_net::{DaemonConfig, DetourServer, PortAllocator, host};
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "detourd")]
#[command(author, version, about = "NAT detour control daemon", long_about = None)]
pub struct DaemonArgs {
    /// Configuration file (default: /etc/detour/detourd.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Control socket address.
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Address NAT rules rewrite to (default: detected from the default route).
    #[arg(long)]
    pub detour_ip: Option<Ipv4Addr>,

    /// Packet-filter backend.
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Attempts before a port allocation gives up.
    #[arg(long)]
    pub max_alloc_attempts: Option<u32>,

    /// Leave net.ipv4.ip_forward untouched.
    #[arg(long)]
    pub no_ip_forward: bool,

    /// Log rules instead of installing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Iptables,
    Nftables,
}

impl From<BackendArg> for FirewallBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Iptables => Self::Iptables,
            BackendArg::Nftables => Self::Nftables,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let default_filter = if args.debug {
        "detour=debug,detour_net=debug,detourd=debug"
    } else {
        "detour=info,detour_net=info,detourd=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(args).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    let config = load_config(&args)?;
    info!(bind = %config.bind, dry_run = config.dry_run, "Starting detour daemon...");

    if config.enable_ip_forward && !config.dry_run {
        host::enable_ip_forward().context("Failed to enable IP forwarding")?;
    }
    match host::ip_forward_enabled() {
        Ok(true) => info!("IP forwarding is enabled"),
        Ok(false) => warn!("IP forwarding is disabled; detoured traffic will not be forwarded"),
        Err(e) => warn!(error = %e, "could not read IP forwarding state"),
    }

    let detour_ip = match config.detour_ip {
        Some(ip) => ip,
        None => host::detect_local_ip(config.probe_address)
            .with_context(|| format!("Failed to detect local address via {}", config.probe_address))?,
    };
    info!(%detour_ip, "detour address resolved");

    let allocator = PortAllocator::new(Box::new(ProcNetListeners::default()))
        .with_max_attempts(config.max_alloc_attempts);

    if config.dry_run {
        warn!("dry run: NAT rules will not be installed");
        return serve(&config, RecordingInstaller::new(), allocator).await;
    }

    let backend = config.backend.unwrap_or_else(FirewallBackend::detect);
    let mut firewall =
        NatFirewall::new(backend, detour_ip).context("Failed to initialize firewall")?;
    firewall.setup().context("Failed to set up firewall")?;
    info!(backend = ?firewall.backend(), detour_ip = %firewall.detour_ip(), "firewall ready");
    serve(&config, firewall, allocator).await
}

fn load_config(args: &DaemonArgs) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DaemonConfig::load().context("Failed to load config")?,
    };

    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(ip) = args.detour_ip {
        config.detour_ip = Some(ip);
    }
    if let Some(backend) = args.backend {
        config.backend = Some(backend.into());
    }
    if let Some(attempts) = args.max_alloc_attempts {
        config.max_alloc_attempts = attempts;
    }
    if args.no_ip_forward {
        config.enable_ip_forward = false;
    }
    if args.dry_run {
        config.dry_run = true;
    }

    config.validate()?;
    Ok(config)
}

async fn serve<I: RuleInstaller>(
    config: &DaemonConfig,
    installer: I,
    allocator: PortAllocator,
) -> Result<()> {
    // Owns the installer from here on, so a failed bind still tears down.
    let server = DetourServer::new(installer, allocator);

    let socket = UdpSocket::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind control socket {}", config.bind))?;

    server
        .serve(socket, shutdown_signal())
        .await
        .context("Control loop failed")?;

    info!("detour daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
