//! NAT rule installation (iptables/nftables).
//!
//! Each [`Mapping`] is realised as a pair of kernel NAT rules on the detour
//! host:
//!
//! 1. SNAT in POSTROUTING: traffic from the client to the remote endpoint
//!    leaves with the detour host's address as its source, so the server
//!    answers the detour host.
//! 2. DNAT in PREROUTING: traffic from the client to the detour host's
//!    detour port is redirected to the remote endpoint.
//!
//! The pair is installed and removed as a unit. Rules only match TCP.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::RuleInstallError;
use crate::mapping::Mapping;

/// nftables table owned by the daemon.
const NFT_TABLE: &str = "detour";

/// Firewall backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// Use iptables (legacy).
    #[default]
    Iptables,
    /// Use nftables (modern).
    Nftables,
}

impl FirewallBackend {
    /// Detects the available firewall backend.
    ///
    /// Prefers iptables, which operates on the kernel's built-in nat chains;
    /// falls back to nftables when iptables is not installed.
    #[must_use]
    pub fn detect() -> Self {
        if tool_available("iptables") {
            return Self::Iptables;
        }
        if tool_available("nft") {
            return Self::Nftables;
        }
        Self::Iptables
    }

    const fn program(self) -> &'static str {
        match self {
            Self::Iptables => "iptables",
            Self::Nftables => "nft",
        }
    }
}

fn tool_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// Applies and reverts the rule pair for a mapping.
///
/// Implementations must never keep their own copy of a mapping: the caller
/// owns the record of what is installed and passes it back for removal.
pub trait RuleInstaller: Send {
    /// Installs the SNAT rule, then the DNAT rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleInstallError`] if either rule could not be added. A
    /// rule that was added before the failure has already been removed
    /// again when this returns.
    fn install(&mut self, mapping: &Mapping) -> Result<(), RuleInstallError>;

    /// Removes the SNAT rule, then the DNAT rule.
    ///
    /// Both removals are attempted even if the first fails.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Rules already gone from the kernel (e.g.
    /// flushed by an operator) surface here and are safe to ignore.
    fn uninstall(&mut self, mapping: &Mapping) -> Result<(), RuleInstallError>;

    /// Releases backend-wide state once every mapping has been removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be cleaned up.
    fn teardown(&mut self) -> Result<(), RuleInstallError> {
        Ok(())
    }
}

/// Which half of the rule pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NatKind {
    Snat,
    Dnat,
}

impl NatKind {
    const fn iptables_chain(self) -> &'static str {
        match self {
            Self::Snat => "POSTROUTING",
            Self::Dnat => "PREROUTING",
        }
    }

    const fn nft_chain(self) -> &'static str {
        match self {
            Self::Snat => "postrouting",
            Self::Dnat => "prerouting",
        }
    }
}

/// Packet-filter backed [`RuleInstaller`].
///
/// # Example
///
/// ```no_run
/// use detour_net::firewall::{FirewallBackend, NatFirewall, RuleInstaller};
/// use detour_net::Mapping;
///
/// let mut firewall = NatFirewall::new(FirewallBackend::detect(), "10.0.2.1".parse().unwrap()).unwrap();
/// firewall.setup().unwrap();
///
/// let mapping = Mapping::new(
///     "10.0.1.1".parse().unwrap(),
///     "10.0.3.2".parse().unwrap(),
///     5201,
///     5201,
/// );
/// firewall.install(&mapping).unwrap();
/// firewall.uninstall(&mapping).unwrap();
/// firewall.teardown().unwrap();
/// ```
#[derive(Debug)]
pub struct NatFirewall {
    backend: FirewallBackend,
    detour_ip: Ipv4Addr,
    program: PathBuf,
}

impl NatFirewall {
    /// Creates a firewall manager that rewrites to/from `detour_ip`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's tool is not available.
    pub fn new(backend: FirewallBackend, detour_ip: Ipv4Addr) -> Result<Self, RuleInstallError> {
        Self::with_program(backend, detour_ip, backend.program())
    }

    /// Like [`NatFirewall::new`], but runs `program` instead of the tool
    /// found on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error if `program` cannot be run or `program --version`
    /// fails.
    pub fn with_program(
        backend: FirewallBackend,
        detour_ip: Ipv4Addr,
        program: impl Into<PathBuf>,
    ) -> Result<Self, RuleInstallError> {
        let program = program.into();
        run(&program, &["--version"])?;

        tracing::info!(?backend, %detour_ip, program = %program.display(), "using firewall backend");
        Ok(Self {
            backend,
            detour_ip,
            program,
        })
    }

    /// Returns the firewall backend.
    #[must_use]
    pub const fn backend(&self) -> FirewallBackend {
        self.backend
    }

    /// Returns the address rules rewrite to.
    #[must_use]
    pub const fn detour_ip(&self) -> Ipv4Addr {
        self.detour_ip
    }

    /// Prepares backend state before the first install.
    ///
    /// iptables rules go straight into the built-in nat chains and need no
    /// preparation. For nftables the daemon's own table and nat chains are
    /// created.
    ///
    /// # Errors
    ///
    /// Returns an error if the nftables table cannot be created.
    pub fn setup(&mut self) -> Result<(), RuleInstallError> {
        if self.backend == FirewallBackend::Nftables {
            run(&self.program, &["add", "table", "ip", NFT_TABLE])?;
            let chains = [
                format!("add chain ip {NFT_TABLE} prerouting {{ type nat hook prerouting priority -100; }}"),
                format!("add chain ip {NFT_TABLE} postrouting {{ type nat hook postrouting priority 100; }}"),
            ];
            for chain in &chains {
                run(&self.program, &chain.split_whitespace().collect::<Vec<_>>())?;
            }
            tracing::debug!("nftables table and chains set up");
        }
        Ok(())
    }

    fn add(&self, kind: NatKind, mapping: &Mapping) -> Result<(), RuleInstallError> {
        match self.backend {
            FirewallBackend::Iptables => {
                let args = iptables_args("-A", kind, mapping, self.detour_ip);
                run(&self.program, &args.iter().map(String::as_str).collect::<Vec<_>>())?;
            }
            FirewallBackend::Nftables => {
                let rule = format!(
                    "add rule ip {NFT_TABLE} {} {}",
                    kind.nft_chain(),
                    nft_rule_body(kind, mapping, self.detour_ip)
                );
                run(&self.program, &rule.split_whitespace().collect::<Vec<_>>())?;
            }
        }
        tracing::debug!(?kind, %mapping, "added NAT rule");
        Ok(())
    }

    fn delete(&self, kind: NatKind, mapping: &Mapping) -> Result<(), RuleInstallError> {
        match self.backend {
            FirewallBackend::Iptables => {
                let args = iptables_args("-D", kind, mapping, self.detour_ip);
                run(&self.program, &args.iter().map(String::as_str).collect::<Vec<_>>())?;
            }
            FirewallBackend::Nftables => self.delete_nft_rule(kind, mapping)?,
        }
        tracing::debug!(?kind, %mapping, "removed NAT rule");
        Ok(())
    }

    /// Finds and deletes an nftables rule.
    ///
    /// nftables deletes by handle, so the chain is listed with `-a` and the
    /// first line matching every pattern of the rule is removed.
    fn delete_nft_rule(&self, kind: NatKind, mapping: &Mapping) -> Result<(), RuleInstallError> {
        let chain = kind.nft_chain();
        let listing = run(&self.program, &["-a", "list", "chain", "ip", NFT_TABLE, chain])?;
        let patterns = nft_match_patterns(kind, mapping, self.detour_ip);

        let handle = listing
            .lines()
            .filter(|line| patterns.iter().all(|p| line.contains(p.as_str())))
            .find_map(extract_nft_handle)
            .ok_or_else(|| RuleInstallError::NotFound {
                chain: chain.to_string(),
                rule: nft_rule_body(kind, mapping, self.detour_ip),
            })?;

        let handle = handle.to_string();
        run(
            &self.program,
            &["delete", "rule", "ip", NFT_TABLE, chain, "handle", &handle],
        )?;
        Ok(())
    }
}

impl RuleInstaller for NatFirewall {
    fn install(&mut self, mapping: &Mapping) -> Result<(), RuleInstallError> {
        self.add(NatKind::Snat, mapping)?;
        if let Err(e) = self.add(NatKind::Dnat, mapping) {
            if let Err(rollback) = self.delete(NatKind::Snat, mapping) {
                tracing::error!(%mapping, error = %rollback, "failed to roll back SNAT rule");
            }
            return Err(e);
        }
        Ok(())
    }

    fn uninstall(&mut self, mapping: &Mapping) -> Result<(), RuleInstallError> {
        let snat = self.delete(NatKind::Snat, mapping);
        let dnat = self.delete(NatKind::Dnat, mapping);
        snat.and(dnat)
    }

    fn teardown(&mut self) -> Result<(), RuleInstallError> {
        if self.backend == FirewallBackend::Nftables {
            run(&self.program, &["delete", "table", "ip", NFT_TABLE])?;
            tracing::debug!("nftables table deleted");
        }
        Ok(())
    }
}

/// Builds the iptables argument list for one half of a rule pair.
/// `action` is `-A` to append or `-D` to delete.
fn iptables_args(action: &str, kind: NatKind, m: &Mapping, detour_ip: Ipv4Addr) -> Vec<String> {
    let mut args: Vec<String> = ["-t", "nat", action, kind.iptables_chain(), "-s"]
        .iter()
        .map(ToString::to_string)
        .collect();
    args.push(m.client_ip.to_string());
    match kind {
        NatKind::Snat => args.extend([
            "-d".to_string(),
            m.remote_ip.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            m.remote_port.to_string(),
            "-j".to_string(),
            "SNAT".to_string(),
            "--to-source".to_string(),
            detour_ip.to_string(),
        ]),
        NatKind::Dnat => args.extend([
            "-d".to_string(),
            detour_ip.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            m.detour_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            m.remote().to_string(),
        ]),
    }
    args
}

fn nft_rule_body(kind: NatKind, m: &Mapping, detour_ip: Ipv4Addr) -> String {
    match kind {
        NatKind::Snat => format!(
            "ip saddr {} ip daddr {} tcp dport {} snat to {}",
            m.client_ip, m.remote_ip, m.remote_port, detour_ip
        ),
        NatKind::Dnat => format!(
            "ip saddr {} ip daddr {} tcp dport {} dnat to {}",
            m.client_ip,
            detour_ip,
            m.detour_port,
            m.remote()
        ),
    }
}

/// Substrings that identify a rule in `nft -a list` output. Each ends in a
/// space so `10.0.1.1` does not match `10.0.1.10`; listed rules always end
/// with `# handle N`.
fn nft_match_patterns(kind: NatKind, m: &Mapping, detour_ip: Ipv4Addr) -> Vec<String> {
    match kind {
        NatKind::Snat => vec![
            format!("ip saddr {} ", m.client_ip),
            format!("ip daddr {} ", m.remote_ip),
            format!("dport {} ", m.remote_port),
            "snat ".to_string(),
            format!(" {detour_ip} "),
        ],
        NatKind::Dnat => vec![
            format!("ip saddr {} ", m.client_ip),
            format!("ip daddr {detour_ip} "),
            format!("dport {} ", m.detour_port),
            "dnat ".to_string(),
            format!(" {} ", m.remote()),
        ],
    }
}

/// Extracts the handle number from an nftables rule line.
///
/// Line format: "... # handle 123"
fn extract_nft_handle(line: &str) -> Option<u64> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts
        .windows(2)
        .find(|w| w[0] == "handle")
        .and_then(|w| w[1].parse().ok())
}

/// Runs a packet-filter command, returning its standard output.
fn run(program: &Path, args: &[&str]) -> Result<String, RuleInstallError> {
    tracing::debug!("{} {}", program.display(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| RuleInstallError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(RuleInstallError::Command {
            command: format!("{} {}", program.display(), args.join(" ")),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A call observed by [`RecordingInstaller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerCall {
    Install(Mapping),
    Uninstall(Mapping),
}

/// [`RuleInstaller`] that records calls instead of touching the kernel.
///
/// Used for `--dry-run` and in tests. Clones share the same record, so a
/// handle kept by the caller observes calls made through the installer
/// owned by the server.
#[derive(Debug, Clone, Default)]
pub struct RecordingInstaller {
    calls: Arc<Mutex<Vec<InstallerCall>>>,
    failing_installs: Arc<AtomicUsize>,
    failing_uninstalls: Arc<AtomicUsize>,
}

impl RecordingInstaller {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` installs fail without being recorded.
    pub fn fail_next_installs(&self, n: usize) {
        self.failing_installs.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` uninstalls fail. The attempts are still recorded.
    pub fn fail_next_uninstalls(&self, n: usize) {
        self.failing_uninstalls.store(n, Ordering::SeqCst);
    }

    /// Returns every recorded call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<InstallerCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the mappings installed so far, in order.
    #[must_use]
    pub fn installed(&self) -> Vec<Mapping> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                InstallerCall::Install(m) => Some(m),
                InstallerCall::Uninstall(_) => None,
            })
            .collect()
    }

    /// Returns the mappings uninstalled (or attempted) so far, in order.
    #[must_use]
    pub fn uninstalled(&self) -> Vec<Mapping> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                InstallerCall::Uninstall(m) => Some(m),
                InstallerCall::Install(_) => None,
            })
            .collect()
    }

    fn take_failure(counter: &AtomicUsize, what: &str, mapping: &Mapping) -> Result<(), RuleInstallError> {
        if counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RuleInstallError::Command {
                command: format!("{what} {mapping}"),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, call: InstallerCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl RuleInstaller for RecordingInstaller {
    fn install(&mut self, mapping: &Mapping) -> Result<(), RuleInstallError> {
        Self::take_failure(&self.failing_installs, "install", mapping)?;
        tracing::info!(%mapping, "dry-run: NAT rule pair recorded");
        self.record(InstallerCall::Install(*mapping));
        Ok(())
    }

    fn uninstall(&mut self, mapping: &Mapping) -> Result<(), RuleInstallError> {
        self.record(InstallerCall::Uninstall(*mapping));
        Self::take_failure(&self.failing_uninstalls, "uninstall", mapping)?;
        tracing::info!(%mapping, "dry-run: NAT rule pair removal recorded");
        Ok(())
    }
}
