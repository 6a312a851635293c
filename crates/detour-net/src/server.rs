//! Detour control loop.
//!
//! The daemon handles one datagram at a time to completion:
//!
//! ```text
//! RECEIVED -> PARSED -> RESOLVED -> ECHOED | INSTALLED -> RESPONDED
//! ```
//!
//! A request for a remote endpoint the client already has a mapping for is
//! answered from the store (ECHOED). Otherwise the client's preferred port
//! is kept if it is usable, a fresh one is allocated if not, and the NAT
//! rule pair is installed before the mapping is recorded (INSTALLED).
//!
//! Failed requests are logged and dropped without a reply; the client's
//! timeout is the only failure signal the protocol has.
//!
//! The server owns every rule it installs. Whatever way it goes out of scope
//! (normal shutdown, an error returned from [`DetourServer::serve`], a
//! panic, or the serve future being dropped), the remaining rules are
//! uninstalled.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{DetourError, ProtocolError, Result};
use crate::firewall::RuleInstaller;
use crate::mapping::Mapping;
use crate::port_alloc::PortAllocator;
use crate::protocol::{Request, Response};
use crate::store::RuleStore;

/// Receive buffer size. Anything longer than a frame is rejected anyway.
const RECV_BUF_LEN: usize = 512;

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client already had a mapping for this remote.
    Echoed(Mapping),
    /// A new rule pair was installed.
    Installed {
        mapping: Mapping,
        /// Port the client asked for.
        requested: u16,
    },
}

impl Outcome {
    /// Returns the mapping the client is answered with.
    #[must_use]
    pub const fn mapping(&self) -> Mapping {
        match self {
            Self::Echoed(mapping) | Self::Installed { mapping, .. } => *mapping,
        }
    }
}

/// Request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Datagrams received.
    pub received: u64,
    /// Datagrams dropped as malformed.
    pub dropped: u64,
    /// Requests answered from an existing mapping.
    pub echoed: u64,
    /// Requests that installed a new mapping.
    pub installed: u64,
    /// Well-formed requests that could not be served.
    pub failed: u64,
}

/// Detour control server.
pub struct DetourServer<I: RuleInstaller> {
    store: RuleStore,
    allocator: PortAllocator,
    installer: I,
    stats: ServerStats,
    finished: bool,
}

impl<I: RuleInstaller> DetourServer<I> {
    /// Creates a server with an empty rule store.
    #[must_use]
    pub fn new(installer: I, allocator: PortAllocator) -> Self {
        Self {
            store: RuleStore::new(),
            allocator,
            installer,
            stats: ServerStats::default(),
            finished: false,
        }
    }

    /// Returns the active mappings.
    #[must_use]
    pub const fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Returns the request counters.
    #[must_use]
    pub const fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Resolves a decoded request to a mapping, installing rules if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if no port could be allocated, the listener probe
    /// failed, or the rules could not be installed. Nothing is left
    /// installed or recorded in that case.
    pub fn resolve(&mut self, request: &Request) -> Result<Outcome> {
        if let Some(existing) = self.store.find_by_remote(request.client_ip, request.remote()) {
            return Ok(Outcome::Echoed(existing));
        }

        let detour_port = if self.hint_usable(request)? {
            request.detour_port
        } else {
            self.allocator.allocate(&self.store, request.client_ip)?
        };

        let mapping = Mapping::new(
            request.client_ip,
            request.remote_ip,
            request.remote_port,
            detour_port,
        );
        self.installer.install(&mapping)?;

        if let Err(e) = self.store.insert(mapping) {
            if let Err(undo) = self.installer.uninstall(&mapping) {
                tracing::error!(%mapping, error = %undo, "failed to remove unrecorded NAT rules");
            }
            return Err(e.into());
        }

        Ok(Outcome::Installed {
            mapping,
            requested: request.detour_port,
        })
    }

    /// The client's preferred port is kept unless it is zero, already held
    /// by the client, or owned by a live service.
    fn hint_usable(&self, request: &Request) -> Result<bool> {
        let port = request.detour_port;
        if port == 0 || self.store.port_in_use_by_client(request.client_ip, port) {
            return Ok(false);
        }
        Ok(!self.allocator.is_restricted(port)?)
    }

    /// Handles one inbound datagram, returning the reply to send to `src`.
    ///
    /// Never fails: malformed and unserviceable requests are logged and
    /// yield `None`.
    pub fn handle_datagram(&mut self, buf: &[u8], src: SocketAddr) -> Option<Response> {
        self.stats.received += 1;

        let request = match client_ip(src).and_then(|ip| Request::decode(buf, ip)) {
            Ok(request) => request,
            Err(e) => {
                self.stats.dropped += 1;
                tracing::warn!(%src, error = %e, "dropping malformed control datagram");
                return None;
            }
        };

        match self.resolve(&request) {
            Ok(outcome) => {
                let mapping = outcome.mapping();
                match outcome {
                    Outcome::Echoed(_) => {
                        self.stats.echoed += 1;
                        tracing::info!(proposed = request.detour_port, "ECHO {mapping}");
                    }
                    Outcome::Installed { requested, .. } => {
                        self.stats.installed += 1;
                        tracing::info!(proposed = requested, "ADD {mapping}");
                    }
                }
                Some(Response::for_mapping(&mapping))
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!(
                    client = %request.client_ip,
                    remote = %request.remote(),
                    proposed = request.detour_port,
                    error = %e,
                    "dropping detour request"
                );
                None
            }
        }
    }

    /// Serves requests on `socket` until `shutdown` completes, then removes
    /// every installed rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails with a non-transient error.
    /// Rules are removed in that case too.
    pub async fn serve<F>(mut self, socket: UdpSocket, shutdown: F) -> Result<ServerStats>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = socket.local_addr() {
            tracing::info!(%addr, "detour control socket listening");
        }

        tokio::pin!(shutdown);
        let mut buf = [0u8; RECV_BUF_LEN];

        let result = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                recv = socket.recv_from(&mut buf) => match recv {
                    Ok((len, src)) => {
                        let Some(response) = self.handle_datagram(&buf[..len], src) else {
                            continue;
                        };
                        if let Err(e) = socket.send_to(&response.encode(), src).await {
                            tracing::warn!(%src, error = %e, "failed to send response");
                        }
                    }
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "transient receive error");
                    }
                    Err(e) => break Err(DetourError::Io(e)),
                },
            }
        };

        let stats = self.shutdown();
        result.map(|()| stats)
    }

    /// Uninstalls every remaining mapping and releases installer state.
    ///
    /// Safe to call more than once; later calls only return the counters.
    pub fn shutdown(&mut self) -> ServerStats {
        if self.finished {
            return self.stats;
        }
        self.finished = true;

        let mappings: Vec<Mapping> = self.store.all().copied().collect();
        tracing::info!(count = mappings.len(), "removing detour rules");
        for mapping in &mappings {
            if let Err(e) = self.installer.uninstall(mapping) {
                tracing::warn!(%mapping, error = %e, "failed to remove NAT rules");
            }
            if let Err(e) = self.store.remove(mapping) {
                tracing::error!(error = %e, "rule store out of sync");
            }
            tracing::info!("DEL {mapping}");
        }
        if let Err(e) = self.installer.teardown() {
            tracing::warn!(error = %e, "firewall teardown failed");
        }

        let ServerStats {
            received,
            dropped,
            echoed,
            installed,
            failed,
        } = self.stats;
        tracing::info!(received, dropped, echoed, installed, failed, "detour server stopped");
        self.stats
    }
}

impl<I: RuleInstaller> Drop for DetourServer<I> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<I: RuleInstaller> std::fmt::Debug for DetourServer<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetourServer")
            .field("mappings", &self.store.len())
            .field("allocator", &self.allocator)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn client_ip(src: SocketAddr) -> std::result::Result<Ipv4Addr, ProtocolError> {
    match src {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(ProtocolError::NonIpv4Sender(src)),
    }
}

/// Receive errors that concern a single datagram rather than the socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::RecordingInstaller;
    use crate::listeners::ListenerProbe;
    use crate::port_alloc::EPHEMERAL_PORTS;
    use crate::protocol::FRAME_LEN;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const OTHER_CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 2);

    struct Listening(Vec<u16>);

    impl ListenerProbe for Listening {
        fn is_listening(&self, port: u16) -> io::Result<bool> {
            Ok(self.0.contains(&port))
        }
    }

    fn allocator(listening: &[u16]) -> PortAllocator {
        PortAllocator::new(Box::new(Listening(listening.to_vec())))
            .with_rng(StdRng::seed_from_u64(42))
    }

    fn server(recorder: &RecordingInstaller) -> DetourServer<RecordingInstaller> {
        DetourServer::new(recorder.clone(), allocator(&[]))
    }

    fn src(client: Ipv4Addr) -> SocketAddr {
        SocketAddr::from((client, 40000))
    }

    fn request(remote: &str, hint: u16) -> [u8; FRAME_LEN] {
        Request::frame(remote.parse().unwrap(), hint).encode()
    }

    fn ask(
        server: &mut DetourServer<RecordingInstaller>,
        client: Ipv4Addr,
        remote: &str,
        hint: u16,
    ) -> Option<Response> {
        server.handle_datagram(&request(remote, hint), src(client))
    }

    fn sorted(mut mappings: Vec<Mapping>) -> Vec<Mapping> {
        mappings.sort_by_key(|m| (m.client_ip, m.remote_ip, m.remote_port, m.detour_port));
        mappings
    }

    #[test]
    fn test_scenario() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        let first = ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).unwrap();
        assert_eq!(first.detour_port, 5201);
        assert_eq!(first.remote(), "10.0.3.2:5201".parse().unwrap());
        assert_eq!(server.store().len(), 1);
        assert_eq!(
            recorder.installed(),
            vec![Mapping::new(CLIENT, Ipv4Addr::new(10, 0, 3, 2), 5201, 5201)]
        );

        let second = ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).unwrap();
        assert_eq!(second, first);
        assert_eq!(recorder.installed().len(), 1);

        let third = ask(&mut server, CLIENT, "10.0.3.3:5201", 5201).unwrap();
        assert_ne!(third.detour_port, 5201);
        assert!(EPHEMERAL_PORTS.contains(&third.detour_port));
        assert_eq!(server.store().len(), 2);

        let stats = server.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.installed, 2);
        assert_eq!(stats.echoed, 1);
    }

    #[test]
    fn test_repeat_echoes_even_with_different_hint() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        let first = ask(&mut server, CLIENT, "10.0.3.2:5201", 0).unwrap();
        let again = ask(&mut server, CLIENT, "10.0.3.2:5201", 6000).unwrap();
        assert_eq!(again.detour_port, first.detour_port);
        assert_eq!(recorder.installed().len(), 1);
    }

    #[test]
    fn test_clients_are_isolated() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        let a = ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).unwrap();
        let b = ask(&mut server, OTHER_CLIENT, "10.0.3.9:80", 5201).unwrap();

        // DNAT rules match on the client address, so equal ports do not
        // collide across clients.
        assert_eq!(a.detour_port, 5201);
        assert_eq!(b.detour_port, 5201);
        assert_eq!(server.store().len(), 2);
        assert!(server
            .store()
            .find_by_remote(CLIENT, "10.0.3.9:80".parse().unwrap())
            .is_none());
    }

    #[test]
    fn test_collision_reallocates() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        ask(&mut server, CLIENT, "10.0.3.2:5201", 50000).unwrap();
        let second = ask(&mut server, CLIENT, "10.0.3.2:5202", 50000).unwrap();
        assert_ne!(second.detour_port, 50000);
    }

    #[test]
    fn test_zero_hint_is_allocated() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        let response = ask(&mut server, CLIENT, "10.0.3.2:5201", 0).unwrap();
        assert!(EPHEMERAL_PORTS.contains(&response.detour_port));
    }

    #[test]
    fn test_restricted_hint_is_reallocated() {
        let recorder = RecordingInstaller::new();
        let mut server = DetourServer::new(recorder.clone(), allocator(&[22]));

        let response = ask(&mut server, CLIENT, "10.0.3.2:22", 22).unwrap();
        assert_ne!(response.detour_port, 22);
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        assert!(server.handle_datagram(b"hello", src(CLIENT)).is_none());
        let mut bad_version = request("10.0.3.2:5201", 5201);
        bad_version[0] = 9;
        assert!(server.handle_datagram(&bad_version, src(CLIENT)).is_none());
        let response = Response::for_mapping(&Mapping::new(CLIENT, CLIENT, 1, 1)).encode();
        assert!(server.handle_datagram(&response, src(CLIENT)).is_none());

        assert_eq!(server.stats().dropped, 3);
        assert!(server.store().is_empty());
        assert!(recorder.calls().is_empty());

        // Still serving.
        assert!(ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).is_some());
    }

    #[test]
    fn test_ipv6_sender_is_dropped() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        let v6: SocketAddr = "[2001:db8::1]:40000".parse().unwrap();
        assert!(server
            .handle_datagram(&request("10.0.3.2:5201", 5201), v6)
            .is_none());
        assert_eq!(server.stats().dropped, 1);
    }

    #[test]
    fn test_install_failure_leaves_no_state() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);
        recorder.fail_next_installs(1);

        assert!(ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).is_none());
        assert!(server.store().is_empty());
        assert_eq!(server.stats().failed, 1);

        let retry = ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).unwrap();
        assert_eq!(retry.detour_port, 5201);
    }

    #[test]
    fn test_exhaustion_drops_request() {
        let recorder = RecordingInstaller::new();
        let alloc = allocator(&[])
            .with_range(50000..=50000)
            .with_max_attempts(8);
        let mut server = DetourServer::new(recorder.clone(), alloc);

        ask(&mut server, CLIENT, "10.0.3.2:5201", 50000).unwrap();
        assert!(ask(&mut server, CLIENT, "10.0.3.3:5201", 50000).is_none());
        assert_eq!(server.stats().failed, 1);
        assert_eq!(server.store().len(), 1);

        // Other clients are unaffected.
        assert!(ask(&mut server, OTHER_CLIENT, "10.0.3.3:5201", 50000).is_some());
    }

    #[test]
    fn test_shutdown_uninstalls_every_mapping() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        for i in 1..=5u8 {
            let remote = format!("10.0.3.{i}:5201");
            ask(&mut server, CLIENT, &remote, 5201).unwrap();
        }
        ask(&mut server, OTHER_CLIENT, "10.0.3.1:5201", 5201).unwrap();
        let stats = server.shutdown();

        assert_eq!(stats.installed, 6);
        assert!(server.store().is_empty());
        assert_eq!(sorted(recorder.uninstalled()), sorted(recorder.installed()));

        // A second shutdown and the drop do not uninstall again.
        server.shutdown();
        drop(server);
        assert_eq!(recorder.uninstalled().len(), 6);
    }

    #[test]
    fn test_shutdown_continues_past_failed_uninstall() {
        let recorder = RecordingInstaller::new();
        let mut server = server(&recorder);

        for i in 1..=3u8 {
            let remote = format!("10.0.3.{i}:5201");
            ask(&mut server, CLIENT, &remote, 0).unwrap();
        }
        recorder.fail_next_uninstalls(2);
        server.shutdown();

        assert!(server.store().is_empty());
        assert_eq!(recorder.uninstalled().len(), 3);
        assert_eq!(sorted(recorder.uninstalled()), sorted(recorder.installed()));
    }

    #[test]
    fn test_drop_uninstalls() {
        let recorder = RecordingInstaller::new();
        {
            let mut server = server(&recorder);
            ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).unwrap();
            ask(&mut server, CLIENT, "10.0.3.3:5201", 5201).unwrap();
        }
        assert_eq!(recorder.uninstalled().len(), 2);
        assert_eq!(sorted(recorder.uninstalled()), sorted(recorder.installed()));
    }

    #[test]
    fn test_panic_still_uninstalls() {
        let recorder = RecordingInstaller::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut server = server(&recorder);
            ask(&mut server, CLIENT, "10.0.3.2:5201", 5201).unwrap();
            panic!("request handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(recorder.uninstalled(), recorder.installed());
        assert_eq!(recorder.uninstalled().len(), 1);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
