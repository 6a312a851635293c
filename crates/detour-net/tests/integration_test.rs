//! End-to-end tests over a loopback control socket.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use detour_net::error::DetourError;
use detour_net::listeners::ListenerProbe;
use detour_net::protocol::{FRAME_LEN, Request, Response};
use detour_net::{DetourClient, DetourServer, Mapping, PortAllocator, RecordingInstaller, ServerStats};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct NoListeners;

impl ListenerProbe for NoListeners {
    fn is_listening(&self, _port: u16) -> io::Result<bool> {
        Ok(false)
    }
}

struct Daemon {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<detour_net::Result<ServerStats>>,
}

async fn start(recorder: &RecordingInstaller) -> Daemon {
    let allocator = PortAllocator::new(Box::new(NoListeners)).with_rng(StdRng::seed_from_u64(1));
    let server = DetourServer::new(recorder.clone(), allocator);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(socket, async {
        let _ = stopped.await;
    }));

    Daemon { addr, stop, task }
}

fn client(daemon: &Daemon) -> DetourClient {
    DetourClient::new(daemon.addr).with_timeout(Duration::from_secs(2))
}

fn remote(s: &str) -> SocketAddrV4 {
    s.parse().unwrap()
}

fn sorted(mut mappings: Vec<Mapping>) -> Vec<Mapping> {
    mappings.sort_by_key(|m| (m.client_ip, m.remote_ip, m.remote_port, m.detour_port));
    mappings
}

#[tokio::test]
async fn test_requests_over_loopback() {
    let recorder = RecordingInstaller::new();
    let daemon = start(&recorder).await;
    let client = client(&daemon);

    let first = client.request(remote("10.0.3.2:5201"), 5201).await.unwrap();
    assert_eq!(first, 5201);

    let again = client.request(remote("10.0.3.2:5201"), 5201).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(recorder.installed().len(), 1);

    let other = client.request(remote("10.0.3.3:5201"), 5201).await.unwrap();
    assert_ne!(other, 5201);

    daemon.stop.send(()).unwrap();
    let stats = daemon.task.await.unwrap().unwrap();
    assert_eq!(stats.installed, 2);
    assert_eq!(stats.echoed, 1);
    assert_eq!(sorted(recorder.uninstalled()), sorted(recorder.installed()));
}

#[tokio::test]
async fn test_malformed_datagrams_do_not_stop_daemon() {
    let recorder = RecordingInstaller::new();
    let daemon = start(&recorder).await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.send_to(b"not a frame", daemon.addr).await.unwrap();
    raw.send_to(&[0u8; FRAME_LEN], daemon.addr).await.unwrap();
    raw.send_to(&[0u8; 1024], daemon.addr).await.unwrap();

    // A valid request on the same socket is still answered.
    let frame = Request::frame(remote("10.0.3.2:80"), 0).encode();
    raw.send_to(&frame, daemon.addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), raw.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, daemon.addr);
    let response = Response::decode(&buf[..len]).unwrap();
    assert_eq!(response.remote(), remote("10.0.3.2:80"));

    daemon.stop.send(()).unwrap();
    let stats = daemon.task.await.unwrap().unwrap();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.installed, 1);
}

#[tokio::test]
async fn test_failed_install_times_out_client() {
    let recorder = RecordingInstaller::new();
    recorder.fail_next_installs(2);
    let daemon = start(&recorder).await;

    let client = DetourClient::new(daemon.addr)
        .with_timeout(Duration::from_millis(100))
        .with_attempts(2);
    let err = client.request(remote("10.0.3.2:5201"), 5201).await.unwrap_err();
    assert!(matches!(err, DetourError::NoResponse { .. }));

    // The daemon recovers once installs succeed again.
    let port = DetourClient::new(daemon.addr)
        .with_timeout(Duration::from_secs(2))
        .request(remote("10.0.3.2:5201"), 5201)
        .await
        .unwrap();
    assert_eq!(port, 5201);

    daemon.stop.send(()).unwrap();
    let stats = daemon.task.await.unwrap().unwrap();
    assert_eq!(stats.failed, 2);
}

#[tokio::test]
async fn test_aborted_server_still_cleans_up() {
    let recorder = RecordingInstaller::new();
    let daemon = start(&recorder).await;
    let client = client(&daemon);

    for i in 1..=3u8 {
        client
            .request(remote(&format!("10.0.3.{i}:443")), 0)
            .await
            .unwrap();
    }

    daemon.task.abort();
    assert!(daemon.task.await.unwrap_err().is_cancelled());
    assert_eq!(recorder.uninstalled().len(), 3);
    assert_eq!(sorted(recorder.uninstalled()), sorted(recorder.installed()));
}
