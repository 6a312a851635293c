//! Host network helpers.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

/// Returns the IPv4 address this host would use to reach `probe`.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel choose a
/// route and source address. The address of the default-route interface is
/// what clients see as the detour host.
///
/// # Errors
///
/// Returns an error if no route to `probe` exists or the chosen source is
/// not IPv4.
pub fn detect_local_ip(probe: SocketAddr) -> io::Result<Ipv4Addr> {
    let bind: SocketAddr = match probe {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("probe address {probe} is not IPv4"),
            ));
        }
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(probe)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable local IPv4 address (got {other})"),
        )),
    }
}

/// Enables IPv4 forwarding in the kernel.
///
/// NAT rewrites only take effect for forwarded packets, so the daemon turns
/// this on at startup.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be written (usually: not root).
pub fn enable_ip_forward() -> io::Result<()> {
    std::fs::write(IP_FORWARD, "1")?;
    tracing::debug!("IP forwarding enabled");
    Ok(())
}

/// Returns whether IPv4 forwarding is enabled.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be read.
pub fn ip_forward_enabled() -> io::Result<bool> {
    Ok(std::fs::read_to_string(IP_FORWARD)?.trim() == "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_local_ip_loopback_route() {
        let ip = detect_local_ip("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_detect_local_ip_rejects_ipv6_target() {
        let err = detect_local_ip("[::1]:53".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_ip_forward_enabled_reads_sysctl() {
        let Ok(raw) = std::fs::read_to_string(IP_FORWARD) else {
            return;
        };
        assert_eq!(ip_forward_enabled().unwrap(), raw.trim() == "1");
    }
}
