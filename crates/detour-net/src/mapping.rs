//! The unit of state managed by the daemon.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// One NAT redirection: traffic from `client_ip` to the detour host's
/// `detour_port` is forwarded to `remote_ip:remote_port`.
///
/// The detour host's own address is not stored here. It is fixed for the
/// lifetime of the daemon and held by the rule installer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping {
    /// Machine whose traffic is redirected.
    pub client_ip: Ipv4Addr,
    /// True destination address.
    pub remote_ip: Ipv4Addr,
    /// True destination port.
    pub remote_port: u16,
    /// Port on the detour host the client must connect to.
    pub detour_port: u16,
}

impl Mapping {
    /// Creates a new mapping.
    #[must_use]
    pub const fn new(
        client_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        detour_port: u16,
    ) -> Self {
        Self {
            client_ip,
            remote_ip,
            remote_port,
            detour_port,
        }
    }

    /// Returns the remote endpoint.
    #[must_use]
    pub const fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}:{} via {}",
            self.client_ip, self.remote_ip, self.remote_port, self.detour_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_display() {
        let m = Mapping::new(
            Ipv4Addr::new(10, 0, 1, 1),
            Ipv4Addr::new(10, 0, 3, 2),
            5201,
            49200,
        );
        assert_eq!(m.to_string(), "10.0.1.1 to 10.0.3.2:5201 via 49200");
        assert_eq!(m.remote(), "10.0.3.2:5201".parse().unwrap());
    }
}
