//! Live TCP listener lookup.
//!
//! A detour port must not shadow a real service on the detour host: a DNAT
//! rule for that port would hijack the client's connections to it. This
//! module answers "is something listening on port N on a non-loopback
//! address" by reading the kernel socket tables in `/proc/net`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// `st` column value for sockets in the LISTEN state.
const TCP_LISTEN: &str = "0A";

/// Source of live listening-socket state.
pub trait ListenerProbe: Send {
    /// Returns true if a TCP server is listening on `port` on any
    /// non-loopback address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket table cannot be read.
    fn is_listening(&self, port: u16) -> io::Result<bool>;
}

/// [`ListenerProbe`] backed by `/proc/net/tcp` and `/proc/net/tcp6`.
#[derive(Debug, Clone)]
pub struct ProcNetListeners {
    tables: Vec<PathBuf>,
}

impl Default for ProcNetListeners {
    fn default() -> Self {
        Self::with_tables(vec![
            PathBuf::from("/proc/net/tcp"),
            PathBuf::from("/proc/net/tcp6"),
        ])
    }
}

impl ProcNetListeners {
    /// Reads the given socket tables instead of the system ones.
    ///
    /// A table that does not exist is skipped (e.g. `tcp6` on hosts with
    /// IPv6 disabled).
    #[must_use]
    pub fn with_tables(tables: Vec<PathBuf>) -> Self {
        Self { tables }
    }

    /// Returns every non-loopback listening port across all tables.
    ///
    /// # Errors
    ///
    /// Returns an error if a table exists but cannot be read.
    pub fn listening_ports(&self) -> io::Result<Vec<u16>> {
        let mut ports = Vec::new();
        for table in &self.tables {
            let contents = match std::fs::read_to_string(table) {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            ports.extend(
                contents
                    .lines()
                    .skip(1)
                    .filter_map(parse_listener)
                    .filter(|(addr, _)| !is_loopback(*addr))
                    .map(|(_, port)| port),
            );
        }
        Ok(ports)
    }
}

impl ListenerProbe for ProcNetListeners {
    fn is_listening(&self, port: u16) -> io::Result<bool> {
        Ok(self.listening_ports()?.contains(&port))
    }
}

/// Parses one socket table row, returning the local endpoint of a LISTEN
/// socket. Other states and unparseable rows yield `None`.
///
/// Row format: `sl local_address rem_address st ...`, where the local address
/// is `ADDR:PORT` in hex and ADDR is a sequence of native-endian 32-bit words.
fn parse_listener(line: &str) -> Option<(IpAddr, u16)> {
    let mut fields = line.split_whitespace();
    let local = fields.nth(1)?;
    let state = fields.nth(1)?;
    if state != TCP_LISTEN {
        return None;
    }

    let (addr, port) = local.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let addr = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(parse_word(addr)?)),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&parse_word(addr.get(i * 8..i * 8 + 8)?)?);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some((addr, port))
}

fn parse_word(hex: &str) -> Option<[u8; 4]> {
    u32::from_str_radix(hex, 16).ok().map(u32::to_ne_bytes)
}

fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}
