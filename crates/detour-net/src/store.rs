//! Active mapping table.
//!
//! [`RuleStore`] is the single source of truth for which NAT rule pairs the
//! daemon has installed. Mappings are indexed two ways, each with O(1)
//! lookup:
//!
//! - by `(client_ip, detour_port)`: a client may hold a detour port at most
//!   once, otherwise two DNAT rules would match the same traffic;
//! - by `(client_ip, remote)`: repeated requests for the same server from the
//!   same client resolve to the existing mapping.

use std::net::{Ipv4Addr, SocketAddrV4};

use hashbrown::{HashMap, HashSet};

use crate::error::StoreError;
use crate::mapping::Mapping;

/// In-memory index of installed mappings.
#[derive(Debug, Default)]
pub struct RuleStore {
    by_port: HashMap<(Ipv4Addr, u16), Mapping>,
    by_remote: HashMap<(Ipv4Addr, SocketAddrV4), Mapping>,
    entries: HashSet<Mapping>,
}

impl RuleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the client's existing mapping for `remote`, if any.
    #[must_use]
    pub fn find_by_remote(&self, client_ip: Ipv4Addr, remote: SocketAddrV4) -> Option<Mapping> {
        self.by_remote.get(&(client_ip, remote)).copied()
    }

    /// Returns true if the client already uses `detour_port`.
    #[must_use]
    pub fn port_in_use_by_client(&self, client_ip: Ipv4Addr, detour_port: u16) -> bool {
        self.by_port.contains_key(&(client_ip, detour_port))
    }

    /// Adds a mapping to every index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the mapping would share a detour port or a
    /// remote endpoint with an existing mapping of the same client. The store
    /// is left unchanged in that case.
    pub fn insert(&mut self, mapping: Mapping) -> Result<(), StoreError> {
        if self.port_in_use_by_client(mapping.client_ip, mapping.detour_port) {
            return Err(StoreError::PortTaken {
                client: mapping.client_ip,
                detour_port: mapping.detour_port,
            });
        }
        if self.by_remote.contains_key(&(mapping.client_ip, mapping.remote())) {
            return Err(StoreError::RemoteTaken {
                client: mapping.client_ip,
                remote: mapping.remote(),
            });
        }

        self.by_port
            .insert((mapping.client_ip, mapping.detour_port), mapping);
        self.by_remote
            .insert((mapping.client_ip, mapping.remote()), mapping);
        self.entries.insert(mapping);
        Ok(())
    }

    /// Removes a mapping from every index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] if the exact mapping is not stored.
    pub fn remove(&mut self, mapping: &Mapping) -> Result<(), StoreError> {
        if !self.entries.remove(mapping) {
            return Err(StoreError::Missing(*mapping));
        }
        self.by_port
            .remove(&(mapping.client_ip, mapping.detour_port));
        self.by_remote
            .remove(&(mapping.client_ip, mapping.remote()));
        Ok(())
    }

    /// Iterates over every stored mapping in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &Mapping> + '_ {
        self.entries.iter()
    }

    /// Returns the number of stored mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_A: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const CLIENT_B: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 2);

    fn mapping(client: Ipv4Addr, remote: &str, detour_port: u16) -> Mapping {
        let remote: SocketAddrV4 = remote.parse().unwrap();
        Mapping::new(client, *remote.ip(), remote.port(), detour_port)
    }

    #[test]
    fn test_insert_indexes_both_ways() {
        let mut store = RuleStore::new();
        let m = mapping(CLIENT_A, "10.0.3.2:5201", 5201);
        store.insert(m).unwrap();

        assert_eq!(
            store.find_by_remote(CLIENT_A, "10.0.3.2:5201".parse().unwrap()),
            Some(m)
        );
        assert!(store.port_in_use_by_client(CLIENT_A, 5201));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_indices_are_per_client() {
        let mut store = RuleStore::new();
        store
            .insert(mapping(CLIENT_A, "10.0.3.2:5201", 5201))
            .unwrap();

        assert!(!store.port_in_use_by_client(CLIENT_B, 5201));
        assert!(store
            .find_by_remote(CLIENT_B, "10.0.3.2:5201".parse().unwrap())
            .is_none());
        store
            .insert(mapping(CLIENT_B, "10.0.3.2:5201", 5201))
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_insert_rejects_port_collision() {
        let mut store = RuleStore::new();
        store
            .insert(mapping(CLIENT_A, "10.0.3.2:5201", 5201))
            .unwrap();

        let err = store
            .insert(mapping(CLIENT_A, "10.0.3.3:5201", 5201))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::PortTaken {
                client: CLIENT_A,
                detour_port: 5201
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_rejects_duplicate_remote() {
        let mut store = RuleStore::new();
        store
            .insert(mapping(CLIENT_A, "10.0.3.2:5201", 5201))
            .unwrap();

        let err = store
            .insert(mapping(CLIENT_A, "10.0.3.2:5201", 50000))
            .unwrap_err();
        assert!(matches!(err, StoreError::RemoteTaken { .. }));
        assert!(!store.port_in_use_by_client(CLIENT_A, 50000));
    }

    #[test]
    fn test_remove_clears_all_indices() {
        let mut store = RuleStore::new();
        let m = mapping(CLIENT_A, "10.0.3.2:5201", 5201);
        store.insert(m).unwrap();
        store.remove(&m).unwrap();

        assert!(store.is_empty());
        assert!(!store.port_in_use_by_client(CLIENT_A, 5201));
        assert!(store.find_by_remote(CLIENT_A, m.remote()).is_none());
        // Both slots are free again.
        store.insert(m).unwrap();
    }

    #[test]
    fn test_remove_missing_fails() {
        let mut store = RuleStore::new();
        let m = mapping(CLIENT_A, "10.0.3.2:5201", 5201);
        assert_eq!(store.remove(&m), Err(StoreError::Missing(m)));

        store.insert(m).unwrap();
        let other_port = Mapping { detour_port: 5202, ..m };
        assert!(store.remove(&other_port).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_all_lists_every_mapping() {
        let mut store = RuleStore::new();
        let a = mapping(CLIENT_A, "10.0.3.2:5201", 5201);
        let b = mapping(CLIENT_A, "10.0.3.3:5201", 50001);
        let c = mapping(CLIENT_B, "10.0.3.2:5201", 5201);
        for m in [a, b, c] {
            store.insert(m).unwrap();
        }

        let mut all: Vec<Mapping> = store.all().copied().collect();
        all.sort_by_key(|m| (m.client_ip, m.detour_port));
        assert_eq!(all, vec![a, b, c]);
    }
}
