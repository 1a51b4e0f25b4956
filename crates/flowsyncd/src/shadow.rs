//! Shadow copies of the kernel host (neighbor) and route tables
//!
//! Each table sits behind its own lock. Every scan-and-mutate sequence is a
//! single method call so the lock is held for the whole sequence and never
//! across an await point.

use crate::types::{HostEntry, MacAddress, RouteEntry};
use parking_lot::Mutex;
use std::net::IpAddr;
use tracing::debug;

/// Outcome of inserting a host entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostUpsert {
    /// No entry existed for the address
    Inserted,
    /// An entry existed with a different MAC or interface and was replaced
    Replaced(HostEntry),
    /// An identical entry already existed
    Unchanged,
}

/// In-memory host and route tables shared by both event workers
#[derive(Debug, Default)]
pub struct ShadowTables {
    hosts: Mutex<Vec<HostEntry>>,
    routes: Mutex<Vec<RouteEntry>>,
}

impl ShadowTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a host, keeping at most one entry per address
    pub fn upsert_host(&self, entry: HostEntry) -> HostUpsert {
        let mut hosts = self.hosts.lock();
        match hosts.iter_mut().find(|h| h.address == entry.address) {
            Some(existing) if *existing == entry => HostUpsert::Unchanged,
            Some(existing) => HostUpsert::Replaced(std::mem::replace(existing, entry)),
            None => {
                hosts.push(entry);
                HostUpsert::Inserted
            }
        }
    }

    /// Remove and return the host entry for `address`
    pub fn remove_host(&self, address: &IpAddr) -> Option<HostEntry> {
        let mut hosts = self.hosts.lock();
        let pos = hosts.iter().position(|h| h.address == *address)?;
        Some(hosts.remove(pos))
    }

    /// Hardware address of the neighbor at `address`, if resolved
    pub fn lookup_host_mac(&self, address: &IpAddr) -> Option<MacAddress> {
        self.hosts
            .lock()
            .iter()
            .find(|h| h.address == *address)
            .map(|h| h.hw_address)
    }

    /// Append a route unless a structurally identical one exists
    ///
    /// Returns `false` for a duplicate.
    pub fn insert_route(&self, entry: RouteEntry) -> bool {
        let mut routes = self.routes.lock();
        if routes.iter().any(|r| *r == entry) {
            return false;
        }
        routes.push(entry);
        true
    }

    /// Remove and return the route structurally identical to `entry`
    pub fn remove_route(&self, entry: &RouteEntry) -> Option<RouteEntry> {
        let mut routes = self.routes.lock();
        let pos = routes.iter().position(|r| r == entry)?;
        Some(routes.remove(pos))
    }

    pub fn contains_route(&self, entry: &RouteEntry) -> bool {
        self.routes.lock().iter().any(|r| r == entry)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    /// Empty both tables
    ///
    /// Does not touch flows already programmed into the datapath.
    pub fn clear(&self) {
        let mut hosts = self.hosts.lock();
        let mut routes = self.routes.lock();
        debug!(
            hosts = hosts.len(),
            routes = routes.len(),
            "Clearing shadow tables"
        );
        hosts.clear();
        routes.clear();
    }
}
