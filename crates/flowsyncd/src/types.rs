//! Core types for flow-table synchronization
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Neighbors and routes as tracked components
//! - IA-3: Device Identification - MAC addresses for device identification

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// MAC address representation
///
/// # NIST Controls
/// - IA-3: Device Identification - MAC addresses for device identification
/// - AU-3: Content of Audit Records - MAC included in flow audit records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Zero MAC address
    pub const ZERO: Self = Self([0, 0, 0, 0, 0, 0]);

    /// Broadcast MAC address
    pub const BROADCAST: Self = Self([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build from a kernel link-layer address attribute
    ///
    /// Returns `None` unless the slice is exactly 6 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Error returned when a MAC address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacError(String);

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for ParseMacError {}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Parse from colon or dash separated hex (e.g., "00:11:22:33:44:55")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseMacError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 {
                return Err(ParseMacError(s.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Number of leading one bits in a network mask
pub fn prefix_len(mask: &IpAddr) -> u8 {
    let mut bits = 0;
    for byte in ip_bytes(mask) {
        bits += byte.leading_ones() as u8;
        if byte != 0xff {
            break;
        }
    }
    bits
}

/// Build the network mask of `prefix_len` bits for the family of `family`
///
/// Lengths beyond the family width saturate to a full mask.
pub fn netmask(family: &IpAddr, prefix_len: u8) -> IpAddr {
    match family {
        IpAddr::V4(_) => {
            let bits = u32::from(prefix_len.min(32));
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(mask))
        }
        IpAddr::V6(_) => {
            let bits = u32::from(prefix_len.min(128));
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(mask))
        }
    }
}

/// Width of the address family in bits (32 or 128)
pub fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Network-order bytes of an address (4 or 16 bytes)
pub fn ip_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

/// An interface the agent is responsible for
///
/// Supplied by configuration at startup and never mutated by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Kernel interface name (e.g., "eth0")
    pub name: String,
    /// Forwarding port on the datapath
    pub port: u32,
    /// The interface's own hardware address
    pub hw_address: MacAddress,
    /// Administrative state
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A resolved neighbor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: IpAddr,
    pub hw_address: MacAddress,
    pub interface: Interface,
}

/// A next-hop route mirrored from the main routing table
///
/// Equality is structural on (address, netmask, gateway); the interface does
/// not participate.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Destination network
    pub address: IpAddr,
    pub netmask: IpAddr,
    /// Next hop
    pub gateway: IpAddr,
    pub interface: Interface,
}

impl RouteEntry {
    pub fn prefix_len(&self) -> u8 {
        prefix_len(&self.netmask)
    }
}

impl PartialEq for RouteEntry {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.netmask == other.netmask
            && self.gateway == other.gateway
    }
}

impl Eq for RouteEntry {}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} via {} dev {}",
            self.address,
            self.prefix_len(),
            self.gateway,
            self.interface.name
        )
    }
}

/// Netlink message type for neighbor operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborMessageType {
    /// New neighbor or update (RTM_NEWNEIGH)
    New,
    /// Neighbor deleted (RTM_DELNEIGH)
    Delete,
}

/// Netlink message type for route operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMessageType {
    /// RTM_NEWROUTE
    New,
    /// RTM_DELROUTE
    Delete,
}

/// A decoded neighbor-table notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEvent {
    pub kind: NeighborMessageType,
    /// Interface name (resolved from ifindex)
    pub interface: String,
    pub address: IpAddr,
    /// Link-layer address, absent on most deletes and unresolved neighbors
    pub hw_address: Option<MacAddress>,
}

/// A decoded route-table notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEvent {
    pub kind: RouteMessageType,
    /// Routing table id (RT_TABLE_MAIN = 254)
    pub table: u32,
    /// Destination network, the unspecified address for default routes
    pub destination: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    /// Outgoing interface name
    pub interface: Option<String>,
}

/// A decoded kernel notification of either kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Neighbor(NeighborEvent),
    Route(RouteEvent),
}

/// Kernel main routing table id
pub const RT_TABLE_MAIN: u32 = 254;
