//! Flow-mod message model and translation from shadow entries
//!
//! A [`RouteMod`] is the hardware-programming command sent to the flow-table
//! server: one destination match, an ordered action list, and options.
//! Construction is pure; dispatch lives in [`crate::transport`].

use crate::types::{HostEntry, MacAddress, RouteEntry, max_prefix_len, prefix_len};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Base priority; the match prefix length is added on top
pub const DEFAULT_PRIORITY: u16 = 0x8000;

/// Idle timeout attached to IPv4 host flows (conventional ARP aging)
pub const HOST_IDLE_TIMEOUT_SECS: u16 = 60;

/// Operation carried by a [`RouteMod`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModType {
    Add,
    Delete,
}

/// Destination match criterion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Match {
    Ipv4 { addr: Ipv4Addr, mask: Ipv4Addr },
    Ipv6 { addr: Ipv6Addr, mask: Ipv6Addr },
}

impl Match {
    /// Build a destination match; `None` when address and mask families differ
    pub fn destination(addr: IpAddr, mask: IpAddr) -> Option<Self> {
        match (addr, mask) {
            (IpAddr::V4(addr), IpAddr::V4(mask)) => Some(Self::Ipv4 { addr, mask }),
            (IpAddr::V6(addr), IpAddr::V6(mask)) => Some(Self::Ipv6 { addr, mask }),
            _ => None,
        }
    }

    /// Prefix length of the mask in bits
    pub fn prefix_len(&self) -> u8 {
        match self {
            Self::Ipv4 { mask, .. } => prefix_len(&IpAddr::V4(*mask)),
            Self::Ipv6 { mask, .. } => prefix_len(&IpAddr::V6(*mask)),
        }
    }
}

impl std::fmt::Display for Match {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4 { addr, .. } => write!(f, "{}/{}", addr, self.prefix_len()),
            Self::Ipv6 { addr, .. } => write!(f, "{}/{}", addr, self.prefix_len()),
        }
    }
}

/// Rewrite and forwarding actions, applied in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Action {
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    Output(u32),
}

/// Flow options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FlowOption {
    Priority(u16),
    IdleTimeout(u16),
}

/// Hardware-programming command for the flow-table server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMod {
    #[serde(rename = "mod")]
    pub mod_type: ModType,
    /// Owner identity of the sending agent
    pub id: u64,
    pub matches: Vec<Match>,
    pub actions: Vec<Action>,
    pub options: Vec<FlowOption>,
}

impl RouteMod {
    pub fn new(mod_type: ModType, id: u64) -> Self {
        Self {
            mod_type,
            id,
            matches: Vec::new(),
            actions: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn add_match(&mut self, m: Match) {
        self.matches.push(m);
    }

    pub fn add_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub fn add_option(&mut self, o: FlowOption) {
        self.options.push(o);
    }

    pub fn priority(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            FlowOption::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn idle_timeout(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            FlowOption::IdleTimeout(t) => Some(*t),
            _ => None,
        })
    }

    /// Output port of the first output action
    pub fn output_port(&self) -> Option<u32> {
        self.actions.iter().find_map(|a| match a {
            Action::Output(p) => Some(*p),
            _ => None,
        })
    }
}

/// Priority for a match of `prefix_len` bits
///
/// Longer prefixes outrank shorter ones; exact host matches outrank all routes
/// of the same family.
pub fn priority_for(prefix_len: u8) -> u16 {
    DEFAULT_PRIORITY + u16::from(prefix_len)
}

/// Build the flow-mod for a route
///
/// `next_hop` is required for installs and ignored for removals, which carry
/// only the output action. Returns `None` when the route's address and mask
/// are of different families.
pub fn route_flow_mod(
    mod_type: ModType,
    agent_id: u64,
    route: &RouteEntry,
    next_hop: Option<MacAddress>,
) -> Option<RouteMod> {
    let m = Match::destination(route.address, route.netmask)?;
    let prefix = m.prefix_len();

    let mut msg = RouteMod::new(mod_type, agent_id);
    msg.add_match(m);

    if mod_type == ModType::Add {
        let next_hop = next_hop?;
        msg.add_action(Action::SetEthSrc(route.interface.hw_address));
        msg.add_action(Action::SetEthDst(next_hop));
    }
    msg.add_action(Action::Output(route.interface.port));
    msg.add_option(FlowOption::Priority(priority_for(prefix)));

    Some(msg)
}

/// Build the flow-mod for a host
pub fn host_flow_mod(mod_type: ModType, agent_id: u64, host: &HostEntry) -> RouteMod {
    let m = match host.address {
        IpAddr::V4(addr) => Match::Ipv4 {
            addr,
            mask: Ipv4Addr::BROADCAST,
        },
        IpAddr::V6(addr) => Match::Ipv6 {
            addr,
            mask: Ipv6Addr::from(u128::MAX),
        },
    };

    let mut msg = RouteMod::new(mod_type, agent_id);
    msg.add_match(m);

    if mod_type == ModType::Add {
        msg.add_action(Action::SetEthSrc(host.interface.hw_address));
        msg.add_action(Action::SetEthDst(host.hw_address));
    }
    msg.add_action(Action::Output(host.interface.port));
    msg.add_option(FlowOption::Priority(priority_for(max_prefix_len(&host.address))));

    if mod_type == ModType::Add && host.address.is_ipv4() {
        msg.add_option(FlowOption::IdleTimeout(HOST_IDLE_TIMEOUT_SECS));
    }

    msg
}
