//! Gateway MAC resolution
//!
//! A route can only be programmed once the next hop's MAC is known, because
//! the installed flow rewrites the destination MAC. There is no "resolve now"
//! primitive, so on a miss the resolver pokes the gateway with a throwaway
//! TCP connection attempt (the kernel resolves the neighbor to send the SYN)
//! and polls the host table again after a short delay. The host table is
//! filled by the neighbor worker, which runs independently.

use crate::metrics::MetricsCollector;
use crate::shadow::ShadowTables;
use crate::types::{Interface, MacAddress};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Lookups before giving up on a gateway
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Delay between lookups
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Destination port of the probe connection
pub const DEFAULT_PROBE_PORT: u16 = 9;

/// Upper bound on a single probe connection attempt
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Side-effecting action that prompts the kernel to resolve `gateway`
///
/// The outcome is irrelevant; implementations must not block for long.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    async fn probe(&self, gateway: IpAddr, interface: &Interface);
}

/// Probe that fires a TCP connection attempt at the gateway
///
/// The attempt runs detached with its own timeout so a slow or black-holed
/// gateway never stretches the resolver's retry interval.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    port: u16,
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PORT, DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl GatewayProbe for TcpConnectProbe {
    async fn probe(&self, gateway: IpAddr, interface: &Interface) {
        let addr = probe_address(gateway, self.port, &interface.name);
        trace!(%addr, interface = %interface.name, "Probing gateway");
        let timeout = self.timeout;
        tokio::spawn(async move {
            let _ = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
        });
    }
}

/// Destination of the probe connection
///
/// IPv6 link-local gateways need the outgoing interface as scope id, or the
/// connect fails with EINVAL before any neighbor solicitation is sent.
fn probe_address(gateway: IpAddr, port: u16, interface: &str) -> SocketAddr {
    match gateway {
        IpAddr::V6(v6) if is_unicast_link_local(&v6) => {
            SocketAddr::V6(SocketAddrV6::new(v6, port, 0, interface_scope(interface)))
        }
        _ => SocketAddr::new(gateway, port),
    }
}

/// fe80::/10
fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(target_os = "linux")]
fn interface_scope(name: &str) -> u32 {
    match nix::net::if_::if_nametoindex(name) {
        Ok(index) => index,
        Err(e) => {
            debug!(interface = name, error = %e, "No ifindex for probe scope");
            0
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn interface_scope(_name: &str) -> u32 {
    0
}

/// Bounded-retry resolver for next-hop MAC addresses
pub struct GatewayResolver {
    probe: Box<dyn GatewayProbe>,
    max_attempts: u32,
    retry_interval: Duration,
}

impl GatewayResolver {
    pub fn new(probe: Box<dyn GatewayProbe>, max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            probe,
            max_attempts,
            retry_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Look up `gateway` in the host table, probing between misses
    ///
    /// Runs at most `max_attempts` lookups. The host table lock is taken per
    /// lookup only, never across the probe or the delay.
    pub async fn resolve(
        &self,
        tables: &ShadowTables,
        gateway: IpAddr,
        interface: &Interface,
        metrics: &MetricsCollector,
    ) -> Option<MacAddress> {
        let start = Instant::now();

        for attempt in 1..=self.max_attempts {
            if let Some(mac) = tables.lookup_host_mac(&gateway) {
                metrics.observe_resolution_latency(start.elapsed().as_secs_f64());
                debug!(%gateway, %mac, attempt, "Resolved gateway");
                return Some(mac);
            }

            self.probe.probe(gateway, interface).await;
            tokio::time::sleep(self.retry_interval).await;
        }

        metrics.record_resolution_failure();
        warn!(
            %gateway,
            interface = %interface.name,
            attempts = self.max_attempts,
            "Gateway resolution exhausted"
        );
        None
    }
}

impl Default for GatewayResolver {
    fn default() -> Self {
        Self::new(
            Box::new(TcpConnectProbe::default()),
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_RETRY_INTERVAL,
        )
    }
}
