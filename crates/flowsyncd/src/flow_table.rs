//! FlowTable - kernel table to flow-table synchronization
//!
//! Owns the shadow tables, the interface directory, the down-port set and the
//! transport handle. One instance is built at startup and shared by the
//! neighbor and route workers through an `Arc`.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Neighbor and route table monitoring
//! - AU-12: Audit Record Generation - Log every install, remove and discard
//! - CM-8: System Component Inventory - Track neighbors and next hops

use crate::error::{FlowsyncError, Result};
use crate::flow_mod::{ModType, RouteMod, host_flow_mod, route_flow_mod};
use crate::metrics::MetricsCollector;
use crate::netlink::AsyncNetlinkSocket;
use crate::resolver::GatewayResolver;
use crate::shadow::{HostUpsert, ShadowTables};
use crate::transport::{CLIENT_SERVER_CHANNEL, FlowModTransport, SERVER_ID};
use crate::types::{
    HostEntry, Interface, KernelEvent, MacAddress, NeighborEvent, NeighborMessageType, RT_TABLE_MAIN,
    RouteEntry, RouteEvent, RouteMessageType, netmask,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Forwarding ports that are administratively down
///
/// Owned by whoever tracks port state; the synchronizer only reads it. Clones
/// share the same set.
#[derive(Debug, Clone, Default)]
pub struct DownPorts(Arc<RwLock<HashSet<u32>>>);

impl DownPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, port: u32) -> bool {
        self.0.read().contains(&port)
    }

    pub fn set_down(&self, port: u32) {
        self.0.write().insert(port);
    }

    pub fn set_up(&self, port: u32) {
        self.0.write().remove(&port);
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl FromIterator<u32> for DownPorts {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(Arc::new(RwLock::new(iter.into_iter().collect())))
    }
}

/// The synchronizer
pub struct FlowTable {
    agent_id: u64,
    interfaces: HashMap<String, Interface>,
    down_ports: DownPorts,
    transport: Arc<dyn FlowModTransport>,
    resolver: GatewayResolver,
    tables: ShadowTables,
    metrics: MetricsCollector,
    channel: String,
    server_id: String,
}

impl FlowTable {
    /// Create a synchronizer with the default resolver and addressing
    pub fn new(
        agent_id: u64,
        interfaces: impl IntoIterator<Item = Interface>,
        transport: Arc<dyn FlowModTransport>,
        down_ports: DownPorts,
    ) -> Self {
        let interfaces = interfaces
            .into_iter()
            .map(|iface| (iface.name.clone(), iface))
            .collect();

        Self {
            agent_id,
            interfaces,
            down_ports,
            transport,
            resolver: GatewayResolver::default(),
            tables: ShadowTables::new(),
            metrics: MetricsCollector::default(),
            channel: CLIENT_SERVER_CHANNEL.to_string(),
            server_id: SERVER_ID.to_string(),
        }
    }

    pub fn with_resolver(mut self, resolver: GatewayResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the channel and destination used for every flow-mod
    pub fn with_addressing(mut self, channel: impl Into<String>, server_id: impl Into<String>) -> Self {
        self.channel = channel.into();
        self.server_id = server_id.into();
        self
    }

    pub fn agent_id(&self) -> u64 {
        self.agent_id
    }

    pub fn tables(&self) -> &ShadowTables {
        &self.tables
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn down_ports(&self) -> &DownPorts {
        &self.down_ports
    }

    /// Subscribe to both kernel tables and spawn one worker per subscription
    ///
    /// Both sockets are opened and their dumps requested before either worker
    /// is spawned, so a subscription failure leaves nothing running. Must be
    /// called from within a tokio runtime.
    ///
    /// # NIST Controls
    /// - AC-3: Access Enforcement - Kernel sockets require CAP_NET_ADMIN
    #[instrument(skip(self), fields(agent_id = self.agent_id))]
    pub fn start(self: &Arc<Self>) -> Result<SyncWorkers> {
        let mut neighbors = AsyncNetlinkSocket::neighbors()?;
        let mut routes = AsyncNetlinkSocket::routes()?;

        neighbors.request_dump()?;
        routes.request_dump()?;

        info!(
            interfaces = self.interfaces.len(),
            down_ports = self.down_ports.len(),
            "Kernel subscriptions ready, starting workers"
        );

        Ok(SyncWorkers {
            neighbors: tokio::spawn(Arc::clone(self).run_worker(neighbors)),
            routes: tokio::spawn(Arc::clone(self).run_worker(routes)),
        })
    }

    /// Drop all shadow state
    ///
    /// Installed flows are left alone; the peer clears them when the datapath
    /// association is reset.
    #[instrument(skip(self))]
    pub fn clear(&self) {
        self.tables.clear();
        self.update_table_sizes();
        info!("Cleared shadow tables");
    }

    /// Receive-and-dispatch loop for one subscription
    ///
    /// Returns only on a receive error, which is unrecoverable.
    async fn run_worker(self: Arc<Self>, mut socket: AsyncNetlinkSocket) -> Result<()> {
        let subscription = socket.subscription();
        debug!(?subscription, "Worker started");

        loop {
            let events = match socket.recv_events().await {
                Ok(events) => events,
                Err(e) => {
                    self.metrics.record_netlink_error();
                    error!(?subscription, error = %e, "Kernel subscription failed");
                    return Err(e);
                }
            };

            for event in events {
                self.handle_kernel_event(event).await;
            }
        }
    }

    pub async fn handle_kernel_event(&self, event: KernelEvent) {
        match event {
            KernelEvent::Neighbor(ev) => self.handle_neighbor_event(ev).await,
            KernelEvent::Route(ev) => self.handle_route_event(ev).await,
        }
    }

    /// Apply a neighbor notification
    #[instrument(level = "debug", skip(self), fields(address = %event.address, interface = %event.interface))]
    pub async fn handle_neighbor_event(&self, event: NeighborEvent) {
        self.metrics.record_neighbor_event();

        let Some(interface) = self.active_interface(&event.interface) else {
            self.discard("interface unknown or inactive");
            return;
        };

        match event.kind {
            NeighborMessageType::New => {
                let usable = |mac: &MacAddress| !mac.is_zero() && !mac.is_broadcast();
                let Some(hw_address) = event.hw_address.filter(usable) else {
                    self.discard("neighbor without usable link-layer address");
                    return;
                };

                let host = HostEntry {
                    address: event.address,
                    hw_address,
                    interface: interface.clone(),
                };

                match self.tables.upsert_host(host.clone()) {
                    HostUpsert::Unchanged => {
                        debug!(mac = %hw_address, "Host already present");
                        return;
                    }
                    HostUpsert::Replaced(old) => {
                        info!(old_mac = %old.hw_address, mac = %hw_address, "Host changed");
                    }
                    HostUpsert::Inserted => {
                        info!(mac = %hw_address, "Host added");
                    }
                }
                self.update_table_sizes();
                self.install_host(&host).await;
            }
            NeighborMessageType::Delete => match self.tables.remove_host(&event.address) {
                Some(host) => {
                    info!(mac = %host.hw_address, "Host removed");
                    self.update_table_sizes();
                    self.remove_host(&host).await;
                }
                None => debug!("Delete for unknown host, ignoring"),
            },
        }
    }

    /// Apply a route notification
    #[instrument(
        level = "debug",
        skip(self),
        fields(destination = %event.destination, prefix_len = event.prefix_len)
    )]
    pub async fn handle_route_event(&self, event: RouteEvent) {
        self.metrics.record_route_event();

        if event.table != RT_TABLE_MAIN {
            trace!(table = event.table, "Route outside main table");
            self.discard("route outside main table");
            return;
        }

        let Some(gateway) = event.gateway else {
            debug!("Directly attached route, not programmed");
            self.discard("route without gateway");
            return;
        };

        let Some(interface) = event
            .interface
            .as_deref()
            .and_then(|name| self.active_interface(name))
        else {
            self.discard("interface unknown or inactive");
            return;
        };

        let route = RouteEntry {
            address: event.destination,
            netmask: netmask(&event.destination, event.prefix_len),
            gateway,
            interface: interface.clone(),
        };

        match event.kind {
            RouteMessageType::New => {
                if !self.tables.insert_route(route.clone()) {
                    debug!(%route, "Duplicate route, ignoring");
                    return;
                }
                info!(%route, "Route added");
                self.update_table_sizes();
                self.install_route(&route).await;
            }
            RouteMessageType::Delete => match self.tables.remove_route(&route) {
                Some(stored) => {
                    info!(route = %stored, "Route removed");
                    self.update_table_sizes();
                    self.remove_route(&stored).await;
                }
                None => debug!(%route, "Delete for unknown route, ignoring"),
            },
        }
    }

    /// Resolve the next hop and dispatch the install
    async fn install_route(&self, route: &RouteEntry) {
        if self.port_is_down(route.interface.port) {
            return;
        }

        let Some(next_hop) = self
            .resolver
            .resolve(&self.tables, route.gateway, &route.interface, &self.metrics)
            .await
        else {
            warn!(%route, "Next hop unresolved, route recorded without a flow");
            return;
        };

        if !self.tables.contains_route(route) {
            debug!(%route, "Route withdrawn during resolution, not programmed");
            return;
        }

        match route_flow_mod(ModType::Add, self.agent_id, route, Some(next_hop)) {
            Some(msg) => self.dispatch(msg).await,
            None => warn!(%route, "Address and mask families differ, not programmed"),
        }
    }

    async fn remove_route(&self, route: &RouteEntry) {
        if self.port_is_down(route.interface.port) {
            return;
        }
        if let Some(msg) = route_flow_mod(ModType::Delete, self.agent_id, route, None) {
            self.dispatch(msg).await;
        }
    }

    async fn install_host(&self, host: &HostEntry) {
        if self.port_is_down(host.interface.port) {
            return;
        }
        self.dispatch(host_flow_mod(ModType::Add, self.agent_id, host))
            .await;
    }

    async fn remove_host(&self, host: &HostEntry) {
        if self.port_is_down(host.interface.port) {
            return;
        }
        self.dispatch(host_flow_mod(ModType::Delete, self.agent_id, host))
            .await;
    }

    /// Hand a flow-mod to the transport; failures are logged and dropped
    async fn dispatch(&self, msg: RouteMod) {
        let is_install = msg.mod_type == ModType::Add;
        match self
            .transport
            .send(&self.channel, &self.server_id, &msg)
            .await
        {
            Ok(()) => {
                self.metrics.record_flow(is_install);
                debug!(
                    mod_type = ?msg.mod_type,
                    priority = ?msg.priority(),
                    port = ?msg.output_port(),
                    "Dispatched flow-mod"
                );
            }
            Err(e) => {
                self.metrics.record_transport_error();
                warn!(error = %e, mod_type = ?msg.mod_type, "Failed to send flow-mod, dropped");
            }
        }
    }

    fn active_interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name).filter(|iface| iface.active)
    }

    fn port_is_down(&self, port: u32) -> bool {
        let down = self.down_ports.contains(port);
        if down {
            debug!(port, "Output port down, skipping flow-mod");
        }
        down
    }

    fn discard(&self, reason: &'static str) {
        self.metrics.record_discarded();
        debug!(reason, "Discarded event");
    }

    fn update_table_sizes(&self) {
        self.metrics
            .set_table_sizes(self.tables.host_count(), self.tables.route_count());
    }
}

/// Build a synchronizer and start its workers
pub fn start(
    agent_id: u64,
    interfaces: impl IntoIterator<Item = Interface>,
    transport: Arc<dyn FlowModTransport>,
    down_ports: DownPorts,
) -> Result<(Arc<FlowTable>, SyncWorkers)> {
    let table = Arc::new(FlowTable::new(agent_id, interfaces, transport, down_ports));
    let workers = table.start()?;
    Ok((table, workers))
}

/// Handles of the two event workers
pub struct SyncWorkers {
    neighbors: JoinHandle<Result<()>>,
    routes: JoinHandle<Result<()>>,
}

impl SyncWorkers {
    /// Wait until either worker ends and return its outcome
    pub async fn wait(self) -> Result<()> {
        let Self {
            mut neighbors,
            mut routes,
        } = self;

        let (name, outcome) = tokio::select! {
            r = &mut neighbors => ("neighbor", r),
            r = &mut routes => ("route", r),
        };
        neighbors.abort();
        routes.abort();

        match outcome {
            Ok(result) => result,
            Err(e) => Err(FlowsyncError::Worker(format!("{} worker: {}", name, e))),
        }
    }
}
