//! Integration tests for flowsyncd
//!
//! Drives the synchronizer with decoded kernel events and observes the
//! flow-mods it dispatches through an in-process channel transport.

use async_trait::async_trait;
use flowsyncd::flow_mod::{DEFAULT_PRIORITY, HOST_IDLE_TIMEOUT_SECS};
use flowsyncd::transport::{CLIENT_SERVER_CHANNEL, SERVER_ID};
use flowsyncd::types::{
    NeighborEvent, NeighborMessageType, RT_TABLE_MAIN, RouteEvent, RouteMessageType,
};
use flowsyncd::{
    Action, ChannelTransport, DownPorts, Envelope, FlowOption, FlowTable, GatewayProbe,
    GatewayResolver, HostEntry, Interface, MacAddress, Match, ModType,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const AGENT_ID: u64 = 0x12a0a0a0a0a0;

fn iface(name: &str, port: u32, mac: &str, active: bool) -> Interface {
    Interface {
        name: name.to_string(),
        port,
        hw_address: mac.parse().expect("valid MAC"),
        active,
    }
}

fn interfaces() -> Vec<Interface> {
    vec![
        iface("eth0", 2, "aa:bb:cc:dd:ee:01", true),
        iface("eth1", 3, "aa:bb:cc:dd:ee:01", true),
        iface("eth2", 4, "aa:bb:cc:dd:ee:04", true),
        iface("eth9", 9, "aa:bb:cc:dd:ee:09", false),
    ]
}

fn mac(s: &str) -> MacAddress {
    s.parse().expect("valid MAC")
}

fn ip(s: &str) -> IpAddr {
    s.parse().expect("valid IP")
}

fn neigh_new(interface: &str, addr: &str, hw: &str) -> NeighborEvent {
    NeighborEvent {
        kind: NeighborMessageType::New,
        interface: interface.to_string(),
        address: ip(addr),
        hw_address: Some(mac(hw)),
    }
}

fn neigh_del(interface: &str, addr: &str) -> NeighborEvent {
    NeighborEvent {
        kind: NeighborMessageType::Delete,
        interface: interface.to_string(),
        address: ip(addr),
        hw_address: None,
    }
}

fn route(kind: RouteMessageType, dst: &str, len: u8, gw: Option<&str>, dev: &str) -> RouteEvent {
    RouteEvent {
        kind,
        table: RT_TABLE_MAIN,
        destination: ip(dst),
        prefix_len: len,
        gateway: gw.map(ip),
        interface: Some(dev.to_string()),
    }
}

/// Probe that counts calls and can inject the gateway into the host table
///
/// With `clear_on` set, the table is cleared on that call, before any
/// injection.
struct TestProbe {
    calls: Arc<AtomicU32>,
    inject: Option<(u32, MacAddress)>,
    clear_on: Option<u32>,
    table: Arc<OnceLock<Arc<FlowTable>>>,
}

#[async_trait]
impl GatewayProbe for TestProbe {
    async fn probe(&self, gateway: IpAddr, interface: &Interface) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let (Some(at), Some(table)) = (self.clear_on, self.table.get()) {
            if n == at {
                table.clear();
            }
        }
        if let (Some((at, hw)), Some(table)) = (self.inject, self.table.get()) {
            if n == at {
                table.tables().upsert_host(HostEntry {
                    address: gateway,
                    hw_address: hw,
                    interface: interface.clone(),
                });
            }
        }
    }
}

struct Harness {
    table: Arc<FlowTable>,
    rx: UnboundedReceiver<Envelope>,
    probes: Arc<AtomicU32>,
}

impl Harness {
    fn new(down: &[u32]) -> Self {
        Self::with_injection(down, None)
    }

    fn with_injection(down: &[u32], inject: Option<(u32, MacAddress)>) -> Self {
        Self::with_probe(down, inject, None)
    }

    fn with_probe(down: &[u32], inject: Option<(u32, MacAddress)>, clear_on: Option<u32>) -> Self {
        let (transport, rx) = ChannelTransport::new("agent");
        let probes = Arc::new(AtomicU32::new(0));
        let slot = Arc::new(OnceLock::new());
        let probe = TestProbe {
            calls: Arc::clone(&probes),
            inject,
            clear_on,
            table: Arc::clone(&slot),
        };

        let table = Arc::new(
            FlowTable::new(
                AGENT_ID,
                interfaces(),
                Arc::new(transport),
                down.iter().copied().collect::<DownPorts>(),
            )
            .with_resolver(GatewayResolver::new(
                Box::new(probe),
                10,
                Duration::from_millis(1),
            )),
        );
        let _ = slot.set(Arc::clone(&table));

        Self { table, rx, probes }
    }

    fn next(&mut self) -> Envelope {
        self.rx.try_recv().expect("a flow-mod was dispatched")
    }

    fn assert_quiet(&mut self) {
        assert!(self.rx.try_recv().is_err(), "unexpected flow-mod dispatched");
    }

    async fn seed_gateway(&mut self) {
        self.table
            .handle_neighbor_event(neigh_new("eth0", "10.0.0.1", "aa:bb:cc:dd:ee:03"))
            .await;
        let _ = self.next();
    }
}

#[tokio::test]
async fn test_host_install_message() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_neighbor_event(neigh_new("eth1", "10.0.0.5", "aa:bb:cc:dd:ee:02"))
        .await;

    let env = h.next();
    assert_eq!(env.from, "agent");
    assert_eq!(env.to, SERVER_ID);
    assert_eq!(env.channel, CLIENT_SERVER_CHANNEL);

    let msg = env.message;
    assert_eq!(msg.mod_type, ModType::Add);
    assert_eq!(msg.id, AGENT_ID);
    assert_eq!(msg.matches.len(), 1);
    assert_eq!(msg.matches[0].to_string(), "10.0.0.5/32");
    assert_eq!(
        msg.actions,
        vec![
            Action::SetEthSrc(mac("aa:bb:cc:dd:ee:01")),
            Action::SetEthDst(mac("aa:bb:cc:dd:ee:02")),
            Action::Output(3),
        ]
    );
    assert_eq!(
        msg.options,
        vec![
            FlowOption::Priority(DEFAULT_PRIORITY + 32),
            FlowOption::IdleTimeout(HOST_IDLE_TIMEOUT_SECS),
        ]
    );

    assert_eq!(h.table.tables().host_count(), 1);
    h.assert_quiet();
}

#[tokio::test]
async fn test_ipv6_host_has_no_idle_timeout() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_neighbor_event(neigh_new("eth0", "2001:db8::5", "aa:bb:cc:dd:ee:02"))
        .await;

    let msg = h.next().message;
    assert!(matches!(msg.matches[0], Match::Ipv6 { .. }));
    assert_eq!(msg.priority(), Some(DEFAULT_PRIORITY + 128));
    assert_eq!(msg.idle_timeout(), None);
}

#[tokio::test]
async fn test_host_on_down_port_recorded_without_message() {
    let mut h = Harness::new(&[3]);
    h.table
        .handle_neighbor_event(neigh_new("eth1", "10.0.0.5", "aa:bb:cc:dd:ee:02"))
        .await;

    assert_eq!(h.table.tables().host_count(), 1);
    h.assert_quiet();
}

#[tokio::test]
async fn test_neighbor_on_unknown_or_inactive_interface_discarded() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_neighbor_event(neigh_new("lo", "10.0.0.5", "aa:bb:cc:dd:ee:02"))
        .await;
    h.table
        .handle_neighbor_event(neigh_new("eth9", "10.0.0.6", "aa:bb:cc:dd:ee:02"))
        .await;

    assert_eq!(h.table.tables().host_count(), 0);
    assert_eq!(h.table.metrics().events_discarded_total.get(), 2.0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_neighbor_without_lladdr_discarded() {
    let mut h = Harness::new(&[]);
    let mut ev = neigh_new("eth0", "10.0.0.5", "aa:bb:cc:dd:ee:02");
    ev.hw_address = None;
    h.table.handle_neighbor_event(ev).await;

    assert_eq!(h.table.tables().host_count(), 0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_host_dedupe_and_replace() {
    let mut h = Harness::new(&[]);
    let ev = neigh_new("eth0", "10.0.0.5", "aa:bb:cc:dd:ee:02");
    h.table.handle_neighbor_event(ev.clone()).await;
    let _ = h.next();

    // Same neighbor again
    h.table.handle_neighbor_event(ev).await;
    assert_eq!(h.table.tables().host_count(), 1);
    h.assert_quiet();

    // MAC moved
    h.table
        .handle_neighbor_event(neigh_new("eth0", "10.0.0.5", "aa:bb:cc:dd:ee:99"))
        .await;
    assert_eq!(h.table.tables().host_count(), 1);
    let msg = h.next().message;
    assert_eq!(msg.mod_type, ModType::Add);
    assert!(msg.actions.contains(&Action::SetEthDst(mac("aa:bb:cc:dd:ee:99"))));
    assert_eq!(
        h.table.tables().lookup_host_mac(&ip("10.0.0.5")),
        Some(mac("aa:bb:cc:dd:ee:99"))
    );
}

#[tokio::test]
async fn test_neighbor_delete_removes_flow() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_neighbor_event(neigh_new("eth1", "10.0.0.5", "aa:bb:cc:dd:ee:02"))
        .await;
    let _ = h.next();

    h.table
        .handle_neighbor_event(neigh_del("eth1", "10.0.0.5"))
        .await;
    let msg = h.next().message;
    assert_eq!(msg.mod_type, ModType::Delete);
    assert_eq!(msg.matches[0].to_string(), "10.0.0.5/32");
    assert_eq!(msg.actions, vec![Action::Output(3)]);
    assert_eq!(h.table.tables().host_count(), 0);

    // Nothing left to delete
    h.table
        .handle_neighbor_event(neigh_del("eth1", "10.0.0.5"))
        .await;
    h.assert_quiet();
}

#[tokio::test]
async fn test_route_without_gateway_ignored() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_route_event(route(RouteMessageType::New, "10.0.0.0", 24, None, "eth0"))
        .await;

    assert_eq!(h.table.tables().route_count(), 0);
    assert_eq!(h.probes.load(Ordering::SeqCst), 0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_route_outside_main_table_ignored() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;
    let mut ev = route(
        RouteMessageType::New,
        "192.168.1.0",
        24,
        Some("10.0.0.1"),
        "eth0",
    );
    ev.table = 255;
    h.table.handle_route_event(ev).await;

    assert_eq!(h.table.tables().route_count(), 0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_route_add_then_delete() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;

    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    let msg = h.next().message;
    assert_eq!(msg.mod_type, ModType::Add);
    assert_eq!(msg.matches[0].to_string(), "192.168.1.0/24");
    assert_eq!(msg.priority(), Some(DEFAULT_PRIORITY + 24));
    assert!(msg.actions.contains(&Action::SetEthDst(mac("aa:bb:cc:dd:ee:03"))));
    assert_eq!(msg.output_port(), Some(2));
    assert_eq!(msg.idle_timeout(), None);
    assert_eq!(h.table.tables().route_count(), 1);
    assert_eq!(h.probes.load(Ordering::SeqCst), 0);

    h.table
        .handle_route_event(route(
            RouteMessageType::Delete,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    let msg = h.next().message;
    assert_eq!(msg.mod_type, ModType::Delete);
    assert_eq!(msg.matches[0].to_string(), "192.168.1.0/24");
    assert_eq!(msg.actions, vec![Action::Output(2)]);
    assert_eq!(h.table.tables().route_count(), 0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_duplicate_route_ignored() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;
    let ev = route(
        RouteMessageType::New,
        "192.168.1.0",
        24,
        Some("10.0.0.1"),
        "eth0",
    );

    h.table.handle_route_event(ev.clone()).await;
    let _ = h.next();
    h.table.handle_route_event(ev).await;

    assert_eq!(h.table.tables().route_count(), 1);
    h.assert_quiet();
}

#[tokio::test]
async fn test_unmatched_route_delete_is_noop() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;
    let _ = h.next();

    // Different gateway, so not structurally equal
    h.table
        .handle_route_event(route(
            RouteMessageType::Delete,
            "192.168.1.0",
            24,
            Some("10.0.0.2"),
            "eth0",
        ))
        .await;

    assert_eq!(h.table.tables().route_count(), 1);
    h.assert_quiet();
}

#[tokio::test]
async fn test_longer_prefix_outranks_shorter() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;

    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "172.16.0.0",
            16,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;
    let wide = h.next().message;

    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "172.16.5.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;
    let narrow = h.next().message;

    assert!(narrow.priority() > wide.priority());
}

#[tokio::test]
async fn test_default_route_priority_is_base() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "0.0.0.0",
            0,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    let msg = h.next().message;
    assert_eq!(msg.matches[0].to_string(), "0.0.0.0/0");
    assert_eq!(msg.priority(), Some(DEFAULT_PRIORITY));
}

#[tokio::test]
async fn test_resolution_succeeds_after_injection() {
    let mut h = Harness::with_injection(&[], Some((3, mac("aa:bb:cc:dd:ee:77"))));
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    let msg = h.next().message;
    assert!(msg.actions.contains(&Action::SetEthDst(mac("aa:bb:cc:dd:ee:77"))));
    assert_eq!(h.probes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_resolution_exhaustion_keeps_route() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    assert_eq!(h.probes.load(Ordering::SeqCst), 10);
    assert_eq!(h.table.tables().route_count(), 1);
    assert_eq!(h.table.metrics().resolution_failures_total.get(), 1.0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_route_on_down_port_not_probed() {
    let mut h = Harness::new(&[2]);
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    assert_eq!(h.table.tables().route_count(), 1);
    assert_eq!(h.probes.load(Ordering::SeqCst), 0);
    h.assert_quiet();

    h.table
        .handle_route_event(route(
            RouteMessageType::Delete,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;
    assert_eq!(h.table.tables().route_count(), 0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_route_on_inactive_interface_ignored() {
    let mut h = Harness::new(&[]);
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth9",
        ))
        .await;

    assert_eq!(h.table.tables().route_count(), 0);
    h.assert_quiet();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_neighbor_event_unblocks_pending_route() {
    let (transport, mut rx) = ChannelTransport::new("agent");
    let table = Arc::new(
        FlowTable::new(AGENT_ID, interfaces(), Arc::new(transport), DownPorts::new())
            .with_resolver(GatewayResolver::new(
                Box::new(flowsyncd::TcpConnectProbe::new(9, Duration::from_millis(10))),
                200,
                Duration::from_millis(10),
            )),
    );

    let route_table = Arc::clone(&table);
    let pending = tokio::spawn(async move {
        route_table
            .handle_route_event(route(
                RouteMessageType::New,
                "192.168.1.0",
                24,
                Some("127.0.0.1"),
                "eth0",
            ))
            .await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    table
        .handle_neighbor_event(neigh_new("eth0", "127.0.0.1", "aa:bb:cc:dd:ee:03"))
        .await;
    pending.await.unwrap();

    // The two installs come from different tasks, so their order is not fixed
    let first = rx.recv().await.unwrap().message;
    let second = rx.recv().await.unwrap().message;
    let route = [first, second]
        .into_iter()
        .find(|m| m.matches[0].to_string() == "192.168.1.0/24")
        .expect("route install dispatched");
    assert!(route.actions.contains(&Action::SetEthDst(mac("aa:bb:cc:dd:ee:03"))));
    assert_eq!(table.tables().route_count(), 1);
}

#[tokio::test]
async fn test_clear_empties_tables_without_messages() {
    let mut h = Harness::new(&[]);
    h.seed_gateway().await;
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;
    let _ = h.next();

    h.table.clear();
    assert_eq!(h.table.tables().host_count(), 0);
    assert_eq!(h.table.tables().route_count(), 0);
    h.assert_quiet();
}

#[tokio::test]
async fn test_clear_during_resolution_suppresses_install() {
    let mut h = Harness::with_probe(&[], Some((2, mac("aa:bb:cc:dd:ee:77"))), Some(1));
    h.table
        .handle_route_event(route(
            RouteMessageType::New,
            "192.168.1.0",
            24,
            Some("10.0.0.1"),
            "eth0",
        ))
        .await;

    // Resolved on the third lookup, but the route was cleared meanwhile
    assert_eq!(h.probes.load(Ordering::SeqCst), 2);
    assert_eq!(h.table.tables().route_count(), 0);
    assert_eq!(h.table.tables().host_count(), 1);
    h.assert_quiet();
}

#[tokio::test]
async fn test_down_port_change_seen_by_table() {
    let mut h = Harness::new(&[]);
    h.table.down_ports().set_down(3);
    h.table
        .handle_neighbor_event(neigh_new("eth1", "10.0.0.5", "aa:bb:cc:dd:ee:02"))
        .await;
    h.assert_quiet();

    h.table.down_ports().set_up(3);
    h.table
        .handle_neighbor_event(neigh_new("eth1", "10.0.0.6", "aa:bb:cc:dd:ee:02"))
        .await;
    assert_eq!(h.next().message.output_port(), Some(3));
}
