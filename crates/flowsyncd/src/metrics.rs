//! Prometheus metrics collection for flowsyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-6: Audit Record Review - Metrics available for analysis
//! - SI-4: System Monitoring - Synchronization health metrics

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector shared by both event workers
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub neighbor_events_total: Counter,
    pub route_events_total: Counter,
    pub events_discarded_total: Counter,
    pub flows_installed_total: Counter,
    pub flows_removed_total: Counter,
    pub resolution_failures_total: Counter,
    pub transport_errors_total: Counter,
    pub netlink_errors_total: Counter,

    // Gauges
    pub host_table_size: Gauge,
    pub route_table_size: Gauge,

    // Histograms
    pub resolution_latency_seconds: Histogram,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter, prometheus::Error> {
            let c = Counter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let neighbor_events_total = counter(
            "flowsyncd_neighbor_events_total",
            "Total number of neighbor events received",
        )?;
        let route_events_total = counter(
            "flowsyncd_route_events_total",
            "Total number of route events received",
        )?;
        let events_discarded_total = counter(
            "flowsyncd_events_discarded_total",
            "Total number of events discarded without state change",
        )?;
        let flows_installed_total = counter(
            "flowsyncd_flows_installed_total",
            "Total number of install flow-mods dispatched",
        )?;
        let flows_removed_total = counter(
            "flowsyncd_flows_removed_total",
            "Total number of remove flow-mods dispatched",
        )?;
        let resolution_failures_total = counter(
            "flowsyncd_resolution_failures_total",
            "Total number of gateway resolutions that exhausted their attempts",
        )?;
        let transport_errors_total = counter(
            "flowsyncd_transport_errors_total",
            "Total number of flow-mod send failures",
        )?;
        let netlink_errors_total = counter(
            "flowsyncd_netlink_errors_total",
            "Total number of netlink socket errors",
        )?;

        // Gauges
        let host_table_size = Gauge::with_opts(Opts::new(
            "flowsyncd_host_table_size",
            "Current number of entries in the host table",
        ))?;
        registry.register(Box::new(host_table_size.clone()))?;

        let route_table_size = Gauge::with_opts(Opts::new(
            "flowsyncd_route_table_size",
            "Current number of entries in the route table",
        ))?;
        registry.register(Box::new(route_table_size.clone()))?;

        // Histograms
        let resolution_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flowsyncd_resolution_latency_seconds",
                "Gateway MAC resolution latency in seconds",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.02, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0]),
        )?;
        registry.register(Box::new(resolution_latency_seconds.clone()))?;

        Ok(Self {
            neighbor_events_total,
            route_events_total,
            events_discarded_total,
            flows_installed_total,
            flows_removed_total,
            resolution_failures_total,
            transport_errors_total,
            netlink_errors_total,
            host_table_size,
            route_table_size,
            resolution_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn record_neighbor_event(&self) {
        self.neighbor_events_total.inc();
    }

    pub fn record_route_event(&self) {
        self.route_events_total.inc();
    }

    pub fn record_discarded(&self) {
        self.events_discarded_total.inc();
    }

    /// Record a dispatched flow-mod
    pub fn record_flow(&self, is_install: bool) {
        if is_install {
            self.flows_installed_total.inc();
        } else {
            self.flows_removed_total.inc();
        }
    }

    pub fn record_resolution_failure(&self) {
        self.resolution_failures_total.inc();
    }

    pub fn record_transport_error(&self) {
        self.transport_errors_total.inc();
    }

    pub fn record_netlink_error(&self) {
        self.netlink_errors_total.inc();
    }

    pub fn set_table_sizes(&self, hosts: usize, routes: usize) {
        self.host_table_size.set(hosts as f64);
        self.route_table_size.set(routes as f64);
    }

    pub fn observe_resolution_latency(&self, duration_secs: f64) {
        self.resolution_latency_seconds.observe(duration_secs);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}
