//! Flow-table synchronization agent
//!
//! This crate mirrors the kernel neighbor (ARP/NDP) and routing tables into
//! in-memory shadow tables and turns every relevant change into a flow-mod
//! for a remote flow-table server that programs the forwarding datapath.
//!
//! # Features
//!
//! - **perf-fxhash**: FxHashMap for the interface index cache
//! - **perf-all**: All performance features
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Kernel netlink requires CAP_NET_ADMIN |
//! | AU-3 | Content of Audit Records | Structured logging with route and host details |
//! | AU-12 | Audit Record Generation | Every install, remove and discard logged |
//! | CM-6 | Configuration Settings | TOML configuration file |
//! | CM-8 | System Component Inventory | Track neighbors and next hops |
//! | SC-7 | Boundary Protection | Only configured interfaces are programmed |
//! | SI-4 | System Monitoring | Real-time kernel table monitoring |
//! | SI-10 | Input Validation | Defensive netlink decoding |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────────┐     ┌──────────────────┐
//! │  Linux Kernel   │     │          flowsyncd           │     │ Flow-table server│
//! │                 │     │                              │     │                  │
//! │  RTM_*NEIGH ────┼────▶│ neighbor worker ─┐           │     │                  │
//! │                 │     │                  ▼           │     │                  │
//! │                 │     │        FlowTable (shadow) ───┼────▶│  RouteMod queue  │
//! │                 │     │                  ▲    │      │     │                  │
//! │  RTM_*ROUTE ────┼────▶│ route worker ────┘    ▼      │     │                  │
//! │                 │◀────┼──────────── GatewayResolver  │     │                  │
//! └─────────────────┘     └──────────────────────────────┘     └──────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod flow_mod;
pub mod flow_table;
pub mod metrics;
pub mod metrics_server;
pub mod netlink;
pub mod resolver;
pub mod shadow;
pub mod transport;
pub mod types;

pub use config::FlowsyncConfig;
pub use error::{FlowsyncError, Result};
pub use flow_mod::{Action, FlowOption, Match, ModType, RouteMod};
pub use flow_table::{DownPorts, FlowTable, SyncWorkers, start};
pub use metrics::MetricsCollector;
pub use metrics_server::start_metrics_server;
pub use netlink::AsyncNetlinkSocket;
pub use resolver::{GatewayProbe, GatewayResolver, TcpConnectProbe};
pub use shadow::ShadowTables;
pub use transport::{ChannelTransport, Envelope, FlowModTransport, RedisTransport};
pub use types::{HostEntry, Interface, KernelEvent, MacAddress, RouteEntry};
