//! Configuration file support for flowsyncd
//!
//! Loads and validates the agent configuration from a TOML file.
//! Default location: /etc/flowsyncd/flowsyncd.toml
//!
//! The interface directory and the down-port set come from here; the
//! synchronizer treats both as read-only.

use crate::error::{FlowsyncError, Result};
use crate::flow_table::DownPorts;
use crate::metrics_server::DEFAULT_METRICS_PORT;
use crate::resolver::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PROBE_PORT, GatewayResolver, TcpConnectProbe,
};
use crate::transport::{CLIENT_SERVER_CHANNEL, SERVER_ID};
use crate::types::Interface;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/flowsyncd/flowsyncd.toml";

/// Flow-mod transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Channel to the flow-table server
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Identifier of the flow-table server
    #[serde(default = "default_server_id")]
    pub server_id: String,
}

/// Gateway resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Host-table lookups before a gateway is given up on
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between lookups in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Destination port of the probe connection
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Probe connection timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Complete flowsyncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowsyncConfig {
    /// Identity stamped on every flow-mod
    #[serde(default)]
    pub agent_id: u64,

    /// Ports that are administratively down at startup
    #[serde(default)]
    pub down_ports: Vec<u32>,

    /// Interfaces this agent programs flows for
    #[serde(default)]
    pub interfaces: Vec<Interface>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

// Default functions
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_channel() -> String {
    CLIENT_SERVER_CHANNEL.to_string()
}

fn default_server_id() -> String {
    SERVER_ID.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_interval() -> u64 {
    20
}

fn default_probe_port() -> u16 {
    DEFAULT_PROBE_PORT
}

fn default_probe_timeout() -> u64 {
    500
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            channel: default_channel(),
            server_id: default_server_id(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval_ms: default_retry_interval(),
            probe_port: default_probe_port(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl FlowsyncConfig {
    /// Load and validate configuration from file
    ///
    /// A missing file is an error: the interface directory has no default.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FlowsyncError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            FlowsyncError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowsyncError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.transport.redis_port == 0 {
            return Err(FlowsyncError::Config("redis_port must be > 0".to_string()));
        }

        if self.resolver.max_attempts == 0 {
            return Err(FlowsyncError::Config(
                "max_attempts must be > 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for iface in &self.interfaces {
            if !names.insert(iface.name.as_str()) {
                return Err(FlowsyncError::Config(format!(
                    "duplicate interface name {}",
                    iface.name
                )));
            }
            if !ports.insert(iface.port) {
                return Err(FlowsyncError::Config(format!(
                    "duplicate port {} on interface {}",
                    iface.port, iface.name
                )));
            }
        }

        Ok(())
    }

    /// Get retry interval as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.resolver.retry_interval_ms)
    }

    /// Get probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver.probe_timeout_ms)
    }

    /// Resolver with a TCP connect probe as configured
    pub fn gateway_resolver(&self) -> GatewayResolver {
        let probe = TcpConnectProbe::new(self.resolver.probe_port, self.probe_timeout());
        GatewayResolver::new(
            Box::new(probe),
            self.resolver.max_attempts,
            self.retry_interval(),
        )
    }

    pub fn down_port_set(&self) -> DownPorts {
        self.down_ports.iter().copied().collect()
    }
}
