//! Outbound delivery of flow-mods to the flow-table server
//!
//! The engine only needs an addressed send primitive. Two implementations are
//! provided: a Redis list queue per channel for the daemon, and an in-process
//! tokio channel for embedding and tests.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-8: Transmission Confidentiality - Database communication
//! - AU-3: Content of Audit Records - Envelopes carry sender and recipient

use crate::error::{FlowsyncError, Result};
use crate::flow_mod::RouteMod;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

/// Channel between the agent and the flow-table server
pub const CLIENT_SERVER_CHANNEL: &str = "rfclient<->rfserver";

/// Well-known identifier of the flow-table server
pub const SERVER_ID: &str = "rfserver";

/// Addressed message as it travels over a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub channel: String,
    pub message: RouteMod,
}

/// Addressed send primitive
///
/// Delivery is best-effort from the caller's point of view: a returned error
/// is logged and the message dropped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowModTransport: Send + Sync {
    async fn send(&self, channel: &str, destination: &str, message: &RouteMod) -> Result<()>;
}

/// Redis-backed transport
///
/// Each channel is a Redis list; envelopes are RPUSHed as JSON and the server
/// pops them in order.
pub struct RedisTransport {
    conn: ConnectionManager,
    sender_id: String,
}

impl RedisTransport {
    #[instrument(skip(sender_id))]
    pub async fn new(host: &str, port: u16, sender_id: impl Into<String>) -> Result<Self> {
        debug!(host, port, "Connecting flow-mod transport to Redis");
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            sender_id: sender_id.into(),
        })
    }

    /// Redis key backing a channel
    pub fn channel_key(channel: &str) -> String {
        format!("FLOWMOD_QUEUE:{}", channel)
    }
}

#[async_trait]
impl FlowModTransport for RedisTransport {
    async fn send(&self, channel: &str, destination: &str, message: &RouteMod) -> Result<()> {
        let envelope = Envelope {
            from: self.sender_id.clone(),
            to: destination.to_string(),
            channel: channel.to_string(),
            message: message.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        let key = Self::channel_key(channel);

        // Clones share one multiplexed connection
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&key, payload).await?;
        debug!(key, to = destination, "Queued flow-mod");
        Ok(())
    }
}

/// In-process transport over an unbounded tokio channel
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Envelope>,
    sender_id: String,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its channel
    pub fn new(sender_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                sender_id: sender_id.into(),
            },
            rx,
        )
    }
}

#[async_trait]
impl FlowModTransport for ChannelTransport {
    async fn send(&self, channel: &str, destination: &str, message: &RouteMod) -> Result<()> {
        let envelope = Envelope {
            from: self.sender_id.clone(),
            to: destination.to_string(),
            channel: channel.to_string(),
            message: message.clone(),
        };
        self.tx
            .send(envelope)
            .map_err(|_| FlowsyncError::Transport("receiver dropped".to_string()))
    }
}
