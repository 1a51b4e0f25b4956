//! Error types for flowsyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use thiserror::Error;

/// Errors that can occur in flowsyncd
///
/// Per-event problems (malformed notifications, unknown interfaces) are not
/// errors; they are logged and discarded by the handlers.
#[derive(Debug, Error)]
pub enum FlowsyncError {
    /// Netlink socket error
    /// NIST: SC-7 (Boundary Protection) - Kernel interface errors
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Interface lookup failed
    #[error("Interface not found: index {0}")]
    InterfaceNotFound(u32),

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Flow-mod delivery failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// An event worker stopped unexpectedly
    #[error("Worker failed: {0}")]
    Worker(String),

    /// Redis connection or operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Message encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for flowsyncd operations
pub type Result<T> = std::result::Result<T, FlowsyncError>;
