//! Plugin-specific error types.

use fip_ipam::IpamError;
use thiserror::Error;

/// Errors that can occur in the floating IP plugin.
///
/// The `Display` strings of the node-level variants double as the
/// per-node rejection reasons reported back to the scheduler.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// IPAM error (pool configuration, exhaustion, store)
    #[error(transparent)]
    Ipam(#[from] IpamError),

    /// Node has no internal address to derive a subnet from
    #[error("FloatingIPPlugin:UnknownNode")]
    UnknownNode,

    /// Node's internal address is not covered by any configured pool
    #[error("FloatingIPPlugin:NoFIPConfigNode")]
    NoFipConfigNode,

    /// Post-allocation query came back empty; the store is suspect and the
    /// allocation is left for resync to reclaim
    #[error("inconsistent allocation state: {0}")]
    Inconsistent(String),

    /// A retry budget was exhausted
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invalid plugin configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pod or binding request missing required identity fields
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
