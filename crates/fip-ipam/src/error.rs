//! IPAM and allocation store errors

use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors surfaced by the IPAM facade.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Malformed or overlapping pool definitions
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// The requested subnet has no free floating IP left
    #[error("no enough floating IPs")]
    NoEnoughIp,

    /// The key already owns a floating IP; re-allocation must reuse it
    #[error("key {key} already owns floating IP {ip}")]
    AlreadyAllocated { key: String, ip: Ipv4Addr },

    /// Allocation store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the durable allocation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted row no longer parses as an address or subnet
    #[error("corrupt allocation record: {0}")]
    Corrupt(String),
}
