//! Allocation store abstraction
//!
//! The store owns the durable `ip -> (key, subnet)` table. Its atomic
//! claim is the only concurrency primitive the rest of the allocator
//! relies on: two claims can never hand out the same row.

use crate::error::StoreError;
use crate::models::AllocationRecord;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// One row implied by the active pool definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSeed {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Network,
}

/// Durable allocation table operations.
///
/// All mutations bump the row's `updated_at`. Releasing an already-free row
/// is a no-op success.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Reconciles the table against a new pool definition in one
    /// transaction: seeds missing rows as free, deletes free rows that fell
    /// out of the definition, and returns still-owned rows that fell out of
    /// the definition (they are retained, never deleted).
    async fn reconcile(&self, seeds: &[PoolSeed]) -> Result<Vec<AllocationRecord>, StoreError>;

    /// Atomically claims the lexicographically smallest free row in
    /// `subnet` for `key`, recording `attr`. Returns `None` when the subnet
    /// is exhausted. Concurrent claims are serialized by the store.
    async fn claim_one_in_subnet(
        &self,
        key: &str,
        subnet: &Ipv4Network,
        attr: &str,
    ) -> Result<Option<Ipv4Addr>, StoreError>;

    /// Rows owned by `key`, ordered by ip.
    async fn query_by_key(&self, key: &str) -> Result<Vec<AllocationRecord>, StoreError>;

    /// Owned rows whose key starts with `prefix`, ordered by ip.
    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<AllocationRecord>, StoreError>;

    /// Distinct subnets in which `key` owns at least one row.
    async fn subnets_with_key(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Distinct subnets with at least one free row.
    async fn subnets_with_free_ip(&self) -> Result<Vec<String>, StoreError>;

    /// Frees every row owned by one of `keys`; returns the number of rows
    /// actually freed.
    async fn release_by_keys(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Frees every owned row whose key starts with `prefix`.
    async fn release_by_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Every owned row, ordered by ip.
    async fn list_allocated(&self) -> Result<Vec<AllocationRecord>, StoreError>;
}
