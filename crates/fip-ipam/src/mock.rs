//! In-memory allocation store for unit tests.
//!
//! Implements the same contract as the SQL store over a `BTreeMap` keyed by
//! the canonical address string, so iteration order matches the SQL
//! `ORDER BY ip`.

use crate::error::StoreError;
use crate::models::{AllocationRecord, ReleasePolicy};
use crate::store::{AllocationStore, PoolSeed};
use async_trait::async_trait;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// Test double for [`AllocationStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<BTreeMap<String, AllocationRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a row, for assertions.
    pub fn record(&self, ip: Ipv4Addr) -> Option<AllocationRecord> {
        self.rows.lock().unwrap().get(&ip.to_string()).cloned()
    }

    /// Number of free rows across all subnets.
    pub fn free_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.key.is_empty())
            .count()
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn reconcile(&self, seeds: &[PoolSeed]) -> Result<Vec<AllocationRecord>, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        for seed in seeds {
            let ip = seed.ip.to_string();
            match rows.get_mut(&ip) {
                Some(row) => row.subnet = seed.subnet,
                None => {
                    rows.insert(
                        ip,
                        AllocationRecord {
                            ip: seed.ip,
                            subnet: seed.subnet,
                            key: String::new(),
                            attr: String::new(),
                            policy: ReleasePolicy::Normal,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        let desired: std::collections::HashSet<String> =
            seeds.iter().map(|s| s.ip.to_string()).collect();
        let mut orphans = Vec::new();
        rows.retain(|ip, row| {
            if desired.contains(ip) {
                return true;
            }
            if row.key.is_empty() {
                return false;
            }
            row.updated_at = now;
            orphans.push(row.clone());
            true
        });
        Ok(orphans)
    }

    async fn claim_one_in_subnet(
        &self,
        key: &str,
        subnet: &Ipv4Network,
        attr: &str,
    ) -> Result<Option<Ipv4Addr>, StoreError> {
        let subnet = subnet.to_string();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.values_mut() {
            if row.subnet.to_string() == subnet && row.key.is_empty() {
                row.key = key.to_string();
                row.attr = attr.to_string();
                row.updated_at = Utc::now();
                return Ok(Some(row.ip));
            }
        }
        Ok(None)
    }

    async fn query_by_key(&self, key: &str) -> Result<Vec<AllocationRecord>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.values().filter(|r| r.key == key).cloned().collect())
    }

    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<AllocationRecord>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .filter(|r| !r.key.is_empty() && r.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn subnets_with_key(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut subnets: Vec<String> = rows
            .values()
            .filter(|r| r.key == key)
            .map(|r| r.subnet.to_string())
            .collect();
        subnets.sort();
        subnets.dedup();
        Ok(subnets)
    }

    async fn subnets_with_free_ip(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut subnets: Vec<String> = rows
            .values()
            .filter(|r| r.key.is_empty())
            .map(|r| r.subnet.to_string())
            .collect();
        subnets.sort();
        subnets.dedup();
        Ok(subnets)
    }

    async fn release_by_keys(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut released = 0;
        for row in rows.values_mut() {
            if !row.key.is_empty() && keys.contains(&row.key) {
                row.key.clear();
                row.attr.clear();
                row.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_by_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut released = 0;
        for row in rows.values_mut() {
            if !row.key.is_empty() && row.key.starts_with(prefix) {
                row.key.clear();
                row.attr.clear();
                row.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_allocated(&self) -> Result<Vec<AllocationRecord>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.values().filter(|r| !r.key.is_empty()).cloned().collect())
    }
}
