//! IPAM facade
//!
//! A stateless shim over the allocation store plus a cached index of the
//! configured pool entries, keyed by routable subnet. All durable state
//! lives in the store; the index only avoids a round trip for subnet
//! lookups and annotation shaping.

use crate::error::IpamError;
use crate::models::{self, AllocationRecord, FipConf, IpInfo, PoolEntry};
use crate::store::{AllocationStore, PoolSeed};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct Ipam {
    store: Arc<dyn AllocationStore>,
    pools: RwLock<Vec<PoolEntry>>,
}

impl Ipam {
    pub fn new(store: Arc<dyn AllocationStore>) -> Self {
        Self {
            store,
            pools: RwLock::new(Vec::new()),
        }
    }

    /// Validates `confs`, reconciles the durable table against them, and
    /// swaps the in-memory index. Owned records that fell out of the pool
    /// are retained and logged.
    pub async fn configure_pool(&self, confs: &[FipConf]) -> Result<(), IpamError> {
        let entries = models::expand(confs)?;
        let seeds: Vec<PoolSeed> = entries
            .iter()
            .flat_map(|entry| {
                let subnet = entry.routable_subnet;
                entry.ips().map(move |ip| PoolSeed { ip, subnet })
            })
            .collect();
        let orphans = self.store.reconcile(&seeds).await?;
        for orphan in &orphans {
            warn!(
                ip = %orphan.ip,
                key = %orphan.key,
                "allocation is outside the configured pool, retaining as orphan"
            );
        }
        info!(
            subnets = entries.len(),
            ips = seeds.len(),
            orphans = orphans.len(),
            "configured floating IP pool"
        );
        *self.pools.write().await = entries;
        Ok(())
    }

    /// Routable subnets of the active pool.
    pub async fn configured_subnets(&self) -> Vec<Ipv4Network> {
        let pools = self.pools.read().await;
        pools.iter().map(|entry| entry.routable_subnet).collect()
    }

    /// The configured routable subnet containing `ip`, if any.
    pub async fn routable_subnet(&self, ip: Ipv4Addr) -> Option<Ipv4Network> {
        let pools = self.pools.read().await;
        pools
            .iter()
            .find(|entry| entry.routable_subnet.contains(ip))
            .map(|entry| entry.routable_subnet)
    }

    /// Subnets in which `key` holds at least one IP; with an empty key,
    /// every subnet that still has a free IP.
    pub async fn query_routable_subnet_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<Ipv4Network>, IpamError> {
        let raw = if key.is_empty() {
            self.store.subnets_with_free_ip().await?
        } else {
            self.store.subnets_with_key(key).await?
        };
        let mut subnets = Vec::with_capacity(raw.len());
        for s in raw {
            match s.parse::<Ipv4Network>() {
                Ok(net) => subnets.push(net),
                Err(_) => warn!(subnet = %s, "skipping unparsable subnet in store"),
            }
        }
        Ok(subnets)
    }

    /// Claims a free IP in `subnet` for `key`, recording `attr`.
    ///
    /// If the key already owns an IP anywhere the claim is refused with
    /// [`IpamError::AlreadyAllocated`]; callers re-query and reuse the
    /// winner's record, which makes concurrent allocations for one key
    /// converge.
    pub async fn allocate_in_subnet(
        &self,
        key: &str,
        subnet: &Ipv4Network,
        attr: &str,
    ) -> Result<Ipv4Addr, IpamError> {
        let owned = self.store.query_by_key(key).await?;
        if let Some(first) = owned.first() {
            return Err(IpamError::AlreadyAllocated {
                key: key.to_string(),
                ip: first.ip,
            });
        }
        match self.store.claim_one_in_subnet(key, subnet, attr).await? {
            Some(ip) => {
                info!(%key, %ip, subnet = %subnet, "allocated floating IP");
                Ok(ip)
            }
            None => Err(IpamError::NoEnoughIp),
        }
    }

    /// The first (smallest) IP owned by `key`, shaped for publication.
    ///
    /// Returns `None` for keys with no allocation, and for orphan records
    /// whose pool entry no longer exists (no gateway to publish).
    pub async fn query_first(&self, key: &str) -> Result<Option<IpInfo>, IpamError> {
        let owned = self.store.query_by_key(key).await?;
        let Some(record) = owned.first() else {
            return Ok(None);
        };
        let pools = self.pools.read().await;
        match pools.iter().find(|entry| entry.contains(record.ip)) {
            Some(entry) => Ok(Some(IpInfo {
                ip: record.ip,
                mask: entry.routable_subnet.prefix(),
                vlan: entry.vlan,
                gateway: entry.gateway,
                routable_subnet: entry.routable_subnet,
            })),
            None => {
                warn!(%key, ip = %record.ip, "owned IP is no longer in the configured pool");
                Ok(None)
            }
        }
    }

    /// Rows owned by `key`, ordered by ip.
    pub async fn query_by_key(&self, key: &str) -> Result<Vec<AllocationRecord>, IpamError> {
        Ok(self.store.query_by_key(key).await?)
    }

    /// Every owned row, for the resync sweep.
    pub async fn list_allocated(&self) -> Result<Vec<AllocationRecord>, IpamError> {
        Ok(self.store.list_allocated().await?)
    }

    /// Frees every IP owned by one of `keys`. Freeing a key with no
    /// allocation is a no-op.
    pub async fn release(&self, keys: &[String]) -> Result<(), IpamError> {
        for key in keys {
            for record in self.store.query_by_key(key).await? {
                info!(%key, ip = %record.ip, "releasing floating IP");
            }
        }
        let released = self.store.release_by_keys(keys).await?;
        debug!(released, "release finished");
        Ok(())
    }

    /// Frees every IP whose owner key starts with `prefix` (all instances
    /// of one app).
    pub async fn release_by_prefix(&self, prefix: &str) -> Result<(), IpamError> {
        let records = self.store.query_by_prefix(prefix).await?;
        for record in &records {
            info!(key = %record.key, ip = %record.ip, "releasing floating IP");
        }
        self.store.release_by_prefix(prefix).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryStore;

    fn conf(subnet: &str, ips: &[&str], gateway: &str) -> FipConf {
        FipConf {
            routable_subnet: subnet.parse().unwrap(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            gateway: gateway.parse().unwrap(),
            vlan: 0,
        }
    }

    async fn ipam_with_pool() -> (Ipam, MemoryStore) {
        let store = MemoryStore::new();
        let ipam = Ipam::new(Arc::new(store.clone()));
        ipam.configure_pool(&[conf("10.0.0.0/29", &["10.0.0.1~10.0.0.3"], "10.0.0.6")])
            .await
            .unwrap();
        (ipam, store)
    }

    #[tokio::test]
    async fn allocate_refuses_second_ip_for_same_key() {
        let (ipam, _) = ipam_with_pool().await;
        let subnet: Ipv4Network = "10.0.0.0/29".parse().unwrap();

        let ip = ipam.allocate_in_subnet("ns_p1", &subnet, "n1").await.unwrap();
        assert_eq!(ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap());

        let err = ipam.allocate_in_subnet("ns_p1", &subnet, "n1").await.unwrap_err();
        match err {
            IpamError::AlreadyAllocated { ip, .. } => {
                assert_eq!(ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap())
            }
            other => panic!("unexpected error: {other}"),
        }
        // The refused claim did not consume anything.
        let first = ipam.query_first("ns_p1").await.unwrap().unwrap();
        assert_eq!(first.ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn allocate_exhaustion_reports_no_enough_ip() {
        let (ipam, _) = ipam_with_pool().await;
        let subnet: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        for key in ["ns_p1", "ns_p2", "ns_p3"] {
            ipam.allocate_in_subnet(key, &subnet, "n1").await.unwrap();
        }
        let err = ipam.allocate_in_subnet("ns_p4", &subnet, "n1").await.unwrap_err();
        assert!(matches!(err, IpamError::NoEnoughIp));
    }

    #[tokio::test]
    async fn query_first_after_release_is_none() {
        let (ipam, _) = ipam_with_pool().await;
        let subnet: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        ipam.allocate_in_subnet("ns_p1", &subnet, "n1").await.unwrap();
        assert!(ipam.query_first("ns_p1").await.unwrap().is_some());

        ipam.release(&["ns_p1".to_string()]).await.unwrap();
        assert!(ipam.query_first("ns_p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn free_count_is_invariant_across_allocate_release() {
        let (ipam, store) = ipam_with_pool().await;
        let subnet: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        let before = store.free_count();
        ipam.allocate_in_subnet("ns_p1", &subnet, "n1").await.unwrap();
        ipam.release(&["ns_p1".to_string()]).await.unwrap();
        ipam.allocate_in_subnet("ns_p2", &subnet, "n1").await.unwrap();
        ipam.release(&["ns_p2".to_string()]).await.unwrap();
        assert_eq!(store.free_count(), before);
    }

    #[tokio::test]
    async fn query_first_shapes_annotation_payload() {
        let (ipam, _) = ipam_with_pool().await;
        let subnet: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        ipam.allocate_in_subnet("ns_p1", &subnet, "n1").await.unwrap();

        let info = ipam.query_first("ns_p1").await.unwrap().unwrap();
        assert_eq!(info.mask, 29);
        assert_eq!(info.gateway, "10.0.0.6".parse::<Ipv4Addr>().unwrap());
        assert_eq!(info.routable_subnet, subnet);
        assert_eq!(info.vlan, 0);
    }

    #[tokio::test]
    async fn subnet_queries_follow_ownership() {
        let store = MemoryStore::new();
        let ipam = Ipam::new(Arc::new(store));
        ipam.configure_pool(&[
            conf("10.0.0.0/29", &["10.0.0.1"], "10.0.0.6"),
            conf("10.0.1.0/29", &["10.0.1.1"], "10.0.1.6"),
        ])
        .await
        .unwrap();
        let sub_a: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        let sub_b: Ipv4Network = "10.0.1.0/29".parse().unwrap();

        // No ownership yet: empty key sees both subnets as allocatable.
        assert_eq!(
            ipam.query_routable_subnet_by_key("").await.unwrap(),
            vec![sub_a, sub_b]
        );
        assert!(ipam.query_routable_subnet_by_key("ns_p1").await.unwrap().is_empty());

        ipam.allocate_in_subnet("ns_p1", &sub_a, "n1").await.unwrap();
        assert_eq!(
            ipam.query_routable_subnet_by_key("ns_p1").await.unwrap(),
            vec![sub_a]
        );
        // Subnet a is now full; only b has a free IP.
        assert_eq!(ipam.query_routable_subnet_by_key("").await.unwrap(), vec![sub_b]);
    }

    #[tokio::test]
    async fn reconfigure_preserves_owned_records() {
        let (ipam, store) = ipam_with_pool().await;
        let subnet: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        ipam.allocate_in_subnet("ns_p1", &subnet, "n1").await.unwrap();

        ipam.configure_pool(&[conf("10.0.0.0/29", &["10.0.0.2~10.0.0.4"], "10.0.0.6")])
            .await
            .unwrap();
        // .1 survives as an owned orphan; query_first hides it since its
        // pool entry is gone, but the record itself remains releasable.
        assert!(ipam.query_first("ns_p1").await.unwrap().is_none());
        assert_eq!(ipam.query_by_key("ns_p1").await.unwrap().len(), 1);
        assert!(store.record("10.0.0.1".parse().unwrap()).is_some());

        ipam.release(&["ns_p1".to_string()]).await.unwrap();
        assert!(ipam.query_by_key("ns_p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn routable_subnet_matches_node_addresses() {
        let (ipam, _) = ipam_with_pool().await;
        assert_eq!(
            ipam.routable_subnet("10.0.0.5".parse().unwrap()).await,
            Some("10.0.0.0/29".parse().unwrap())
        );
        assert_eq!(ipam.routable_subnet("10.1.0.5".parse().unwrap()).await, None);
    }
}
