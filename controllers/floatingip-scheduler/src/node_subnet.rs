//! Node-to-subnet resolution.
//!
//! Maps a node name to the routable subnet its internal address falls in.
//! The mapping is cold and rarely changes, so a single mutex guards the
//! cache and the slow-path node fetch runs inside it.

use fip_ipam::Ipam;
use ipnetwork::Ipv4Network;
use k8s_openapi::api::core::v1::Node;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::{is_server_timeout, ClusterClient};
use crate::error::PluginError;
use crate::retry::{retry_within, RetryError};

const NODE_FETCH_INTERVAL: Duration = Duration::from_millis(100);
const NODE_FETCH_BUDGET: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct NodeSubnetCache {
    inner: Mutex<HashMap<String, Ipv4Network>>,
}

impl NodeSubnetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a node already in hand (the filter path).
    pub async fn subnet_of(&self, ipam: &Ipam, node: &Node) -> Result<Ipv4Network, PluginError> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut cache = self.inner.lock().await;
        if let Some(subnet) = cache.get(&name) {
            return Ok(*subnet);
        }
        let subnet = resolve(ipam, node).await?;
        cache.insert(name, subnet);
        Ok(subnet)
    }

    /// Resolves a node by name, fetching it from the API server (the bind
    /// path). Server timeouts are retried every 100 ms for up to a minute.
    pub async fn lookup(
        &self,
        ipam: &Ipam,
        cluster: &dyn ClusterClient,
        node_name: &str,
    ) -> Result<Ipv4Network, PluginError> {
        let mut cache = self.inner.lock().await;
        if let Some(subnet) = cache.get(node_name) {
            return Ok(*subnet);
        }
        let node = retry_within(
            NODE_FETCH_INTERVAL,
            NODE_FETCH_BUDGET,
            || cluster.get_node(node_name),
            is_server_timeout,
        )
        .await
        .map_err(|e| match e {
            RetryError::Terminal(e) => PluginError::Kube(e),
            RetryError::Exhausted(e) => {
                PluginError::Timeout(format!("fetching node {node_name}: {e}"))
            }
        })?;
        let subnet = resolve(ipam, &node).await?;
        cache.insert(node_name.to_string(), subnet);
        Ok(subnet)
    }

    /// Drops entries whose subnet is no longer configured. Valid entries
    /// repopulate lazily on the next lookup.
    pub async fn retain_subnets(&self, configured: &[Ipv4Network]) {
        let mut cache = self.inner.lock().await;
        let before = cache.len();
        cache.retain(|_, subnet| configured.contains(subnet));
        debug!(evicted = before - cache.len(), "pruned node subnet cache");
    }
}

async fn resolve(ipam: &Ipam, node: &Node) -> Result<Ipv4Network, PluginError> {
    let ip = internal_ip(node).ok_or(PluginError::UnknownNode)?;
    ipam.routable_subnet(ip)
        .await
        .ok_or(PluginError::NoFipConfigNode)
}

/// The node's internal IPv4 address from its status address list.
pub fn internal_ip(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .and_then(|addr| addr.address.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node, pool, MockCluster};
    use fip_ipam::MemoryStore;
    use std::sync::Arc;

    async fn ipam() -> Ipam {
        let ipam = Ipam::new(Arc::new(MemoryStore::new()));
        ipam.configure_pool(&pool()).await.unwrap();
        ipam
    }

    #[tokio::test]
    async fn resolves_and_caches_from_node_object() {
        let ipam = ipam().await;
        let cache = NodeSubnetCache::new();
        let n1 = node("n1", true, Some("10.0.0.4"));

        let subnet = cache.subnet_of(&ipam, &n1).await.unwrap();
        assert_eq!(subnet, "10.0.0.0/29".parse().unwrap());

        // A second resolution is served from the cache even if the node
        // object no longer carries addresses.
        let stale = node("n1", true, None);
        let subnet = cache.subnet_of(&ipam, &stale).await.unwrap();
        assert_eq!(subnet, "10.0.0.0/29".parse().unwrap());
    }

    #[tokio::test]
    async fn rejects_nodes_without_internal_address() {
        let ipam = ipam().await;
        let cache = NodeSubnetCache::new();
        let err = cache
            .subnet_of(&ipam, &node("n1", true, None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "FloatingIPPlugin:UnknownNode");
    }

    #[tokio::test]
    async fn rejects_nodes_outside_every_pool() {
        let ipam = ipam().await;
        let cache = NodeSubnetCache::new();
        let err = cache
            .subnet_of(&ipam, &node("n1", true, Some("192.168.9.1")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "FloatingIPPlugin:NoFIPConfigNode");
    }

    #[tokio::test]
    async fn lookup_fetches_the_node() {
        let ipam = ipam().await;
        let cache = NodeSubnetCache::new();
        let cluster = MockCluster::new();
        cluster.add_node(node("n1", true, Some("10.0.0.4")));

        let subnet = cache.lookup(&ipam, &cluster, "n1").await.unwrap();
        assert_eq!(subnet, "10.0.0.0/29".parse().unwrap());
    }

    #[tokio::test]
    async fn retain_subnets_evicts_dropped_pools() {
        let ipam = ipam().await;
        let cache = NodeSubnetCache::new();
        cache
            .subnet_of(&ipam, &node("n1", true, Some("10.0.0.4")))
            .await
            .unwrap();

        cache.retain_subnets(&[]).await;
        // Entry is gone; resolution now consults the node object again.
        let err = cache
            .subnet_of(&ipam, &node("n1", true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownNode));
    }
}
