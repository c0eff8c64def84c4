//! Floating IP plugin.
//!
//! Implements the extender hooks: `filter` admits only nodes whose routable
//! subnet can still serve the pod, `bind` allocates (or reuses) an IP and
//! publishes it as a pod annotation, and the lifecycle hooks feed pods that
//! may need their IP released into the reconciler's queue.

use fip_ipam::{FipConf, IpInfo, Ipam, IpamError};
use k8s_openapi::api::core::v1::{Node, Pod};
use schedulerapi::{ExtenderBindingArgs, FailedNodesMap, HostPriorityList};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::Conf;
use crate::error::PluginError;
use crate::extender::SchedulerPlugin;
use crate::keys;
use crate::node_subnet::NodeSubnetCache;
use crate::retry::{retry_within, RetryError};

use async_trait::async_trait;

/// Annotation under which the allocation is published on the pod.
pub const ANNOTATION_FLOATINGIP: &str = "floatingip";

/// Pods opt in to the plugin with this label.
const OBJECT_SELECTOR: (&str, &str) = ("network", "FLOATINGIP");
/// Nodes carrying this label can host floating IP pods.
const NODE_SELECTOR: (&str, &str) = ("network", "floatingip");
/// Pods with this label keep their IP across restarts of the same slot.
const INVARIANT_SELECTOR: (&str, &str) = ("floatingip", "invariant");

const REASON_UNLABEL_NODE: &str = "FloatingIPPlugin:UnlabelNode";
const REASON_NO_FIP_LEFT: &str = "FloatingIPPlugin:NoFIPLeft";

const PATCH_INTERVAL: Duration = Duration::from_millis(300);
const PATCH_BUDGET: Duration = Duration::from_secs(20);

pub struct FloatingIpPlugin {
    pub(crate) ipam: Arc<Ipam>,
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) conf: Conf,
    node_subnet: NodeSubnetCache,
    last_pool_conf: Mutex<String>,
    unreleased: mpsc::Sender<Pod>,
}

fn has_label(labels: Option<&BTreeMap<String, String>>, selector: (&str, &str)) -> bool {
    labels
        .and_then(|labels| labels.get(selector.0))
        .is_some_and(|value| value == selector.1)
}

/// Whether a pod failed due to node-pressure eviction.
pub fn evicted(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Failed") && status.reason.as_deref() == Some("Evicted")
}

impl FloatingIpPlugin {
    pub fn new(
        ipam: Arc<Ipam>,
        cluster: Arc<dyn ClusterClient>,
        conf: Conf,
        unreleased: mpsc::Sender<Pod>,
    ) -> Self {
        Self {
            ipam,
            cluster,
            conf,
            node_subnet: NodeSubnetCache::new(),
            last_pool_conf: Mutex::new(String::new()),
            unreleased,
        }
    }

    /// Whether the pod opted in to floating IP scheduling.
    pub fn wanted_object(&self, pod: &Pod) -> bool {
        has_label(pod.metadata.labels.as_ref(), OBJECT_SELECTOR)
    }

    /// Whether the pod wants its IP retained across slot restarts.
    pub fn invariant(&self, pod: &Pod) -> bool {
        has_label(pod.metadata.labels.as_ref(), INVARIANT_SELECTOR)
    }

    fn node_labeled(&self, node: &Node) -> bool {
        has_label(node.metadata.labels.as_ref(), NODE_SELECTOR)
    }

    /// Allocates an IP for `key` on the winner node, reusing any existing
    /// allocation. The post-claim re-query must find the record; an empty
    /// result means the store is inconsistent.
    async fn allocate_ip(&self, key: &str, node_name: &str) -> Result<IpInfo, PluginError> {
        if let Some(info) = self.ipam.query_first(key).await? {
            debug!(%key, ip = %info.ip, "pod already owns a floating IP, reusing");
            info!(%key, ip = %info.ip, "reused floating IP");
            return Ok(info);
        }
        let subnet = self
            .node_subnet
            .lookup(&self.ipam, self.cluster.as_ref(), node_name)
            .await?;
        match self.ipam.allocate_in_subnet(key, &subnet, node_name).await {
            Ok(_) => {}
            // Lost a concurrent claim for the same key; the winner's record
            // is picked up by the re-query below.
            Err(IpamError::AlreadyAllocated { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        let info = self.ipam.query_first(key).await?.ok_or_else(|| {
            PluginError::Inconsistent(format!("no floating IP record for {key} after claim"))
        })?;
        info!(%key, ip = %info.ip, node = node_name, "allocated floating IP");
        Ok(info)
    }

    /// Releases whatever `key` owns; no-op when it owns nothing.
    pub(crate) async fn release_pod_ip(&self, key: &str) -> Result<(), PluginError> {
        if self.ipam.query_by_key(key).await?.is_empty() {
            return Ok(());
        }
        self.ipam.release(&[key.to_string()]).await?;
        Ok(())
    }

    pub(crate) async fn queue_release(&self, pod: &Pod) -> Result<(), PluginError> {
        self.unreleased
            .send(pod.clone())
            .await
            .map_err(|_| PluginError::Watch("release loop is gone".to_string()))
    }

    /// Fetches the pool configmap and reconfigures the pool when its
    /// serialized value changed. Returns whether a new value was seen.
    pub async fn sync_pool_config(&self) -> Result<bool, PluginError> {
        let namespace = &self.conf.config_map_namespace;
        let name = &self.conf.config_map_name;
        let cm = self.cluster.get_config_map(namespace, name).await?;
        let raw = cm
            .data
            .and_then(|mut data| data.remove("floatingips"))
            .ok_or_else(|| {
                PluginError::InvalidConfig(format!(
                    "configmap {namespace}/{name} has no floatingips key"
                ))
            })?;
        {
            let last = self.last_pool_conf.lock().await;
            if *last == raw {
                debug!("floating IP configmap unchanged");
                return Ok(false);
            }
        }
        info!(%namespace, %name, "floating IP configmap changed, reconfiguring pool");
        let confs: Vec<FipConf> = serde_json::from_str(&raw).map_err(|e| {
            PluginError::InvalidConfig(format!("configmap {namespace}/{name}: {e}"))
        })?;
        *self.last_pool_conf.lock().await = raw;
        match self.ipam.configure_pool(&confs).await {
            Ok(()) => {
                let configured = self.ipam.configured_subnets().await;
                self.node_subnet.retain_subnets(&configured).await;
            }
            Err(e) => warn!(error = %e, "failed to configure pool"),
        }
        Ok(true)
    }
}

#[async_trait]
impl SchedulerPlugin for FloatingIpPlugin {
    async fn filter(
        &self,
        pod: &Pod,
        nodes: Vec<Node>,
    ) -> Result<(Vec<Node>, FailedNodesMap), PluginError> {
        let mut failed = FailedNodesMap::new();
        if !self.wanted_object(pod) {
            return Ok((nodes, failed));
        }
        let key = keys::pod_key(pod)
            .ok_or_else(|| PluginError::InvalidObject("pod has no name or namespace".into()))?;

        // A stale allocation (eviction, restart) is authoritative: the pod
        // must go back to its subnet. Only a fresh key may consider every
        // subnet that still has capacity.
        let mut subnets = self.ipam.query_routable_subnet_by_key(&key).await?;
        if subnets.is_empty() {
            subnets = self.ipam.query_routable_subnet_by_key("").await?;
        } else {
            debug!(%key, ?subnets, "key already holds a floating IP, pinning to its subnet");
        }

        let mut accepted = Vec::new();
        for node in nodes {
            let name = node.metadata.name.clone().unwrap_or_default();
            if !self.node_labeled(&node) {
                failed.insert(name, REASON_UNLABEL_NODE.to_string());
                continue;
            }
            match self.node_subnet.subnet_of(&self.ipam, &node).await {
                Ok(subnet) if subnets.contains(&subnet) => accepted.push(node),
                Ok(_) => {
                    failed.insert(name, REASON_NO_FIP_LEFT.to_string());
                }
                Err(e) => {
                    failed.insert(name, e.to_string());
                }
            }
        }
        debug!(%key, accepted = accepted.len(), failed = failed.len(), "filtered nodes");
        Ok((accepted, failed))
    }

    async fn prioritize(
        &self,
        _pod: &Pod,
        _nodes: &[Node],
    ) -> Result<HostPriorityList, PluginError> {
        // Scoring is reserved; all viable nodes rank equally.
        Ok(HostPriorityList::new())
    }

    async fn bind(&self, args: &ExtenderBindingArgs) -> Result<(), PluginError> {
        let key = keys::key_for(&args.pod_namespace, &args.pod_name);
        let info = self.allocate_ip(&key, &args.node).await?;
        let payload = serde_json::to_string(&info)?;
        let patch = json!({
            "metadata": {
                "annotations": { ANNOTATION_FLOATINGIP: payload }
            }
        });

        let result = retry_within(
            PATCH_INTERVAL,
            PATCH_BUDGET,
            || {
                self.cluster
                    .patch_pod(&args.pod_namespace, &args.pod_name, patch.clone())
            },
            |_| true,
        )
        .await;
        match result {
            Ok(()) => {
                debug!(%key, ip = %info.ip, "published floating IP annotation");
                Ok(())
            }
            // The allocation stays committed: the store is the source of
            // truth and resync reclaims it if the pod never materializes.
            Err(RetryError::Terminal(e)) | Err(RetryError::Exhausted(e)) => {
                warn!(%key, error = %e, "failed to annotate pod, leaving allocation for resync");
                Err(PluginError::Timeout(format!(
                    "annotating pod {key}: {e}"
                )))
            }
        }
    }

    async fn add_pod(&self, _pod: &Pod) -> Result<(), PluginError> {
        Ok(())
    }

    async fn update_pod(&self, _old: &Pod, new: &Pod) -> Result<(), PluginError> {
        if !self.wanted_object(new) {
            return Ok(());
        }
        // Deployments leave evicted pods behind; reclaim their IPs as soon
        // as the eviction is observed.
        if evicted(new) {
            self.queue_release(new).await?;
        }
        Ok(())
    }

    async fn remove_pod(&self, pod: &Pod) -> Result<(), PluginError> {
        if !self.wanted_object(pod) {
            return Ok(());
        }
        self.queue_release(pod).await
    }
}
