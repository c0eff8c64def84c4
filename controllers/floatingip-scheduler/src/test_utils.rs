//! Test utilities
//!
//! Builders for pods, nodes and TApps, plus an in-memory `ClusterClient`
//! so plugin behavior can be exercised without an API server.

#![cfg(test)]

use async_trait::async_trait;
use crds::{TApp, TAppSpec};
use fip_ipam::{FipConf, Ipam, MemoryStore};
use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeAddress, NodeStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::cluster::ClusterClient;
use crate::config::Conf;
use crate::plugin::FloatingIpPlugin;

pub const OBJECT_LABELS: &[(&str, &str)] = &[("network", "FLOATINGIP")];
pub const INVARIANT_LABELS: &[(&str, &str)] =
    &[("network", "FLOATINGIP"), ("floatingip", "invariant")];

fn labels_of(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// A pod with the given labels.
pub fn pod(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: labels_of(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A pod carrying `base` labels plus `extra` ones.
pub fn labeled_pod(
    name: &str,
    namespace: &str,
    base: &[(&str, &str)],
    extra: &[(&str, &str)],
) -> Pod {
    let mut all: Vec<(&str, &str)> = base.to_vec();
    all.extend_from_slice(extra);
    pod(name, namespace, &all)
}

/// A floating-IP pod that was evicted from its node.
pub fn evicted_pod(name: &str, namespace: &str) -> Pod {
    let mut pod = pod(name, namespace, OBJECT_LABELS);
    pod.status = Some(PodStatus {
        phase: Some("Failed".to_string()),
        reason: Some("Evicted".to_string()),
        ..Default::default()
    });
    pod
}

/// A node, optionally fabric-labeled and with an internal address.
pub fn node(name: &str, labeled: bool, internal_ip: Option<&str>) -> Node {
    let labels = if labeled {
        labels_of(&[("network", "floatingip")])
    } else {
        None
    };
    let status = internal_ip.map(|ip| NodeStatus {
        addresses: Some(vec![NodeAddress {
            address: ip.to_string(),
            type_: "InternalIP".to_string(),
        }]),
        ..Default::default()
    });
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels,
            ..Default::default()
        },
        status,
        ..Default::default()
    }
}

/// A TApp with the given per-slot desired statuses.
pub fn tapp(name: &str, namespace: &str, statuses: &[(&str, &str)]) -> TApp {
    TApp {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: TAppSpec {
            replicas: statuses.len() as i32,
            statuses: statuses
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
        status: None,
    }
}

/// Two-subnet pool used across the plugin tests: `10.0.0.0/29` with
/// `.1~.3` and `10.0.1.0/29` with `.1~.2`.
pub fn pool() -> Vec<FipConf> {
    serde_json::from_str(
        r#"[
            {"routableSubnet": "10.0.0.0/29", "ips": ["10.0.0.1~10.0.0.3"], "gateway": "10.0.0.6"},
            {"routableSubnet": "10.0.1.0/29", "ips": ["10.0.1.1~10.0.1.2"], "gateway": "10.0.1.6"}
        ]"#,
    )
    .unwrap()
}

/// A plugin over a `MemoryStore`-backed IPAM preconfigured with [`pool`].
pub async fn test_plugin(cluster: MockCluster) -> (Arc<FloatingIpPlugin>, mpsc::Receiver<Pod>) {
    let ipam = Ipam::new(Arc::new(MemoryStore::new()));
    ipam.configure_pool(&pool()).await.unwrap();
    let conf = Conf::parse(r#"{"database": {"url": "sqlite::memory:"}}"#).unwrap();
    let (tx, rx) = mpsc::channel(10);
    let plugin = FloatingIpPlugin::new(Arc::new(ipam), Arc::new(cluster), conf, tx);
    (Arc::new(plugin), rx)
}

fn not_found(what: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{what} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

/// In-memory stand-in for the orchestrator.
#[derive(Clone, Default)]
pub struct MockCluster {
    nodes: Arc<Mutex<HashMap<String, Node>>>,
    pods: Arc<Mutex<HashMap<(String, String), Pod>>>,
    tapps: Arc<Mutex<HashMap<(String, String), TApp>>>,
    config_maps: Arc<Mutex<HashMap<(String, String), ConfigMap>>>,
    patches: Arc<Mutex<Vec<(String, String, serde_json::Value)>>>,
    fail_patches: Arc<Mutex<bool>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, node);
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn add_tapp(&self, tapp: TApp) {
        let key = (
            tapp.metadata.namespace.clone().unwrap_or_default(),
            tapp.metadata.name.clone().unwrap_or_default(),
        );
        self.tapps.lock().unwrap().insert(key, tapp);
    }

    pub fn set_config_map(&self, namespace: &str, name: &str, key: &str, value: &str) {
        let mut data = BTreeMap::new();
        data.insert(key.to_string(), value.to_string());
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        self.config_maps
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), cm);
    }

    /// Makes every subsequent pod patch fail with a server error.
    pub fn fail_patches(&self) {
        *self.fail_patches.lock().unwrap() = true;
    }

    /// Patches recorded so far as `(namespace, name, body)`.
    pub fn patches(&self) -> Vec<(String, String, serde_json::Value)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), kube::Error> {
        if *self.fail_patches.lock().unwrap() {
            return Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "injected patch failure".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }));
        }
        self.patches
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string(), patch));
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, kube::Error> {
        self.config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn get_tapp(&self, namespace: &str, name: &str) -> Result<Option<TApp>, kube::Error> {
        Ok(self
            .tapps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
