//! Orchestrator access.
//!
//! The plugin talks to the cluster through the [`ClusterClient`] capability
//! bundle: a node/pod/configmap reader, a pod patcher, and a TApp lister.
//! The trait exists so tests can substitute an in-memory cluster.

use async_trait::async_trait;
use crds::{tapp::TAPP_INSTANCE_KEY, TApp};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::keys;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error>;

    /// Merge-patches a pod's metadata, used to publish the allocation
    /// annotation.
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), kube::Error>;

    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<ConfigMap, kube::Error>;

    /// The named TApp, or `None` when the workload does not exist.
    async fn get_tapp(&self, namespace: &str, name: &str) -> Result<Option<TApp>, kube::Error>;
}

/// TApps owning the given instance pod; empty when the pod does not belong
/// to one or the workload is gone.
pub async fn pod_tapps(
    cluster: &dyn ClusterClient,
    pod: &Pod,
) -> Result<Vec<TApp>, kube::Error> {
    let Some(app) = tapp_name_of(pod) else {
        return Ok(Vec::new());
    };
    let Some(namespace) = pod.metadata.namespace.as_deref() else {
        return Ok(Vec::new());
    };
    Ok(cluster.get_tapp(namespace, &app).await?.into_iter().collect())
}

/// `ClusterClient` over a live API server connection.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_node(&self, name: &str) -> Result<Node, kube::Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.get(name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get(name).await
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, kube::Error> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        config_maps.get(name).await
    }

    async fn get_tapp(&self, namespace: &str, name: &str) -> Result<Option<TApp>, kube::Error> {
        let tapps: Api<TApp> = Api::namespaced(self.client.clone(), namespace);
        tapps.get_opt(name).await
    }
}

/// Derives the owning TApp name from an instance pod.
///
/// Instance pods are named `appname-index` and labeled with their index;
/// the label is authoritative when present.
pub fn tapp_name_of(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref()?;
    if let Some(index) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(TAPP_INSTANCE_KEY))
    {
        if let Some(app) = name.strip_suffix(&format!("-{index}")) {
            return Some(app.to_string());
        }
    }
    keys::split_instance(name).map(|(app, _)| app.to_string())
}

/// Whether a kube error is the API server's not-found response.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Whether a kube error is a server-side timeout worth retrying.
pub fn is_server_timeout(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "ServerTimeout" || resp.code == 504)
}
