//! Scheduler plugin capability set.
//!
//! The extender surface is a composable set of hooks: node filtering,
//! scoring, binding, and pod lifecycle notifications. The HTTP layer and
//! the pod watcher only see this trait; the floating IP plugin is one
//! implementation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use schedulerapi::{ExtenderBindingArgs, FailedNodesMap, HostPriorityList};

use crate::error::PluginError;

#[async_trait]
pub trait SchedulerPlugin: Send + Sync {
    /// Partitions candidate nodes into viable ones and per-node rejections.
    async fn filter(
        &self,
        pod: &Pod,
        nodes: Vec<Node>,
    ) -> Result<(Vec<Node>, FailedNodesMap), PluginError>;

    /// Scores viable nodes. An empty list leaves ordering to other
    /// scorers.
    async fn prioritize(
        &self,
        pod: &Pod,
        nodes: &[Node],
    ) -> Result<HostPriorityList, PluginError>;

    /// Commits the scheduler's placement decision.
    async fn bind(&self, args: &ExtenderBindingArgs) -> Result<(), PluginError>;

    /// Pod lifecycle notifications.
    async fn add_pod(&self, pod: &Pod) -> Result<(), PluginError>;
    async fn update_pod(&self, old: &Pod, new: &Pod) -> Result<(), PluginError>;
    async fn remove_pod(&self, pod: &Pod) -> Result<(), PluginError>;
}
