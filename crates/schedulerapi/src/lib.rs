//! Scheduler-extender wire contract.
//!
//! JSON request/response types exchanged with the cluster scheduler's
//! extender hooks (`filter`, `prioritize`, `bind`). Field names follow the
//! scheduler's own serialization, so these types must stay wire-stable.

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::List;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arguments the scheduler sends to `filter` and `prioritize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderArgs {
    /// Pod being scheduled.
    pub pod: Pod,
    /// Candidate nodes where the pod could be placed.
    pub nodes: List<Node>,
}

/// Per-node rejection reasons keyed by node name.
pub type FailedNodesMap = BTreeMap<String, String>;

/// Result of a `filter` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    /// Nodes that remain viable for the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<List<Node>>,
    /// Nodes filtered out, with the reason for each.
    #[serde(default, rename = "failedNodes", skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_nodes: FailedNodesMap,
    /// Set when the whole filter pass failed; aborts scheduling of the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtenderFilterResult {
    /// Wraps accepted nodes and per-node failures into a wire result.
    pub fn accepted(nodes: Vec<Node>, failed_nodes: FailedNodesMap) -> Self {
        Self {
            nodes: Some(List {
                items: nodes,
                metadata: Default::default(),
            }),
            failed_nodes,
            error: None,
        }
    }

    /// A result carrying a scheduling-aborting error.
    pub fn errored(error: String) -> Self {
        Self {
            nodes: None,
            failed_nodes: FailedNodesMap::new(),
            error: Some(error),
        }
    }
}

/// Arguments for a `bind` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderBindingArgs {
    /// Name of the pod being bound.
    pub pod_name: String,
    /// Namespace of the pod being bound.
    pub pod_namespace: String,
    /// UID of the pod being bound.
    #[serde(default, rename = "podUID")]
    pub pod_uid: String,
    /// Node selected by the scheduler.
    pub node: String,
}

/// Result of a `bind` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingResult {
    /// Set when binding failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Priority of scheduling onto one host; higher is better.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPriority {
    /// Name of the host.
    pub host: String,
    /// Non-negative score associated with the host.
    pub score: u64,
}

/// Host priorities ordered by `(score desc, host asc)`.
pub type HostPriorityList = Vec<HostPriority>;

/// Sorts a priority list into its canonical wire order.
pub fn sort_host_priorities(list: &mut HostPriorityList) {
    list.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.host.cmp(&b.host)));
}
