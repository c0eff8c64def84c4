//! TApp CRD
//!
//! An indexed workload: every instance has a stable slot index and a
//! desired per-instance status. The floating IP plugin consults the status
//! of a pod's slot before deciding whether its IP may be reclaimed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pod label carrying the instance's slot index within its TApp.
pub const TAPP_INSTANCE_KEY: &str = "tapp_instance_key";

/// Desired per-instance status marking a slot as permanently stopped.
pub const INSTANCE_KILLED: &str = "Killed";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apps.tkestack.io",
    version = "v1",
    kind = "TApp",
    namespaced,
    status = "TAppStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TAppSpec {
    /// Number of instance slots.
    #[serde(default)]
    pub replicas: i32,

    /// Desired status per instance index, e.g. `{"0": "Running", "2": "Killed"}`.
    /// Slots absent from the map follow the workload default.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub statuses: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TAppStatus {
    /// Observed number of running instances.
    #[serde(default)]
    pub ready_replicas: i32,
}

/// Whether a desired instance status marks the slot as killed.
///
/// Historic controllers wrote both `killed` and `Killed`; compare
/// case-insensitively.
pub fn instance_killed(status: &str) -> bool {
    status.eq_ignore_ascii_case(INSTANCE_KILLED)
}
