//! Owner keys.
//!
//! The key joining the allocation table to the orchestrator, derivable
//! from the pod alone: `namespace_podname`. TApp instance pods are named
//! `appname-index`, so their keys come out as `namespace_appname-index`
//! and a whole app is addressable by the prefix `namespace_appname-`.

use k8s_openapi::api::core::v1::Pod;

/// Key for a pod known by name and namespace.
pub fn key_for(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

/// Key of a pod object; `None` when identity fields are missing.
pub fn pod_key(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref()?;
    Some(key_for(namespace, name))
}

/// Splits a key back into `(namespace, pod name)`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('_').filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
}

/// Splits an instance pod name into `(app, index)` when it has the
/// `appname-index` shape with a numeric index.
pub fn split_instance(name: &str) -> Option<(&str, &str)> {
    let (app, index) = name.rsplit_once('-')?;
    if app.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((app, index))
}

/// Release prefix covering every instance of an app.
pub fn app_prefix(namespace: &str, app: &str) -> String {
    format!("{namespace}_{app}-")
}
