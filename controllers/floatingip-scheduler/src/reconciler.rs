//! Release reconciliation.
//!
//! Two tiers decide when an IP goes back to the pool. The event tier
//! consumes pods from the `unreleased` queue and releases immediately
//! unless the invariant policy retains the slot's IP. The resync tier
//! periodically sweeps every allocation and repairs whatever the event
//! tier missed: lost events, annotation failures, crashes.

use crds::tapp::{instance_killed, TAPP_INSTANCE_KEY};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{is_not_found, pod_tapps};
use crate::error::PluginError;
use crate::keys;
use crate::plugin::{evicted, FloatingIpPlugin};

/// Delay before a failed unbind is handed back to the queue.
const REQUEUE_BACKOFF: Duration = Duration::from_millis(300);

/// Consumes pods needing release evaluation.
///
/// Each pod's unbind runs in its own task so one slow release cannot
/// starve the queue. Failed unbinds re-enqueue after a short backoff;
/// there is no retry cap, the resync tier is the backstop.
pub async fn release_loop(plugin: Arc<FloatingIpPlugin>, mut unreleased: mpsc::Receiver<Pod>) {
    info!("release loop started");
    while let Some(pod) = unreleased.recv().await {
        let plugin = plugin.clone();
        tokio::spawn(async move {
            if let Err(e) = unbind(&plugin, &pod).await {
                let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
                warn!(pod = name, error = %e, "unbind failed, re-enqueueing");
                sleep(REQUEUE_BACKOFF).await;
                if plugin.queue_release(&pod).await.is_err() {
                    warn!(pod = name, "release queue closed, dropping pod");
                }
            }
        });
    }
    info!("release loop stopped");
}

/// Decides whether the pod's IP goes back to the pool.
///
/// Non-invariant pods release unconditionally. Invariant pods keep their
/// IP while the owning TApp still wants the slot; only a killed slot (or a
/// missing workload) releases. TApp lookup failures fail open to release.
pub(crate) async fn unbind(plugin: &FloatingIpPlugin, pod: &Pod) -> Result<(), PluginError> {
    let key = keys::pod_key(pod)
        .ok_or_else(|| PluginError::InvalidObject("pod has no name or namespace".into()))?;
    if !plugin.invariant(pod) {
        return plugin.release_pod_ip(&key).await;
    }
    let tapps = match pod_tapps(plugin.cluster.as_ref(), pod).await {
        Ok(tapps) => tapps,
        Err(e) => {
            warn!(%key, error = %e, "TApp lookup failed, releasing");
            return plugin.release_pod_ip(&key).await;
        }
    };
    let Some(tapp) = tapps.first() else {
        return plugin.release_pod_ip(&key).await;
    };
    let slot = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(TAPP_INSTANCE_KEY));
    match slot.and_then(|slot| tapp.spec.statuses.get(slot)) {
        Some(status) if instance_killed(status) => plugin.release_pod_ip(&key).await,
        _ => {
            debug!(%key, "slot still desired, reserving floating IP");
            Ok(())
        }
    }
}

/// One full reconciliation pass between the allocation table and live
/// cluster state.
pub async fn resync(plugin: &FloatingIpPlugin) -> Result<(), PluginError> {
    let allocated = plugin.ipam.list_allocated().await?;
    debug!(allocations = allocated.len(), "resync sweep");

    let mut release_keys: Vec<String> = Vec::new();
    // app prefix -> (any live pod seen, keys of vanished instances)
    let mut apps: HashMap<String, (bool, Vec<String>)> = HashMap::new();

    for record in allocated {
        let key = record.key.clone();
        let Some((namespace, name)) = keys::split_key(&key) else {
            warn!(%key, "owner key does not parse, skipping");
            continue;
        };
        match plugin.cluster.get_pod(namespace, name).await {
            Ok(pod) => {
                if evicted(&pod) {
                    if let Err(e) = unbind(plugin, &pod).await {
                        warn!(%key, error = %e, "resync unbind failed");
                    }
                } else if let Some((app, _)) = keys::split_instance(name) {
                    apps.entry(keys::app_prefix(namespace, app)).or_default().0 = true;
                }
            }
            Err(e) if is_not_found(&e) => {
                let Some((app, slot)) = keys::split_instance(name) else {
                    release_keys.push(key);
                    continue;
                };
                match plugin.cluster.get_tapp(namespace, app).await {
                    Ok(Some(tapp)) => {
                        // The slot's key is stable, so a restarting
                        // instance reuses this record; release only a slot
                        // the workload no longer wants.
                        let killed = tapp
                            .spec
                            .statuses
                            .get(slot)
                            .is_some_and(|status| instance_killed(status));
                        if killed {
                            release_keys.push(key);
                        } else {
                            debug!(%key, "instance slot still desired, reserving");
                        }
                    }
                    Ok(None) => {
                        apps.entry(keys::app_prefix(namespace, app))
                            .or_default()
                            .1
                            .push(key);
                    }
                    Err(e) => {
                        warn!(%key, error = %e, "TApp lookup failed during resync");
                    }
                }
            }
            Err(e) => {
                warn!(%key, error = %e, "pod lookup failed during resync");
            }
        }
    }

    if !release_keys.is_empty() {
        plugin.ipam.release(&release_keys).await?;
    }
    for (prefix, (any_live, vanished)) in apps {
        if vanished.is_empty() {
            continue;
        }
        if any_live {
            plugin.ipam.release(&vanished).await?;
        } else {
            // The whole instance set is gone; reclaim the app wholesale.
            plugin.ipam.release_by_prefix(&prefix).await?;
        }
    }
    Ok(())
}

/// Periodic resync driver.
pub async fn resync_loop(plugin: Arc<FloatingIpPlugin>) {
    let period = Duration::from_secs(plugin.conf.resync_interval * 60);
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(e) = resync(&plugin).await {
            warn!(error = %e, "resync pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        evicted_pod, labeled_pod, node, pod, tapp, test_plugin, MockCluster, INVARIANT_LABELS,
        OBJECT_LABELS,
    };
    use ipnetwork::Ipv4Network;

    fn subnet() -> Ipv4Network {
        "10.0.0.0/29".parse().unwrap()
    }

    #[tokio::test]
    async fn unbind_releases_plain_pods() {
        let (plugin, _rx) = test_plugin(MockCluster::new()).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_p1", &subnet(), "n1")
            .await
            .unwrap();

        unbind(&plugin, &pod("p1", "ns", OBJECT_LABELS)).await.unwrap();
        assert!(plugin.ipam.query_by_key("ns_p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbind_reserves_live_invariant_slots() {
        let cluster = MockCluster::new();
        cluster.add_tapp(tapp("app", "ns", &[("0", "Running")]));
        let (plugin, _rx) = test_plugin(cluster).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_app-0", &subnet(), "n1")
            .await
            .unwrap();

        let instance = labeled_pod("app-0", "ns", INVARIANT_LABELS, &[(TAPP_INSTANCE_KEY, "0")]);
        unbind(&plugin, &instance).await.unwrap();
        assert_eq!(plugin.ipam.query_by_key("ns_app-0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unbind_releases_killed_invariant_slots() {
        let cluster = MockCluster::new();
        cluster.add_tapp(tapp("app", "ns", &[("0", "Killed")]));
        let (plugin, _rx) = test_plugin(cluster).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_app-0", &subnet(), "n1")
            .await
            .unwrap();

        let instance = labeled_pod("app-0", "ns", INVARIANT_LABELS, &[(TAPP_INSTANCE_KEY, "0")]);
        unbind(&plugin, &instance).await.unwrap();
        assert!(plugin.ipam.query_by_key("ns_app-0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbind_releases_when_no_tapp_owns_the_pod() {
        let (plugin, _rx) = test_plugin(MockCluster::new()).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_app-0", &subnet(), "n1")
            .await
            .unwrap();

        let instance = labeled_pod("app-0", "ns", INVARIANT_LABELS, &[(TAPP_INSTANCE_KEY, "0")]);
        unbind(&plugin, &instance).await.unwrap();
        assert!(plugin.ipam.query_by_key("ns_app-0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_loop_frees_evicted_pods() {
        let (plugin, rx) = test_plugin(MockCluster::new()).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_p1", &subnet(), "n1")
            .await
            .unwrap();

        let loop_plugin = plugin.clone();
        let handle = tokio::spawn(release_loop(loop_plugin, rx));

        plugin.queue_release(&evicted_pod("p1", "ns")).await.unwrap();
        // The loop spawns the unbind; give it a few polls to land.
        for _ in 0..50 {
            if plugin.ipam.query_by_key("ns_p1").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(plugin.ipam.query_by_key("ns_p1").await.unwrap().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn resync_releases_allocations_without_pods() {
        let cluster = MockCluster::new();
        cluster.add_node(node("n1", true, Some("10.0.0.4")));
        let (plugin, _rx) = test_plugin(cluster.clone()).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_gone", &subnet(), "n1")
            .await
            .unwrap();
        plugin
            .ipam
            .allocate_in_subnet("ns_alive", &subnet(), "n1")
            .await
            .unwrap();
        cluster.add_pod(pod("alive", "ns", OBJECT_LABELS));

        resync(&plugin).await.unwrap();
        assert!(plugin.ipam.query_by_key("ns_gone").await.unwrap().is_empty());
        assert_eq!(plugin.ipam.query_by_key("ns_alive").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resync_releases_evicted_pods() {
        let cluster = MockCluster::new();
        let (plugin, _rx) = test_plugin(cluster.clone()).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_p1", &subnet(), "n1")
            .await
            .unwrap();
        cluster.add_pod(evicted_pod("p1", "ns"));

        resync(&plugin).await.unwrap();
        assert!(plugin.ipam.query_by_key("ns_p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resync_reserves_vanished_instances_of_live_tapps() {
        let cluster = MockCluster::new();
        cluster.add_tapp(tapp("app", "ns", &[("0", "Running")]));
        let (plugin, _rx) = test_plugin(cluster).await;
        plugin
            .ipam
            .allocate_in_subnet("ns_app-0", &subnet(), "n1")
            .await
            .unwrap();

        resync(&plugin).await.unwrap();
        // The slot is still desired; a restarting instance reuses the IP.
        assert_eq!(plugin.ipam.query_by_key("ns_app-0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resync_reclaims_whole_vanished_apps() {
        let cluster = MockCluster::new();
        let (plugin, _rx) = test_plugin(cluster).await;
        for key in ["ns_app-0", "ns_app-1"] {
            plugin
                .ipam
                .allocate_in_subnet(key, &subnet(), "n1")
                .await
                .unwrap();
        }

        resync(&plugin).await.unwrap();
        assert!(plugin.ipam.query_by_key("ns_app-0").await.unwrap().is_empty());
        assert!(plugin.ipam.query_by_key("ns_app-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resync_repairs_failed_annotation_binds() {
        // An allocation exists but the pod never materialized (annotation
        // patching failed past its budget). Resync returns it to the pool.
        let cluster = MockCluster::new();
        cluster.add_node(node("n1", true, Some("10.0.0.4")));
        cluster.fail_patches();
        let (plugin, _rx) = test_plugin(cluster.clone()).await;

        let args = schedulerapi::ExtenderBindingArgs {
            pod_name: "p1".to_string(),
            pod_namespace: "ns".to_string(),
            pod_uid: "uid-1".to_string(),
            node: "n1".to_string(),
        };
        use crate::extender::SchedulerPlugin;
        tokio::time::pause();
        assert!(plugin.bind(&args).await.is_err());
        tokio::time::resume();
        assert_eq!(plugin.ipam.list_allocated().await.unwrap().len(), 1);

        resync(&plugin).await.unwrap();
        assert!(plugin.ipam.list_allocated().await.unwrap().is_empty());
    }
}
