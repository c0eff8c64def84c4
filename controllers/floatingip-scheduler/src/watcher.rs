//! Kubernetes resource watchers.
//!
//! The pod watcher feeds lifecycle events into the plugin; the pool
//! watcher keeps the floating IP pool in sync with its configmap. Both
//! run until shutdown; transient failures are logged and absorbed.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::extender::SchedulerPlugin;
use crate::plugin::FloatingIpPlugin;

/// How often the pool configmap is compared against the last applied value.
const POOL_SYNC_PERIOD: Duration = Duration::from_secs(60);
/// Poll cadence while waiting for the very first pool definition.
const POOL_BOOT_INTERVAL: Duration = Duration::from_millis(100);

/// Streams pod events into the plugin's lifecycle hooks.
///
/// The underlying watcher reconnects on its own; stream-level errors are
/// transient and only logged.
pub async fn watch_pods(
    plugin: Arc<dyn SchedulerPlugin>,
    client: Client,
) -> Result<(), PluginError> {
    let pods: Api<Pod> = Api::all(client);
    let mut stream = watcher(pods, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pod)) => {
                if let Err(e) = plugin.update_pod(&pod, &pod).await {
                    warn!(error = %e, "pod update handling failed");
                }
            }
            Ok(watcher::Event::Deleted(pod)) => {
                if let Err(e) = plugin.remove_pod(&pod).await {
                    warn!(error = %e, "pod removal handling failed");
                }
            }
            Ok(watcher::Event::Restarted(pods)) => {
                debug!(pods = pods.len(), "pod watch restarted");
            }
            Err(e) => warn!(error = %e, "pod watch error"),
        }
    }
    Err(PluginError::Watch("pod watch stream ended".to_string()))
}

/// Blocks until the first pool definition has been fetched and applied.
/// Startup must not complete before the pool is known.
pub async fn await_initial_pool(plugin: &FloatingIpPlugin) {
    let mut tick = interval(POOL_BOOT_INTERVAL);
    loop {
        tick.tick().await;
        match plugin.sync_pool_config().await {
            Ok(_) => return,
            Err(e) => warn!(error = %e, "waiting for floating IP configmap"),
        }
    }
}

/// Periodically re-fetches the pool configmap, applying it on change.
pub async fn pool_config_loop(plugin: Arc<FloatingIpPlugin>) {
    let mut tick = interval(POOL_SYNC_PERIOD);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if let Err(e) = plugin.sync_pool_config().await {
            warn!(error = %e, "pool configmap sync failed");
        }
    }
}
