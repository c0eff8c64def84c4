//! Floating IP Scheduler Plugin
//!
//! A scheduler extender that assigns externally-routable IPs to pods:
//! - filter: admits only nodes whose routable subnet can serve the pod
//! - bind: allocates an IP from the durable pool and annotates the pod
//! - lifecycle: releases IPs on eviction/removal, honoring the invariant
//!   retention policy, with a periodic resync as the safety net

mod cluster;
mod config;
mod error;
mod extender;
mod keys;
mod node_subnet;
mod plugin;
mod reconciler;
mod retry;
mod server;
mod test_utils;
mod watcher;

use crate::cluster::KubeCluster;
use crate::config::Conf;
use crate::error::PluginError;
use crate::extender::SchedulerPlugin;
use crate::plugin::FloatingIpPlugin;
use fip_ipam::{Ipam, IpamError, SqlStore};
use kube::Client;
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Capacity of the queue feeding the release loop.
const UNRELEASED_CAPACITY: usize = 10;

#[tokio::main]
async fn main() -> Result<(), PluginError> {
    tracing_subscriber::fmt::init();

    info!("starting floating IP scheduler plugin");

    let config_path = env::var("FLOATINGIP_CONFIG").map_err(|_| {
        PluginError::InvalidConfig("FLOATINGIP_CONFIG environment variable is required".to_string())
    })?;
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|e| PluginError::InvalidConfig(format!("reading {config_path}: {e}")))?;
    let conf = Conf::parse(&raw)
        .map_err(|e| PluginError::InvalidConfig(format!("parsing {config_path}: {e}")))?;
    let listen_addr =
        env::var("FLOATINGIP_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    info!(
        resync_interval_minutes = conf.resync_interval,
        config_map = %conf.config_map_name,
        "configuration loaded"
    );

    let store = SqlStore::connect(&conf.database.url, conf.database.max_connections)
        .await
        .map_err(IpamError::from)?;
    let ipam = Arc::new(Ipam::new(Arc::new(store)));

    let kube_client = Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(kube_client.clone()));

    let (unreleased_tx, unreleased_rx) = mpsc::channel(UNRELEASED_CAPACITY);
    let plugin = Arc::new(FloatingIpPlugin::new(
        ipam.clone(),
        cluster,
        conf.clone(),
        unreleased_tx,
    ));

    // Inline pool definitions win; otherwise startup blocks on the first
    // successful configmap fetch and the pool watcher keeps following it.
    let inline_pool = !conf.floatingips.is_empty();
    if inline_pool {
        ipam.configure_pool(&conf.floatingips).await?;
    } else {
        info!("no inline pool definitions, fetching from configmap");
        watcher::await_initial_pool(plugin.as_ref()).await;
        tokio::spawn(watcher::pool_config_loop(plugin.clone()));
    }

    let release_loop = tokio::spawn(reconciler::release_loop(plugin.clone(), unreleased_rx));
    let resync_loop = tokio::spawn(reconciler::resync_loop(plugin.clone()));
    let pod_watcher = tokio::spawn(watcher::watch_pods(
        plugin.clone() as Arc<dyn SchedulerPlugin>,
        kube_client,
    ));
    let http_server = tokio::spawn(server::serve(listen_addr, plugin));

    tokio::select! {
        result = pod_watcher => {
            result.map_err(|e| PluginError::Watch(format!("pod watcher panicked: {e}")))??;
        }
        result = http_server => {
            result.map_err(|e| PluginError::Watch(format!("http server panicked: {e}")))??;
        }
        result = release_loop => {
            result.map_err(|e| PluginError::Watch(format!("release loop panicked: {e}")))?;
            return Err(PluginError::Watch("release loop exited".to_string()));
        }
        result = resync_loop => {
            result.map_err(|e| PluginError::Watch(format!("resync loop panicked: {e}")))?;
            return Err(PluginError::Watch("resync loop exited".to_string()));
        }
    }

    Ok(())
}
