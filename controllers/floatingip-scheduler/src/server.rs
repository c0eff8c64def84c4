//! Extender HTTP surface.
//!
//! Thin JSON adapter between the scheduler's extender hooks and the
//! plugin. Node-level failures travel in `failedNodes`; a pass-wide
//! failure lands in the result's `error` field, which aborts scheduling of
//! that pod. Bind errors roll nothing back: allocation repair belongs to
//! the resync tier.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use schedulerapi::{
    sort_host_priorities, ExtenderArgs, ExtenderBindingArgs, ExtenderBindingResult,
    ExtenderFilterResult, HostPriorityList,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::error::PluginError;
use crate::extender::SchedulerPlugin;

pub fn router(plugin: Arc<dyn SchedulerPlugin>) -> Router {
    Router::new()
        .route("/filter", post(filter))
        .route("/prioritize", post(prioritize))
        .route("/bind", post(bind))
        .with_state(plugin)
}

async fn filter(
    State(plugin): State<Arc<dyn SchedulerPlugin>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<ExtenderFilterResult> {
    match plugin.filter(&args.pod, args.nodes.items).await {
        Ok((nodes, failed)) => Json(ExtenderFilterResult::accepted(nodes, failed)),
        Err(e) => {
            warn!(error = %e, "filter pass failed");
            Json(ExtenderFilterResult::errored(e.to_string()))
        }
    }
}

async fn prioritize(
    State(plugin): State<Arc<dyn SchedulerPlugin>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<HostPriorityList> {
    match plugin.prioritize(&args.pod, &args.nodes.items).await {
        Ok(mut list) => {
            sort_host_priorities(&mut list);
            Json(list)
        }
        Err(e) => {
            warn!(error = %e, "prioritize failed, returning no scores");
            Json(HostPriorityList::new())
        }
    }
}

async fn bind(
    State(plugin): State<Arc<dyn SchedulerPlugin>>,
    Json(args): Json<ExtenderBindingArgs>,
) -> Json<ExtenderBindingResult> {
    match plugin.bind(&args).await {
        Ok(()) => Json(ExtenderBindingResult::default()),
        Err(e) => {
            warn!(pod = %args.pod_name, error = %e, "bind failed");
            Json(ExtenderBindingResult {
                error: Some(e.to_string()),
            })
        }
    }
}

pub async fn serve(addr: String, plugin: Arc<dyn SchedulerPlugin>) -> Result<(), PluginError> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PluginError::Watch(format!("binding {addr}: {e}")))?;
    info!(%addr, "extender API listening");
    axum::serve(listener, router(plugin))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PluginError::Watch(format!("http server: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}
