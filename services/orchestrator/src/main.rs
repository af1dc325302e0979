mod config;
mod controller;
mod endpoint;
mod error;
mod manager;
mod reconcile_loop;
mod routes_models;
mod state;
mod supervisor;
mod xmlrpc;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::get,
    Router,
};
use modelops::{PortRegistry, ProgramSpec};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::controller::ControllerSettings;
use crate::endpoint::HttpEndpoint;
use crate::manager::ModelManager;
use crate::routes_models::*;
use crate::state::{AppState, SharedState};
use crate::supervisor::{Supervisor, SupervisorRpc};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    let ports = PortRegistry::open(&cfg.model_root, cfg.port_base)
        .with_context(|| format!("Failed to open port registry under {}", cfg.model_root.display()))?;

    let supervisor = SupervisorRpc::new(
        cfg.supervisor_url.clone(),
        cfg.supervisorctl.clone(),
        cfg.call_timeout,
    )?;
    let endpoint = HttpEndpoint::new(cfg.worker.clone(), cfg.call_timeout, cfg.swap_timeout)?;

    // not fatal: supervisord may come up after us
    match supervisor.all_process_info().await {
        Ok(procs) => info!(processes = procs.len(), url=%cfg.supervisor_url, "supervisor: ok"),
        Err(e) => warn!("supervisor: not reachable yet: {e}"),
    }

    let settings = ControllerSettings {
        template_dir: cfg.template_dir.clone(),
        programs: ProgramSpec {
            trainer_command: cfg.trainer_command.clone(),
            worker_command: cfg.worker_command.clone(),
            threads: cfg.trainer_threads(),
            stop_wait_secs: cfg.stop_wait_secs(),
        },
    };
    let manager = Arc::new(ModelManager::new(
        settings,
        Arc::new(ports),
        Arc::new(supervisor),
        Arc::new(endpoint),
    ));

    let cancel = CancellationToken::new();
    let reconcile = tokio::spawn(reconcile_loop::run_reconcile_loop(
        manager.clone(),
        cfg.reconcile_interval,
        cancel.clone(),
    ));

    let app_state: SharedState = Arc::new(AppState::new(manager, cfg.clone()));

    let app = Router::new()
        .route("/health", get(get_health))
        .route("/models", get(get_models))
        .route("/models/:name", get(get_model).put(put_model).delete(delete_model))
        .route(
            "/models/:name/proxy/*path",
            get(proxy_model).post(proxy_model).put(proxy_model),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = &cfg.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("orchestrator listening on http://{addr}");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    reconcile.await.context("reconcile loop panicked")?;
    Ok(())
}
