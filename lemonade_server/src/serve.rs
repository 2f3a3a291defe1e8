//! The persistent `serve` / `run` path
//! ===================================
//!
//! Startup order: cache root → logging → single-instance lock → registry +
//! router → optional initial model load (`run`) → bind HTTP and realtime
//! listeners → serve until a shutdown signal → unload the backend, release
//! the lock, exit 0.

use std::{path::PathBuf, sync::Arc};

use axum::routing::get;
use lemonade_models::{DownloadEvent, HubCache, ModelRegistry, PullOptions};
use lemonade_router::{InstanceLock, LoadRequest, Router, ServerConfig};

use crate::{lifecycle, logging, realtime, routes, state::AppState};

pub fn run(
    config: ServerConfig,
    log_file: Option<PathBuf>,
    initial_model: Option<String>,
) -> Result<(), String> {
    let cache = HubCache::from_default_root().map_err(|e| e.to_string())?;

    let _logging = logging::init(config.log_level, cache.root(), log_file.as_ref())?;

    // Refuses to coexist with a running serve: already_running, exit 1.
    let lock = InstanceLock::acquire(&cache, config.port).map_err(|e| e.to_string())?;

    let registry = Arc::new(ModelRegistry::new(cache.clone()));
    let router = Arc::new(Router::new(config.clone(), cache));
    let state = Arc::new(AppState::new(
        config,
        Arc::clone(&router),
        Arc::clone(&registry),
    ));

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("failed to start async runtime: {e}"))?;
    let result = runtime.block_on(serve_async(Arc::clone(&state), initial_model));

    // Clean teardown regardless of how the servers exited: no orphaned
    // children, lock released for the next serve.
    router.shutdown();
    drop(lock);
    result
}

async fn serve_async(state: Arc<AppState>, initial_model: Option<String>) -> Result<(), String> {
    if let Some(name) = initial_model {
        preload(&state, &name).await?;
    }

    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                format!("port {} is already in use (port_in_use)", state.config.port)
            }
            _ => format!("failed to bind {bind_addr}: {e}"),
        })?;

    let realtime_port = state
        .config
        .port
        .checked_add(100)
        .ok_or_else(|| "port too high for the realtime offset (+100)".to_owned())?;
    let realtime_addr = format!("{}:{}", state.config.host, realtime_port);
    let realtime_listener = tokio::net::TcpListener::bind(&realtime_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                format!("port {realtime_port} is already in use (port_in_use)")
            }
            _ => format!("failed to bind {realtime_addr}: {e}"),
        })?;

    let shutdown = lifecycle::shutdown_signal()?;

    tracing::info!("HTTP gateway listening on http://{bind_addr}");
    tracing::info!("realtime WebSocket on ws://{realtime_addr}/realtime");

    let app = routes::build(Arc::clone(&state));
    let realtime_app = axum::Router::new()
        .route("/realtime", get(realtime::ws_handler))
        .with_state(Arc::clone(&state));

    let realtime_shutdown = shutdown.clone();
    let realtime_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(realtime_listener, realtime_app)
            .with_graceful_shutdown(lifecycle::wait(realtime_shutdown))
            .await
        {
            tracing::warn!("realtime listener exited: {e}");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(lifecycle::wait(shutdown))
        .await
        .map_err(|e| format!("gateway server failed: {e}"))?;

    let _ = realtime_task.await;
    tracing::info!("gateway stopped");
    Ok(())
}

/// `run <model>`: pull missing artifacts, then block until loaded.
async fn preload(state: &Arc<AppState>, name: &str) -> Result<(), String> {
    let entry = state.registry.get(name).map_err(|e| e.to_string())?;

    if !state.registry.is_downloaded(&entry) {
        println!("pulling {name}…");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DownloadEvent>();
        let printer = tokio::spawn(async move {
            let mut last_percent = None;
            while let Some(event) = rx.recv().await {
                if event.percent != last_percent {
                    last_percent = event.percent;
                    if let Some(percent) = event.percent {
                        println!("  {} {percent}%", event.file);
                    }
                }
            }
        });
        state
            .registry
            .pull(name, &PullOptions::default(), &tx)
            .await
            .map_err(|e| e.to_string())?;
        drop(tx);
        let _ = printer.await;
    }

    let router = Arc::clone(&state.router);
    let req = LoadRequest {
        entry,
        ctx_size: state.config.ctx_size,
    };
    let model = tokio::task::spawn_blocking(move || router.load(req))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    println!("{} is running at {}", model.name, model.backend_address);
    Ok(())
}
