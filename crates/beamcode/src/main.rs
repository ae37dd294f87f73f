// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use beamcode::adapter::{self, AdapterKind, InvertedRegistry};
use beamcode::config::Config;
use beamcode::coordinator::SessionCoordinator;
use beamcode::registry::SessionRegistry;
use beamcode::storage::{FileStorage, Storage};
use beamcode::tracer::{Tracer, TracerConfig};
use beamcode::transport::{self, AppState};

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

/// Initialize tracing/logging from config. Uses `try_init` so it's safe to
/// call more than once (e.g. from tests that spawn the binary repeatedly).
fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Wire the coordinator, adapters and transport layer, then serve until a
/// shutdown signal arrives (spec.md §6 exit codes: 0 normal, 1 fatal
/// startup).
async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(data_dir));
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&storage), config.max_sessions));

    let tracer = Arc::new(Tracer::new(TracerConfig::from_env_values(
        config.trace,
        &config.trace_level,
        config.trace_allow_sensitive,
        config.prometheus,
    )));

    let bus = beamcode::bus::EventBus::default();
    let inverted = Arc::new(InvertedRegistry::new());

    let kinds = [AdapterKind::Claude, AdapterKind::Codex, AdapterKind::Gemini, AdapterKind::Opencode, AdapterKind::Acp];
    let mut adapters: HashMap<String, Arc<dyn beamcode::adapter::BackendAdapter>> = HashMap::new();
    for kind in kinds {
        adapters.insert(kind.as_str().to_owned(), adapter::build(kind, bus.clone(), Arc::clone(&inverted), None));
    }
    let default_adapter = config.adapter.clone().unwrap_or_else(|| AdapterKind::Claude.as_str().to_owned());

    let coordinator = SessionCoordinator::new(bus, registry, storage, adapters, default_adapter, config.no_auto_launch, tracer);
    coordinator.start().await?;

    let state = AppState::new(Arc::clone(&coordinator), config.auth_token.clone(), inverted);
    let router = transport::build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "beamcoded listening");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;
    coordinator.stop().await;
    Ok(())
}

/// First SIGTERM/SIGINT triggers graceful shutdown; a second forces exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGTERM");
            }
            _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
