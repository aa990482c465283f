//! Live Worker
//!
//! Channel admission service in front of a live streaming engine.
//!
//! # Servers
//!
//! - HTTP gateway, `GET /<token>` redirects to the channel (default: 0.0.0.0:9001)
//! - HTTP server for health, metrics and admin endpoints (default: 0.0.0.0:8081)
//!
//! # Worker mode
//!
//! With `LIVE_WORKER_MODE=worker` the binary is a single-channel worker
//! process. It speaks worker protocol frames on stdin/stdout and logs to
//! stderr. The service spawns itself this way under `LW_ISOLATION=process`.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Build the channel driver and spawn the pool actor
//! 4. Start the health/metrics/admin server
//! 5. Bind the gateway and start the channel list task, then report ready
//! 6. Wait for shutdown signal, release listed channels, then evict everything

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use common::config::ObservabilityConfig;
use live_worker::actors::{ActorMetrics, PoolActorHandle};
use live_worker::config::{Config, IsolationMode};
use live_worker::engine::{ChannelDriver, InProcessDriver, LoopbackEngine, ProcessDriver, WorkerCommand};
use live_worker::gateway::{admin_router, gateway_router};
use live_worker::observability::{health_router, init_metrics_recorder, HealthState};
use live_worker::tasks::{start_channel_list_task, ChannelListClient};
use live_worker::token::KeyedTokenCodec;
use live_worker::worker::{run_worker, WorkerArgs, MODE_VAR, MODE_WORKER};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "live_worker=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let observability = ObservabilityConfig::from_vars(&vars, DEFAULT_LOG_FILTER);

    if vars.get(MODE_VAR).is_some_and(|mode| mode == MODE_WORKER) {
        // stdout carries frames
        init_tracing(&observability, BoxMakeWriter::new(std::io::stderr));
        return worker_main(&vars).await;
    }

    init_tracing(&observability, BoxMakeWriter::new(std::io::stdout));
    info!("Starting Live Worker");

    // Load configuration
    let config = Config::from_vars(&vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        worker_id = %config.worker_id,
        gateway_bind_address = %config.gateway_bind_address,
        health_bind_address = %config.health_bind_address,
        max_parallel = config.max_parallel,
        idle_grace_ticks = config.idle_grace_ticks,
        isolation = ?config.isolation,
        channel_list = config.channel_list.is_some(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new(config.worker_id.clone()));

    let driver: Box<dyn ChannelDriver> = match config.isolation {
        IsolationMode::InProcess => Box::new(InProcessDriver::new(LoopbackEngine::new(
            config.engine_ready_delay,
        ))),
        IsolationMode::Process => {
            let command = match &config.worker_program {
                Some(program) => WorkerCommand::new(program.clone()),
                None => WorkerCommand::current_exe()?,
            };
            info!(program = %command.program().display(), "Using worker processes");
            Box::new(ProcessDriver::new(command, config.engine_ready_delay))
        }
    };

    let codec = Arc::new(KeyedTokenCodec::new(&config.token_key));
    let pool = PoolActorHandle::spawn(driver, codec, &config.pool_settings(), ActorMetrics::new())
        .map_err(|e| {
            error!(error = %e, "Failed to start pool actor");
            e
        })?;
    info!("Pool actor started");

    let shutdown_token = CancellationToken::new();

    // Health, metrics and admin share one listener
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .merge(admin_router(pool.clone()));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    let gateway_addr: SocketAddr = config.gateway_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.gateway_bind_address, "Invalid gateway bind address");
        format!("Invalid gateway bind address: {e}")
    })?;
    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %gateway_addr, "Failed to bind gateway");
            format!("Failed to bind gateway to {gateway_addr}: {e}")
        })?;

    let gateway_shutdown_token = shutdown_token.child_token();
    let gateway = gateway_router(pool.clone());
    tokio::spawn(async move {
        let server = axum::serve(gateway_listener, gateway).with_graceful_shutdown(async move {
            gateway_shutdown_token.cancelled().await;
            info!("Gateway shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Gateway failed");
        }
    });
    info!(addr = %gateway_addr, "Gateway started");

    let channel_list_task = match config.channel_list.clone() {
        Some(list_config) => {
            let client = ChannelListClient::new(&list_config);
            let task = tokio::spawn(start_channel_list_task(
                client,
                pool.clone(),
                list_config,
                shutdown_token.child_token(),
            ));
            info!("Channel list task started");
            Some(task)
        }
        None => {
            info!("No channel list URL configured, channel list task disabled");
            None
        }
    };

    health_state.set_ready();
    info!("Live Worker running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();
    shutdown_token.cancel();

    // Listed channels are released while the pool is still running
    if let Some(task) = channel_list_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Channel list task failed");
        }
    }

    // Evicts every channel and resolves pending requests with Aborted
    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Pool shutdown error");
    }

    info!("Live Worker shutdown complete");
    Ok(())
}

/// Run one channel as a worker process.
async fn worker_main(vars: &HashMap<String, String>) -> Result<(), Box<dyn std::error::Error>> {
    let args = WorkerArgs::from_vars(vars).map_err(|e| {
        error!(target: "lw.worker", error = %e, "Invalid worker arguments");
        e
    })?;
    info!(
        target: "lw.worker",
        pid = std::process::id(),
        tcp_port = args.tcp_port,
        udp_port = args.udp_port,
        "Worker starting"
    );

    let engine = LoopbackEngine::new(args.ready_delay);
    run_worker(engine, &args, tokio::io::stdin(), tokio::io::stdout())
        .await
        .map_err(|e| {
            error!(target: "lw.worker", error = %e, "Worker failed");
            e
        })?;

    info!(target: "lw.worker", "Worker exiting");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig, writer: BoxMakeWriter) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer().with_writer(writer);

    if config.json_logs {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
