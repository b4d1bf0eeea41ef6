//! Centrix CI Server — build request queue and dispatch.
//!
//! A standalone binary that accepts build requests over HTTP, queues them
//! per owner (project or personal), and activates them under the configured
//! concurrency rules. Execution happens elsewhere: executors report back
//! through the completion endpoint.

mod config;
mod events;
mod metrics;
mod models;
mod routes;
mod services;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;

use ci_queue::BuildQueue;

use crate::events::EventBus;
use crate::services::access_service::ActorAccess;
use crate::services::build_service::BuildStore;
use crate::services::dispatcher::{run_dispatcher, Dispatcher};
use crate::services::project_service::ProjectRegistry;

#[derive(Parser)]
#[command(name = "centrix-ci", about = "Centrix CI build queue server")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "CI_PORT", default_value = "9090")]
    port: u16,

    /// Prometheus exporter port
    #[arg(long, env = "CI_METRICS_PORT", default_value = "9000")]
    metrics_port: u16,

    /// Start with build activation paused
    #[arg(long)]
    paused: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting Centrix CI Server...");

    let mut ci_config = config::CiConfig::from_env();
    if cli.paused {
        ci_config.start_paused = true;
    }

    // Collaborators
    let projects = Arc::new(ProjectRegistry::from_seeds(&ci_config.projects));
    let builds = Arc::new(BuildStore::new());
    let access = Arc::new(ActorAccess::new(ci_config.admins.clone()));

    // Build queue
    let policy = ci_config.activation_policy.build(projects.clone());
    let queue = Arc::new(BuildQueue::new(
        ci_config.queue_config(),
        policy,
        projects.clone(),
        builds.clone(),
    ));
    tracing::info!(
        policy = %ci_config.activation_policy,
        race_resolution = %ci_config.race_resolution,
        max_active = ci_config.max_concurrent_builds,
        paused = ci_config.start_paused,
        projects = ci_config.projects.len(),
        "Build queue configured"
    );

    // Dispatcher and event log
    let events = EventBus::new(ci_config.event_capacity);
    let dispatcher = Arc::new(Dispatcher::new(queue, builds, events));
    tokio::spawn(events::log_events(dispatcher.events().subscribe()));
    tokio::spawn(run_dispatcher(
        dispatcher.clone(),
        Duration::from_secs(ci_config.activation_interval_secs),
    ));

    // CI router state
    let ci_state = routes::CiRouterState {
        dispatcher,
        projects,
        access,
        config: ci_config,
    };

    let app = Router::new()
        .nest("/ci", routes::ci_router(ci_state))
        .layer(TraceLayer::new_for_http());

    // Initialize metrics
    metrics::init_metrics(cli.metrics_port);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Centrix CI Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
