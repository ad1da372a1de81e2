mod background;
mod config;
mod handlers;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use prometheus::Registry;
use tokio::sync::watch;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use walg_exporter_core::VERSION;
use walg_exporter_core::collector::{Collector, InventoryFetcher, PostgresSource};
use walg_exporter_core::metrics::Metrics;
use walg_exporter_core::publish;

use config::{ExporterConfig, LogFormat};
use state::AppState;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "walg-exporter",
    about = "Prometheus exporter for WAL-G backups and PostgreSQL replication state",
    version = VERSION
)]
struct Args {
    /// Path to TOML configuration file. Flags override values from the file.
    #[arg(long, env = "WALG_EXPORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on for HTTP requests [default: 0.0.0.0:9351].
    #[arg(long, env = "WALG_EXPORTER_LISTEN_ADDRESS")]
    listen_address: Option<String>,

    /// Path under which to expose metrics [default: /metrics].
    #[arg(long, env = "WALG_EXPORTER_METRICS_PATH")]
    metrics_path: Option<String>,

    /// Path to the wal-g binary [default: wal-g].
    #[arg(long, env = "WALG_EXPORTER_WALG_BINARY")]
    walg_binary: Option<PathBuf>,

    /// PostgreSQL connection string (key=value or URL form).
    #[arg(long, env = "WALG_EXPORTER_POSTGRES_CONNECTION", hide_env_values = true)]
    postgres_connection: Option<String>,

    /// Seconds between collection cycles [default: 60].
    #[arg(long, env = "WALG_EXPORTER_SCRAPE_INTERVAL")]
    scrape_interval: Option<u64>,

    /// Seconds one collection cycle may take [default: 30].
    #[arg(long, env = "WALG_EXPORTER_COLLECT_TIMEOUT")]
    collect_timeout: Option<u64>,

    /// Log level or filter directive, used when RUST_LOG is unset [default: info].
    #[arg(long, env = "WALG_EXPORTER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format [default: text].
    #[arg(long, value_enum, env = "WALG_EXPORTER_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

// ============================================================
// Main
// ============================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ExporterConfig::resolve(&args)?;

    init_tracing(&config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(config))
}

fn init_tracing(config: &ExporterConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("invalid log level {:?}", config.log_level))?,
    };
    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
    Ok(())
}

async fn async_main(config: ExporterConfig) -> anyhow::Result<()> {
    info!(version = VERSION, "starting walg-exporter");
    config.log_summary();

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new(&registry).context("failed to register metrics")?);
    metrics.set_exporter_info(
        VERSION,
        option_env!("WALG_EXPORTER_COMMIT").unwrap_or("unknown"),
        option_env!("WALG_EXPORTER_BUILD_DATE").unwrap_or("unknown"),
    );

    let source = PostgresSource::new(config.postgres_connection.clone());
    // The collector reconnects on its own; an unreachable server only delays data.
    if let Err(e) = source
        .try_connect(Instant::now() + Duration::from_secs(5))
        .await
    {
        warn!(error = %e, "initial PostgreSQL connection failed, will retry each cycle");
    }
    let fetcher =
        InventoryFetcher::new(config.walg_binary.clone()).with_prefix_args(config.walg_args.clone());
    let collector = Collector::new(source, fetcher, Arc::clone(&metrics));

    let (publisher, snapshots) = publish::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collect_task = tokio::spawn(background::collect_loop(
        collector,
        metrics,
        publisher,
        config.scrape_interval(),
        config.collect_timeout(),
        shutdown_rx.clone(),
    ));

    let state = AppState {
        registry,
        snapshots,
        metrics_path: config.metrics_path.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(addr = %listener.local_addr()?, "listening");

    tokio::spawn(async move {
        let signal = wait_for_shutdown_signal().await;
        info!(signal, "shutting down");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
        .context("server error")?;

    collect_task.await.context("collection task panicked")?;
    info!("walg-exporter stopped");
    Ok(())
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route(&state.metrics_path, get(handlers::handle_metrics))
        .route("/health", get(handlers::handle_health))
        .route("/ready", get(handlers::handle_ready))
        .route("/api/v1/snapshot", get(handlers::handle_snapshot))
        .route("/", get(handlers::handle_index))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
