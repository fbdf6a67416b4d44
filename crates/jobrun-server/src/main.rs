use std::net::SocketAddr;
use std::sync::Arc;

use jobrun_core::Config;
use jobrun_exec::HttpGatewayClient;
use jobrun_notify::SlackNotifier;
use jobrun_scheduler::{Maintenance, RunController, SchedulerConfig};
use jobrun_store::Store;
use tracing::info;

use jobrun_server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // config path: first CLI argument > JOBRUN_CONFIG env > ./jobrun.json
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    init_logging(&config.log)?;

    info!(path = %config.db_path, "opening database");
    let store = Store::open(&config.db_path)?;

    let notifier = Arc::new(SlackNotifier::from_token_path(
        config.notifications.slack_token_path.as_deref(),
    ));
    let gateway = Arc::new(HttpGatewayClient::new(
        &config.gateway.url,
        config.gateway.token_path.as_deref(),
    ));

    let controller = RunController::new(
        store.clone(),
        notifier,
        gateway,
        SchedulerConfig {
            db_path: config.db_path.clone(),
            max_concurrency: config.max_concurrency,
            shutdown_grace_ms: config.shutdown_grace_ms,
            reconcile_interval_ms: config.reconcile_interval_ms,
            default_on_failure: config.notifications.default_on_failure.clone(),
            default_on_success: config.notifications.default_on_success.clone(),
        },
    );
    controller.start().await?;

    let maintenance = Arc::new(Maintenance::new(
        store.clone(),
        config.run_retention_days,
        config.state_cleanup_interval_ms,
    ));
    maintenance.start();

    let port = config.port;
    let state = Arc::new(AppState::new(config, store, controller.clone()));
    let router = build_router(Arc::clone(&state));

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "runner listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.stop();
    controller.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

/// Initialise tracing from the log section: `RUST_LOG` wins over the
/// configured level; `log.file` selects stdout or an append-mode file.
fn init_logging(cfg: &jobrun_core::config::LogConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if cfg.file == "stdout" {
        builder.init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.file)?;
        builder.with_writer(file).with_ansi(false).init();
    }
    Ok(())
}
