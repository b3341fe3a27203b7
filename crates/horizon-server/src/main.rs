//! # Horizon Server
//!
//! Runs the generation worker pool, the horizon sweeper and the admin API
//! against PostgreSQL.

use anyhow::Context;
use axum::routing::get;
use horizon_config::{ConfigLoader, ObservabilityConfig};
use horizon_jobs::postgres::create_pool;
use horizon_jobs::{register_metrics, JobsConfig};
use horizon_rest::create_router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};

mod app;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        eprintln!("horizon-server: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config_loader = ConfigLoader::from_default_location().context("loading configuration")?;
    let config = config_loader.get().await;
    init_logging(&config.observability);

    info!(name = %config.app.name, version = %config.app.version, "Starting Horizon server");
    info!("Environment: {}", config.app.environment);

    let jobs: JobsConfig = config_loader
        .section_or_default("jobs")
        .await
        .context("reading jobs configuration")?;
    jobs.validate().context("invalid jobs configuration")?;

    let db_pool = create_pool(&config.database).await.context("connecting to PostgreSQL")?;
    if config.database.run_migrations {
        db_pool.run_migrations().await.context("running migrations")?;
    }

    let instance_id = app::instance_id(&config);
    info!(instance_id = %instance_id, "Instance identity");
    let components = app::build(db_pool.clone(), &jobs, &instance_id);

    let mut router = create_router(components.state, &config.server);
    if config.observability.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing Prometheus recorder")?;
        register_metrics();
        router = router.route(
            &config.observability.metrics_path,
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    let workers = components.workers.clone();
    let worker_task = tokio::spawn(async move { workers.start().await });
    let sweeper_task = components.sweeper.clone().map(|sweeper| {
        tokio::spawn(async move { sweeper.start().await })
    });

    let rest_addr = config.server.rest_addr();
    info!("Starting REST server on http://{}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr)
        .await
        .with_context(|| format!("binding {rest_addr}"))?;

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Stopping background components...");
    components.workers.stop();
    if let Some(sweeper) = &components.sweeper {
        sweeper.stop();
    }
    match worker_task.await {
        Ok(Err(e)) => warn!(error = %e, "Worker pool exited with error"),
        Err(e) => warn!(error = %e, "Worker pool task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(task) = sweeper_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "Sweeper exited with error"),
            Err(e) => warn!(error = %e, "Sweeper task panicked"),
            Ok(Ok(())) => {}
        }
    }
    db_pool.close().await;

    served.context("REST server error")?;
    info!("Server shutdown complete");
    Ok(())
}

fn init_logging(observability: &ObservabilityConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&observability.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if observability.json_logs() {
        registry.with(tracing_subscriber::fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
