use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use syncer::config::Config;
use syncer::db::{self, PgStore};
use syncer::registry::{RegistryClient, RegistryConfig};
use syncer::store::Store;
use syncer::{metrics, rest, scheduler, StatisticsAggregator, SyncOptions, SyncOrchestrator};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting registry syncer");
    info!("Registry: {}", config.registry_url);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));

    // Initialize metrics
    metrics::init_metrics().context("failed to register metrics")?;

    // Connect to database
    let pool = db::make_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let registry = Arc::new(
        RegistryClient::new(RegistryConfig {
            base_url: config.registry_url.clone(),
            api_key: config.registry_api_key.clone(),
            default_tag: config.registry_tag_id.clone(),
            page_size: config.registry_page_size,
            timeout: config.registry_timeout,
        })
        .context("failed to build registry client")?,
    );

    let orchestrator = SyncOrchestrator::new(
        registry.clone(),
        registry,
        store.clone(),
        SyncOptions {
            tag: config.registry_tag_id.clone(),
            required_channels: config.required_channels.clone(),
        },
    );
    let aggregator = StatisticsAggregator::new(store.clone(), config.statistic_channels.clone())
        .with_outlier_factor(config.outlier_factor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut jobs = Vec::new();

    if config.sync_devices_enabled {
        let orchestrator = orchestrator.clone();
        jobs.push(tokio::spawn(scheduler::run_periodic(
            "device_sync",
            config.device_sync_interval,
            shutdown_rx.clone(),
            move || {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.reconcile_devices().await }
            },
        )));
    } else {
        info!("Device synchronisation is disabled");
    }

    if config.initiate_readings_enabled {
        let orchestrator = orchestrator.clone();
        jobs.push(tokio::spawn(scheduler::run_periodic(
            "readings_initiation",
            config.readings_init_interval,
            shutdown_rx.clone(),
            move || {
                let orchestrator = orchestrator.clone();
                async move { orchestrator.initiate_pending().await }
            },
        )));
    } else {
        info!("Readings initiation is disabled");
    }

    if config.statistics_enabled {
        let aggregator = aggregator.clone();
        jobs.push(tokio::spawn(scheduler::run_periodic(
            "statistics",
            config.statistics_interval,
            shutdown_rx.clone(),
            move || {
                let aggregator = aggregator.clone();
                async move { aggregator.recompute_all().await }
            },
        )));
    } else {
        info!("Statistics computation is disabled");
    }

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(rest::AppState {
            store,
            orchestrator,
            aggregator,
        }));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(e) = job.await {
            error!("Scheduled job ended abnormally: {}", e);
        }
    }

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
