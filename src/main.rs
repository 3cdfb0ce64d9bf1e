use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use usage_ledger::config;
use usage_ledger::usage::{
    spawn_usage_scheduler, HttpCloudAccountClient, HttpMeteringClient, HttpProductCatalogClient,
    LedgerStore, PgLedgerStore, QuantityCalculator, UsageController, UsageService,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
    let token = config::USAGE_SERVICE_TOKEN.clone();
    let controller = Arc::new(UsageController::new(
        Arc::new(HttpMeteringClient::new(
            config::METERING_SERVICE_URL.as_str(),
            token.clone(),
        )?),
        Arc::new(HttpProductCatalogClient::new(
            config::PRODUCT_CATALOG_URL.as_str(),
            token.clone(),
        )?),
        Arc::new(HttpCloudAccountClient::new(
            config::CLOUD_ACCOUNT_URL.as_str(),
            token,
        )?),
        store.clone(),
        QuantityCalculator::new(config::quantity_config_from_env()),
        config::controller_options_from_env(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if *config::USAGE_SCHEDULER_ENABLED {
        let interval = Duration::from_secs(*config::USAGE_SCHEDULER_INTERVAL_SECS);
        Some(spawn_usage_scheduler(controller, interval, shutdown_rx))
    } else {
        None
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(usage_ledger::app(UsageService::new(store)))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(?error, "failed to listen for shutdown signal");
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(scheduler) = scheduler {
        if let Err(error) = scheduler.await {
            tracing::warn!(?error, "usage scheduler task ended abnormally");
        }
    }

    Ok(())
}
