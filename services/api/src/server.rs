use crate::cli::ServeArgs;
use crate::infra::{seed_demo_data, AppState, LoggingChannelSender};
use crate::routes::app_router;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use collectflow::config::AppConfig;
use collectflow::error::AppError;
use collectflow::telemetry;
use collectflow::workflows::clock::{Clock, SystemClock};
use collectflow::workflows::collections::{CollectionsApi, Dispatcher};
use collectflow::workflows::liens::LiensApi;
use collectflow::workflows::memory::InMemoryStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::new());
    if args.seed_demo {
        seed_demo_data(&store, clock.now())?;
    }
    let sender = Arc::new(LoggingChannelSender::default());

    if config.webhooks.cron_secret.is_none() {
        warn!("CRON_SECRET is not set; the dispatch trigger is unauthenticated");
    }
    if config.webhooks.carrier_secret.is_none() {
        warn!("CARRIER_WEBHOOK_SECRET is not set; carrier callbacks will be rejected");
    }

    let collections = Arc::new(CollectionsApi::new(
        store.clone(),
        sender.clone(),
        clock.clone(),
        config.dispatcher.clone(),
        config.webhooks.cron_secret.clone(),
    ));
    let liens = Arc::new(LiensApi::new(
        store.clone(),
        clock.clone(),
        config.webhooks.carrier_secret.clone(),
    ));

    let shutdown = Arc::new(Notify::new());
    let background = config.dispatcher.poll_interval().map(|interval| {
        let dispatcher = Dispatcher::new(store.clone(), sender.clone(), config.dispatcher.clone());
        let clock = clock.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(clock, interval, shutdown).await })
    });
    if background.is_none() {
        info!("background dispatcher disabled; use the dispatch trigger instead");
    }

    let app = app_router(collections, liens)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "collections service ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    readiness_flag.store(false, Ordering::Release);
    shutdown.notify_one();
    if let Some(handle) = background {
        if let Err(err) = handle.await {
            warn!(error = %err, "dispatcher task ended abnormally");
        }
    }
    info!("collections service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
