use eeg_ingest::{
    build_classifier, router, AppState, ConnectionRegistry, Dispatcher, FeedSettings,
    FeedSubscriber, IngestConfig, IngestPipeline, MemoryReadingStore, PipelineStats,
    PostgresReadingStore, ReadingStore, ViewerSettings, ZmqTransport,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eeg_ingest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting EEG ingest service");

    let config = IngestConfig::from_env()?;

    let store: Arc<dyn ReadingStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(url)
                .await?;
            let store = PostgresReadingStore::new(pool);
            store.initialize().await?;
            info!("Database schema initialized");
            Arc::new(store)
        }
        None => {
            warn!(
                capacity = config.memory_store_capacity,
                "DATABASE_URL not set, keeping only the most recent samples in memory"
            );
            Arc::new(MemoryReadingStore::with_capacity(config.memory_store_capacity))
        }
    };

    let classifier = build_classifier(&config.classifier)?;
    info!(classifier = classifier.name(), "Classifier ready");

    let registry = ConnectionRegistry::new();
    let stats = Arc::new(PipelineStats::new());

    let dispatcher = Dispatcher::new(
        store,
        classifier,
        registry.clone(),
        config.alerts_enabled,
        stats.clone(),
    );
    let feed = FeedSubscriber::new(
        ZmqTransport::new(config.broker_endpoint(), config.topic.clone()),
        FeedSettings::from(&config),
        stats.clone(),
    );

    let mut pipeline = IngestPipeline::new(feed, dispatcher, config.dispatch_queue_capacity);
    pipeline.start().await?;

    let state = AppState {
        registry,
        stats,
        viewer: ViewerSettings {
            queue_capacity: config.viewer_queue_capacity,
            send_timeout: config.viewer_send_timeout,
        },
    };
    let app = router(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    info!("Listening on {}", addr);
    info!("Live viewers: ws://{}/api/v1/ws/live_eeg/{{patient_id}}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    // Viewers are closed by the pipeline before the server is told to stop,
    // otherwise graceful shutdown waits on open sockets.
    let server_exit = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };

    pipeline.stop().await;
    match server_exit {
        None => {
            shutdown.cancel();
            server.await??;
        }
        Some(result) => {
            warn!("HTTP server exited before shutdown was requested");
            result??;
        }
    }

    info!("EEG ingest service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
