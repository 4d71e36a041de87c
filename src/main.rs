use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_replica::{
    api,
    blob_store::{self, LocalStore},
    bus::{AmqpBus, MessageBus},
    cache::InMemoryFileCache,
    config::Config,
    service::FileService,
    storage::Database,
    sync::FileSyncService,
    AppState,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-replica starting");

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration for node: {}", config.node.id);

    // Initialize metadata database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Initialize the local blob store for replicated content
    let blobs: Arc<dyn blob_store::BlobStore> =
        Arc::new(LocalStore::new(&config.storage.storage_path)?);
    info!("Storing file content at: {}", config.storage.storage_path);

    // Connect to the message bus
    let bus: Arc<dyn MessageBus> = Arc::new(AmqpBus::connect(&config.amqp.uri).await?);

    // Metadata cache
    let cache = Arc::new(InMemoryFileCache::new(config.cache.ttl()));

    let files = Arc::new(FileService::new(db, cache, Arc::clone(&bus)));

    // Start consuming replication events for this node
    let sync = FileSyncService::new(config.node.id.clone(), Arc::clone(&blobs));
    let sync_handles = sync
        .register(bus.as_ref(), config.amqp.prefetch, config.amqp.ack)
        .await?;
    info!("Replication subscriptions registered");

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        files,
        blobs,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop event consumers
    info!("Shutting down replication subscriptions");
    for handle in sync_handles {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
