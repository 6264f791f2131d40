use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_core::{
    api,
    config::{BlobBackend, Config, StoreBackend},
    services::JwtVerifier,
    storage::{BlobStore, DocumentStore, MemoryBlobStore, MemoryDocumentStore, MinioClient, PgDocumentStore},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load();
    tracing::info!("Starting server in {} mode", config.server.environment);

    // Document store
    let documents: Arc<dyn DocumentStore> = match config.store.backend {
        StoreBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&config.database_url())
                .await?;
            tracing::info!("Connected to PostgreSQL");

            let store = PgDocumentStore::new(db);
            store.migrate().await?;
            tracing::info!("Database migrations completed");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory document store; data is lost on restart");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    // Blob store
    let blobs: Arc<dyn BlobStore> = match config.blob.backend {
        BlobBackend::Minio => {
            let minio = MinioClient::new(&config.minio);
            minio.ensure_buckets().await?;
            tracing::info!("Connected to MinIO");
            Arc::new(minio)
        }
        BlobBackend::Memory => Arc::new(MemoryBlobStore::new(&format!(
            "http://{}:{}/blobs",
            config.server.host, config.server.port
        ))),
    };

    let verifier = Arc::new(JwtVerifier::new(&config.jwt));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState::start(config, documents, blobs, verifier);
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
