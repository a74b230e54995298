//! Voice agent server binary.
//!
//! Reads configuration from the environment, opens the shared database,
//! and serves the telephony media websocket.

use std::sync::Arc;

use wren::config::AppConfig;
use wren::db::Database;
use wren::journal::ConversationJournal;
use wren::memory::MemoryStore;
use wren::pipeline::coordinator::CallDeps;
use wren::server::build_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().map_err(|e| {
        tracing::error!(error = %e, "configuration is invalid");
        anyhow::anyhow!("configuration: {e}")
    })?;

    let db = Arc::new(Database::open(&config.db_path).map_err(|e| {
        tracing::error!(error = %e, path = %config.db_path.display(), "database open failed");
        anyhow::anyhow!("database: {e}")
    })?);
    tracing::info!(
        path = %config.db_path.display(),
        schema_version = db.schema_version().unwrap_or(0),
        "database ready"
    );

    let memory = MemoryStore::new(Arc::clone(&db))?;
    let journal = ConversationJournal::new(db);

    let port = config.port;
    let deps = CallDeps {
        config: Arc::new(config),
        memory,
        journal,
    };

    let app = build_router(deps);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "wren-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
