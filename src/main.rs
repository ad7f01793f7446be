use std::sync::Arc;

use tracing::{info, warn};

use ollama_chat::agent::{MockTokenSource, OllamaTokenSource, TokenSource};
use ollama_chat::config::{AppConfig, TokenSourceKind};
use ollama_chat::db::kv_store::SqliteKvStore;
use ollama_chat::routes::router;
use ollama_chat::service::chat_service::ChatService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ollama_chat=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // ── Storage ───────────────────────────────────────────────────────────────
    let kv = SqliteKvStore::connect(&config.database_url).await?;
    info!("Key-value store ready at {}", config.database_url);

    // ── Token source ──────────────────────────────────────────────────────────
    let source: Arc<dyn TokenSource> = match config.token_source {
        TokenSourceKind::Ollama => {
            info!("Streaming replies from Ollama at {}", config.ollama_base_url);
            Arc::new(OllamaTokenSource::new(&config.ollama_base_url)?)
        }
        TokenSourceKind::Mock => {
            info!("Streaming replies from the built-in mock source");
            Arc::new(MockTokenSource::new())
        }
    };

    let chat_service = ChatService::open(Arc::new(kv), source).await?;
    match chat_service.sync_available_models().await {
        Ok(models) => info!("{} model(s) available", models.len()),
        Err(e) => warn!("Could not list models, keeping the configured one: {e}"),
    }

    // ── Listen ────────────────────────────────────────────────────────────────
    let app = router(chat_service);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
