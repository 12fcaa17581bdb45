use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zinas::config::Config;
use zinas::db::Database;
use zinas::fetcher::{start_background_refresh, Fetcher};
use zinas::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zinas=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::var("ZINAS_CONFIG").unwrap_or_else(|_| "feeds.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {} feeds and {} topics from {}",
        config.feeds.len(),
        config.topics.len(),
        config_path
    );

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:zinas.db?mode=rwc".to_string());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    info!("Database initialized");

    let db = Arc::new(db);
    let fetcher = Arc::new(Fetcher::new(db.clone(), &config)?);

    // Seed an empty database before serving
    if db.count_articles().await? == 0 {
        info!("No articles stored yet, running initial refresh");
        if let Some(summary) = fetcher.refresh_all_feeds().await? {
            let failed = summary.failed_sources();
            if !failed.is_empty() {
                warn!("Initial refresh failed for: {}", failed.join(", "));
            }
        }
    }

    if config.refresh_interval > 0 {
        let bg_fetcher = fetcher.clone();
        let refresh_interval = config.refresh_interval;
        tokio::spawn(async move {
            start_background_refresh(bg_fetcher, refresh_interval).await;
        });
    }

    let state = Arc::new(AppState {
        db: db.clone(),
        fetcher: fetcher.clone(),
    });
    let app = routes::router(state);

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Server starting on http://{}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
