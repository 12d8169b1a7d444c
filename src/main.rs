use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use sitepulse_ingest::config::Config;
use sitepulse_ingest::crypto::CredentialVault;
use sitepulse_ingest::ingest::{self, IngestSettings, Orchestrator};
use sitepulse_ingest::providers::GoogleIdentity;
use sitepulse_ingest::sources::{AnalyticsFetcher, SearchFetcher};
use sitepulse_ingest::store::Store;
use sitepulse_ingest::token::TokenBroker;
use sitepulse_ingest::{api, AppState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sitepulse_ingest=info".into()),
        )
        .init();

    // Load config
    let config = Config::from_env()?;
    info!("sitepulse-ingest v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    // Initialize components
    let vault = Arc::new(CredentialVault::new(&config.credential_secret));
    let store = Arc::new(Store::new(&config.database_url).await?);
    store.migrate().await?;
    info!("Database connected and migrated ✓");

    let identity = Arc::new(GoogleIdentity::new(
        config.google_client_id.clone(),
        config.google_client_secret.clone(),
    ));
    let broker = Arc::new(TokenBroker::new(store.clone(), identity, vault));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        broker.clone(),
        Arc::new(AnalyticsFetcher::new()),
        Arc::new(SearchFetcher::new()),
        store.clone(),
        IngestSettings::from_config(&config),
    ));

    // Start the daily sweep daemon
    let daemon_orchestrator = orchestrator.clone();
    let sweep_hour = config.sweep_hour_utc;
    tokio::spawn(async move {
        ingest::sweep_daemon(daemon_orchestrator, sweep_hour).await;
    });

    // Build shared state
    let state: SharedState = Arc::new(AppState {
        config: config.clone(),
        store,
        broker,
        orchestrator,
    });

    // Build router
    let app = api::router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready ✓");
    axum::serve(listener, app).await?;

    Ok(())
}
