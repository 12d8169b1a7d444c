pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ingest;
pub mod providers;
pub mod sources;
pub mod store;
pub mod token;

pub use config::Config;
pub use error::IngestError;

use std::sync::Arc;

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub store: Arc<store::Store>,
    pub broker: Arc<token::TokenBroker>,
    pub orchestrator: Arc<ingest::Orchestrator>,
}

pub type SharedState = Arc<AppState>;
