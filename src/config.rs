use anyhow::{Context, Result};

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,

    // ── Database (PostgreSQL, shared with the dashboard/export services) ─
    pub database_url: String,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// Process-wide secret the credential vault derives its AES key from.
    /// Normalized to 32 bytes (truncated/zero-padded), so any string works;
    /// changing it orphans every previously sealed envelope.
    pub credential_secret: String,

    // ── Service-to-service auth ─────────────────────────────────────────
    /// Shared secret for internal callers (scheduler front door, dashboard API).
    pub internal_secret: String,

    // ── Identity provider (Google OAuth token endpoint) ─────────────────
    pub google_client_id: String,
    pub google_client_secret: String,

    // ── Ingestion tunables ──────────────────────────────────────────────
    /// UTC hour of day (0-23) the scheduled sweep fires.
    pub sweep_hour_utc: u32,
    /// Max concurrently running ingestion tasks within one sweep.
    pub sweep_concurrency: usize,
    /// Overall deadline for one scheduled sweep, seconds.
    pub sweep_deadline_secs: u64,
    /// Deadline for a manual single-site run, seconds.
    pub manual_deadline_secs: u64,
    /// Transient-failure retries per task within a run.
    pub task_retry_limit: u32,
    /// Whole past months covered by the onboarding backfill.
    pub backfill_months: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8430".into())
                .parse()
                .context("Invalid PORT")?,

            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL is required (PostgreSQL connection string)")?,

            credential_secret: std::env::var("CREDENTIAL_SECRET")
                .context("CREDENTIAL_SECRET is required (vault key material)")?,

            internal_secret: std::env::var("INTERNAL_SECRET")
                .context("INTERNAL_SECRET is required for service-to-service auth")?,

            google_client_id: std::env::var("GOOGLE_CLIENT_ID")
                .context("GOOGLE_CLIENT_ID is required")?,
            google_client_secret: std::env::var("GOOGLE_CLIENT_SECRET")
                .context("GOOGLE_CLIENT_SECRET is required")?,

            sweep_hour_utc: env_parsed("SWEEP_HOUR_UTC", 6)?,
            sweep_concurrency: env_parsed("SWEEP_CONCURRENCY", 8)?,
            sweep_deadline_secs: env_parsed("SWEEP_DEADLINE_SECS", 300)?,
            manual_deadline_secs: env_parsed("MANUAL_DEADLINE_SECS", 45)?,
            task_retry_limit: env_parsed("TASK_RETRY_LIMIT", 2)?,
            backfill_months: env_parsed("BACKFILL_MONTHS", 3)?,
        })
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid {name}: {v}")),
        Err(_) => Ok(default),
    }
}
