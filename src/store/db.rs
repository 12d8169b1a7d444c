//! PostgreSQL-backed store. Tables:
//! - `sites`: onboarded tenants and their source references
//! - `credential_records`: encrypted token pairs per (owner, provider)
//! - `report_snapshots`: normalized report rows per (site, source, window)

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{CredentialKey, CredentialRecord, CredentialStore, ReportSink, Site, SiteStore};
use crate::error::IngestError;
use crate::ingest::window::DateWindow;
use crate::sources::{ReportTable, SourceKind};

pub struct Store {
    pub pool: PgPool,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self, IngestError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(db_url)
            .await
            .map_err(|e| IngestError::Database(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool })
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                owner_id            TEXT NOT NULL,
                display_name        TEXT NOT NULL DEFAULT '',
                analytics_property  TEXT,
                search_site_url     TEXT,
                setup_completed     BOOLEAN NOT NULL DEFAULT false,
                created_at          TIMESTAMPTZ DEFAULT NOW(),
                updated_at          TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Token pairs. `expires_at` is JSONB: canonically a bare epoch-ms
        // number, but rows imported from the old document store may still
        // hold {"seconds": n} / {"_millis": n}. `encrypted` is nullable so
        // legacy plaintext rows read as not-encrypted.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credential_records (
                owner_id        TEXT NOT NULL,
                provider        TEXT NOT NULL,
                access_token    TEXT NOT NULL,
                refresh_token   TEXT NOT NULL,
                expires_at      JSONB NOT NULL,
                encrypted       BOOLEAN,
                updated_at      TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY (owner_id, provider)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS report_snapshots (
                site_id       UUID NOT NULL,
                source        TEXT NOT NULL,
                window_start  DATE NOT NULL,
                window_end    DATE NOT NULL,
                report        JSONB NOT NULL,
                fetched_at    TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY (site_id, source, window_start, window_end)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sites_eligible ON sites(setup_completed) \
             WHERE analytics_property IS NOT NULL OR search_site_url IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sites_owner ON sites(owner_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn site_from_row(row: &sqlx::postgres::PgRow) -> Site {
    Site {
        id: row.get(0),
        owner_id: row.get(1),
        display_name: row.get(2),
        analytics_property: row.get(3),
        search_site_url: row.get(4),
        setup_completed: row.get(5),
    }
}

const SITE_COLUMNS: &str =
    "id, owner_id, display_name, analytics_property, search_site_url, setup_completed";

#[async_trait]
impl SiteStore for Store {
    async fn eligible_sites(&self) -> Result<Vec<Site>, IngestError> {
        let rows = sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites \
             WHERE setup_completed = true \
               AND (analytics_property IS NOT NULL OR search_site_url IS NOT NULL) \
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(site_from_row).collect())
    }

    async fn site(&self, id: Uuid) -> Result<Option<Site>, IngestError> {
        let row = sqlx::query(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(site_from_row))
    }

    async fn upsert_site(&self, site: &Site) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO sites
                (id, owner_id, display_name, analytics_property, search_site_url, setup_completed)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id)
            DO UPDATE SET
                display_name = EXCLUDED.display_name,
                analytics_property = EXCLUDED.analytics_property,
                search_site_url = EXCLUDED.search_site_url,
                setup_completed = EXCLUDED.setup_completed,
                updated_at = NOW()
            "#,
        )
        .bind(site.id)
        .bind(&site.owner_id)
        .bind(&site.display_name)
        .bind(&site.analytics_property)
        .bind(&site.search_site_url)
        .bind(site.setup_completed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn sites_for_owner(&self, owner_id: &str) -> Result<Vec<Site>, IngestError> {
        let rows = sqlx::query(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE owner_id = $1 ORDER BY created_at"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(site_from_row).collect())
    }
}

#[async_trait]
impl CredentialStore for Store {
    async fn load_credential(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<CredentialRecord>, IngestError> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, expires_at, encrypted \
             FROM credential_records WHERE owner_id = $1 AND provider = $2",
        )
        .bind(&key.owner_id)
        .bind(key.provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        Ok(Some(CredentialRecord {
            access_token: row.get(0),
            refresh_token: row.get(1),
            expires_at: row.get(2),
            encrypted: row.get(3),
        }))
    }

    async fn store_credential(
        &self,
        key: &CredentialKey,
        record: &CredentialRecord,
    ) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO credential_records
                (owner_id, provider, access_token, refresh_token, expires_at, encrypted)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (owner_id, provider)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                encrypted = EXCLUDED.encrypted,
                updated_at = NOW()
            "#,
        )
        .bind(&key.owner_id)
        .bind(key.provider.as_str())
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(&record.expires_at)
        .bind(record.encrypted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReportSink for Store {
    async fn store_snapshot(
        &self,
        site_id: Uuid,
        source: SourceKind,
        window: &DateWindow,
        table: &ReportTable,
    ) -> Result<(), IngestError> {
        let report = serde_json::to_value(table)
            .map_err(|e| IngestError::Internal(format!("snapshot serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO report_snapshots (site_id, source, window_start, window_end, report)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (site_id, source, window_start, window_end)
            DO UPDATE SET report = EXCLUDED.report, fetched_at = NOW()
            "#,
        )
        .bind(site_id)
        .bind(source.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(report)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
