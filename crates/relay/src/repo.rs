//! Repository interface to the relational store.
//!
//! The relay only needs three operations from persistence: resolve a
//! credential hash into an [`AuthRecord`], touch a key's `last_used_at`, and
//! upsert daily usage counters. Everything else about the tenant/plan/key
//! tables is opaque to the core.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::{AuthRecord, KeyStatus, TenantStatus, UsageDelta};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;

/// Repository failures. `NotFound` must stay distinguishable from transport
/// trouble so the auth gate can classify credentials correctly.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("row not found")]
    NotFound,

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            other => RepoError::Unavailable(other.to_string()),
        }
    }
}

/// Narrow persistence surface consumed by the relay core.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Resolve a credential hash into the joined tenant + key + plan record.
    async fn find_auth_by_hash(&self, hash: &str) -> Result<AuthRecord, RepoError>;

    /// Record when the key was last used. Best-effort from the caller's
    /// point of view.
    async fn touch_last_used(&self, key_id: i64, ts: DateTime<Utc>) -> Result<(), RepoError>;

    /// Fold a usage delta into the daily row for `(key, date)`. Sums for
    /// counters, max for peak streams; safe to retry.
    async fn increment_usage(
        &self,
        tenant_id: i64,
        key_id: i64,
        date: NaiveDate,
        delta: UsageDelta,
    ) -> Result<(), RepoError>;
}

/// Postgres-backed repository.
pub struct SqlRepository {
    pool: PgPool,
}

impl SqlRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration and verify connectivity.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepoError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn parse_tenant_status(raw: &str) -> Result<TenantStatus, RepoError> {
    match raw {
        "active" => Ok(TenantStatus::Active),
        "suspended" => Ok(TenantStatus::Suspended),
        "deleted" => Ok(TenantStatus::Deleted),
        other => Err(RepoError::Unavailable(format!(
            "unknown tenant status '{other}'"
        ))),
    }
}

fn parse_key_status(raw: &str) -> Result<KeyStatus, RepoError> {
    match raw {
        "active" => Ok(KeyStatus::Active),
        "revoked" => Ok(KeyStatus::Revoked),
        "expired" => Ok(KeyStatus::Expired),
        other => Err(RepoError::Unavailable(format!(
            "unknown key status '{other}'"
        ))),
    }
}

#[async_trait]
impl Repository for SqlRepository {
    async fn find_auth_by_hash(&self, hash: &str) -> Result<AuthRecord, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT t.id AS tenant_id, t.status AS tenant_status,
                   ak.id AS key_id, ak.status AS key_status, ak.expires_at,
                   p.id AS plan_id, p.max_concurrent_streams, p.max_rps,
                   p.max_symbols, p.max_daily_requests
            FROM api_keys ak
            JOIN tenants t ON t.id = ak.tenant_id
            JOIN plans p ON p.id = ak.plan_id
            WHERE ak.key_hash = $1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::NotFound)?;

        let tenant_status: String = row.try_get("tenant_status")?;
        let key_status: String = row.try_get("key_status")?;

        Ok(AuthRecord {
            tenant_id: row.try_get("tenant_id")?,
            tenant_status: parse_tenant_status(&tenant_status)?,
            key_id: row.try_get("key_id")?,
            key_status: parse_key_status(&key_status)?,
            plan_id: row.try_get("plan_id")?,
            max_concurrent_streams: row.try_get("max_concurrent_streams")?,
            max_rps: row.try_get("max_rps")?,
            max_symbols: row.try_get("max_symbols")?,
            max_daily_requests: row.try_get("max_daily_requests")?,
            expires_at: row.try_get("expires_at")?,
            cached_at: Utc::now(),
        })
    }

    async fn touch_last_used(&self, key_id: i64, ts: DateTime<Utc>) -> Result<(), RepoError> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        tenant_id: i64,
        key_id: i64,
        date: NaiveDate,
        delta: UsageDelta,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO usage_daily
                (tenant_id, api_key_id, usage_date, total_requests, total_messages,
                 error_count, peak_concurrent_streams, avg_latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (api_key_id, usage_date) DO UPDATE SET
                total_requests = usage_daily.total_requests + EXCLUDED.total_requests,
                total_messages = usage_daily.total_messages + EXCLUDED.total_messages,
                error_count = usage_daily.error_count + EXCLUDED.error_count,
                peak_concurrent_streams =
                    GREATEST(usage_daily.peak_concurrent_streams, EXCLUDED.peak_concurrent_streams),
                avg_latency_ms = COALESCE(EXCLUDED.avg_latency_ms, usage_daily.avg_latency_ms),
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(key_id)
        .bind(date)
        .bind(delta.requests)
        .bind(delta.messages)
        .bind(delta.errors)
        .bind(delta.peak_streams)
        .bind(delta.avg_latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
