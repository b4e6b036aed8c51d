//! Auth gate: resolves opaque credentials into authorization records.
//!
//! The credential never leaves this module in the clear: a SHA-256 hex
//! digest is the lookup key everywhere (in-process cache, Redis, and the
//! repository's `key_hash` column). Lookups go process cache → Redis →
//! repository; valid records are written back through both cache layers.

use chrono::Utc;
use common::{AuthRecord, KeyStatus, TenantStatus};
use metrics::counter;
use parking_lot::RwLock;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::repo::{RepoError, Repository};

/// Version tag for the Redis payload. Entries with an unknown tag are
/// treated as misses so mixed-version deployments stay safe.
const CACHE_SCHEMA_VERSION: u32 = 1;

const REDIS_KEY_PREFIX: &str = "auth:";

/// Versioned envelope for auth records in the distributed cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedAuth {
    schema: u32,
    record: AuthRecord,
}

/// Compute the hex SHA-256 digest used as the credential's cache and
/// repository key.
pub fn hash_credential(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Credential validation with layered caching.
pub struct AuthGate {
    repo: Arc<dyn Repository>,
    redis: Option<redis::Client>,
    cache: RwLock<HashMap<String, AuthRecord>>,
    cache_ttl: Duration,
}

impl AuthGate {
    pub fn new(
        repo: Arc<dyn Repository>,
        redis: Option<redis::Client>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            redis,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Validate a credential and return its authorization record.
    pub async fn authenticate(&self, credential: &str) -> Result<AuthRecord, RelayError> {
        if credential.is_empty() {
            counter!("relay_auth_failures_total", "reason" => "missing").increment(1);
            return Err(RelayError::MissingCredential);
        }

        let hash = hash_credential(credential);

        if let Some(record) = self.from_process_cache(&hash) {
            counter!("relay_auth_cache_hits_total", "layer" => "process").increment(1);
            return Ok(record);
        }

        if let Some(record) = self.from_redis(&hash).await {
            counter!("relay_auth_cache_hits_total", "layer" => "redis").increment(1);
            self.cache.write().insert(hash.clone(), record.clone());
            return Ok(record);
        }

        let mut record = match self.repo.find_auth_by_hash(&hash).await {
            Ok(record) => record,
            Err(RepoError::NotFound) => {
                counter!("relay_auth_failures_total", "reason" => "invalid").increment(1);
                return Err(RelayError::InvalidCredential);
            }
            Err(RepoError::Unavailable(reason)) => {
                counter!("relay_auth_failures_total", "reason" => "unavailable").increment(1);
                warn!(%reason, "auth repository unavailable");
                return Err(RelayError::Unavailable(reason));
            }
        };

        if !record.is_valid() {
            let err = classify_invalid(&record);
            counter!("relay_auth_failures_total", "reason" => failure_reason(&err)).increment(1);
            return Err(err);
        }

        record.cached_at = Utc::now();
        self.cache.write().insert(hash.clone(), record.clone());
        self.put_redis(&hash, &record).await;

        // Best-effort last-used stamp; failures are logged, never surfaced.
        let repo = self.repo.clone();
        let key_id = record.key_id;
        tokio::spawn(async move {
            if let Err(err) = repo.touch_last_used(key_id, Utc::now()).await {
                debug!(key_id, %err, "failed to record last_used");
            }
        });

        counter!("relay_auth_success_total").increment(1);
        Ok(record)
    }

    /// Purge the credential from both cache layers. Called after any
    /// administrative mutation of keys, tenants, or plans.
    pub async fn invalidate(&self, credential: &str) {
        let hash = hash_credential(credential);
        self.cache.write().remove(&hash);

        if let Some(client) = &self.redis {
            let key = format!("{REDIS_KEY_PREFIX}{hash}");
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    if let Err(err) = conn.del::<_, ()>(&key).await {
                        warn!(%err, "failed to invalidate distributed auth cache");
                    }
                }
                Err(err) => warn!(%err, "redis unavailable during auth invalidation"),
            }
        }
    }

    /// Drop expired entries from the in-process cache. Returns the number
    /// of entries removed.
    pub fn scrub(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.cache_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let cutoff = Utc::now() - ttl;

        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, record| record.cached_at >= cutoff);
        before - cache.len()
    }

    /// Periodic scrub loop; exits when `cancel` fires.
    pub async fn run_scrub(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cache_ttl);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.scrub();
                    if removed > 0 {
                        debug!(removed, "auth cache scrub");
                    }
                }
            }
        }
    }

    fn from_process_cache(&self, hash: &str) -> Option<AuthRecord> {
        let record = self.cache.read().get(hash).cloned()?;
        let ttl = chrono::Duration::from_std(self.cache_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        if record.cached_at + ttl > Utc::now() && record.is_valid() {
            Some(record)
        } else {
            // Stale or no-longer-valid entry: drop it so the next lookup
            // goes through the slow path.
            self.cache.write().remove(hash);
            None
        }
    }

    async fn from_redis(&self, hash: &str) -> Option<AuthRecord> {
        let client = self.redis.as_ref()?;
        let key = format!("{REDIS_KEY_PREFIX}{hash}");

        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(%err, "redis unavailable, skipping distributed auth cache");
                return None;
            }
        };

        let payload: Option<String> = match conn.get(&key).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%err, "redis get failed");
                return None;
            }
        };

        let cached: CachedAuth = serde_json::from_str(&payload?).ok()?;
        if cached.schema != CACHE_SCHEMA_VERSION {
            debug!(schema = cached.schema, "ignoring auth cache entry with unknown schema");
            return None;
        }
        cached.record.is_valid().then_some(cached.record)
    }

    async fn put_redis(&self, hash: &str, record: &AuthRecord) {
        let Some(client) = &self.redis else { return };
        let key = format!("{REDIS_KEY_PREFIX}{hash}");
        let payload = match serde_json::to_string(&CachedAuth {
            schema: CACHE_SCHEMA_VERSION,
            record: record.clone(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to serialize auth record for redis");
                return;
            }
        };

        match client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                if let Err(err) = conn
                    .set_ex::<_, _, ()>(&key, payload, self.cache_ttl.as_secs())
                    .await
                {
                    debug!(%err, "redis set failed");
                }
            }
            Err(err) => debug!(%err, "redis unavailable, skipping auth cache write"),
        }
    }
}

/// Map an invalid record onto the credential error taxonomy.
fn classify_invalid(record: &AuthRecord) -> RelayError {
    if record.tenant_status == TenantStatus::Suspended {
        return RelayError::SuspendedTenant;
    }
    match record.key_status {
        KeyStatus::Revoked => RelayError::RevokedCredential,
        KeyStatus::Expired => RelayError::ExpiredCredential,
        KeyStatus::Active if record.is_expired() => RelayError::ExpiredCredential,
        _ => RelayError::InvalidCredential,
    }
}

fn failure_reason(err: &RelayError) -> &'static str {
    match err {
        RelayError::SuspendedTenant => "suspended",
        RelayError::RevokedCredential => "revoked",
        RelayError::ExpiredCredential => "expired",
        _ => "invalid",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use chrono::{DateTime, NaiveDate};
    use common::UsageDelta;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubRepo {
        records: Mutex<HashMap<String, AuthRecord>>,
        queries: AtomicU32,
        unavailable: std::sync::atomic::AtomicBool,
    }

    impl StubRepo {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(HashMap::new()),
                queries: AtomicU32::new(0),
                unavailable: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn insert(&self, credential: &str, record: AuthRecord) {
            self.records
                .lock()
                .insert(hash_credential(credential), record);
        }

        fn query_count(&self) -> u32 {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Repository for StubRepo {
        async fn find_auth_by_hash(&self, hash: &str) -> Result<AuthRecord, RepoError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RepoError::Unavailable("stub down".into()));
            }
            self.records
                .lock()
                .get(hash)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn touch_last_used(&self, _key_id: i64, _ts: DateTime<Utc>) -> Result<(), RepoError> {
            Ok(())
        }

        async fn increment_usage(
            &self,
            _tenant_id: i64,
            _key_id: i64,
            _date: NaiveDate,
            _delta: UsageDelta,
        ) -> Result<(), RepoError> {
            Ok(())
        }
    }

    fn record() -> AuthRecord {
        AuthRecord {
            tenant_id: 1,
            tenant_status: TenantStatus::Active,
            key_id: 10,
            key_status: KeyStatus::Active,
            plan_id: 2,
            max_concurrent_streams: 10,
            max_rps: 100,
            max_symbols: 50,
            max_daily_requests: None,
            expires_at: None,
            cached_at: Utc::now(),
        }
    }

    fn gate(repo: Arc<StubRepo>) -> AuthGate {
        AuthGate::new(repo, None, Duration::from_secs(300))
    }

    #[test]
    fn hash_is_stable_hex() {
        let hash = hash_credential("secret-key");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_credential("secret-key"));
        assert_ne!(hash, hash_credential("other-key"));
    }

    #[tokio::test]
    async fn empty_credential_rejected() {
        let gate = gate(StubRepo::new());
        assert!(matches!(
            gate.authenticate("").await,
            Err(RelayError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn unknown_credential_is_invalid() {
        let gate = gate(StubRepo::new());
        assert!(matches!(
            gate.authenticate("nope").await,
            Err(RelayError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn valid_credential_is_cached() {
        let repo = StubRepo::new();
        repo.insert("key-1", record());
        let gate = gate(repo.clone());

        assert!(gate.authenticate("key-1").await.is_ok());
        assert!(gate.authenticate("key-1").await.is_ok());
        assert_eq!(repo.query_count(), 1, "second call served from cache");
    }

    #[tokio::test]
    async fn invalidate_forces_repository_round_trip() {
        let repo = StubRepo::new();
        repo.insert("key-1", record());
        let gate = gate(repo.clone());

        assert!(gate.authenticate("key-1").await.is_ok());
        gate.invalidate("key-1").await;

        // Admin revoked the key; the cache-hot path must observe it.
        let mut revoked = record();
        revoked.key_status = KeyStatus::Revoked;
        repo.insert("key-1", revoked);

        assert!(matches!(
            gate.authenticate("key-1").await,
            Err(RelayError::RevokedCredential)
        ));
        assert_eq!(repo.query_count(), 2);
    }

    #[tokio::test]
    async fn classifies_invalid_records() {
        let repo = StubRepo::new();

        let mut suspended = record();
        suspended.tenant_status = TenantStatus::Suspended;
        repo.insert("suspended", suspended);

        let mut revoked = record();
        revoked.key_status = KeyStatus::Revoked;
        repo.insert("revoked", revoked);

        let mut expired = record();
        expired.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        repo.insert("expired", expired);

        let gate = gate(repo);
        assert!(matches!(
            gate.authenticate("suspended").await,
            Err(RelayError::SuspendedTenant)
        ));
        assert!(matches!(
            gate.authenticate("revoked").await,
            Err(RelayError::RevokedCredential)
        ));
        assert!(matches!(
            gate.authenticate("expired").await,
            Err(RelayError::ExpiredCredential)
        ));
    }

    #[tokio::test]
    async fn repository_outage_surfaces_unavailable() {
        let repo = StubRepo::new();
        repo.unavailable.store(true, Ordering::SeqCst);
        let gate = gate(repo);

        assert!(matches!(
            gate.authenticate("key-1").await,
            Err(RelayError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn stale_cache_entry_requeries() {
        let repo = StubRepo::new();
        repo.insert("key-1", record());
        let gate = AuthGate::new(repo.clone(), None, Duration::from_millis(10));

        assert!(gate.authenticate("key-1").await.is_ok());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(gate.authenticate("key-1").await.is_ok());
        assert_eq!(repo.query_count(), 2, "expired entry goes back to the repository");
    }

    #[tokio::test]
    async fn scrub_drops_expired_entries() {
        let repo = StubRepo::new();
        repo.insert("key-1", record());
        let gate = AuthGate::new(repo, None, Duration::from_millis(10));

        assert!(gate.authenticate("key-1").await.is_ok());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(gate.scrub(), 1);
        assert_eq!(gate.scrub(), 0);
    }
}
