//! Tenant, key, and plan records the auth gate resolves credentials into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a tenant account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

/// Lifecycle state of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

/// A validated authorization: the joined tenant + key + plan row, plus cache
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub tenant_id: i64,
    pub tenant_status: TenantStatus,
    pub key_id: i64,
    pub key_status: KeyStatus,
    pub plan_id: i64,
    pub max_concurrent_streams: i32,
    pub max_rps: i32,
    pub max_symbols: i32,
    pub max_daily_requests: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cached_at: DateTime<Utc>,
}

impl AuthRecord {
    /// Whether the key is past its expiry timestamp.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Usable iff the tenant and key are both active and the key has not
    /// expired.
    pub fn is_valid(&self) -> bool {
        self.tenant_status == TenantStatus::Active
            && self.key_status == KeyStatus::Active
            && !self.is_expired()
    }
}

/// Counters accumulated for one API key, flushed into the daily usage row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub requests: i64,
    pub messages: i64,
    pub errors: i64,
    pub peak_streams: i32,
    pub avg_latency_ms: Option<f64>,
}

impl UsageDelta {
    /// Whether flushing this delta would be a no-op.
    pub fn is_empty(&self) -> bool {
        self.requests == 0
            && self.messages == 0
            && self.errors == 0
            && self.peak_streams == 0
            && self.avg_latency_ms.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

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

    #[test]
    fn active_record_is_valid() {
        assert!(record().is_valid());
    }

    #[test]
    fn suspended_tenant_is_invalid() {
        let mut rec = record();
        rec.tenant_status = TenantStatus::Suspended;
        assert!(!rec.is_valid());
    }

    #[test]
    fn revoked_key_is_invalid() {
        let mut rec = record();
        rec.key_status = KeyStatus::Revoked;
        assert!(!rec.is_valid());
    }

    #[test]
    fn past_expiry_is_invalid() {
        let mut rec = record();
        rec.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(rec.is_expired());
        assert!(!rec.is_valid());

        rec.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(!rec.is_expired());
        assert!(rec.is_valid());
    }

    #[test]
    fn empty_delta() {
        assert!(UsageDelta::default().is_empty());
        let delta = UsageDelta {
            requests: 1,
            ..Default::default()
        };
        assert!(!delta.is_empty());
    }
}
