//! Error taxonomy surfaced across the relay's library boundary.

use thiserror::Error;

/// Errors the transport layer can observe.
///
/// Credential and quota failures are classified here with stable codes; the
/// transport layer maps `code()` straight onto the wire. Upstream trouble is
/// handled internally and only ever shows up as [`RelayError::Unavailable`]
/// on read paths.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("credential is required")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("credential has expired")]
    ExpiredCredential,

    #[error("credential has been revoked")]
    RevokedCredential,

    #[error("tenant account is suspended")]
    SuspendedTenant,

    #[error("request rate limit exceeded")]
    QuotaExceededRps,

    #[error("maximum concurrent streams exceeded")]
    QuotaExceededStreams,

    #[error("daily request quota exceeded")]
    QuotaExceededDaily,

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl RelayError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::MissingCredential => "AUTH_MISSING_CREDENTIAL",
            RelayError::InvalidCredential => "AUTH_INVALID_CREDENTIAL",
            RelayError::ExpiredCredential => "AUTH_EXPIRED_CREDENTIAL",
            RelayError::RevokedCredential => "AUTH_REVOKED_CREDENTIAL",
            RelayError::SuspendedTenant => "AUTH_SUSPENDED_TENANT",
            RelayError::QuotaExceededRps => "QUOTA_EXCEEDED_RPS",
            RelayError::QuotaExceededStreams => "QUOTA_EXCEEDED_STREAMS",
            RelayError::QuotaExceededDaily => "QUOTA_EXCEEDED_DAILY",
            RelayError::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

/// Result alias for boundary operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RelayError::MissingCredential.code(), "AUTH_MISSING_CREDENTIAL");
        assert_eq!(RelayError::QuotaExceededRps.code(), "QUOTA_EXCEEDED_RPS");
        assert_eq!(
            RelayError::Unavailable("no data".into()).code(),
            "UNAVAILABLE"
        );
    }
}
