/// Shared error type used across all claude-mem worker crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("database busy: {0}")]
    Busy(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider} ({kind:?}): {message}")]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("vector store: {0}")]
    Vector(String),

    #[error("config: {0}")]
    Config(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Classification of a provider failure, used to decide whether the
/// fallback agent should take over the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Invalid or expired credentials (401/403).
    Auth,
    /// Rate limited (429) or quota exhausted.
    RateLimited,
    /// Provider-side failure (5xx).
    Server,
    /// Connection refused/reset, DNS failure, broken pipe.
    Transport,
    /// The request never completed in time.
    Timeout,
    /// The provider rejected the request itself (4xx other than 429).
    InvalidRequest,
    /// Anything we could not classify.
    Other,
}

impl Error {
    /// Whether this error should hand the session to the fallback provider.
    ///
    /// Auth, rate-limit, 5xx, transport, and timeout failures are eligible.
    /// Client bugs (4xx other than 429) and programming errors are not.
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Http(_) => true,
            Error::Provider { kind, .. } => matches!(
                kind,
                ProviderErrorKind::Auth
                    | ProviderErrorKind::RateLimited
                    | ProviderErrorKind::Server
                    | ProviderErrorKind::Transport
                    | ProviderErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Classify an HTTP status code from a provider response.
    pub fn provider_kind_for_status(status: u16) -> ProviderErrorKind {
        match status {
            401 | 403 => ProviderErrorKind::Auth,
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Server,
            400..=499 => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::Other,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound("no rows".into()),
            rusqlite::Error::SqliteFailure(f, msg) => {
                let text = msg.clone().unwrap_or_else(|| f.to_string());
                match f.code {
                    ErrorCode::ConstraintViolation => Error::Conflict(text),
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::Busy(text),
                    ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Error::Corrupt(text),
                    _ => Error::Other(text),
                }
            }
            _ => Error::Other(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_eligibility_by_kind() {
        let eligible = [
            ProviderErrorKind::Auth,
            ProviderErrorKind::RateLimited,
            ProviderErrorKind::Server,
            ProviderErrorKind::Transport,
            ProviderErrorKind::Timeout,
        ];
        for kind in eligible {
            let err = Error::Provider {
                provider: "gemini".into(),
                kind,
                message: "boom".into(),
            };
            assert!(err.is_fallback_eligible(), "{kind:?} should be eligible");
        }

        let err = Error::Provider {
            provider: "gemini".into(),
            kind: ProviderErrorKind::InvalidRequest,
            message: "bad schema".into(),
        };
        assert!(!err.is_fallback_eligible());
    }

    #[test]
    fn timeouts_and_transport_are_eligible() {
        assert!(Error::Timeout("60s".into()).is_fallback_eligible());
        assert!(Error::Http("connection reset".into()).is_fallback_eligible());
        assert!(!Error::NotFound("row".into()).is_fallback_eligible());
        assert!(!Error::Parse("bad tag".into()).is_fallback_eligible());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            Error::provider_kind_for_status(401),
            ProviderErrorKind::Auth
        );
        assert_eq!(
            Error::provider_kind_for_status(429),
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            Error::provider_kind_for_status(503),
            ProviderErrorKind::Server
        );
        assert_eq!(
            Error::provider_kind_for_status(422),
            ProviderErrorKind::InvalidRequest
        );
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
