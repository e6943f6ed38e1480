use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether the selector should advance to the next credential and retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout(_) => true,
            Error::Auth(AuthError::RefreshTransient(_)) => true,
            Error::Api(ApiError::ServerError { .. }) => true,
            Error::Api(ApiError::RateLimited { .. }) => true,
            _ => false,
        }
    }

    /// Whether the credential that produced this error is permanently dead.
    pub fn is_auth_dead(&self) -> bool {
        matches!(
            self,
            Error::Auth(AuthError::Rejected { .. }) | Error::Auth(AuthError::Ineligible)
        )
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// OAuth or project discovery answered 400/403 - the credential is dead.
    #[error("credential rejected by upstream (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The account has no Cloud AI project and cannot be provisioned one.
    #[error("account is not eligible for project provisioning")]
    Ineligible,

    /// Refresh failed for a recoverable reason (network, 5xx).
    #[error("token refresh failed: {0}")]
    RefreshTransient(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("quota exhausted on {model}, resets at {reset_time:?}")]
    QuotaExhausted {
        model: String,
        reset_time: Option<String>,
    },

    #[error("rate limited - retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("invalid request field '{field}': {message}")]
    InvalidRequest { field: String, message: String },

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("no usable credential in the pool")]
    PoolExhausted,

    #[error("request body too large: {size} bytes (max: {max} bytes)")]
    RequestTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Http("connection reset".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(180)).is_transient());
        assert!(Error::Auth(AuthError::RefreshTransient("503".into())).is_transient());
        assert!(
            Error::Api(ApiError::ServerError {
                status: 502,
                message: "bad gateway".into()
            })
            .is_transient()
        );

        assert!(!Error::Api(ApiError::PoolExhausted).is_transient());
        assert!(
            !Error::Api(ApiError::QuotaExhausted {
                model: "gemini-3-flash".into(),
                reset_time: None
            })
            .is_transient()
        );
    }

    #[test]
    fn auth_dead_classification() {
        assert!(
            Error::Auth(AuthError::Rejected {
                status: 400,
                message: "invalid_grant".into()
            })
            .is_auth_dead()
        );
        assert!(Error::Auth(AuthError::Ineligible).is_auth_dead());
        assert!(!Error::Auth(AuthError::RefreshTransient("x".into())).is_auth_dead());
        assert!(!Error::Http("x".into()).is_auth_dead());
    }

    #[test]
    fn invalid_request_names_the_field() {
        let err = Error::Api(ApiError::InvalidRequest {
            field: "messages".into(),
            message: "must not be empty".into(),
        });
        let display = format!("{}", err);
        assert!(display.contains("messages"));
        assert!(display.contains("must not be empty"));
    }
}
