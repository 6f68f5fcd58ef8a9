/// Errors from the upstream HubSoft API surface.
///
/// `is_retryable` mirrors the engine's retry policy: transient transport
/// and 5xx failures retry, everything shaped like a caller mistake fails
/// terminally.
#[derive(Debug, thiserror::Error)]
pub enum HubSoftError {
    #[error("timeout")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limit hit, reset in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("authentication failed")]
    Auth,

    #[error("not found")]
    NotFound,

    #[error("unexpected response shape: {0}")]
    Schema(String),

    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },
}

impl HubSoftError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HubSoftError::Timeout
            | HubSoftError::Connection(_)
            | HubSoftError::RateLimited { .. }
            | HubSoftError::Server { .. } => true,
            HubSoftError::Auth
            | HubSoftError::NotFound
            | HubSoftError::Schema(_)
            | HubSoftError::Api { .. } => false,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HubSoftError::Timeout
        } else if e.is_connect() {
            HubSoftError::Connection(e.to_string())
        } else {
            HubSoftError::Connection(e.to_string())
        }
    }

    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => HubSoftError::RateLimited {
                retry_after_secs: 60,
            },
            401 => HubSoftError::Auth,
            404 => HubSoftError::NotFound,
            500..=599 => HubSoftError::Server { status },
            _ => HubSoftError::Api {
                status,
                message: body,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(HubSoftError::Timeout.is_retryable());
        assert!(HubSoftError::Connection("refused".into()).is_retryable());
        assert!(HubSoftError::RateLimited { retry_after_secs: 60 }.is_retryable());
        assert!(HubSoftError::Server { status: 503 }.is_retryable());
    }

    #[test]
    fn permanent_errors_are_not() {
        assert!(!HubSoftError::NotFound.is_retryable());
        assert!(!HubSoftError::Schema("missing field".into()).is_retryable());
        assert!(!HubSoftError::Api { status: 400, message: "bad".into() }.is_retryable());
        assert!(!HubSoftError::Auth.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            HubSoftError::from_status(429, String::new()),
            HubSoftError::RateLimited { .. }
        ));
        assert!(matches!(
            HubSoftError::from_status(502, String::new()),
            HubSoftError::Server { status: 502 }
        ));
        assert!(matches!(
            HubSoftError::from_status(400, String::new()),
            HubSoftError::Api { status: 400, .. }
        ));
    }
}
