use reqwest::StatusCode;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("remote artifact not ready: {reason}")]
    NotReady { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("authentication rejected with HTTP {status}")]
    Auth { status: StatusCode },

    #[error("invalid artifact: {reason}")]
    InvalidArtifact { reason: String },

    #[error("integrity mismatch on {field}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("upload session made no progress after {attempts} consecutive 308 responses")]
    Stuck308 { attempts: u32 },

    #[error("upload session rejected: {reason}")]
    SessionRejected { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        source: Box<TransferError>,
    },
}

impl TransferError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
        }
    }

    pub fn invalid_artifact(reason: impl Into<String>) -> Self {
        Self::InvalidArtifact {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    /// Whether the retry driver may schedule another attempt for this error.
    ///
    /// `Auth` is special-cased by the driver: it is granted exactly one
    /// forced-refresh pass before counting as fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotReady { .. }
            | Self::Network { .. }
            | Self::Io { .. }
            | Self::InvalidArtifact { .. }
            | Self::IntegrityMismatch { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Auth { .. } => true,
            Self::Stuck308 { .. } | Self::SessionRejected { .. } | Self::Exhausted { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        let err = TransferError::http_status(StatusCode::BAD_GATEWAY, "http://x", "download");
        assert!(err.is_retryable());

        let err = TransferError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://x", "upload");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_fatal() {
        let err = TransferError::http_status(StatusCode::NOT_FOUND, "http://x", "download");
        assert!(!err.is_retryable());

        let err = TransferError::Stuck308 { attempts: 5 };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_ready_is_retryable() {
        assert!(TransferError::not_ready("placeholder size").is_retryable());
    }
}
