use thiserror::Error;

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote rejected call (code {code}): {message}")]
    RemoteRejection { code: i64, message: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLx error: {0}")]
    Sqlx(sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SentinelError {
    /// Whether a retry executor should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SentinelError::Transport(_)
                | SentinelError::StoreUnavailable(_)
                | SentinelError::Http(_)
                | SentinelError::WebSocket(_)
                | SentinelError::Io(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SentinelError::Cancelled)
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, SentinelError::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for SentinelError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SentinelError::StoreUnavailable(err.to_string()),
            other => SentinelError::Sqlx(other),
        }
    }
}

impl From<redis::RedisError> for SentinelError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            SentinelError::StoreUnavailable(err.to_string())
        } else {
            SentinelError::Redis(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SentinelError::Transport("reset".into()).is_retryable());
        assert!(SentinelError::StoreUnavailable("down".into()).is_retryable());
        assert!(!SentinelError::Protocol("bad frame".into()).is_retryable());
        assert!(!SentinelError::Cancelled.is_retryable());
        assert!(!SentinelError::RemoteRejection {
            code: -32602,
            message: "invalid params".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_sqlx_pool_errors_are_store_unavailable() {
        let err: SentinelError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_store_unavailable());

        let err: SentinelError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_store_unavailable());
    }
}
