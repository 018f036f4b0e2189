use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmoncmsError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid response: {0}")]
    Response(String),

    #[error("invalid feed descriptor: {0}")]
    InvalidFeedDescriptor(String),

    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("corrupt feed file {path}: {message}")]
    CorruptFile { path: String, message: String },

    #[error("feed data unavailable: {0}")]
    FeedDataUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EmoncmsError {
    pub(crate) fn unsupported(operation: &'static str, backend: &'static str) -> Self {
        Self::Unsupported { operation, backend }
    }

    pub(crate) fn corrupt(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptFile {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EmoncmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Response(format!("malformed JSON: {err}"))
    }
}

impl From<reqwest::Error> for EmoncmsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Connection(err.to_string())
        } else {
            Self::Response(err.to_string())
        }
    }
}

impl From<sqlx::Error> for EmoncmsError {
    fn from(err: sqlx::Error) -> Self {
        tracing::debug!(error = %err, "mysql error");
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => Self::Connection(err.to_string()),
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("28000") => {
                // access denied
                Self::Connection(err.to_string())
            }
            other => Self::Response(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EmoncmsError>;
