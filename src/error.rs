use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend answered with a non-success status.
    #[error("API Error {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected locally before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("sync engine is not running")]
    EngineStopped,
}

impl ClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClientError::Validation(message.into())
    }

    /// Transport failures are the ones surfaced to the view as failed operations.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Status { .. } | ClientError::Request(_) | ClientError::Io(_)
        )
    }
}
