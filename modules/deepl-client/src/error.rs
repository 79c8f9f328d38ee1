use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeeplError>;

#[derive(Debug, Error)]
pub enum DeeplError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Translation quota exceeded")]
    QuotaExceeded,

    #[error("Authorization failed: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl DeeplError {
    /// Map a non-success HTTP status to the matching error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            456 => DeeplError::QuotaExceeded,
            401 | 403 => DeeplError::Auth(message),
            _ => DeeplError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for DeeplError {
    fn from(err: reqwest::Error) -> Self {
        DeeplError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for DeeplError {
    fn from(err: serde_json::Error) -> Self {
        DeeplError::Parse(err.to_string())
    }
}
