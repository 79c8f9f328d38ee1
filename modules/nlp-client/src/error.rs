use thiserror::Error;

pub type Result<T> = std::result::Result<T, NlpError>;

#[derive(Debug, Error)]
pub enum NlpError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for NlpError {
    fn from(err: reqwest::Error) -> Self {
        NlpError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for NlpError {
    fn from(err: serde_json::Error) -> Self {
        NlpError::Parse(err.to_string())
    }
}
