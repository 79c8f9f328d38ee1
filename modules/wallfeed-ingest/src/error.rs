use thiserror::Error;

use wallfeed_common::WallfeedError;
use wallfeed_store::StoreError;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Failures that end an ingestion run.
///
/// Transport errors never surface here: the engine retries them. Everything
/// below means the upstream contract changed or the store is unusable.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Unexpected content type {content_type:?} from {url}")]
    UnexpectedContentType { url: String, content_type: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Source(#[from] WallfeedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
