use thiserror::Error;

#[derive(Error, Debug)]
pub enum WallfeedError {
    #[error("Invalid source domain: {0}")]
    InvalidDomain(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
