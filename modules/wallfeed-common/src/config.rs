use std::env;
use std::time::Duration;

use crate::error::WallfeedError;

pub const DEFAULT_BASE_URL: &str = "https://m.vk.com";
pub const DEFAULT_PAGE_LIMIT: u32 = 5;
pub const DEFAULT_SCRAPE_DELAY_SECS: u64 = 5;
pub const DEFAULT_LOOP_DELAY_SECS: u64 = 300;
pub const DEFAULT_ERROR_DELAY_SECS: u64 = 120;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Enrichment providers
    pub deepl_auth_key: Option<String>,
    pub nlp_service_url: Option<String>,

    // Crawling
    pub base_url: String,
    pub scrape_delay: Duration,
    pub loop_delay: Duration,
    pub error_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, WallfeedError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| WallfeedError::Config("DATABASE_URL is required".into()))?,
            deepl_auth_key: optional_env("DEEPL_AUTH_KEY"),
            nlp_service_url: optional_env("NLP_SERVICE_URL"),
            base_url: optional_env("WALLFEED_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            scrape_delay: secs_env("WALLFEED_SCRAPE_DELAY_SECS", DEFAULT_SCRAPE_DELAY_SECS)?,
            loop_delay: secs_env("WALLFEED_LOOP_DELAY_SECS", DEFAULT_LOOP_DELAY_SECS)?,
            error_delay: secs_env("WALLFEED_ERROR_DELAY_SECS", DEFAULT_ERROR_DELAY_SECS)?,
        })
    }

    /// Log which settings are present without revealing secrets.
    pub fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) => preview(v),
                None => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!("  DEEPL_AUTH_KEY: {}", preview_opt(&self.deepl_auth_key));
        tracing::info!("  NLP_SERVICE_URL: {}", self.nlp_service_url.as_deref().unwrap_or("<not set>"));
        tracing::info!("  WALLFEED_BASE_URL: {}", self.base_url);
        tracing::info!(
            scrape_delay_secs = self.scrape_delay.as_secs(),
            loop_delay_secs = self.loop_delay.as_secs(),
            error_delay_secs = self.error_delay.as_secs(),
            "  Delays"
        );
    }
}

/// First few characters of a secret plus its length.
fn preview(val: &str) -> String {
    let head: String = val.chars().take(5).collect();
    format!("{head}...({} chars)", val.chars().count())
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn secs_env(key: &str, default: u64) -> Result<Duration, WallfeedError> {
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| WallfeedError::Config(format!("{key} must be a whole number of seconds"))),
        None => Ok(Duration::from_secs(default)),
    }
}
