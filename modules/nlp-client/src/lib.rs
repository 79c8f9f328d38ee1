//! Client for the Russian-language NLP sidecar.
//!
//! The sidecar exposes two endpoints:
//! - `POST /sentiment` with `{"texts": [...]}` returns one score object per text
//! - `POST /entities` with `{"text": "..."}` returns the recognized spans

pub mod error;

pub use error::{NlpError, Result};

use serde::de::DeserializeOwned;
use serde::Serialize;
use wallfeed_common::{ExtractedEntity, SentimentScores};

#[derive(Debug, Serialize)]
struct SentimentRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Serialize)]
struct EntitiesRequest<'a> {
    text: &'a str,
}

pub struct NlpClient {
    client: reqwest::Client,
    base_url: String,
}

impl NlpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Score a batch of texts. Returns one entry per input, in order.
    pub async fn sentiment(&self, texts: &[String]) -> Result<Vec<SentimentScores>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let scores: Vec<SentimentScores> =
            self.post("sentiment", &SentimentRequest { texts }).await?;
        if scores.len() != texts.len() {
            return Err(NlpError::Parse(format!(
                "expected {} sentiment results, got {}",
                texts.len(),
                scores.len()
            )));
        }
        Ok(scores)
    }

    /// Recognize named entities in one text.
    pub async fn entities(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        self.post("entities", &EntitiesRequest { text }).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(NlpError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw = resp.text().await?;
        let parsed = serde_json::from_str(&raw)?;
        tracing::trace!(path, "NLP sidecar responded");
        Ok(parsed)
    }
}
