// Model boundaries for the enrichment stages, and their production
// implementations backed by the NLP sidecar and DeepL.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use deepl_client::DeeplClient;
use nlp_client::NlpClient;
use wallfeed_common::{ExtractedEntity, SentimentScores};

/// Scores a batch of texts; one result per input, in order.
#[async_trait]
pub trait SentimentModel: Send + Sync {
    async fn predict(&self, texts: &[String]) -> Result<Vec<SentimentScores>>;
}

/// Recognizes named entities in a single document.
#[async_trait]
pub trait EntityRecognizer: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>>;
}

/// Translates a batch of texts; one result per input, in order.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<String>>;
}

/// A model the pipeline may or may not have. Stages whose model is
/// `Unavailable` are skipped.
pub enum ModelHandle<T: ?Sized> {
    Available(Arc<T>),
    Unavailable,
}

impl<T: ?Sized> ModelHandle<T> {
    pub fn from_option(model: Option<Arc<T>>) -> Self {
        match model {
            Some(m) => Self::Available(m),
            None => Self::Unavailable,
        }
    }

    pub fn get(&self) -> Option<&Arc<T>> {
        match self {
            Self::Available(m) => Some(m),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

impl<T: ?Sized> Clone for ModelHandle<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Available(m) => Self::Available(Arc::clone(m)),
            Self::Unavailable => Self::Unavailable,
        }
    }
}

impl<T: ?Sized> Default for ModelHandle<T> {
    fn default() -> Self {
        Self::Unavailable
    }
}

#[async_trait]
impl SentimentModel for NlpClient {
    async fn predict(&self, texts: &[String]) -> Result<Vec<SentimentScores>> {
        Ok(self.sentiment(texts).await?)
    }
}

#[async_trait]
impl EntityRecognizer for NlpClient {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        Ok(self.entities(text).await?)
    }
}

#[async_trait]
impl Translator for DeeplClient {
    async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<String>> {
        let translations = DeeplClient::translate(self, texts, source_lang, target_lang).await?;
        Ok(translations.into_iter().map(|t| t.text).collect())
    }
}
