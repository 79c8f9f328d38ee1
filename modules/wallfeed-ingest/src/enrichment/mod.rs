//! Enrichment pipeline: sentiment, named entities and translation.
//!
//! Each stage selects rows the store reports as unprocessed, calls its model
//! in batches and writes keyed results back, so every stage can be re-run
//! and resumed at any point. A stage whose model is unavailable is skipped.

pub mod models;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use wallfeed_common::config::DEFAULT_ERROR_DELAY_SECS;
use wallfeed_common::{
    ExtractedEntity, Post, PostSentiment, PostTranslation, Selection, WriteMode,
};
use wallfeed_store::RecordStore;

pub use models::{EntityRecognizer, ModelHandle, SentimentModel, Translator};

pub const SENTIMENT_BATCH_SIZE: usize = 100;
pub const POST_TRANSLATION_BATCH_SIZE: usize = 10;
pub const ENTITY_TRANSLATION_BATCH_SIZE: usize = 50;
/// Posts longer than this (in characters) are never sent for translation.
pub const TRANSLATION_MAX_CHARS: usize = 2500;
pub const SOURCE_LANG: &str = "RU";
pub const TARGET_LANG: &str = "EN-US";

#[derive(TypedBuilder)]
pub struct EnrichmentPipeline {
    store: Arc<dyn RecordStore>,
    #[builder(default)]
    sentiment: ModelHandle<dyn SentimentModel>,
    #[builder(default)]
    entities: ModelHandle<dyn EntityRecognizer>,
    #[builder(default)]
    translator: ModelHandle<dyn Translator>,
    /// Pause after a translation-provider error.
    #[builder(default = Duration::from_secs(DEFAULT_ERROR_DELAY_SECS))]
    cooldown: Duration,
}

impl EnrichmentPipeline {
    pub fn has_translator(&self) -> bool {
        self.translator.is_available()
    }

    /// Score the posts a page just wrote. Best-effort: failures are logged
    /// and the posts stay in the sentiment backlog.
    pub async fn score_inline(&self, posts: &[Post]) {
        let Some(model) = self.sentiment.get() else {
            return;
        };
        let posts: Vec<&Post> = posts.iter().filter(|p| !p.text.is_empty()).collect();

        for chunk in posts.chunks(SENTIMENT_BATCH_SIZE) {
            let texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
            let scores = match model.predict(&texts).await {
                Ok(scores) if scores.len() == chunk.len() => scores,
                Ok(scores) => {
                    warn!(expected = chunk.len(), got = scores.len(), "Sentiment model returned wrong result count");
                    return;
                }
                Err(e) => {
                    warn!(posts = chunk.len(), error = %e, "Inline sentiment failed");
                    return;
                }
            };

            let rows: Vec<PostSentiment> = chunk
                .iter()
                .zip(scores)
                .map(|(p, scores)| PostSentiment {
                    id: p.id.clone(),
                    scores,
                })
                .collect();
            if let Err(e) = self.store.insert_sentiment(&rows, WriteMode::Replace).await {
                warn!(posts = rows.len(), error = %e, "Failed to store sentiment");
                return;
            }
            debug!(posts = rows.len(), "Inline sentiment stored");
        }
    }

    /// Score every selected post that has text and no sentiment yet.
    /// With `reset`, existing scores are dropped first.
    pub async fn score_sentiment(&self, selection: &Selection, reset: bool) -> Result<usize> {
        let Some(model) = self.sentiment.get() else {
            info!("Sentiment model unavailable, skipping");
            return Ok(0);
        };

        if reset {
            self.store
                .reset_sentiment()
                .await
                .context("Failed to reset sentiment")?;
            info!("Existing sentiment scores removed");
        }

        let pending = self.store.posts_needing_sentiment(selection).await?;
        info!(count = pending.len(), "Scoring sentiment");

        let mut scored = 0;
        for chunk in pending.chunks(SENTIMENT_BATCH_SIZE) {
            let texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
            let scores = model
                .predict(&texts)
                .await
                .context("Sentiment model failed")?;
            if scores.len() != chunk.len() {
                bail!(
                    "Sentiment model returned {} results for {} texts",
                    scores.len(),
                    chunk.len()
                );
            }

            let rows: Vec<PostSentiment> = chunk
                .iter()
                .zip(scores)
                .map(|(p, scores)| PostSentiment {
                    id: p.id.clone(),
                    scores,
                })
                .collect();
            self.store.insert_sentiment(&rows, WriteMode::InsertOnly).await?;
            scored += rows.len();
        }

        info!(scored, "Sentiment scoring done");
        Ok(scored)
    }

    /// Extract entities one post at a time. Every processed post gets a
    /// done-marker, found entities or not. Returns the number of entity
    /// spans recorded.
    pub async fn extract_entities(&self, selection: &Selection) -> Result<usize> {
        let Some(model) = self.entities.get() else {
            info!("Entity recognizer unavailable, skipping");
            return Ok(0);
        };

        let pending = self.store.posts_needing_entities(selection).await?;
        info!(count = pending.len(), "Extracting named entities");

        let mut extracted = 0;
        let mut posts_done = 0;
        for post in &pending {
            let spans = model
                .extract(&post.text)
                .await
                .with_context(|| format!("Entity recognition failed for post {}", post.id))?;
            let spans: Vec<ExtractedEntity> = spans.into_iter().map(canonical_entity).collect();
            debug!(post_id = %post.id, spans = spans.len(), "Entities recognized");

            extracted += self.store.record_entities(&post.id, &spans).await?;
            posts_done += 1;
        }

        info!(extracted, posts = posts_done, "Entity extraction done");
        Ok(extracted)
    }

    /// Translate untranslated posts within the length cap. A provider error
    /// ends the stage early; the count translated so far is returned.
    pub async fn translate_posts(&self, selection: &Selection) -> Result<usize> {
        let Some(translator) = self.translator.get() else {
            info!("Translator unavailable, skipping post translation");
            return Ok(0);
        };

        let pending = self
            .store
            .posts_needing_translation(selection, TRANSLATION_MAX_CHARS)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "Translating posts");

        let mut translated = 0;
        for chunk in pending.chunks(POST_TRANSLATION_BATCH_SIZE) {
            let texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
            let results = match translator.translate(&texts, SOURCE_LANG, TARGET_LANG).await {
                Ok(results) if results.len() == chunk.len() => results,
                Ok(results) => {
                    warn!(expected = chunk.len(), got = results.len(), "Translator returned wrong result count");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, translated, "Translation provider error, stopping post translation");
                    tokio::time::sleep(self.cooldown).await;
                    break;
                }
            };

            let rows: Vec<PostTranslation> = chunk
                .iter()
                .zip(results)
                .map(|(p, text_en)| PostTranslation {
                    id: p.id.clone(),
                    text_en,
                })
                .collect();
            self.store.insert_translations(&rows).await?;
            translated += rows.len();
        }

        info!(translated, "Post translation done");
        Ok(translated)
    }

    /// Translate entity names that have no English form yet, newest first.
    pub async fn translate_entities(&self, limit: Option<usize>) -> Result<usize> {
        let Some(translator) = self.translator.get() else {
            info!("Translator unavailable, skipping entity translation");
            return Ok(0);
        };

        let pending = self.store.entities_needing_translation(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "Translating entities");

        let mut translated = 0;
        for chunk in pending.chunks(ENTITY_TRANSLATION_BATCH_SIZE) {
            let names: Vec<String> = chunk.iter().map(|e| e.name.clone()).collect();
            let results = match translator.translate(&names, SOURCE_LANG, TARGET_LANG).await {
                Ok(results) if results.len() == chunk.len() => results,
                Ok(results) => {
                    warn!(expected = chunk.len(), got = results.len(), "Translator returned wrong result count");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, translated, "Translation provider error, stopping entity translation");
                    tokio::time::sleep(self.cooldown).await;
                    break;
                }
            };

            let rows: Vec<(i64, String)> =
                chunk.iter().map(|e| e.id).zip(results).collect();
            self.store.set_entity_translations(&rows).await?;
            translated += rows.len();
        }

        info!(translated, "Entity translation done");
        Ok(translated)
    }

    /// Run after a page was ingested, scoped to the posts it added:
    /// translate them, extract their entities, then translate any new
    /// entity names. Failures are logged and never reach the caller.
    pub async fn after_page(&self, inserted_ids: &[String]) {
        if inserted_ids.is_empty() {
            return;
        }
        let selection = Selection::Posts(inserted_ids.to_vec());

        if self.has_translator() {
            if let Err(e) = self.translate_posts(&selection).await {
                warn!(error = %e, "Post translation failed");
            }
        }

        let extracted = match self.extract_entities(&selection).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Entity extraction failed");
                0
            }
        };

        if extracted > 0 && self.has_translator() {
            if let Err(e) = self.translate_entities(Some(extracted)).await {
                warn!(error = %e, "Entity translation failed");
            }
        }
    }
}

/// Use the recognizer's normalized form as the entity name, falling back to
/// the surface text when none was produced.
fn canonical_entity(mut span: ExtractedEntity) -> ExtractedEntity {
    if span.normal.trim().is_empty() {
        span.normal = span.text.clone();
    }
    span
}
