// RecordStore: the persistence boundary for ingestion and enrichment.
//
// PgStore is the production implementation; MemoryStore (feature `test-utils`)
// backs deterministic tests with no database.

use async_trait::async_trait;

use wallfeed_common::{
    DomainStats, EntityRecord, ExtractedEntity, InsertOutcome, LoggedPage, PageRecord,
    PendingEntity, PendingText, Post, PostEntity, PostMetrics, PostSentiment, PostTranslation, ScrapeLogEntry,
    Selection, SentimentScores, WriteMode,
};

use crate::error::Result;

#[async_trait]
pub trait RecordStore: Send + Sync {
    // --- Posts ---

    /// Insert a post. With `WriteMode::InsertOnly` an existing id is left
    /// untouched and reported as `RejectedDuplicate`; with `Replace` it is
    /// overwritten, its sentiment row is dropped, and it is reported as
    /// `Inserted`.
    async fn insert_post(&self, post: &Post, mode: WriteMode) -> Result<InsertOutcome>;

    /// Insert or overwrite the metrics row for a post.
    async fn upsert_metrics(&self, metrics: &PostMetrics) -> Result<()>;

    /// Write a page in one transaction: each post as `insert_post` would,
    /// then its metrics. Outcomes are returned in record order.
    async fn write_page(&self, records: &[PageRecord], mode: WriteMode) -> Result<Vec<InsertOutcome>>;

    async fn get_post(&self, id: &str) -> Result<Option<Post>>;

    async fn get_metrics(&self, id: &str) -> Result<Option<PostMetrics>>;

    /// Number of stored posts for a domain (the backfill start offset).
    async fn count_posts(&self, domain: &str) -> Result<i64>;

    async fn domain_stats(&self) -> Result<Vec<DomainStats>>;

    /// Drop posts together with their metrics and sentiment.
    async fn reset_posts(&self) -> Result<()>;

    // --- Audit log ---

    async fn append_scrape_log(&self, entry: &ScrapeLogEntry) -> Result<()>;

    /// Successful (status 200) pages in capture order, for offline replay.
    async fn logged_pages(&self, limit: Option<usize>) -> Result<Vec<LoggedPage>>;

    // --- Sentiment ---

    /// Posts with non-empty text and no sentiment row.
    async fn posts_needing_sentiment(&self, selection: &Selection) -> Result<Vec<PendingText>>;

    async fn insert_sentiment(&self, rows: &[PostSentiment], mode: WriteMode) -> Result<()>;

    async fn get_sentiment(&self, id: &str) -> Result<Option<SentimentScores>>;

    async fn reset_sentiment(&self) -> Result<()>;

    // --- Named entities ---

    /// Posts with non-empty text and no done-marker.
    async fn posts_needing_entities(&self, selection: &Selection) -> Result<Vec<PendingText>>;

    /// Resolve or create the entity and entity-type rows for every span, link
    /// them to the post, and write the post's done-marker. All or nothing.
    /// Returns the number of post-entity links written.
    async fn record_entities(&self, post_id: &str, entities: &[ExtractedEntity]) -> Result<usize>;

    async fn post_entities(&self, post_id: &str) -> Result<Vec<PostEntity>>;

    async fn get_entity(&self, id: i64) -> Result<Option<EntityRecord>>;

    /// Entities with a non-empty name and no English name yet, newest first.
    async fn entities_needing_translation(&self, limit: Option<usize>)
        -> Result<Vec<PendingEntity>>;

    async fn set_entity_translations(&self, rows: &[(i64, String)]) -> Result<()>;

    // --- Translation ---

    /// Posts with non-empty text of at most `max_chars` characters and no
    /// translation row.
    async fn posts_needing_translation(
        &self,
        selection: &Selection,
        max_chars: usize,
    ) -> Result<Vec<PendingText>>;

    /// Write translations. Ids that already have one keep it.
    async fn insert_translations(&self, rows: &[PostTranslation]) -> Result<()>;

    async fn get_translation(&self, id: &str) -> Result<Option<String>>;
}
