//! Ingestion engine: per-source pagination, idempotent upserts and the
//! continuation policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use wallfeed_common::config::{DEFAULT_ERROR_DELAY_SECS, DEFAULT_PAGE_LIMIT, DEFAULT_SCRAPE_DELAY_SECS};
use wallfeed_common::{validate_domain, PageRecord, Post, PostMetrics, ScrapeLogEntry, WriteMode};
use wallfeed_store::RecordStore;

use crate::enrichment::EnrichmentPipeline;
use crate::error::{IngestError, Result};
use crate::fetcher::{FetchedPage, PageFetcher};
use crate::normalize::{normalize_text, parse_wall_date};
use crate::parser::PageParser;

pub const EXPECTED_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// One crawl of one source.
#[derive(Debug, Clone, TypedBuilder)]
pub struct IngestRequest {
    #[builder(setter(into))]
    pub domain: String,
    /// Number of newest posts to skip; 0 starts at the top of the wall.
    #[builder(default)]
    pub offset: u64,
    #[builder(default = DEFAULT_PAGE_LIMIT)]
    pub max_pages: u32,
    /// Overwrite existing posts and ignore the "already seen" stop rules.
    #[builder(default)]
    pub force: bool,
    /// Stop once a page reaches posts this old.
    #[builder(default, setter(strip_option))]
    pub until: Option<DateTime<Utc>>,
    #[builder(default = Uuid::new_v4())]
    pub run_id: Uuid,
    /// Checked before every fetch and while waiting between pages.
    #[builder(default)]
    pub cancel: CancellationToken,
}

/// Why a source crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NothingNew,
    KnownHistory,
    ReachedUntil,
    PageLimit,
    /// More pages were expected but the page had no continuation link.
    PaginationLinkMissing,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NothingNew => "nothing new",
            Self::KnownHistory => "reached known history",
            Self::ReachedUntil => "reached requested horizon",
            Self::PageLimit => "page limit reached",
            Self::PaginationLinkMissing => "pagination link missing",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What processing one page wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub posts_added: usize,
    /// Whether the last record in document order was written.
    pub last_post_added: bool,
    /// Oldest `date_utc` among the records written.
    pub earliest_date_seen: Option<DateTime<Utc>>,
    pub inserted_ids: Vec<String>,
    pub continuation_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub domain: String,
    pub pages_fetched: u32,
    pub posts_added: usize,
    pub last_page_had_insertion: bool,
    pub earliest_date_seen: Option<DateTime<Utc>>,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub pages_replayed: usize,
    pub posts_written: usize,
}

/// Next step after a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    Follow(String),
    Stop(StopReason),
}

/// Continuation policy. Rules are checked in order; the first match wins.
pub fn decide(outcome: &PageOutcome, pages_fetched: u32, request: &IngestRequest) -> Continuation {
    if !request.force {
        if outcome.posts_added == 0 {
            return Continuation::Stop(StopReason::NothingNew);
        }
        if !outcome.last_post_added {
            return Continuation::Stop(StopReason::KnownHistory);
        }
    }
    if let (Some(until), Some(earliest)) = (request.until, outcome.earliest_date_seen) {
        if earliest <= until {
            return Continuation::Stop(StopReason::ReachedUntil);
        }
    }
    if pages_fetched >= request.max_pages {
        return Continuation::Stop(StopReason::PageLimit);
    }
    match &outcome.continuation_url {
        Some(url) => Continuation::Follow(url.clone()),
        None => Continuation::Stop(StopReason::PaginationLinkMissing),
    }
}

/// First page of a wall, optionally skipping the newest `offset` posts.
pub fn initial_url(base_url: &str, domain: &str, offset: u64) -> String {
    let base = base_url.trim_end_matches('/');
    if offset == 0 {
        format!("{base}/{domain}")
    } else {
        format!("{base}/{domain}?offset={offset}&own=1")
    }
}

#[derive(TypedBuilder)]
pub struct Ingestor {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn PageParser>,
    enrichment: Arc<EnrichmentPipeline>,
    #[builder(setter(into))]
    base_url: String,
    /// Pause between consecutive pages of one source.
    #[builder(default = Duration::from_secs(DEFAULT_SCRAPE_DELAY_SECS))]
    page_delay: Duration,
    /// Pause before retrying after a transport error.
    #[builder(default = Duration::from_secs(DEFAULT_ERROR_DELAY_SECS))]
    error_delay: Duration,
}

impl Ingestor {
    /// Crawl one source until the continuation policy says stop.
    pub async fn ingest_one(&self, request: &IngestRequest) -> Result<IngestSummary> {
        let domain = validate_domain(&request.domain)?;
        let mut url = initial_url(&self.base_url, domain, request.offset);
        let mut summary = IngestSummary {
            domain: domain.to_string(),
            pages_fetched: 0,
            posts_added: 0,
            last_page_had_insertion: false,
            earliest_date_seen: None,
            stop: StopReason::PageLimit,
        };

        loop {
            if request.cancel.is_cancelled() {
                info!(domain, pages = summary.pages_fetched, "Cancelled, stopping source");
                summary.stop = StopReason::Cancelled;
                return Ok(summary);
            }

            let captured_at = Utc::now().trunc_subsecs(0);
            info!(domain, url = %url, "Scraping page");
            let Some(page) = self.fetch_with_retry(&url, &request.cancel).await else {
                info!(domain, url = %url, "Cancelled during transport retry");
                summary.stop = StopReason::Cancelled;
                return Ok(summary);
            };

            self.store
                .append_scrape_log(&ScrapeLogEntry {
                    run_id: request.run_id,
                    domain: domain.to_string(),
                    timestamp: captured_at,
                    url: url.clone(),
                    status_code: i32::from(page.status),
                    html: page.body.trim().to_string(),
                })
                .await?;
            check_shape(&url, &page)?;
            summary.pages_fetched += 1;

            let outcome = self
                .process_page(domain, &page.body, request.force, captured_at)
                .await?;

            info!(
                domain,
                page = summary.pages_fetched,
                max_pages = request.max_pages,
                posts_added = outcome.posts_added,
                last_post_added = outcome.last_post_added,
                earliest = ?outcome.earliest_date_seen,
                "Page processed"
            );

            summary.posts_added += outcome.posts_added;
            summary.last_page_had_insertion = outcome.last_post_added;
            summary.earliest_date_seen = match (summary.earliest_date_seen, outcome.earliest_date_seen) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            self.enrichment.after_page(&outcome.inserted_ids).await;

            match decide(&outcome, summary.pages_fetched, request) {
                Continuation::Follow(next) => {
                    debug!(domain, next = %next, "Following continuation link");
                    if !self.page_delay.is_zero() {
                        tokio::select! {
                            _ = request.cancel.cancelled() => {}
                            _ = tokio::time::sleep(self.page_delay) => {}
                        }
                    }
                    url = next;
                }
                Continuation::Stop(reason) => {
                    if reason == StopReason::PaginationLinkMissing {
                        warn!(domain, url = %url, "Continuation link not found, stopping source");
                    } else {
                        info!(domain, reason = %reason, "Done with source");
                    }
                    summary.stop = reason;
                    return Ok(summary);
                }
            }
        }
    }

    /// Continue a source from the number of posts already stored for it.
    pub async fn backfill(
        &self,
        domain: &str,
        max_pages: u32,
        force: bool,
        until: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary> {
        let domain = validate_domain(domain)?;
        let stored = self.store.count_posts(domain).await?;
        let offset = u64::try_from(stored).unwrap_or(0);
        info!(domain, offset, "Backfilling");

        let request = IngestRequest {
            domain: domain.to_string(),
            offset,
            max_pages,
            force,
            until,
            run_id: Uuid::new_v4(),
            cancel: cancel.clone(),
        };
        self.ingest_one(&request).await
    }

    /// Reprocess stored 200 responses from the audit log in capture order,
    /// in force mode and without network access.
    pub async fn replay(&self, limit: Option<usize>, reset: bool) -> Result<ReplaySummary> {
        if reset {
            self.store.reset_posts().await?;
            info!("Posts, metrics and sentiment cleared before replay");
        }

        let pages = self.store.logged_pages(limit).await?;
        info!(pages = pages.len(), "Replaying logged pages");

        let mut summary = ReplaySummary::default();
        for page in &pages {
            let outcome = self
                .process_page(&page.domain, &page.html, true, page.timestamp)
                .await?;
            debug!(domain = %page.domain, timestamp = %page.timestamp, posts = outcome.posts_added, "Replayed page");
            summary.pages_replayed += 1;
            summary.posts_written += outcome.posts_added;
        }

        info!(
            pages = summary.pages_replayed,
            posts = summary.posts_written,
            "Replay done"
        );
        Ok(summary)
    }

    /// Parse a page and write its records in one store transaction. Every
    /// record is normalized before anything is written, so a malformed page
    /// writes nothing. New and rewritten posts are then scored for sentiment.
    pub async fn process_page(
        &self,
        domain: &str,
        html: &str,
        force: bool,
        captured_at: DateTime<Utc>,
    ) -> Result<PageOutcome> {
        let captured_at = captured_at.trunc_subsecs(0);
        let parsed = self.parser.parse(html)?;
        let mode = WriteMode::from_force(force);

        let mut records = Vec::with_capacity(parsed.records.len());
        for candidate in parsed.records {
            let post = Post {
                date_utc: parse_wall_date(&candidate.raw_date, captured_at)?,
                text: normalize_text(&candidate.raw_text),
                id: candidate.id.clone(),
                domain: domain.to_string(),
            };
            let metrics = PostMetrics {
                id: candidate.id,
                likes: candidate.likes,
                shares: candidate.shares,
                views: candidate.views,
                timestamp: captured_at,
            };
            records.push(PageRecord { post, metrics });
        }

        let mut outcome = PageOutcome {
            continuation_url: parsed.continuation_url,
            ..PageOutcome::default()
        };

        let outcomes = self.store.write_page(&records, mode).await?;
        let mut written = Vec::new();
        for (record, result) in records.into_iter().zip(outcomes) {
            let post = record.post;
            if result.is_inserted() {
                info!(domain, post_id = %post.id, date = %post.date_utc, "Post added");
                outcome.posts_added += 1;
                outcome.last_post_added = true;
                outcome.earliest_date_seen = Some(match outcome.earliest_date_seen {
                    Some(earliest) => earliest.min(post.date_utc),
                    None => post.date_utc,
                });
                outcome.inserted_ids.push(post.id.clone());
                written.push(post);
            } else {
                debug!(domain, post_id = %post.id, "Post already exists, skipping");
                outcome.last_post_added = false;
            }
        }

        self.enrichment.score_inline(&written).await;
        Ok(outcome)
    }

    /// Retry transport errors until a response arrives. `None` once
    /// cancelled.
    async fn fetch_with_retry(&self, url: &str, cancel: &CancellationToken) -> Option<FetchedPage> {
        loop {
            match self.fetcher.fetch(url).await {
                Ok(page) => return Some(page),
                Err(e) => {
                    warn!(
                        url,
                        error = %e,
                        retry_in_secs = self.error_delay.as_secs(),
                        "Transport error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.error_delay) => {}
                    }
                }
            }
        }
    }
}

fn check_shape(url: &str, page: &FetchedPage) -> Result<()> {
    if page.status != 200 {
        error!(url, status = page.status, "Unexpected status, aborting run");
        return Err(IngestError::UnexpectedStatus {
            url: url.to_string(),
            status: page.status,
        });
    }
    let content_type = page.content_type.as_deref().unwrap_or("");
    if !content_type.trim().eq_ignore_ascii_case(EXPECTED_CONTENT_TYPE) {
        error!(url, content_type, "Unexpected content type, aborting run");
        return Err(IngestError::UnexpectedContentType {
            url: url.to_string(),
            content_type: content_type.to_string(),
        });
    }
    Ok(())
}
