//! Ingestion scenarios against scripted wall pages and the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use wallfeed_common::{Post, PostSentiment, SentimentScores, WriteMode};
use wallfeed_ingest::enrichment::SentimentModel;
use wallfeed_ingest::testing::{
    html_page, wall_page, FixedSentiment, MockFetcher, WallPost, TEST_BASE_URL,
};
use wallfeed_ingest::{
    EnrichmentPipeline, FetchError, FetchedPage, IngestError, IngestRequest, Ingestor, ModelHandle,
    PageFetcher, StopReason, VkWallParser,
};
use wallfeed_store::{MemoryStore, RecordStore};

const LIFE: &str = "https://m.vk.com/life";
const LIFE_PAGE_2: &str = "https://m.vk.com/life?offset=5";

struct Harness {
    store: Arc<MemoryStore>,
    fetcher: Arc<MockFetcher>,
    ingestor: Ingestor,
}

fn harness(fetcher: MockFetcher) -> Harness {
    harness_with_sentiment(fetcher, None)
}

fn harness_with_sentiment(fetcher: MockFetcher, sentiment: Option<Arc<FixedSentiment>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(fetcher);
    let enrichment = EnrichmentPipeline::builder()
        .store(store.clone() as Arc<dyn RecordStore>)
        .sentiment(ModelHandle::from_option(
            sentiment.map(|s| s as Arc<dyn SentimentModel>),
        ))
        .cooldown(Duration::ZERO)
        .build();
    let ingestor = Ingestor::builder()
        .store(store.clone() as Arc<dyn RecordStore>)
        .fetcher(fetcher.clone())
        .parser(Arc::new(VkWallParser::new(TEST_BASE_URL)))
        .enrichment(Arc::new(enrichment))
        .base_url(TEST_BASE_URL)
        .page_delay(Duration::ZERO)
        .error_delay(Duration::ZERO)
        .build();
    Harness {
        store,
        fetcher,
        ingestor,
    }
}

fn p3() -> WallPost {
    WallPost::new("-24199209_3", "3 Sep 2022 at 3:40 pm", "Третий пост")
}
fn p2() -> WallPost {
    WallPost::new("-24199209_2", "3 Sep 2022 at 3:30 pm", "Второй пост")
}
fn p1() -> WallPost {
    WallPost::new("-24199209_1", "3 Sep 2022 at 3:20 pm", "Первый пост")
}

fn stored_post(id: &str, text: &str) -> Post {
    Post {
        id: id.to_string(),
        domain: "life".to_string(),
        date_utc: Utc.with_ymd_and_hms(2022, 9, 3, 12, 20, 0).unwrap(),
        text: text.to_string(),
    }
}

fn request(max_pages: u32) -> IngestRequest {
    IngestRequest::builder().domain("life").max_pages(max_pages).build()
}

#[tokio::test]
async fn new_page_without_link_stops_with_pagination_anomaly() {
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[p3(), p2(), p1()], None));
    let h = harness(fetcher);

    let summary = h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(summary.posts_added, 3);
    assert!(summary.last_page_had_insertion);
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(summary.stop, StopReason::PaginationLinkMissing);
    assert_eq!(h.fetcher.calls(), vec![LIFE]);
    assert_eq!(
        summary.earliest_date_seen,
        Some(Utc.with_ymd_and_hms(2022, 9, 3, 12, 20, 0).unwrap())
    );
}

#[tokio::test]
async fn new_page_with_link_follows_it() {
    let older = WallPost::new("-24199209_0", "2 Sep 2022 at 9:00 am", "Старый пост");
    let fetcher = MockFetcher::new()
        .on_html(LIFE, wall_page(&[p3(), p2(), p1()], Some("/life?offset=5")))
        .on_html(LIFE_PAGE_2, wall_page(&[older], None));
    let h = harness(fetcher);

    let summary = h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(h.fetcher.calls(), vec![LIFE, LIFE_PAGE_2]);
    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.posts_added, 4);
    assert_eq!(summary.stop, StopReason::PaginationLinkMissing);
}

#[tokio::test]
async fn page_budget_stops_before_following_link() {
    let fetcher = MockFetcher::new()
        .on_html(LIFE, wall_page(&[p3(), p2(), p1()], Some("/life?offset=5")));
    let h = harness(fetcher);

    let summary = h.ingestor.ingest_one(&request(1)).await.unwrap();

    assert_eq!(summary.stop, StopReason::PageLimit);
    assert_eq!(h.fetcher.calls(), vec![LIFE]);
}

#[tokio::test]
async fn known_history_stops_even_with_link_and_budget() {
    let fetcher = MockFetcher::new()
        .on_html(LIFE, wall_page(&[p3(), p2(), p1()], Some("/life?offset=5")));
    let h = harness(fetcher);
    h.store
        .insert_post(&stored_post("-24199209_1", "Первый пост"), WriteMode::InsertOnly)
        .await
        .unwrap();

    let summary = h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(summary.posts_added, 2);
    assert!(!summary.last_page_had_insertion);
    assert_eq!(summary.stop, StopReason::KnownHistory);
    assert_eq!(h.fetcher.calls(), vec![LIFE]);
    assert_eq!(h.store.posts().len(), 3);
}

#[tokio::test]
async fn repeated_runs_are_idempotent() {
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[p3(), p2(), p1()], None));
    let h = harness(fetcher);

    h.ingestor.ingest_one(&request(5)).await.unwrap();
    let after_first = h.store.posts();

    let second = h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(second.posts_added, 0);
    assert_eq!(second.stop, StopReason::NothingNew);
    assert_eq!(h.store.posts(), after_first);
}

#[tokio::test]
async fn force_mode_overwrites_text_and_keeps_going() {
    let edited = WallPost::new("-24199209_1", "3 Sep 2022 at 3:20 pm", "Исправленный текст");
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[edited], Some("/life?offset=5")));
    let h = harness(fetcher);
    h.store
        .insert_post(&stored_post("-24199209_1", "Старый текст"), WriteMode::InsertOnly)
        .await
        .unwrap();

    let req = IngestRequest::builder()
        .domain("life")
        .max_pages(1)
        .force(true)
        .build();
    let summary = h.ingestor.ingest_one(&req).await.unwrap();

    let post = h.store.get_post("-24199209_1").await.unwrap().unwrap();
    assert_eq!(post.text, "Исправленный текст");
    assert_eq!(summary.posts_added, 1);
    assert_eq!(summary.stop, StopReason::PageLimit);
}

#[tokio::test]
async fn metrics_refresh_on_every_sighting_without_force() {
    let fetcher = MockFetcher::new()
        .on_html(LIFE, wall_page(&[p1().likes(5)], None))
        .on_html(LIFE, wall_page(&[p1().likes(42)], None));
    let h = harness(fetcher);

    h.ingestor.ingest_one(&request(5)).await.unwrap();
    let second = h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(second.posts_added, 0);
    let metrics = h.store.get_metrics("-24199209_1").await.unwrap().unwrap();
    assert_eq!(metrics.likes, 42);
    assert_eq!(metrics.views, 10);
}

#[tokio::test]
async fn until_horizon_stops_the_crawl() {
    let fetcher = MockFetcher::new()
        .on_html(LIFE, wall_page(&[p3(), p2(), p1()], Some("/life?offset=5")));
    let h = harness(fetcher);

    let req = IngestRequest::builder()
        .domain("life")
        .until(Utc.with_ymd_and_hms(2022, 9, 3, 12, 25, 0).unwrap())
        .build();
    let summary = h.ingestor.ingest_one(&req).await.unwrap();

    assert_eq!(summary.stop, StopReason::ReachedUntil);
    assert_eq!(h.fetcher.calls().len(), 1);
}

#[tokio::test]
async fn transport_errors_are_retried_and_not_logged() {
    let fetcher = MockFetcher::new()
        .fail_transport(LIFE, 2)
        .on_html(LIFE, wall_page(&[p1()], None));
    let h = harness(fetcher);

    let summary = h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(h.fetcher.calls().len(), 3);
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(h.store.scrape_log().len(), 1);
}

#[tokio::test]
async fn unexpected_status_is_fatal_and_logged() {
    let fetcher = MockFetcher::new().on_response(
        LIFE,
        FetchedPage {
            status: 503,
            content_type: Some("text/html; charset=utf-8".into()),
            body: "  maintenance  ".into(),
        },
    );
    let h = harness(fetcher);

    let err = h.ingestor.ingest_one(&request(5)).await.unwrap_err();

    assert!(matches!(err, IngestError::UnexpectedStatus { status: 503, .. }));
    let log = h.store.scrape_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status_code, 503);
    assert_eq!(log[0].html, "maintenance");
    assert!(h.store.posts().is_empty());
}

#[tokio::test]
async fn unexpected_content_type_is_fatal() {
    let fetcher = MockFetcher::new().on_response(
        LIFE,
        FetchedPage {
            content_type: Some("application/json".into()),
            ..html_page(wall_page(&[p1()], None))
        },
    );
    let h = harness(fetcher);

    let err = h.ingestor.ingest_one(&request(5)).await.unwrap_err();

    assert!(matches!(err, IngestError::UnexpectedContentType { .. }));
    assert!(h.store.posts().is_empty());
}

#[tokio::test]
async fn unreadable_date_aborts_before_any_write() {
    let bad = WallPost::new("-24199209_9", "sometime last week", "текст");
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[p3(), bad], None));
    let h = harness(fetcher);

    let err = h.ingestor.ingest_one(&request(5)).await.unwrap_err();

    assert!(matches!(err, IngestError::Parse(_)));
    assert!(h.store.posts().is_empty());
}

#[tokio::test]
async fn invalid_domain_is_rejected_before_fetching() {
    let h = harness(MockFetcher::new());

    let req = IngestRequest::builder().domain("m.vk.com/life").build();
    let err = h.ingestor.ingest_one(&req).await.unwrap_err();

    assert!(matches!(err, IngestError::Source(_)));
    assert!(h.fetcher.calls().is_empty());
}

#[tokio::test]
async fn sentiment_is_scored_inline_for_new_posts_only() {
    let fetcher = MockFetcher::new().on_html(
        LIFE,
        wall_page(&[p3(), WallPost::new("-24199209_2", "3 Sep 2022 at 3:30 pm", ""), p1()], None),
    );
    let sentiment = Arc::new(FixedSentiment::negative());
    let h = harness_with_sentiment(fetcher, Some(sentiment.clone()));
    h.store
        .insert_post(&stored_post("-24199209_1", "Первый пост"), WriteMode::InsertOnly)
        .await
        .unwrap();

    h.ingestor.ingest_one(&request(5)).await.unwrap();

    assert_eq!(sentiment.scored(), 1, "only the new post with text is scored");
    assert!(h.store.get_sentiment("-24199209_3").await.unwrap().is_some());
    assert!(h.store.get_sentiment("-24199209_2").await.unwrap().is_none());
    assert!(h.store.get_sentiment("-24199209_1").await.unwrap().is_none());
}

#[tokio::test]
async fn backfill_starts_at_stored_post_count() {
    let offset_url = "https://m.vk.com/life?offset=3&own=1";
    let fetcher = MockFetcher::new().on_html(
        offset_url,
        wall_page(&[WallPost::new("-24199209_0", "1 Sep 2022 at 8:00 am", "Давний пост")], None),
    );
    let h = harness(fetcher);
    for id in ["-24199209_1", "-24199209_2", "-24199209_3"] {
        h.store
            .insert_post(&stored_post(id, "текст"), WriteMode::InsertOnly)
            .await
            .unwrap();
    }

    let summary = h
        .ingestor
        .backfill("life", 5, false, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.fetcher.calls(), vec![offset_url]);
    assert_eq!(summary.posts_added, 1);
}

#[tokio::test]
async fn replay_rebuilds_posts_from_the_audit_log() {
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[p3(), p2(), p1()], None));
    let h = harness(fetcher);
    h.ingestor.ingest_one(&request(5)).await.unwrap();

    let replayed = h.ingestor.replay(None, true).await.unwrap();

    assert_eq!(replayed.pages_replayed, 1);
    assert_eq!(replayed.posts_written, 3);
    assert_eq!(h.store.posts().len(), 3);
    assert_eq!(h.fetcher.calls().len(), 1, "replay never touches the network");
}

async fn seed_scored(store: &MemoryStore, id: &str, text: &str) {
    store
        .insert_post(&stored_post(id, text), WriteMode::InsertOnly)
        .await
        .unwrap();
    let positive = SentimentScores {
        positive: 0.9,
        neutral: 0.1,
        ..SentimentScores::default()
    };
    store
        .insert_sentiment(
            &[PostSentiment {
                id: id.to_string(),
                scores: positive,
            }],
            WriteMode::InsertOnly,
        )
        .await
        .unwrap();
}

fn forced(max_pages: u32) -> IngestRequest {
    IngestRequest::builder()
        .domain("life")
        .max_pages(max_pages)
        .force(true)
        .build()
}

#[tokio::test]
async fn force_mode_rescores_rewritten_posts() {
    let edited = WallPost::new("-24199209_1", "3 Sep 2022 at 3:20 pm", "Исправленный текст");
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[edited], None));
    let sentiment = Arc::new(FixedSentiment::negative());
    let h = harness_with_sentiment(fetcher, Some(sentiment.clone()));
    seed_scored(&h.store, "-24199209_1", "Старый текст").await;

    h.ingestor.ingest_one(&forced(1)).await.unwrap();

    let scores = h.store.get_sentiment("-24199209_1").await.unwrap().unwrap();
    assert!((scores.negative - 0.8).abs() < f64::EPSILON);
    assert!(scores.positive.abs() < f64::EPSILON);
    assert_eq!(sentiment.batches(), vec![1]);
}

#[tokio::test]
async fn force_rewrite_to_empty_text_drops_the_old_score() {
    let emptied = WallPost::new("-24199209_1", "3 Sep 2022 at 3:20 pm", "");
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[emptied], None));
    let sentiment = Arc::new(FixedSentiment::negative());
    let h = harness_with_sentiment(fetcher, Some(sentiment.clone()));
    seed_scored(&h.store, "-24199209_1", "Старый текст").await;

    h.ingestor.ingest_one(&forced(1)).await.unwrap();

    let post = h.store.get_post("-24199209_1").await.unwrap().unwrap();
    assert_eq!(post.text, "");
    assert!(h.store.get_sentiment("-24199209_1").await.unwrap().is_none());
    assert_eq!(sentiment.scored(), 0);
}

#[tokio::test]
async fn force_rewrite_without_a_model_leaves_the_post_unscored() {
    let edited = WallPost::new("-24199209_1", "3 Sep 2022 at 3:20 pm", "Исправленный текст");
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[edited], None));
    let h = harness(fetcher);
    seed_scored(&h.store, "-24199209_1", "Старый текст").await;

    h.ingestor.ingest_one(&forced(1)).await.unwrap();

    assert!(h.store.get_sentiment("-24199209_1").await.unwrap().is_none());
    let pending = h
        .store
        .posts_needing_sentiment(&wallfeed_common::Selection::backlog(None))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1, "rewritten post is back in the sentiment backlog");
}

/// Cancels the token as soon as the first page has been fetched.
struct CancelAfterFirstFetch {
    inner: MockFetcher,
    cancel: CancellationToken,
}

#[async_trait]
impl PageFetcher for CancelAfterFirstFetch {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let page = self.inner.fetch(url).await;
        self.cancel.cancel();
        page
    }
}

#[tokio::test]
async fn cancellation_stops_between_pages() {
    let older = WallPost::new("-24199209_0", "2 Sep 2022 at 9:00 am", "Старый пост");
    let cancel = CancellationToken::new();
    let fetcher = Arc::new(CancelAfterFirstFetch {
        inner: MockFetcher::new()
            .on_html(LIFE, wall_page(&[p3(), p2(), p1()], Some("/life?offset=5")))
            .on_html(LIFE_PAGE_2, wall_page(&[older], None)),
        cancel: cancel.clone(),
    });
    let store = Arc::new(MemoryStore::new());
    let enrichment = EnrichmentPipeline::builder()
        .store(store.clone() as Arc<dyn RecordStore>)
        .cooldown(Duration::ZERO)
        .build();
    // a long page delay would hang the test unless the wait is cancellable
    let ingestor = Ingestor::builder()
        .store(store.clone() as Arc<dyn RecordStore>)
        .fetcher(fetcher.clone())
        .parser(Arc::new(VkWallParser::new(TEST_BASE_URL)))
        .enrichment(Arc::new(enrichment))
        .base_url(TEST_BASE_URL)
        .page_delay(Duration::from_secs(3600))
        .error_delay(Duration::ZERO)
        .build();

    let req = IngestRequest::builder()
        .domain("life")
        .max_pages(5)
        .cancel(cancel)
        .build();
    let summary = ingestor.ingest_one(&req).await.unwrap();

    assert_eq!(summary.stop, StopReason::Cancelled);
    assert_eq!(summary.pages_fetched, 1);
    assert_eq!(summary.posts_added, 3, "the page in flight is still written");
    assert_eq!(fetcher.inner.calls(), vec![LIFE]);
    assert_eq!(store.posts().len(), 3);
}

#[tokio::test]
async fn cancelled_request_fetches_nothing() {
    let fetcher = MockFetcher::new().on_html(LIFE, wall_page(&[p1()], None));
    let h = harness(fetcher);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let req = IngestRequest::builder().domain("life").cancel(cancel).build();
    let summary = h.ingestor.ingest_one(&req).await.unwrap();

    assert_eq!(summary.stop, StopReason::Cancelled);
    assert_eq!(summary.pages_fetched, 0);
    assert!(h.fetcher.calls().is_empty());
}
