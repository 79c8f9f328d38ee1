// Test mocks for the ingestion engine and enrichment pipeline.
//
// - MockFetcher (PageFetcher): URL -> scripted responses, records every call,
//   can inject transport failures
// - FixedSentiment (SentimentModel): constant scores, counts texts scored
// - FixedEntities (EntityRecognizer): text -> scripted spans
// - MockTranslator (Translator): "EN:" prefix, optionally failing
//
// Plus `wall_page` for building mobile-wall HTML that the real parser reads.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use wallfeed_common::{ExtractedEntity, SentimentScores};

use crate::engine::EXPECTED_CONTENT_TYPE;
use crate::enrichment::{EntityRecognizer, SentimentModel, Translator};
use crate::fetcher::{FetchError, FetchedPage, PageFetcher};

pub const TEST_BASE_URL: &str = "https://m.vk.com";

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Scripted fetcher. Each URL has a queue of responses; the last one repeats
/// once the queue is down to it. Unregistered URLs answer 404, so a test that
/// wanders off script fails loudly instead of retrying forever.
pub struct MockFetcher {
    responses: Mutex<HashMap<String, VecDeque<FetchedPage>>>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a 200 HTML response for `url`.
    pub fn on_html(self, url: &str, html: impl Into<String>) -> Self {
        self.on_response(url, html_page(html))
    }

    pub fn on_response(self, url: &str, page: FetchedPage) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(page);
        self
    }

    /// The next `times` fetches of `url` fail at the transport level.
    pub fn fail_transport(self, url: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(url.to_string(), times);
        self
    }

    /// Every URL fetched, in order, including failed attempts.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Transport(format!("MockFetcher: connection reset for {url}")));
            }
        }

        let mut responses = self.responses.lock().unwrap();
        let page = match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(page.unwrap_or_else(|| FetchedPage {
            status: 404,
            content_type: Some(EXPECTED_CONTENT_TYPE.to_string()),
            body: format!("MockFetcher: no response registered for {url}"),
        }))
    }
}

/// A 200 response with the expected content type.
pub fn html_page(html: impl Into<String>) -> FetchedPage {
    FetchedPage {
        status: 200,
        content_type: Some(EXPECTED_CONTENT_TYPE.to_string()),
        body: html.into(),
    }
}

// ---------------------------------------------------------------------------
// FixedSentiment
// ---------------------------------------------------------------------------

/// Returns the same scores for every text.
pub struct FixedSentiment {
    scores: SentimentScores,
    scored: Mutex<usize>,
    batches: Mutex<Vec<usize>>,
}

impl FixedSentiment {
    pub fn new(scores: SentimentScores) -> Self {
        Self {
            scores,
            scored: Mutex::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn negative() -> Self {
        Self::new(SentimentScores {
            negative: 0.8,
            neutral: 0.2,
            ..SentimentScores::default()
        })
    }

    /// Total number of texts scored.
    pub fn scored(&self) -> usize {
        *self.scored.lock().unwrap()
    }

    /// Size of every batch received, in call order.
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl SentimentModel for FixedSentiment {
    async fn predict(&self, texts: &[String]) -> Result<Vec<SentimentScores>> {
        *self.scored.lock().unwrap() += texts.len();
        self.batches.lock().unwrap().push(texts.len());
        Ok(vec![self.scores; texts.len()])
    }
}

// ---------------------------------------------------------------------------
// FixedEntities
// ---------------------------------------------------------------------------

/// Returns scripted spans for known texts and none for anything else.
pub struct FixedEntities {
    spans: HashMap<String, Vec<ExtractedEntity>>,
    calls: Mutex<Vec<String>>,
}

impl FixedEntities {
    pub fn new() -> Self {
        Self {
            spans: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on_text(mut self, text: &str, spans: Vec<ExtractedEntity>) -> Self {
        self.spans.insert(text.to_string(), spans);
        self
    }

    /// Texts passed to the recognizer, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FixedEntities {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityRecognizer for FixedEntities {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        self.calls.lock().unwrap().push(text.to_string());
        Ok(self.spans.get(text).cloned().unwrap_or_default())
    }
}

/// Shorthand for a recognized span.
pub fn span(text: &str, normal: &str, entity_type: &str, start: i32) -> ExtractedEntity {
    ExtractedEntity {
        text: text.to_string(),
        normal: normal.to_string(),
        entity_type: entity_type.to_string(),
        start,
        stop: start + text.chars().count() as i32,
    }
}

// ---------------------------------------------------------------------------
// MockTranslator
// ---------------------------------------------------------------------------

/// Prefixes each text with "EN:". Can be told to fail from the n-th call on.
pub struct MockTranslator {
    fail_from_call: Option<usize>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl MockTranslator {
    pub fn new() -> Self {
        Self {
            fail_from_call: None,
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails, like an exhausted quota.
    pub fn failing() -> Self {
        Self::failing_from(0)
    }

    /// Calls before `call` (zero-based) succeed; the rest fail.
    pub fn failing_from(call: usize) -> Self {
        Self {
            fail_from_call: Some(call),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Every batch received, including failed ones.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl Default for MockTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<String>> {
        let call = {
            let mut batches = self.batches.lock().unwrap();
            batches.push(texts.to_vec());
            batches.len() - 1
        };
        if source_lang != "RU" || target_lang != "EN-US" {
            bail!("MockTranslator: unexpected language pair {source_lang}->{target_lang}");
        }
        if matches!(self.fail_from_call, Some(n) if call >= n) {
            bail!("MockTranslator: quota exceeded");
        }
        Ok(texts.iter().map(|t| format!("EN:{t}")).collect())
    }
}

// ---------------------------------------------------------------------------
// Wall page HTML
// ---------------------------------------------------------------------------

/// One post as rendered on a test wall page.
#[derive(Debug, Clone)]
pub struct WallPost {
    pub id: String,
    pub date: String,
    pub text: String,
    pub likes: i64,
    pub shares: i64,
    pub views: Option<i64>,
}

impl WallPost {
    pub fn new(id: &str, date: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            date: date.to_string(),
            text: text.to_string(),
            likes: 1,
            shares: 0,
            views: Some(10),
        }
    }

    pub fn likes(mut self, likes: i64) -> Self {
        self.likes = likes;
        self
    }
}

/// Render a mobile wall page with `posts` in order and an optional
/// "show more" link (a path relative to the base URL).
pub fn wall_page(posts: &[WallPost], next: Option<&str>) -> String {
    let mut html = String::from("<html><body><div class=\"wall_posts\">\n");
    for post in posts {
        let views = match post.views {
            Some(v) => format!("<span class=\" wall_item_views\" aria-label=\"{v} views\"></span>"),
            None => String::new(),
        };
        let text = if post.text.is_empty() {
            String::new()
        } else {
            format!(
                "<div class=\"pi_text\">{}<span class=\"pi_text_more\">Show more</span></div>",
                post.text
            )
        };
        html.push_str(&format!(
            "<div class=\"wall_item\">\
             <a class=\"post__anchor\" name=\"post{id}\"></a>\
             <a class=\"wi_date\">{date}</a>{text}\
             <div class=\"_wi_buttons\">\
             <div class=\"PostBottomButtonReaction\"><a class=\"PostBottomButton\"></a>\
             <span class=\"visually-hidden\">{likes} people reacted</span></div>\
             <div><a class=\"PostBottomButton\" aria-label=\"{shares} Share\"></a></div>\
             {views}</div></div>\n",
            id = post.id,
            date = post.date,
            likes = post.likes,
            shares = post.shares,
        ));
    }
    html.push_str("</div>\n");
    if let Some(href) = next {
        html.push_str(&format!(
            "<div class=\"show_more_wrap\"><a href=\"{href}\">Show more</a></div>\n"
        ));
    }
    html.push_str("</body></html>");
    html
}
