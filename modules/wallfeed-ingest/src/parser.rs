use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use wallfeed_common::is_valid_post_id;

use crate::error::{IngestError, Result};

/// One post as found on a wall page, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePost {
    pub id: String,
    pub raw_date: String,
    pub raw_text: String,
    pub likes: i64,
    pub shares: i64,
    pub views: i64,
}

/// Parsed wall page. `records` keep document order (newest first);
/// `continuation_url` is `None` when the page offers no further page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub records: Vec<CandidatePost>,
    pub continuation_url: Option<String>,
}

/// Raw HTML to candidate records. Pure; no I/O.
pub trait PageParser: Send + Sync {
    fn parse(&self, html: &str) -> Result<ParsedPage>;
}

// ---------------------------------------------------------------------------
// Mobile wall markup
// ---------------------------------------------------------------------------

static WALL_ITEM: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.wall_item").unwrap());
static POST_ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.post__anchor").unwrap());
static DATE_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.wi_date").unwrap());
static POST_TEXT: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".pi_text").unwrap());
static BOTTOM_BUTTON: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.PostBottomButton").unwrap());
static VISUALLY_HIDDEN: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span.visually-hidden").unwrap());
static VIEWS: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".wall_item_views").unwrap());
static SHOW_MORE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.show_more_wrap a[href]").unwrap());

static RE_REACTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+) (?:person|people) reacted$").unwrap());
static RE_SHARES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+) Shares?$").unwrap());
static RE_VIEWS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+) views?$").unwrap());

const SHOW_MORE_CLASS: &str = "pi_text_more";

/// Parser for the mobile community wall (`m.vk.com/<domain>`).
pub struct VkWallParser {
    base_url: String,
}

impl VkWallParser {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            format!("{}/{}", self.base_url, href)
        }
    }

    fn parse_item(&self, item: ElementRef<'_>) -> Result<CandidatePost> {
        let id = item
            .select(&POST_ANCHOR)
            .next()
            .and_then(|a| a.value().attr("name"))
            .map(|name| name.replacen("post", "", 1))
            .ok_or_else(|| IngestError::Parse("wall item without post anchor".into()))?;
        if !is_valid_post_id(&id) {
            return Err(IngestError::Parse(format!("malformed post id {id:?}")));
        }

        let raw_date = item
            .select(&DATE_LINK)
            .next()
            .map(|a| a.text().collect::<String>())
            .ok_or_else(|| IngestError::Parse(format!("post {id} has no date")))?;

        let raw_text = match item.select(&POST_TEXT).next() {
            Some(el) => {
                let mut parts = Vec::new();
                collect_text(el, &mut parts);
                parts.join(" ")
            }
            None => String::new(),
        };

        let buttons: Vec<ElementRef<'_>> = item.select(&BOTTOM_BUTTON).collect();
        if buttons.len() < 2 {
            return Err(IngestError::Parse(format!("post {id} is missing reaction buttons")));
        }

        let likes_label = buttons[0]
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|parent| parent.select(&VISUALLY_HIDDEN).last())
            .map(|span| span.text().collect::<String>())
            .ok_or_else(|| IngestError::Parse(format!("post {id} has no reaction count")))?;
        let likes = count(&RE_REACTED, &likes_label, &id)?;

        let shares_label = buttons[1]
            .value()
            .attr("aria-label")
            .ok_or_else(|| IngestError::Parse(format!("post {id} has no share count")))?;
        let shares = count(&RE_SHARES, shares_label, &id)?;

        let views = match item
            .select(&VIEWS)
            .next()
            .and_then(|el| el.value().attr("aria-label"))
        {
            Some(label) => count(&RE_VIEWS, label, &id)?,
            None => 0,
        };

        Ok(CandidatePost {
            id,
            raw_date: raw_date.trim().to_string(),
            raw_text,
            likes,
            shares,
            views,
        })
    }
}

impl PageParser for VkWallParser {
    fn parse(&self, html: &str) -> Result<ParsedPage> {
        let document = Html::parse_document(html);

        let records = document
            .select(&WALL_ITEM)
            .map(|item| self.parse_item(item))
            .collect::<Result<Vec<_>>>()?;

        let continuation_url = document
            .select(&SHOW_MORE)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| self.resolve(href));

        Ok(ParsedPage {
            records,
            continuation_url,
        })
    }
}

/// Text nodes under `el` in document order, skipping the "show more" control.
fn collect_text(el: ElementRef<'_>, out: &mut Vec<String>) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push(text.to_string());
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if child_el.value().classes().any(|c| c == SHOW_MORE_CLASS) {
                continue;
            }
            collect_text(child_el, out);
        }
    }
}

fn count(re: &Regex, label: &str, post_id: &str) -> Result<i64> {
    let label = label.trim();
    re.captures(label)
        .and_then(|caps| caps[1].parse().ok())
        .ok_or_else(|| IngestError::Parse(format!("post {post_id}: unreadable counter {label:?}")))
}
