use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WallfeedError;

// =============================================================================
// Identifiers
// =============================================================================

static RE_DOMAIN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap());
static RE_POST_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-\d+_\d+$").unwrap());

/// Validate a community domain (the path segment of a wall URL).
pub fn validate_domain(domain: &str) -> Result<&str, WallfeedError> {
    if RE_DOMAIN.is_match(domain) {
        Ok(domain)
    } else {
        Err(WallfeedError::InvalidDomain(domain.to_string()))
    }
}

/// Post ids look like `-<group>_<sequence>`.
pub fn is_valid_post_id(id: &str) -> bool {
    RE_POST_ID.is_match(id)
}

// =============================================================================
// Persisted records
// =============================================================================

/// A wall post. `id` never changes once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub domain: String,
    pub date_utc: DateTime<Utc>,
    pub text: String,
}

/// Engagement counters captured at `timestamp`. Overwritten on every sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetrics {
    pub id: String,
    pub likes: i64,
    pub shares: i64,
    pub views: i64,
    pub timestamp: DateTime<Utc>,
}

/// Output of the sentiment model for one text.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SentimentScores {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
    pub skip: f64,
    pub speech: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostSentiment {
    pub id: String,
    pub scores: SentimentScores,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTranslation {
    pub id: String,
    pub text_en: String,
}

/// One span returned by the named-entity recognizer. Offsets are character
/// offsets into the post text, `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub text: String,
    pub normal: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub start: i32,
    pub stop: i32,
}

/// A row of the deduplicated entity lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    pub name_en: Option<String>,
}

/// Association of a post with an entity at a character span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEntity {
    pub post_id: String,
    pub entity_id: i64,
    pub begin_offset: i32,
    pub end_offset: i32,
}

/// Append-only audit record of one HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeLogEntry {
    pub run_id: Uuid,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub status_code: i32,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStats {
    pub domain: String,
    pub nr_posts: i64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

// =============================================================================
// Store interaction vocabulary
// =============================================================================

/// How a post insert treats an existing row with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep the stored row; report the attempt as a duplicate.
    InsertOnly,
    /// Overwrite the stored row.
    Replace,
}

impl WriteMode {
    pub fn from_force(force: bool) -> Self {
        if force {
            Self::Replace
        } else {
            Self::InsertOnly
        }
    }
}

/// Result of an insert-or-reject write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    RejectedDuplicate,
}

impl InsertOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// One parsed record of a page: the post and the metrics seen with it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub post: Post,
    pub metrics: PostMetrics,
}

/// Which rows an enrichment stage should consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Unprocessed rows anywhere in the store, newest first.
    Backlog { limit: Option<usize> },
    /// Only these posts (still subject to the stage's own eligibility rules).
    Posts(Vec<String>),
}

impl Selection {
    pub fn backlog(limit: Option<usize>) -> Self {
        Self::Backlog { limit }
    }
}

/// A post selected for text processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingText {
    pub id: String,
    pub text: String,
}

/// An entity selected for name translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntity {
    pub id: i64,
    pub name: String,
}

/// A stored audit-log page eligible for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedPage {
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub html: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_validation_accepts_lowercase_slugs() {
        assert!(validate_domain("life").is_ok());
        assert!(validate_domain("rt_russian").is_ok());
        assert!(validate_domain("club24199209").is_ok());
    }

    #[test]
    fn domain_validation_rejects_urls_and_uppercase() {
        assert!(validate_domain("Life").is_err());
        assert!(validate_domain("m.vk.com/life").is_err());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("life?offset=5").is_err());
    }

    #[test]
    fn post_id_shape() {
        assert!(is_valid_post_id("-24199209_18932515"));
        assert!(!is_valid_post_id("24199209_18932515"));
        assert!(!is_valid_post_id("post-24199209_18932515"));
        assert!(!is_valid_post_id("-24199209"));
    }

    #[test]
    fn write_mode_follows_force_flag() {
        assert_eq!(WriteMode::from_force(true), WriteMode::Replace);
        assert_eq!(WriteMode::from_force(false), WriteMode::InsertOnly);
    }
}
