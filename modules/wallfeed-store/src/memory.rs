// In-memory RecordStore for tests. Mirrors the Postgres semantics: insert-or-
// reject for posts (a replaced post loses its sentiment), overwrite for
// metrics, at-most-once translations, and deduplicated entity lookup tables.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use wallfeed_common::{
    DomainStats, EntityRecord, ExtractedEntity, InsertOutcome, LoggedPage, PageRecord,
    PendingEntity, PendingText, Post, PostEntity, PostMetrics, PostSentiment, PostTranslation, ScrapeLogEntry,
    Selection, SentimentScores, WriteMode,
};

use crate::error::Result;
use crate::traits::RecordStore;

#[derive(Default)]
struct State {
    posts: HashMap<String, Post>,
    metrics: HashMap<String, PostMetrics>,
    sentiment: HashMap<String, SentimentScores>,
    translations: HashMap<String, String>,
    entity_types: BTreeMap<String, i64>,
    entities: BTreeMap<i64, EntityRecord>,
    entity_keys: HashMap<(i64, String), i64>,
    post_entities: Vec<PostEntity>,
    entities_done: HashSet<String>,
    scrape_log: Vec<ScrapeLogEntry>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn write_post(&mut self, post: &Post, mode: WriteMode) -> InsertOutcome {
        if self.posts.contains_key(&post.id) {
            if mode == WriteMode::InsertOnly {
                return InsertOutcome::RejectedDuplicate;
            }
            self.sentiment.remove(&post.id);
        }
        self.posts.insert(post.id.clone(), post.clone());
        InsertOutcome::Inserted
    }

    /// Posts matching a selection, newest first, before stage-specific filters.
    fn selected_posts(&self, selection: &Selection) -> Vec<&Post> {
        let mut posts: Vec<&Post> = match selection {
            Selection::Backlog { .. } => self.posts.values().collect(),
            Selection::Posts(ids) => ids.iter().filter_map(|id| self.posts.get(id)).collect(),
        };
        posts.sort_by(|a, b| b.date_utc.cmp(&a.date_utc).then_with(|| a.id.cmp(&b.id)));
        posts.dedup_by(|a, b| a.id == b.id);
        posts
    }
}

fn take_pending<'a>(
    posts: impl Iterator<Item = &'a Post>,
    selection: &Selection,
) -> Vec<PendingText> {
    let limit = match selection {
        Selection::Backlog { limit } => limit.unwrap_or(usize::MAX),
        Selection::Posts(_) => usize::MAX,
    };
    posts
        .take(limit)
        .map(|p| PendingText {
            id: p.id.clone(),
            text: p.text.clone(),
        })
        .collect()
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every audit-log entry written so far, in insertion order.
    pub fn scrape_log(&self) -> Vec<ScrapeLogEntry> {
        self.state.lock().unwrap().scrape_log.clone()
    }

    /// All stored posts sorted by id.
    pub fn posts(&self) -> Vec<Post> {
        let state = self.state.lock().unwrap();
        let mut posts: Vec<Post> = state.posts.values().cloned().collect();
        posts.sort_by(|a, b| a.id.cmp(&b.id));
        posts
    }

    pub fn is_entities_done(&self, post_id: &str) -> bool {
        self.state.lock().unwrap().entities_done.contains(post_id)
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().unwrap().entities.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_post(&self, post: &Post, mode: WriteMode) -> Result<InsertOutcome> {
        Ok(self.state.lock().unwrap().write_post(post, mode))
    }

    async fn upsert_metrics(&self, metrics: &PostMetrics) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.metrics.insert(metrics.id.clone(), metrics.clone());
        Ok(())
    }

    async fn write_page(&self, records: &[PageRecord], mode: WriteMode) -> Result<Vec<InsertOutcome>> {
        let mut state = self.state.lock().unwrap();
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(state.write_post(&record.post, mode));
            state
                .metrics
                .insert(record.metrics.id.clone(), record.metrics.clone());
        }
        Ok(outcomes)
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        Ok(self.state.lock().unwrap().posts.get(id).cloned())
    }

    async fn get_metrics(&self, id: &str) -> Result<Option<PostMetrics>> {
        Ok(self.state.lock().unwrap().metrics.get(id).cloned())
    }

    async fn count_posts(&self, domain: &str) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state.posts.values().filter(|p| p.domain == domain).count() as i64)
    }

    async fn domain_stats(&self) -> Result<Vec<DomainStats>> {
        let state = self.state.lock().unwrap();
        let mut by_domain: BTreeMap<&str, DomainStats> = BTreeMap::new();
        for post in state.posts.values() {
            let stats = by_domain.entry(post.domain.as_str()).or_insert_with(|| DomainStats {
                domain: post.domain.clone(),
                nr_posts: 0,
                first: None,
                last: None,
            });
            stats.nr_posts += 1;
            stats.first = Some(stats.first.map_or(post.date_utc, |d| d.min(post.date_utc)));
            stats.last = Some(stats.last.map_or(post.date_utc, |d| d.max(post.date_utc)));
        }
        Ok(by_domain.into_values().collect())
    }

    async fn reset_posts(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.posts.clear();
        state.metrics.clear();
        state.sentiment.clear();
        Ok(())
    }

    async fn append_scrape_log(&self, entry: &ScrapeLogEntry) -> Result<()> {
        self.state.lock().unwrap().scrape_log.push(entry.clone());
        Ok(())
    }

    async fn logged_pages(&self, limit: Option<usize>) -> Result<Vec<LoggedPage>> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<&ScrapeLogEntry> = state
            .scrape_log
            .iter()
            .filter(|e| e.status_code == 200)
            .collect();
        // stable: equal timestamps keep insertion order
        entries.sort_by_key(|e| e.timestamp);

        Ok(entries
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|e| LoggedPage {
                domain: e.domain.clone(),
                timestamp: e.timestamp,
                html: e.html.clone(),
            })
            .collect())
    }

    async fn posts_needing_sentiment(&self, selection: &Selection) -> Result<Vec<PendingText>> {
        let state = self.state.lock().unwrap();
        let posts = state.selected_posts(selection);
        let pending = posts
            .into_iter()
            .filter(|p| !p.text.is_empty() && !state.sentiment.contains_key(&p.id));
        Ok(take_pending(pending, selection))
    }

    async fn insert_sentiment(&self, rows: &[PostSentiment], mode: WriteMode) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            if mode == WriteMode::InsertOnly && state.sentiment.contains_key(&row.id) {
                continue;
            }
            state.sentiment.insert(row.id.clone(), row.scores);
        }
        Ok(())
    }

    async fn get_sentiment(&self, id: &str) -> Result<Option<SentimentScores>> {
        Ok(self.state.lock().unwrap().sentiment.get(id).copied())
    }

    async fn reset_sentiment(&self) -> Result<()> {
        self.state.lock().unwrap().sentiment.clear();
        Ok(())
    }

    async fn posts_needing_entities(&self, selection: &Selection) -> Result<Vec<PendingText>> {
        let state = self.state.lock().unwrap();
        let posts = state.selected_posts(selection);
        let pending = posts
            .into_iter()
            .filter(|p| !p.text.is_empty() && !state.entities_done.contains(&p.id));
        Ok(take_pending(pending, selection))
    }

    async fn record_entities(&self, post_id: &str, entities: &[ExtractedEntity]) -> Result<usize> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        for entity in entities {
            let existing_type = state.entity_types.get(&entity.entity_type).copied();
            let type_id = match existing_type {
                Some(id) => id,
                None => {
                    let id = state.next_id();
                    state.entity_types.insert(entity.entity_type.clone(), id);
                    id
                }
            };

            let key = (type_id, entity.normal.clone());
            let existing_entity = state.entity_keys.get(&key).copied();
            let entity_id = match existing_entity {
                Some(id) => id,
                None => {
                    let id = state.next_id();
                    state.entity_keys.insert(key, id);
                    state.entities.insert(
                        id,
                        EntityRecord {
                            id,
                            name: entity.normal.clone(),
                            entity_type: entity.entity_type.clone(),
                            name_en: None,
                        },
                    );
                    id
                }
            };

            state.post_entities.push(PostEntity {
                post_id: post_id.to_string(),
                entity_id,
                begin_offset: entity.start,
                end_offset: entity.stop,
            });
        }

        state.entities_done.insert(post_id.to_string());
        Ok(entities.len())
    }

    async fn post_entities(&self, post_id: &str) -> Result<Vec<PostEntity>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<PostEntity> = state
            .post_entities
            .iter()
            .filter(|pe| pe.post_id == post_id)
            .cloned()
            .collect();
        rows.sort_by_key(|pe| pe.begin_offset);
        Ok(rows)
    }

    async fn get_entity(&self, id: i64) -> Result<Option<EntityRecord>> {
        Ok(self.state.lock().unwrap().entities.get(&id).cloned())
    }

    async fn entities_needing_translation(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<PendingEntity>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entities
            .values()
            .rev()
            .filter(|e| !e.name.is_empty() && e.name_en.as_deref().map_or(true, str::is_empty))
            .take(limit.unwrap_or(usize::MAX))
            .map(|e| PendingEntity {
                id: e.id,
                name: e.name.clone(),
            })
            .collect())
    }

    async fn set_entity_translations(&self, rows: &[(i64, String)]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (id, name_en) in rows {
            if let Some(entity) = state.entities.get_mut(id) {
                entity.name_en = Some(name_en.clone());
            }
        }
        Ok(())
    }

    async fn posts_needing_translation(
        &self,
        selection: &Selection,
        max_chars: usize,
    ) -> Result<Vec<PendingText>> {
        let state = self.state.lock().unwrap();
        let posts = state.selected_posts(selection);
        let pending = posts.into_iter().filter(|p| {
            !p.text.is_empty()
                && p.text.chars().count() <= max_chars
                && !state.translations.contains_key(&p.id)
        });
        Ok(take_pending(pending, selection))
    }

    async fn insert_translations(&self, rows: &[PostTranslation]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            state
                .translations
                .entry(row.id.clone())
                .or_insert_with(|| row.text_en.clone());
        }
        Ok(())
    }

    async fn get_translation(&self, id: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().translations.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn post(id: &str, minute: u32, text: &str) -> Post {
        Post {
            id: id.to_string(),
            domain: "life".to_string(),
            date_utc: Utc.with_ymd_and_hms(2022, 9, 3, 12, minute, 0).unwrap(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected_without_overwrite() {
        let store = MemoryStore::new();
        let original = post("-1_1", 0, "original");
        assert_eq!(
            store.insert_post(&original, WriteMode::InsertOnly).await.unwrap(),
            InsertOutcome::Inserted
        );

        let changed = post("-1_1", 0, "changed");
        assert_eq!(
            store.insert_post(&changed, WriteMode::InsertOnly).await.unwrap(),
            InsertOutcome::RejectedDuplicate
        );
        assert_eq!(store.get_post("-1_1").await.unwrap().unwrap().text, "original");
    }

    #[tokio::test]
    async fn replace_overwrites_existing_post() {
        let store = MemoryStore::new();
        store.insert_post(&post("-1_1", 0, "original"), WriteMode::InsertOnly).await.unwrap();
        assert_eq!(
            store.insert_post(&post("-1_1", 0, "changed"), WriteMode::Replace).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(store.get_post("-1_1").await.unwrap().unwrap().text, "changed");
    }

    #[tokio::test]
    async fn backlog_selection_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        store.insert_post(&post("-1_1", 1, "old"), WriteMode::InsertOnly).await.unwrap();
        store.insert_post(&post("-1_2", 2, "mid"), WriteMode::InsertOnly).await.unwrap();
        store.insert_post(&post("-1_3", 3, "new"), WriteMode::InsertOnly).await.unwrap();
        store.insert_post(&post("-1_4", 4, ""), WriteMode::InsertOnly).await.unwrap();

        let pending = store
            .posts_needing_sentiment(&Selection::backlog(Some(2)))
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["-1_3", "-1_2"]);
    }

    #[tokio::test]
    async fn entity_lookup_tables_are_deduplicated() {
        let store = MemoryStore::new();
        store.insert_post(&post("-1_1", 1, "Москва и Москва"), WriteMode::InsertOnly).await.unwrap();

        let moscow = |start, stop| ExtractedEntity {
            text: "Москва".into(),
            normal: "Москва".into(),
            entity_type: "LOC".into(),
            start,
            stop,
        };
        let written = store
            .record_entities("-1_1", &[moscow(0, 6), moscow(9, 15)])
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(store.entity_count(), 1);
        let links = store.post_entities("-1_1").await.unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].entity_id, links[1].entity_id);
        assert!(store.is_entities_done("-1_1"));
    }

    #[tokio::test]
    async fn translations_are_written_once() {
        let store = MemoryStore::new();
        store
            .insert_translations(&[PostTranslation { id: "-1_1".into(), text_en: "first".into() }])
            .await
            .unwrap();
        store
            .insert_translations(&[PostTranslation { id: "-1_1".into(), text_en: "second".into() }])
            .await
            .unwrap();
        assert_eq!(store.get_translation("-1_1").await.unwrap().as_deref(), Some("first"));
    }
}
