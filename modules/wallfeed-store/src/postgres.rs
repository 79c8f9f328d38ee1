// Postgres implementation of RecordStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::info;

use wallfeed_common::{
    DomainStats, EntityRecord, ExtractedEntity, InsertOutcome, LoggedPage, PageRecord,
    PendingEntity, PendingText, Post, PostEntity, PostMetrics, PostSentiment, PostTranslation, ScrapeLogEntry,
    Selection, SentimentScores, WriteMode,
};

use crate::error::{Result, StoreError};
use crate::traits::RecordStore;

/// Record store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: String,
    domain: String,
    date_utc: DateTime<Utc>,
    text: String,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id,
            domain: row.domain,
            date_utc: row.date_utc,
            text: row.text,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MetricsRow {
    id: String,
    likes: i64,
    shares: i64,
    views: i64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SentimentRow {
    positive: f64,
    negative: f64,
    neutral: f64,
    skip: f64,
    speech: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    id: i64,
    name: String,
    entity_type: String,
    name_en: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    domain: String,
    nr_posts: i64,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small pool. Access is single-writer, so a handful of
    /// connections is plenty.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Record store migrations complete");
        Ok(())
    }
}

fn to_limit(limit: Option<usize>) -> Result<Option<i64>> {
    limit
        .map(|n| i64::try_from(n).map_err(|_| StoreError::Range(format!("limit {n}"))))
        .transpose()
}

/// Split a selection into the two optional bind parameters shared by the
/// "needs processing" queries: an id filter and a row limit.
fn selection_params(selection: &Selection) -> Result<(Option<Vec<String>>, Option<i64>)> {
    match selection {
        Selection::Backlog { limit } => Ok((None, to_limit(*limit)?)),
        Selection::Posts(ids) => Ok((Some(ids.clone()), None)),
    }
}

async fn pending_texts(
    pool: &PgPool,
    sql: &str,
    selection: &Selection,
) -> Result<Vec<PendingText>> {
    let (ids, limit) = selection_params(selection)?;
    let rows = sqlx::query_as::<_, (String, String)>(sql)
        .bind(ids)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(id, text)| PendingText { id, text })
        .collect())
}

async fn write_post(conn: &mut PgConnection, post: &Post, mode: WriteMode) -> Result<InsertOutcome> {
    let sql = match mode {
        WriteMode::InsertOnly => {
            r#"
            INSERT INTO posts (id, domain, date_utc, text)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#
        }
        WriteMode::Replace => {
            r#"
            INSERT INTO posts (id, domain, date_utc, text)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET domain = EXCLUDED.domain, date_utc = EXCLUDED.date_utc, text = EXCLUDED.text
            "#
        }
    };

    let result = sqlx::query(sql)
        .bind(&post.id)
        .bind(&post.domain)
        .bind(post.date_utc)
        .bind(&post.text)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() != 1 {
        return Ok(InsertOutcome::RejectedDuplicate);
    }

    // A rewritten post's old score no longer matches its text.
    if mode == WriteMode::Replace {
        sqlx::query("DELETE FROM posts_sentiment WHERE id = $1")
            .bind(&post.id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(InsertOutcome::Inserted)
}

async fn write_metrics(conn: &mut PgConnection, metrics: &PostMetrics) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO posts_metrics (id, likes, shares, views, timestamp)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET likes = EXCLUDED.likes, shares = EXCLUDED.shares,
            views = EXCLUDED.views, timestamp = EXCLUDED.timestamp
        "#,
    )
    .bind(&metrics.id)
    .bind(metrics.likes)
    .bind(metrics.shares)
    .bind(metrics.views)
    .bind(metrics.timestamp)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_post(&self, post: &Post, mode: WriteMode) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = write_post(&mut *tx, post, mode).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn upsert_metrics(&self, metrics: &PostMetrics) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_metrics(&mut *conn, metrics).await
    }

    async fn write_page(&self, records: &[PageRecord], mode: WriteMode) -> Result<Vec<InsertOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(write_post(&mut *tx, &record.post, mode).await?);
            write_metrics(&mut *tx, &record.metrics).await?;
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        let row = sqlx::query_as::<_, PostRow>(
            "SELECT id, domain, date_utc, text FROM posts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_metrics(&self, id: &str) -> Result<Option<PostMetrics>> {
        let row = sqlx::query_as::<_, MetricsRow>(
            "SELECT id, likes, shares, views, timestamp FROM posts_metrics WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PostMetrics {
            id: r.id,
            likes: r.likes,
            shares: r.shares,
            views: r.views,
            timestamp: r.timestamp,
        }))
    }

    async fn count_posts(&self, domain: &str) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM posts WHERE domain = $1")
            .bind(domain)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn domain_stats(&self) -> Result<Vec<DomainStats>> {
        let rows = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT domain, COUNT(*) AS nr_posts, MIN(date_utc) AS first, MAX(date_utc) AS last
            FROM posts
            GROUP BY domain
            ORDER BY domain
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| DomainStats {
                domain: r.domain,
                nr_posts: r.nr_posts,
                first: r.first,
                last: r.last,
            })
            .collect())
    }

    async fn reset_posts(&self) -> Result<()> {
        // metrics and sentiment go with the posts via ON DELETE CASCADE
        sqlx::query("TRUNCATE posts CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_scrape_log(&self, entry: &ScrapeLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_log (run_id, domain, timestamp, url, status_code, html)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.run_id)
        .bind(&entry.domain)
        .bind(entry.timestamp)
        .bind(&entry.url)
        .bind(entry.status_code)
        .bind(&entry.html)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn logged_pages(&self, limit: Option<usize>) -> Result<Vec<LoggedPage>> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>, String)>(
            r#"
            SELECT domain, timestamp, html FROM scrape_log
            WHERE status_code = 200
            ORDER BY timestamp, id
            LIMIT $1
            "#,
        )
        .bind(to_limit(limit)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(domain, timestamp, html)| LoggedPage {
                domain,
                timestamp,
                html,
            })
            .collect())
    }

    async fn posts_needing_sentiment(&self, selection: &Selection) -> Result<Vec<PendingText>> {
        pending_texts(
            &self.pool,
            r#"
            SELECT p.id, p.text FROM posts p
            WHERE p.text != ''
              AND ($1::text[] IS NULL OR p.id = ANY($1))
              AND NOT EXISTS (SELECT 1 FROM posts_sentiment s WHERE s.id = p.id)
            ORDER BY p.date_utc DESC
            LIMIT $2
            "#,
            selection,
        )
        .await
    }

    async fn insert_sentiment(&self, rows: &[PostSentiment], mode: WriteMode) -> Result<()> {
        let sql = match mode {
            WriteMode::InsertOnly => {
                r#"
                INSERT INTO posts_sentiment (id, positive, negative, neutral, skip, speech)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#
            }
            WriteMode::Replace => {
                r#"
                INSERT INTO posts_sentiment (id, positive, negative, neutral, skip, speech)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE
                SET positive = EXCLUDED.positive, negative = EXCLUDED.negative,
                    neutral = EXCLUDED.neutral, skip = EXCLUDED.skip, speech = EXCLUDED.speech
                "#
            }
        };

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(sql)
                .bind(&row.id)
                .bind(row.scores.positive)
                .bind(row.scores.negative)
                .bind(row.scores.neutral)
                .bind(row.scores.skip)
                .bind(row.scores.speech)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn get_sentiment(&self, id: &str) -> Result<Option<SentimentScores>> {
        let row = sqlx::query_as::<_, SentimentRow>(
            "SELECT positive, negative, neutral, skip, speech FROM posts_sentiment WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SentimentScores {
            positive: r.positive,
            negative: r.negative,
            neutral: r.neutral,
            skip: r.skip,
            speech: r.speech,
        }))
    }

    async fn reset_sentiment(&self) -> Result<()> {
        sqlx::query("TRUNCATE posts_sentiment")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn posts_needing_entities(&self, selection: &Selection) -> Result<Vec<PendingText>> {
        pending_texts(
            &self.pool,
            r#"
            SELECT p.id, p.text FROM posts p
            WHERE p.text != ''
              AND ($1::text[] IS NULL OR p.id = ANY($1))
              AND NOT EXISTS (SELECT 1 FROM posts_entities_done d WHERE d.id = p.id)
            ORDER BY p.date_utc DESC
            LIMIT $2
            "#,
            selection,
        )
        .await
    }

    async fn record_entities(&self, post_id: &str, entities: &[ExtractedEntity]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for entity in entities {
            let (type_id,) = sqlx::query_as::<_, (i64,)>(
                r#"
                INSERT INTO entity_types (value) VALUES ($1)
                ON CONFLICT (value) DO UPDATE SET value = EXCLUDED.value
                RETURNING id
                "#,
            )
            .bind(&entity.entity_type)
            .fetch_one(&mut *tx)
            .await?;

            let (entity_id,) = sqlx::query_as::<_, (i64,)>(
                r#"
                INSERT INTO entities (entity_type_id, name) VALUES ($1, $2)
                ON CONFLICT (entity_type_id, name) DO UPDATE SET name = EXCLUDED.name
                RETURNING id
                "#,
            )
            .bind(type_id)
            .bind(&entity.normal)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO posts_entities (post_id, entity_id, begin_offset, end_offset)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(post_id)
            .bind(entity_id)
            .bind(entity.start)
            .bind(entity.stop)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT INTO posts_entities_done (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(entities.len())
    }

    async fn post_entities(&self, post_id: &str) -> Result<Vec<PostEntity>> {
        let rows = sqlx::query_as::<_, (String, i64, i32, i32)>(
            r#"
            SELECT post_id, entity_id, begin_offset, end_offset FROM posts_entities
            WHERE post_id = $1
            ORDER BY begin_offset, id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(post_id, entity_id, begin_offset, end_offset)| PostEntity {
                post_id,
                entity_id,
                begin_offset,
                end_offset,
            })
            .collect())
    }

    async fn get_entity(&self, id: i64) -> Result<Option<EntityRecord>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT e.id, e.name, t.value AS entity_type, e.name_en
            FROM entities e JOIN entity_types t ON t.id = e.entity_type_id
            WHERE e.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| EntityRecord {
            id: r.id,
            name: r.name,
            entity_type: r.entity_type,
            name_en: r.name_en,
        }))
    }

    async fn entities_needing_translation(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<PendingEntity>> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT id, name FROM entities
            WHERE name != '' AND (name_en IS NULL OR name_en = '')
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(to_limit(limit)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| PendingEntity { id, name })
            .collect())
    }

    async fn set_entity_translations(&self, rows: &[(i64, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, name_en) in rows {
            sqlx::query("UPDATE entities SET name_en = $2 WHERE id = $1")
                .bind(id)
                .bind(name_en)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn posts_needing_translation(
        &self,
        selection: &Selection,
        max_chars: usize,
    ) -> Result<Vec<PendingText>> {
        let (ids, limit) = selection_params(selection)?;
        let max_chars = i32::try_from(max_chars)
            .map_err(|_| StoreError::Range(format!("max_chars {max_chars}")))?;

        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT p.id, p.text FROM posts p
            WHERE p.text != '' AND char_length(p.text) <= $3
              AND ($1::text[] IS NULL OR p.id = ANY($1))
              AND NOT EXISTS (SELECT 1 FROM posts_translation t WHERE t.id = p.id)
            ORDER BY p.date_utc DESC
            LIMIT $2
            "#,
        )
        .bind(ids)
        .bind(limit)
        .bind(max_chars)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, text)| PendingText { id, text })
            .collect())
    }

    async fn insert_translations(&self, rows: &[PostTranslation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO posts_translation (id, text_en) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&row.id)
            .bind(&row.text_en)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_translation(&self, id: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT text_en FROM posts_translation WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.0))
    }
}
