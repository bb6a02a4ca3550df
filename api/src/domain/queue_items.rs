//! Queue item domain - DB queries for queue_items
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).
//! Soft-deleted rows are excluded everywhere.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::models::{ItemStatus, NewQueueItem, QueueItem, SummaryJson};
use crate::store::StoreError;

const COLUMNS: &str = "id, user_id, video_id, video_title, video_channel, video_duration_seconds, \
     status, transcript, summary_json, error_message, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub struct QueueItemRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub video_id: String,
    pub video_title: Option<String>,
    pub video_channel: Option<String>,
    pub video_duration_seconds: Option<i32>,
    pub status: String,
    pub transcript: Option<String>,
    pub summary_json: Option<Json<SummaryJson>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let status = ItemStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {:?}", row.status)))?;

        Ok(QueueItem {
            id: row.id,
            user_id: row.user_id,
            video_id: row.video_id,
            video_title: row.video_title,
            video_channel: row.video_channel,
            video_duration_seconds: row.video_duration_seconds,
            status,
            transcript: row.transcript,
            summary_json: row.summary_json.map(|j| j.0),
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub fn into_items(rows: Vec<QueueItemRow>) -> Result<Vec<QueueItem>, StoreError> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

/// Insert a pending item unless an active one exists for the same user and video.
/// Returns `None` when the partial unique index rejected the row.
pub async fn insert_pending<'e, E>(
    executor: E,
    item: &NewQueueItem,
) -> Result<Option<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "INSERT INTO queue_items
            (id, user_id, video_id, video_title, video_channel, video_duration_seconds, status, transcript)
         VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
         ON CONFLICT (user_id, video_id) WHERE status <> 'failed' AND deleted_at IS NULL
         DO NOTHING
         RETURNING {COLUMNS}"
    );
    sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(item.user_id)
        .bind(&item.video_id)
        .bind(&item.video_title)
        .bind(&item.video_channel)
        .bind(item.video_duration_seconds)
        .bind(&item.transcript)
        .fetch_optional(executor)
        .await
}

pub async fn get_for_user<'e, E>(
    executor: E,
    user_id: Uuid,
    id: Uuid,
) -> Result<Option<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM queue_items
         WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL"
    );
    sqlx::query_as(&sql)
        .bind(id)
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

pub async fn find_active<'e, E>(
    executor: E,
    user_id: Uuid,
    video_id: &str,
) -> Result<Option<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM queue_items
         WHERE user_id = $1 AND video_id = $2
           AND status <> 'failed' AND deleted_at IS NULL
         LIMIT 1"
    );
    sqlx::query_as(&sql)
        .bind(user_id)
        .bind(video_id)
        .fetch_optional(executor)
        .await
}

pub async fn active_video_ids<'e, E>(
    executor: E,
    user_id: Uuid,
    video_ids: &[String],
) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT DISTINCT video_id FROM queue_items
         WHERE user_id = $1 AND video_id = ANY($2)
           AND status <> 'failed' AND deleted_at IS NULL",
    )
    .bind(user_id)
    .bind(video_ids)
    .fetch_all(executor)
    .await
}

pub async fn list_active<'e, E>(
    executor: E,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM queue_items
         WHERE user_id = $1 AND status <> 'completed' AND deleted_at IS NULL
         ORDER BY created_at DESC
         LIMIT $2 OFFSET $3"
    );
    sqlx::query_as(&sql)
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
}

/// ILIKE pattern matching `text` anywhere, with wildcards in `text` taken literally
pub fn contains_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Completed, visible items created at or after `since` whose title or
/// summary matches the ILIKE `pattern` (both optional)
const COMPLETED_FILTER: &str = "user_id = $1 AND status = 'completed' AND deleted_at IS NULL
           AND ($2::timestamptz IS NULL OR created_at >= $2)
           AND ($3::text IS NULL OR video_title ILIKE $3 OR summary_json->>'summary' ILIKE $3)";

pub async fn list_completed<'e, E>(
    executor: E,
    user_id: Uuid,
    since: Option<DateTime<Utc>>,
    pattern: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM queue_items
         WHERE {COMPLETED_FILTER}
         ORDER BY created_at DESC
         LIMIT $4 OFFSET $5"
    );
    sqlx::query_as(&sql)
        .bind(user_id)
        .bind(since)
        .bind(pattern)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
}

pub async fn count_completed<'e, E>(
    executor: E,
    user_id: Uuid,
    since: Option<DateTime<Utc>>,
    pattern: Option<&str>,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!("SELECT COUNT(*) FROM queue_items WHERE {COMPLETED_FILTER}");
    sqlx::query_scalar(&sql)
        .bind(user_id)
        .bind(since)
        .bind(pattern)
        .fetch_one(executor)
        .await
}

pub async fn count_ahead<'e, E>(
    executor: E,
    user_id: Uuid,
    created_at: DateTime<Utc>,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_items
         WHERE user_id = $1 AND status IN ('pending', 'processing')
           AND deleted_at IS NULL AND created_at <= $2",
    )
    .bind(user_id)
    .bind(created_at)
    .fetch_one(executor)
    .await
}

pub async fn total_completed_seconds<'e, E>(executor: E, user_id: Uuid) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(video_duration_seconds), 0)::BIGINT FROM queue_items
         WHERE user_id = $1 AND status = 'completed' AND deleted_at IS NULL",
    )
    .bind(user_id)
    .fetch_one(executor)
    .await
}

/// pending|failed -> pending. Fails with a unique violation if another active
/// item already exists for the video.
pub async fn reset_for_retry<'e, E>(
    executor: E,
    user_id: Uuid,
    id: Uuid,
) -> Result<Option<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "UPDATE queue_items
         SET status = 'pending', error_message = NULL, updated_at = NOW()
         WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
           AND status IN ('pending', 'failed')
         RETURNING {COLUMNS}"
    );
    sqlx::query_as(&sql)
        .bind(id)
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

pub async fn soft_delete<'e, E>(
    executor: E,
    user_id: Uuid,
    id: Uuid,
) -> Result<Option<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "UPDATE queue_items
         SET deleted_at = NOW(), updated_at = NOW()
         WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
           AND status <> 'processing'
         RETURNING {COLUMNS}"
    );
    sqlx::query_as(&sql)
        .bind(id)
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

pub async fn mark_processing<'e, E>(
    executor: E,
    id: Uuid,
) -> Result<Option<QueueItemRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "UPDATE queue_items
         SET status = 'processing', updated_at = NOW()
         WHERE id = $1 AND deleted_at IS NULL
           AND status IN ('pending', 'processing')
         RETURNING {COLUMNS}"
    );
    sqlx::query_as(&sql).bind(id).fetch_optional(executor).await
}

pub async fn complete<'e, E>(
    executor: E,
    id: Uuid,
    summary: &SummaryJson,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE queue_items
         SET status = 'completed', summary_json = $2, transcript = NULL,
             error_message = NULL, updated_at = NOW()
         WHERE id = $1 AND deleted_at IS NULL AND status = 'processing'",
    )
    .bind(id)
    .bind(Json(summary))
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn fail<'e, E>(executor: E, id: Uuid, message: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE queue_items
         SET status = 'failed', error_message = $2, updated_at = NOW()
         WHERE id = $1 AND deleted_at IS NULL AND status IN ('pending', 'processing')",
    )
    .bind(id)
    .bind(message)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}
