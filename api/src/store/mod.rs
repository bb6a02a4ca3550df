//! Persistence seam for queue items and the usage ledger
//!
//! `PgStore` is the production implementation; `MemoryStore` backs local runs
//! and the test suite. Both enforce the same invariants: at most one active
//! (non-failed, non-deleted) item per user and video, and atomic ledger
//! reservation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{ItemStatus, LedgerEntry, NewQueueItem, Plan, QueueItem, SummaryJson};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Which completed items a summaries read covers
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletedFilter<'a> {
    /// Only items created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the title or summary text
    pub search: Option<&'a str>,
}

/// Result of a user-initiated state change on an item
#[derive(Debug)]
pub enum Transition {
    Applied(QueueItem),
    NotFound,
    /// The item exists but its current status forbids the change
    Conflict(ItemStatus),
    /// Reactivating the item would collide with another active item for the same video
    Duplicate,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    // Plan and ledger

    async fn user_plan(&self, user_id: Uuid) -> Result<Plan, StoreError>;

    /// Stored ledger entry (a fresh one if the user has never been counted)
    async fn usage(&self, user_id: Uuid, today: NaiveDate) -> Result<LedgerEntry, StoreError>;

    /// Atomically take up to `requested` slots under `limit`; returns how many were granted
    async fn reserve_quota(
        &self,
        user_id: Uuid,
        limit: u32,
        requested: u32,
        today: NaiveDate,
    ) -> Result<u32, StoreError>;

    async fn release_quota(
        &self,
        user_id: Uuid,
        count: u32,
        today: NaiveDate,
    ) -> Result<(), StoreError>;

    // Items

    async fn find_active(
        &self,
        user_id: Uuid,
        video_id: &str,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Subset of `video_ids` that already have an active item for the user
    async fn active_video_ids(
        &self,
        user_id: Uuid,
        video_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// Insert pending items in order. Items that would duplicate an active
    /// item are skipped, so the result may be shorter than the input.
    async fn insert_items(&self, items: Vec<NewQueueItem>) -> Result<Vec<QueueItem>, StoreError>;

    /// Item owned by `user_id`, unless deleted
    async fn get_item(&self, user_id: Uuid, id: Uuid) -> Result<Option<QueueItem>, StoreError>;

    /// Non-completed items, newest first
    async fn list_active(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Completed items matching `filter`, newest first
    async fn list_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Number of completed items matching `filter`
    async fn count_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
    ) -> Result<i64, StoreError>;

    /// Number of the user's pending/processing items created at or before `item`
    async fn queue_position(&self, item: &QueueItem) -> Result<i64, StoreError>;

    /// Sum of video durations over the user's completed items
    async fn total_time_saved(&self, user_id: Uuid) -> Result<i64, StoreError>;

    // User transitions

    /// pending|failed -> pending, clearing the error
    async fn reset_for_retry(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError>;

    /// Soft delete anything not currently processing
    async fn soft_delete(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError>;

    // Worker transitions

    /// pending|processing -> processing. `None` when the item is gone or already terminal.
    async fn mark_processing(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError>;

    /// processing -> completed, storing the summary and dropping the transcript
    async fn complete(&self, id: Uuid, summary: &SummaryJson) -> Result<bool, StoreError>;

    /// pending|processing -> failed
    async fn fail(&self, id: Uuid, message: &str) -> Result<bool, StoreError>;
}
