//! Postgres-backed store

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use uuid::Uuid;

use super::{CompletedFilter, QueueStore, StoreError, Transition};
use crate::domain::{queue_items, users};
use crate::models::{LedgerEntry, NewQueueItem, Plan, QueueItem, SummaryJson};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional update on `id` matched nothing
    async fn classify_miss(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        match queue_items::get_for_user(&self.pool, user_id, id).await? {
            Some(row) => Ok(Transition::Conflict(QueueItem::try_from(row)?.status)),
            None => Ok(Transition::NotFound),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueStore for PgStore {
    async fn user_plan(&self, user_id: Uuid) -> Result<Plan, StoreError> {
        let plan = users::get_plan(&self.pool, user_id).await?;
        Ok(Plan::parse(plan.as_deref()))
    }

    async fn usage(&self, user_id: Uuid, today: NaiveDate) -> Result<LedgerEntry, StoreError> {
        Ok(match users::get_usage(&self.pool, user_id).await? {
            Some(row) => LedgerEntry {
                daily_count: u32::try_from(row.daily_count).unwrap_or(0),
                reset_boundary: row.reset_boundary,
            },
            None => LedgerEntry::new(today),
        })
    }

    async fn reserve_quota(
        &self,
        user_id: Uuid,
        limit: u32,
        requested: u32,
        today: NaiveDate,
    ) -> Result<u32, StoreError> {
        users::ensure_user(&self.pool, user_id).await?;
        let granted =
            users::reserve(&self.pool, user_id, to_i32(limit), to_i32(requested), today).await?;
        Ok(u32::try_from(granted).unwrap_or(0))
    }

    async fn release_quota(
        &self,
        user_id: Uuid,
        count: u32,
        today: NaiveDate,
    ) -> Result<(), StoreError> {
        if count == 0 {
            return Ok(());
        }
        users::release(&self.pool, user_id, to_i32(count), today).await?;
        Ok(())
    }

    async fn find_active(
        &self,
        user_id: Uuid,
        video_id: &str,
    ) -> Result<Option<QueueItem>, StoreError> {
        queue_items::find_active(&self.pool, user_id, video_id)
            .await?
            .map(QueueItem::try_from)
            .transpose()
    }

    async fn active_video_ids(
        &self,
        user_id: Uuid,
        video_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        Ok(queue_items::active_video_ids(&self.pool, user_id, video_ids).await?)
    }

    async fn insert_items(&self, items: Vec<NewQueueItem>) -> Result<Vec<QueueItem>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(items.len());

        for item in &items {
            users::ensure_user(&mut *tx, item.user_id).await?;
            if let Some(row) = queue_items::insert_pending(&mut *tx, item).await? {
                inserted.push(QueueItem::try_from(row)?);
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_item(&self, user_id: Uuid, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        queue_items::get_for_user(&self.pool, user_id, id)
            .await?
            .map(QueueItem::try_from)
            .transpose()
    }

    async fn list_active(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows = queue_items::list_active(&self.pool, user_id, limit, offset).await?;
        queue_items::into_items(rows)
    }

    async fn list_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let pattern = filter.search.map(queue_items::contains_pattern);
        let rows = queue_items::list_completed(
            &self.pool,
            user_id,
            filter.since,
            pattern.as_deref(),
            limit,
            offset,
        )
        .await?;
        queue_items::into_items(rows)
    }

    async fn count_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
    ) -> Result<i64, StoreError> {
        let pattern = filter.search.map(queue_items::contains_pattern);
        Ok(
            queue_items::count_completed(&self.pool, user_id, filter.since, pattern.as_deref())
                .await?,
        )
    }

    async fn queue_position(&self, item: &QueueItem) -> Result<i64, StoreError> {
        Ok(queue_items::count_ahead(&self.pool, item.user_id, item.created_at).await?)
    }

    async fn total_time_saved(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(queue_items::total_completed_seconds(&self.pool, user_id).await?)
    }

    async fn reset_for_retry(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        match queue_items::reset_for_retry(&self.pool, user_id, id).await {
            Ok(Some(row)) => Ok(Transition::Applied(QueueItem::try_from(row)?)),
            Ok(None) => self.classify_miss(user_id, id).await,
            Err(e) if is_unique_violation(&e) => Ok(Transition::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn soft_delete(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        match queue_items::soft_delete(&self.pool, user_id, id).await? {
            Some(row) => Ok(Transition::Applied(QueueItem::try_from(row)?)),
            None => self.classify_miss(user_id, id).await,
        }
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        queue_items::mark_processing(&self.pool, id)
            .await?
            .map(QueueItem::try_from)
            .transpose()
    }

    async fn complete(&self, id: Uuid, summary: &SummaryJson) -> Result<bool, StoreError> {
        Ok(queue_items::complete(&self.pool, id, summary).await?)
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool, StoreError> {
        Ok(queue_items::fail(&self.pool, id, message).await?)
    }
}
