//! In-process store

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{CompletedFilter, QueueStore, StoreError, Transition};
use crate::models::{ItemStatus, LedgerEntry, NewQueueItem, Plan, QueueItem, SummaryJson};
use crate::services::rate_limit::UsageLedger;

#[derive(Default)]
struct State {
    items: Vec<StoredItem>,
    plans: HashMap<Uuid, Plan>,
}

struct StoredItem {
    item: QueueItem,
    deleted_at: Option<DateTime<Utc>>,
}

impl StoredItem {
    fn is_visible(&self) -> bool {
        self.deleted_at.is_none()
    }

    fn is_active(&self) -> bool {
        self.is_visible() && self.item.status != ItemStatus::Failed
    }

    fn matches_completed(&self, user_id: Uuid, filter: &CompletedFilter<'_>) -> bool {
        self.is_visible()
            && self.item.user_id == user_id
            && self.item.status == ItemStatus::Completed
            && filter.since.is_none_or(|since| self.item.created_at >= since)
            && filter.search.is_none_or(|q| self.mentions(q))
    }

    fn mentions(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        let title = self.item.video_title.as_deref().unwrap_or_default();
        let summary = self
            .item
            .summary_json
            .as_ref()
            .map(|s| s.summary.as_str())
            .unwrap_or_default();
        title.to_lowercase().contains(&query) || summary.to_lowercase().contains(&query)
    }

    fn touch(&mut self) {
        self.item.updated_at = Utc::now().max(self.item.updated_at);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    ledger: UsageLedger,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_plan(&self, user_id: Uuid, plan: Plan) {
        self.lock().plans.insert(user_id, plan);
    }

    #[cfg(test)]
    pub fn set_usage(&self, user_id: Uuid, entry: LedgerEntry) {
        self.ledger.set(user_id, entry);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn page(items: Vec<QueueItem>, limit: i64, offset: i64) -> Vec<QueueItem> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

fn newest_first(mut items: Vec<QueueItem>) -> Vec<QueueItem> {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    items
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn user_plan(&self, user_id: Uuid) -> Result<Plan, StoreError> {
        Ok(self
            .lock()
            .plans
            .get(&user_id)
            .copied()
            .unwrap_or(Plan::Free))
    }

    async fn usage(&self, user_id: Uuid, today: NaiveDate) -> Result<LedgerEntry, StoreError> {
        Ok(self.ledger.entry(user_id, today))
    }

    async fn reserve_quota(
        &self,
        user_id: Uuid,
        limit: u32,
        requested: u32,
        today: NaiveDate,
    ) -> Result<u32, StoreError> {
        Ok(self.ledger.reserve(user_id, limit, requested, today))
    }

    async fn release_quota(
        &self,
        user_id: Uuid,
        count: u32,
        today: NaiveDate,
    ) -> Result<(), StoreError> {
        self.ledger.release(user_id, count, today);
        Ok(())
    }

    async fn find_active(
        &self,
        user_id: Uuid,
        video_id: &str,
    ) -> Result<Option<QueueItem>, StoreError> {
        Ok(self
            .lock()
            .items
            .iter()
            .find(|s| s.is_active() && s.item.user_id == user_id && s.item.video_id == video_id)
            .map(|s| s.item.clone()))
    }

    async fn active_video_ids(
        &self,
        user_id: Uuid,
        video_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(video_ids
            .iter()
            .filter(|vid| {
                state
                    .items
                    .iter()
                    .any(|s| s.is_active() && s.item.user_id == user_id && &s.item.video_id == *vid)
            })
            .cloned()
            .collect())
    }

    async fn insert_items(&self, items: Vec<NewQueueItem>) -> Result<Vec<QueueItem>, StoreError> {
        let mut state = self.lock();
        let mut inserted = Vec::with_capacity(items.len());

        for new in items {
            let collides = state.items.iter().any(|s| {
                s.is_active() && s.item.user_id == new.user_id && s.item.video_id == new.video_id
            });
            if collides {
                continue;
            }

            let now = Utc::now();
            let item = QueueItem {
                id: Uuid::new_v4(),
                user_id: new.user_id,
                video_id: new.video_id,
                video_title: new.video_title,
                video_channel: new.video_channel,
                video_duration_seconds: new.video_duration_seconds,
                status: ItemStatus::Pending,
                transcript: new.transcript,
                summary_json: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            state.items.push(StoredItem {
                item: item.clone(),
                deleted_at: None,
            });
            inserted.push(item);
        }

        Ok(inserted)
    }

    async fn get_item(&self, user_id: Uuid, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        Ok(self
            .lock()
            .items
            .iter()
            .find(|s| s.is_visible() && s.item.id == id && s.item.user_id == user_id)
            .map(|s| s.item.clone()))
    }

    async fn list_active(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let items = self
            .lock()
            .items
            .iter()
            .filter(|s| {
                s.is_visible() && s.item.user_id == user_id && s.item.status != ItemStatus::Completed
            })
            .map(|s| s.item.clone())
            .collect();
        Ok(page(newest_first(items), limit, offset))
    }

    async fn list_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let items = self
            .lock()
            .items
            .iter()
            .filter(|s| s.matches_completed(user_id, &filter))
            .map(|s| s.item.clone())
            .collect();
        Ok(page(newest_first(items), limit, offset))
    }

    async fn count_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
    ) -> Result<i64, StoreError> {
        let count = self
            .lock()
            .items
            .iter()
            .filter(|s| s.matches_completed(user_id, &filter))
            .count();
        Ok(count as i64)
    }

    async fn queue_position(&self, item: &QueueItem) -> Result<i64, StoreError> {
        let count = self
            .lock()
            .items
            .iter()
            .filter(|s| {
                s.is_visible()
                    && s.item.user_id == item.user_id
                    && matches!(s.item.status, ItemStatus::Pending | ItemStatus::Processing)
                    && s.item.created_at <= item.created_at
            })
            .count();
        Ok(count as i64)
    }

    async fn total_time_saved(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .items
            .iter()
            .filter(|s| {
                s.is_visible() && s.item.user_id == user_id && s.item.status == ItemStatus::Completed
            })
            .filter_map(|s| s.item.video_duration_seconds)
            .map(i64::from)
            .sum())
    }

    async fn reset_for_retry(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        let mut state = self.lock();
        let Some(idx) = state
            .items
            .iter()
            .position(|s| s.is_visible() && s.item.id == id && s.item.user_id == user_id)
        else {
            return Ok(Transition::NotFound);
        };

        let status = state.items[idx].item.status;
        if !status.is_retryable() {
            return Ok(Transition::Conflict(status));
        }

        let video_id = state.items[idx].item.video_id.clone();
        let collides = state.items.iter().any(|s| {
            s.is_active() && s.item.id != id && s.item.user_id == user_id && s.item.video_id == video_id
        });
        if collides {
            return Ok(Transition::Duplicate);
        }

        let stored = &mut state.items[idx];
        stored.item.status = ItemStatus::Pending;
        stored.item.error_message = None;
        stored.touch();
        Ok(Transition::Applied(stored.item.clone()))
    }

    async fn soft_delete(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        let mut state = self.lock();
        let Some(stored) = state
            .items
            .iter_mut()
            .find(|s| s.is_visible() && s.item.id == id && s.item.user_id == user_id)
        else {
            return Ok(Transition::NotFound);
        };

        if !stored.item.status.is_deletable() {
            return Ok(Transition::Conflict(stored.item.status));
        }

        stored.deleted_at = Some(Utc::now());
        stored.touch();
        Ok(Transition::Applied(stored.item.clone()))
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        let mut state = self.lock();
        let Some(stored) = state.items.iter_mut().find(|s| {
            s.is_visible()
                && s.item.id == id
                && matches!(s.item.status, ItemStatus::Pending | ItemStatus::Processing)
        }) else {
            return Ok(None);
        };

        stored.item.status = ItemStatus::Processing;
        stored.touch();
        Ok(Some(stored.item.clone()))
    }

    async fn complete(&self, id: Uuid, summary: &SummaryJson) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(stored) = state.items.iter_mut().find(|s| {
            s.is_visible() && s.item.id == id && s.item.status == ItemStatus::Processing
        }) else {
            return Ok(false);
        };

        stored.item.status = ItemStatus::Completed;
        stored.item.summary_json = Some(summary.clone());
        stored.item.transcript = None;
        stored.item.error_message = None;
        stored.touch();
        Ok(true)
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(stored) = state.items.iter_mut().find(|s| {
            s.is_visible()
                && s.item.id == id
                && matches!(s.item.status, ItemStatus::Pending | ItemStatus::Processing)
        }) else {
            return Ok(false);
        };

        stored.item.status = ItemStatus::Failed;
        stored.item.error_message = Some(message.to_string());
        stored.touch();
        Ok(true)
    }
}
