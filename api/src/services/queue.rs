//! Queue state machine: enqueue, batch enqueue, retry, delete, reads
//!
//! Validation, duplicate suppression and quota reservation happen here; the
//! store makes each individual check-and-write atomic.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::{
    FREE_HISTORY_DAYS, MAX_BATCH_SIZE, MAX_SEARCH_QUERY_CHARS, MAX_VIDEO_CHANNEL_CHARS,
    MAX_VIDEO_TITLE_CHARS,
};
use crate::models::{ItemStatus, NewQueueItem, Plan, QueueItem};
use crate::services::error::ApiError;
use crate::services::rate_limit::resets_at;
use crate::services::text::{clamp_optional, sanitize_search_query};
use crate::services::video_url::extract_video_id;
use crate::store::{CompletedFilter, QueueStore, StoreError, Transition};
use crate::workflow::dispatcher::{DispatchError, Dispatcher};
use crate::workflow::summarize::SummarizeRequested;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid YouTube URL")]
    InvalidUrl(Vec<String>),

    #[error("{0}")]
    InvalidBatch(String),

    #[error("Search query q is required")]
    MissingQuery,

    #[error("Video already in queue")]
    Duplicate,

    #[error("Daily limit reached")]
    RateLimited { limit: u32, plan: Plan },

    #[error("Batch queue requires a Pro plan")]
    ProRequired,

    #[error("Item not found")]
    NotFound,

    #[error("Cannot {action} an item that is {status:?}")]
    InvalidState {
        action: &'static str,
        status: ItemStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidUrl(invalid) => ApiError::InvalidUrl { invalid },
            QueueError::InvalidBatch(msg) => ApiError::BadRequest(msg),
            QueueError::MissingQuery => {
                ApiError::BadRequest("Search query q is required".into())
            }
            QueueError::Duplicate => ApiError::Duplicate("Video already in queue".into()),
            QueueError::RateLimited { limit, plan } => ApiError::RateLimited { limit, plan },
            QueueError::ProRequired => ApiError::ProRequired("Batch queue"),
            QueueError::NotFound => ApiError::NotFound,
            QueueError::InvalidState { action, status } => ApiError::InvalidState {
                action,
                status: status.as_str().to_string(),
            },
            QueueError::Store(e) => {
                tracing::error!(error = %e, "Queue store error");
                ApiError::Internal
            }
            QueueError::Dispatch(e) => {
                tracing::error!(error = %e, "Queue dispatch error");
                ApiError::Internal
            }
        }
    }
}

/// One video submitted by a client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueInput {
    pub video_url: String,
    pub video_title: Option<String>,
    pub video_channel: Option<String>,
    pub video_duration_seconds: Option<i32>,
    /// Transcript captured client-side; used before falling back to the server fetch
    pub transcript: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Enqueued {
    pub item: QueueItem,
    pub position: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnqueued {
    pub items: Vec<QueueItem>,
    pub skipped_duplicates: Vec<String>,
    /// True when the daily limit cut the batch short
    pub rate_limited: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub used: u32,
    pub limit: u32,
    pub plan: Plan,
    pub reset_at: DateTime<Utc>,
    pub total_time_saved_seconds: i64,
}

/// One page of completed summaries plus the size of the whole result
#[derive(Debug, Serialize)]
pub struct SummaryPage {
    pub summaries: Vec<QueueItem>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn event_for(item: &QueueItem) -> SummarizeRequested {
    SummarizeRequested {
        item_id: item.id,
        video_id: item.video_id.clone(),
        title: item.video_title.clone(),
    }
}

fn new_item(user_id: Uuid, video_id: String, input: EnqueueInput) -> NewQueueItem {
    NewQueueItem {
        user_id,
        video_id,
        video_title: clamp_optional(input.video_title, MAX_VIDEO_TITLE_CHARS),
        video_channel: clamp_optional(input.video_channel, MAX_VIDEO_CHANNEL_CHARS),
        video_duration_seconds: input.video_duration_seconds.filter(|d| *d >= 0),
        transcript: input.transcript.filter(|t| !t.trim().is_empty()),
    }
}

#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl QueueService {
    pub fn new(store: Arc<dyn QueueStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Add one video to the user's queue
    pub async fn enqueue(&self, user_id: Uuid, input: EnqueueInput) -> Result<Enqueued, QueueError> {
        let video_id = extract_video_id(&input.video_url)
            .ok_or_else(|| QueueError::InvalidUrl(Vec::new()))?;

        if self.store.find_active(user_id, &video_id).await?.is_some() {
            return Err(QueueError::Duplicate);
        }

        let plan = self.store.user_plan(user_id).await?;
        let limit = plan.daily_limit();
        let today = today();
        if self.store.reserve_quota(user_id, limit, 1, today).await? == 0 {
            tracing::info!(user_id = %user_id, limit, plan = plan.as_str(), "Daily limit reached");
            return Err(QueueError::RateLimited { limit, plan });
        }

        let inserted = self
            .store
            .insert_items(vec![new_item(user_id, video_id.clone(), input)])
            .await;
        let item = match inserted {
            Ok(mut items) if !items.is_empty() => items.remove(0),
            Ok(_) => {
                // Lost the race to a concurrent enqueue of the same video
                self.store.release_quota(user_id, 1, today).await?;
                return Err(QueueError::Duplicate);
            }
            Err(e) => {
                self.release_after_failed_insert(user_id, 1, today).await;
                return Err(e.into());
            }
        };

        self.dispatcher.dispatch(event_for(&item)).await?;
        let position = self.store.queue_position(&item).await?;

        tracing::info!(user_id = %user_id, item_id = %item.id, video_id = %video_id, position, "Video queued");
        Ok(Enqueued { item, position })
    }

    /// Add several videos at once (Pro only)
    pub async fn enqueue_batch(
        &self,
        user_id: Uuid,
        videos: Vec<EnqueueInput>,
    ) -> Result<BatchEnqueued, QueueError> {
        let plan = self.store.user_plan(user_id).await?;
        if plan != Plan::Pro {
            return Err(QueueError::ProRequired);
        }

        if videos.is_empty() {
            return Err(QueueError::InvalidBatch("videos must not be empty".into()));
        }
        if videos.len() > MAX_BATCH_SIZE {
            return Err(QueueError::InvalidBatch(format!(
                "Maximum {} videos per batch",
                MAX_BATCH_SIZE
            )));
        }

        // Validate everything before touching any state
        let mut parsed = Vec::with_capacity(videos.len());
        let mut invalid = Vec::new();
        for input in videos {
            match extract_video_id(&input.video_url) {
                Some(video_id) => parsed.push((video_id, input)),
                None => invalid.push(input.video_url),
            }
        }
        if !invalid.is_empty() {
            return Err(QueueError::InvalidUrl(invalid));
        }

        let mut seen = HashSet::new();
        parsed.retain(|(video_id, _)| seen.insert(video_id.clone()));

        let ids: Vec<String> = parsed.iter().map(|(id, _)| id.clone()).collect();
        let active: HashSet<String> = self
            .store
            .active_video_ids(user_id, &ids)
            .await?
            .into_iter()
            .collect();
        let mut skipped_duplicates: Vec<String> =
            ids.iter().filter(|id| active.contains(*id)).cloned().collect();
        parsed.retain(|(video_id, _)| !active.contains(video_id));

        if parsed.is_empty() {
            return Ok(BatchEnqueued {
                items: Vec::new(),
                skipped_duplicates,
                rate_limited: false,
            });
        }

        let limit = plan.daily_limit();
        let today = today();
        let requested = parsed.len() as u32;
        let granted = self
            .store
            .reserve_quota(user_id, limit, requested, today)
            .await?;
        let rate_limited = granted < requested;

        let candidates: Vec<NewQueueItem> = parsed
            .into_iter()
            .take(granted as usize)
            .map(|(video_id, input)| new_item(user_id, video_id, input))
            .collect();
        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.video_id.clone()).collect();

        let items = match self.store.insert_items(candidates).await {
            Ok(items) => items,
            Err(e) => {
                self.release_after_failed_insert(user_id, granted, today).await;
                return Err(e.into());
            }
        };

        let unused = granted - items.len() as u32;
        if unused > 0 {
            self.store.release_quota(user_id, unused, today).await?;
            let inserted: HashSet<&str> = items.iter().map(|i| i.video_id.as_str()).collect();
            skipped_duplicates.extend(
                candidate_ids
                    .into_iter()
                    .filter(|id| !inserted.contains(id.as_str())),
            );
        }

        futures::future::try_join_all(
            items
                .iter()
                .map(|item| self.dispatcher.dispatch(event_for(item))),
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            queued = items.len(),
            skipped = skipped_duplicates.len(),
            rate_limited,
            "Batch queued"
        );
        Ok(BatchEnqueued {
            items,
            skipped_duplicates,
            rate_limited,
        })
    }

    /// Give back slots reserved for an insert that errored. The insert error is
    /// what the caller sees, so a release failure is only logged.
    async fn release_after_failed_insert(&self, user_id: Uuid, count: u32, today: NaiveDate) {
        if let Err(e) = self.store.release_quota(user_id, count, today).await {
            tracing::error!(user_id = %user_id, count, error = %e, "Failed to release reserved quota");
        }
    }

    /// Re-run a pending or failed item under the same id. Does not consume quota.
    pub async fn retry(&self, user_id: Uuid, id: Uuid) -> Result<QueueItem, QueueError> {
        let item = match self.store.reset_for_retry(user_id, id).await? {
            Transition::Applied(item) => item,
            Transition::NotFound => return Err(QueueError::NotFound),
            Transition::Conflict(status) => {
                return Err(QueueError::InvalidState {
                    action: "retry",
                    status,
                });
            }
            Transition::Duplicate => return Err(QueueError::Duplicate),
        };

        self.dispatcher.dispatch(event_for(&item)).await?;
        tracing::info!(user_id = %user_id, item_id = %item.id, "Item retried");
        Ok(item)
    }

    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<(), QueueError> {
        match self.store.soft_delete(user_id, id).await? {
            Transition::Applied(_) => Ok(()),
            Transition::NotFound | Transition::Duplicate => Err(QueueError::NotFound),
            Transition::Conflict(status) => Err(QueueError::InvalidState {
                action: "delete",
                status,
            }),
        }
    }

    pub async fn get(&self, user_id: Uuid, id: Uuid) -> Result<QueueItem, QueueError> {
        self.store
            .get_item(user_id, id)
            .await?
            .ok_or(QueueError::NotFound)
    }

    /// Items still in the queue (not completed)
    pub async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.store.list_active(user_id, limit, offset).await?)
    }

    /// Completed summaries; free users only see recent history
    pub async fn summaries(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<SummaryPage, QueueError> {
        let filter = CompletedFilter {
            since: self.history_since(user_id).await?,
            search: None,
        };
        self.summary_page(user_id, filter, limit, offset).await
    }

    /// Completed summaries whose title or summary text contains `query`
    pub async fn search_summaries(
        &self,
        user_id: Uuid,
        query: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<SummaryPage, QueueError> {
        let query = sanitize_search_query(query.unwrap_or_default(), MAX_SEARCH_QUERY_CHARS);
        if query.is_empty() {
            return Err(QueueError::MissingQuery);
        }

        let filter = CompletedFilter {
            since: self.history_since(user_id).await?,
            search: Some(query.as_str()),
        };
        self.summary_page(user_id, filter, limit, offset).await
    }

    pub async fn summary(&self, user_id: Uuid, id: Uuid) -> Result<QueueItem, QueueError> {
        let item = self.get(user_id, id).await?;
        if item.status != ItemStatus::Completed {
            return Err(QueueError::NotFound);
        }
        Ok(item)
    }

    /// Soft delete a completed summary. Anything else reads as missing.
    pub async fn delete_summary(&self, user_id: Uuid, id: Uuid) -> Result<(), QueueError> {
        self.summary(user_id, id).await?;
        match self.store.soft_delete(user_id, id).await? {
            Transition::Applied(_) => {
                tracing::info!(user_id = %user_id, item_id = %id, "Summary deleted");
                Ok(())
            }
            _ => Err(QueueError::NotFound),
        }
    }

    async fn history_since(&self, user_id: Uuid) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(match self.store.user_plan(user_id).await? {
            Plan::Free => Some(Utc::now() - Duration::days(FREE_HISTORY_DAYS)),
            Plan::Pro => None,
        })
    }

    async fn summary_page(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
        limit: i64,
        offset: i64,
    ) -> Result<SummaryPage, QueueError> {
        let summaries = self
            .store
            .list_completed(user_id, filter, limit, offset)
            .await?;
        let total = self.store.count_completed(user_id, filter).await?;
        Ok(SummaryPage {
            summaries,
            total,
            offset,
            limit,
        })
    }

    pub async fn usage(&self, user_id: Uuid) -> Result<Usage, QueueError> {
        let today = today();
        let plan = self.store.user_plan(user_id).await?;
        let entry = self.store.usage(user_id, today).await?;
        let total_time_saved_seconds = self.store.total_time_saved(user_id).await?;

        Ok(Usage {
            used: entry.effective_count(today),
            limit: plan.daily_limit(),
            plan,
            reset_at: resets_at(today),
            total_time_saved_seconds,
        })
    }
}
