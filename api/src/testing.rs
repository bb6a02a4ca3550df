//! Test doubles shared across module tests

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use crate::models::{LedgerEntry, NewQueueItem, Plan, QueueItem, SummaryJson};
use crate::services::llm::{LanguageModel, LlmError, ModelRequest};
use crate::services::transcript::{TranscriptError, TranscriptSource};
use crate::store::{CompletedFilter, MemoryStore, QueueStore, StoreError, Transition};
use crate::workflow::dispatcher::{DispatchError, Dispatcher};
use crate::workflow::summarize::SummarizeRequested;

/// Migrated pool for `TEST_DATABASE_URL`, or None when Postgres tests are not configured
pub async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .expect("connect to TEST_DATABASE_URL");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrate test database");
    Some(pool)
}

pub const VALID_SUMMARY: &str = r#"{"summary":"A video about testing.","keyPoints":["Tests matter"],"actionItems":["Write tests"],"timestamps":["0:00 - Intro"]}"#;

/// Language model that replays canned replies in order and records requests
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Transcript source that answers from a fixed script and counts calls
pub struct ScriptedTranscripts {
    replies: Mutex<VecDeque<Result<String, TranscriptError>>>,
    calls: AtomicU32,
}

impl ScriptedTranscripts {
    pub fn new(replies: impl IntoIterator<Item = Result<String, TranscriptError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptSource for ScriptedTranscripts {
    async fn acquire(&self, _video_id: &str) -> Result<String, TranscriptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TranscriptError::Upstream { stage: "script", status: 500 }))
    }
}

/// Dispatcher that only remembers what it was given
#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<SummarizeRequested>>,
}

impl RecordingDispatcher {
    pub fn events(&self) -> Vec<SummarizeRequested> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, event: SummarizeRequested) -> Result<(), DispatchError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Memory store whose inserts and quota releases always fail
#[derive(Default)]
pub struct BrokenInsertStore {
    pub inner: MemoryStore,
    releases: AtomicU32,
}

impl BrokenInsertStore {
    pub fn release_attempts(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueStore for BrokenInsertStore {
    async fn user_plan(&self, user_id: Uuid) -> Result<Plan, StoreError> {
        self.inner.user_plan(user_id).await
    }

    async fn usage(&self, user_id: Uuid, today: NaiveDate) -> Result<LedgerEntry, StoreError> {
        self.inner.usage(user_id, today).await
    }

    async fn reserve_quota(
        &self,
        user_id: Uuid,
        limit: u32,
        requested: u32,
        today: NaiveDate,
    ) -> Result<u32, StoreError> {
        self.inner.reserve_quota(user_id, limit, requested, today).await
    }

    async fn release_quota(&self, _: Uuid, _: u32, _: NaiveDate) -> Result<(), StoreError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Corrupt("release rejected".into()))
    }

    async fn find_active(
        &self,
        user_id: Uuid,
        video_id: &str,
    ) -> Result<Option<QueueItem>, StoreError> {
        self.inner.find_active(user_id, video_id).await
    }

    async fn active_video_ids(
        &self,
        user_id: Uuid,
        video_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        self.inner.active_video_ids(user_id, video_ids).await
    }

    async fn insert_items(&self, _: Vec<NewQueueItem>) -> Result<Vec<QueueItem>, StoreError> {
        Err(StoreError::Corrupt("insert rejected".into()))
    }

    async fn get_item(&self, user_id: Uuid, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        self.inner.get_item(user_id, id).await
    }

    async fn list_active(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.inner.list_active(user_id, limit, offset).await
    }

    async fn list_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.inner.list_completed(user_id, filter, limit, offset).await
    }

    async fn count_completed(
        &self,
        user_id: Uuid,
        filter: CompletedFilter<'_>,
    ) -> Result<i64, StoreError> {
        self.inner.count_completed(user_id, filter).await
    }

    async fn queue_position(&self, item: &QueueItem) -> Result<i64, StoreError> {
        self.inner.queue_position(item).await
    }

    async fn total_time_saved(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.inner.total_time_saved(user_id).await
    }

    async fn reset_for_retry(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        self.inner.reset_for_retry(user_id, id).await
    }

    async fn soft_delete(&self, user_id: Uuid, id: Uuid) -> Result<Transition, StoreError> {
        self.inner.soft_delete(user_id, id).await
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<QueueItem>, StoreError> {
        self.inner.mark_processing(id).await
    }

    async fn complete(&self, id: Uuid, summary: &SummaryJson) -> Result<bool, StoreError> {
        self.inner.complete(id, summary).await
    }

    async fn fail(&self, id: Uuid, message: &str) -> Result<bool, StoreError> {
        self.inner.fail(id, message).await
    }
}
