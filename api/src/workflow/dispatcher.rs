//! Event dispatch: hand a summarize request to whatever runs workflows

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

use super::MemoryJournal;
use super::summarize::{Pipeline, SummarizeRequested, WORKFLOW_NAME};
use crate::domain::workflow_runs;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to persist workflow run: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, event: SummarizeRequested) -> Result<(), DispatchError>;
}

/// Persists a run row; the background worker claims and executes it
#[derive(Clone)]
pub struct PgDispatcher {
    pool: PgPool,
}

impl PgDispatcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Dispatcher for PgDispatcher {
    async fn dispatch(&self, event: SummarizeRequested) -> Result<(), DispatchError> {
        let payload = serde_json::to_value(&event)?;
        let run_id = workflow_runs::insert_run(&self.pool, WORKFLOW_NAME, &payload).await?;
        tracing::debug!(run_id = %run_id, item_id = %event.item_id, "Workflow run queued");
        Ok(())
    }
}

/// Runs the workflow on the current tokio runtime. Nothing survives a restart.
#[derive(Clone)]
pub struct InlineDispatcher {
    pipeline: Arc<Pipeline>,
}

impl InlineDispatcher {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn dispatch(&self, event: SummarizeRequested) -> Result<(), DispatchError> {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let journal = MemoryJournal::default();
            let outcome = pipeline.run(&event, &journal).await;
            tracing::debug!(item_id = %event.item_id, ?outcome, "Inline run finished");
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = SummarizeRequested {
            item_id: uuid::Uuid::nil(),
            video_id: "dQw4w9WgXcQ".into(),
            title: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["itemId"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(value["videoId"], "dQw4w9WgXcQ");
        let back: SummarizeRequested = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
