//! The summarize-video workflow: fetch transcript, generate summary, save result

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{RetryPolicy, StepError, StepFailure, StepJournal, StepRunner};
use crate::models::SummaryJson;
use crate::services::summarizer::Summarizer;
use crate::services::transcript::{TranscriptSource, clean_transcript};
use crate::store::QueueStore;

pub const WORKFLOW_NAME: &str = "summarize-video";

const STEP_FETCH: &str = "fetch-transcript";
const STEP_GENERATE: &str = "generate-summary";
const STEP_SAVE: &str = "save-result";

const FALLBACK_FAILURE_MESSAGE: &str = "Failed to generate summary";

/// Event emitted when an item is enqueued or retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeRequested {
    pub item_id: Uuid,
    pub video_id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The item was deleted or already finished before work began
    Skipped,
    Failed(StepFailure),
    /// The step journal stayed unreachable; the item is left for redelivery
    Interrupted(StepFailure),
}

pub struct Pipeline {
    store: Arc<dyn QueueStore>,
    transcripts: Arc<dyn TranscriptSource>,
    summarizer: Summarizer,
    policy: RetryPolicy,
}

fn retriable(e: impl std::fmt::Display) -> StepError {
    StepError::Retriable(e.to_string())
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transcripts: Arc<dyn TranscriptSource>,
        summarizer: Summarizer,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transcripts,
            summarizer,
            policy,
        }
    }

    /// Run every step, then apply the failure hook if a step gave up
    pub async fn run(&self, event: &SummarizeRequested, journal: &dyn StepJournal) -> RunOutcome {
        match self.execute(event, journal).await {
            Ok(true) => RunOutcome::Completed,
            Ok(false) => RunOutcome::Skipped,
            Err(failure) if failure.interrupted => {
                tracing::warn!(
                    item_id = %event.item_id,
                    step = failure.step,
                    error = %failure.message,
                    "Summarize run interrupted"
                );
                RunOutcome::Interrupted(failure)
            }
            Err(failure) => {
                tracing::warn!(
                    item_id = %event.item_id,
                    step = failure.step,
                    attempts = failure.attempts,
                    error = %failure.message,
                    "Summarize run failed"
                );
                self.on_failure(event.item_id, &failure.message).await;
                RunOutcome::Failed(failure)
            }
        }
    }

    /// Mark the item failed with `message` unless it already reached a terminal state
    pub async fn on_failure(&self, item_id: Uuid, message: &str) {
        let message = if message.trim().is_empty() {
            FALLBACK_FAILURE_MESSAGE
        } else {
            message
        };
        if let Err(e) = self.store.fail(item_id, message).await {
            tracing::error!(item_id = %item_id, error = %e, "Failed to record item failure");
        }
    }

    /// Returns Ok(false) when the item no longer needs processing
    async fn execute(
        &self,
        event: &SummarizeRequested,
        journal: &dyn StepJournal,
    ) -> Result<bool, StepFailure> {
        let runner = StepRunner::new(journal, &self.policy);
        let item_id = event.item_id;
        let video_id = event.video_id.as_str();
        let store = &self.store;
        let transcripts = &self.transcripts;

        let transcript: Option<String> = runner
            .run(STEP_FETCH, || async move {
                let Some(item) = store.mark_processing(item_id).await.map_err(retriable)? else {
                    return Ok(None);
                };

                if let Some(supplied) = item.transcript.as_deref() {
                    match clean_transcript(supplied) {
                        Ok(clean) => return Ok(Some(clean)),
                        Err(_) => tracing::debug!(item_id = %item_id, "Supplied transcript empty after cleaning, fetching"),
                    }
                }

                match transcripts.acquire(video_id).await {
                    Ok(text) => Ok(Some(text)),
                    Err(e) if !e.is_retriable() => {
                        let message = e.to_string();
                        store.fail(item_id, &message).await.map_err(retriable)?;
                        Err(StepError::NonRetriable(message))
                    }
                    Err(e) => Err(retriable(e)),
                }
            })
            .await?;

        let Some(transcript) = transcript else {
            tracing::info!(item_id = %item_id, "Item deleted or already finished, skipping");
            return Ok(false);
        };

        let title = event.title.as_deref().unwrap_or_default();
        let summarizer = &self.summarizer;
        let transcript = transcript.as_str();
        let summary: SummaryJson = runner
            .run(STEP_GENERATE, || async move {
                let result = summarizer
                    .summarize(transcript, title)
                    .await
                    .map_err(retriable)?;
                tracing::info!(
                    item_id = %item_id,
                    attempts = result.attempts,
                    parse_retried = result.attempts > 1,
                    "Summary generated"
                );
                Ok(result.summary)
            })
            .await?;

        let summary = &summary;
        let saved: bool = runner
            .run(STEP_SAVE, || async move {
                store.complete(item_id, summary).await.map_err(retriable)
            })
            .await?;

        if saved {
            tracing::info!(item_id = %item_id, video_id, "Summary saved");
        }
        Ok(saved)
    }
}
