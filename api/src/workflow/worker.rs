//! Workflow worker using apalis
//!
//! Runs as a scheduled cron job that claims queued workflow runs and executes
//! them with bounded concurrency. While a run executes its lease is renewed
//! on a heartbeat; a run whose lease expires (worker crashed mid-run) is
//! claimed again and completed steps are skipped via the journal. Finished
//! runs are purged once they age past the retention window.

use apalis::prelude::*;
use apalis_cron::{CronStream, Schedule};
use apalis_sql::postgres::PostgresStorage;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::PgJournal;
use super::summarize::{Pipeline, RunOutcome, SummarizeRequested, WORKFLOW_NAME};
use crate::config::WorkerConfig;
use crate::domain::workflow_runs::{self, ClaimedRun};

/// Claims allowed before a run is abandoned and its item failed
const MAX_RUN_CLAIMS: i32 = 3;
const CLAIM_BATCH_SIZE: i64 = 32;
const ABANDONED_MESSAGE: &str = "Summary processing was interrupted too many times";

/// Job input - marker for batch processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTick {
    pub scheduled_at: chrono::DateTime<chrono::Utc>,
}

impl From<chrono::DateTime<chrono::Utc>> for WorkflowTick {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        WorkflowTick { scheduled_at: dt }
    }
}

/// Shared context for workflow processing
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: PgPool,
    pub pipeline: Arc<Pipeline>,
    pub concurrency: usize,
    pub lease_seconds: i64,
    pub run_retention_hours: i64,
}

/// Job handler - drains claimable runs.
/// Always returns Ok; individual run failures are recorded on the run and its item.
async fn process_tick(_tick: WorkflowTick, ctx: Data<WorkerContext>) -> Result<(), Error> {
    match process_batch(&ctx).await {
        Ok((completed, failed)) => {
            if completed > 0 || failed > 0 {
                tracing::info!(completed, failed, "Workflow batch complete");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Workflow batch error (will retry next tick)");
        }
    }

    match workflow_runs::purge_finished_runs(&ctx.pool, ctx.run_retention_hours).await {
        Ok(0) => {}
        Ok(purged) => tracing::info!(purged, "Purged finished workflow runs"),
        Err(e) => tracing::warn!(error = %e, "Failed to purge finished workflow runs"),
    }
    Ok(())
}

/// Start the workflow worker
pub async fn run_workflow_worker(
    pool: PgPool,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
) -> anyhow::Result<()> {
    let ctx = WorkerContext {
        pool: pool.clone(),
        pipeline,
        concurrency: config.concurrency,
        lease_seconds: config.lease_seconds,
        run_retention_hours: config.run_retention_hours,
    };

    let schedule_expr = format!("*/{} * * * * *", config.cron_seconds);

    // Run apalis migrations
    PostgresStorage::setup(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to set up apalis storage: {}", e))?;

    let storage: PostgresStorage<WorkflowTick> = PostgresStorage::new(pool.clone());
    let schedule = Schedule::from_str(&schedule_expr)
        .map_err(|e| anyhow::anyhow!("Invalid workflow worker schedule: {}", e))?;
    let cron = CronStream::new(schedule);
    let backend = cron.pipe_to_storage(storage);

    tracing::info!(
        every_secs = config.cron_seconds,
        concurrency = config.concurrency,
        lease_secs = config.lease_seconds,
        "Workflow worker starting"
    );

    let worker = WorkerBuilder::new("workflow-worker")
        .data(ctx)
        .backend(backend)
        .build_fn(process_tick);

    Monitor::new()
        .register(worker)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Workflow worker monitor failed: {:?}", e))
}

/// Claim and execute runs until none are left.
/// Returns (completed_count, failed_count)
async fn process_batch(ctx: &WorkerContext) -> Result<(usize, usize), sqlx::Error> {
    let mut completed = 0;
    let mut failed = 0;
    let mut tasks = tokio::task::JoinSet::new();
    let mut claim_failed = false;
    let mut drained = false;

    loop {
        let needed = ctx.concurrency.saturating_sub(tasks.len());
        if needed > 0 && !claim_failed && !drained {
            let claim_limit = std::cmp::min(CLAIM_BATCH_SIZE, needed as i64);
            let runs = match workflow_runs::claim_runs(&ctx.pool, claim_limit, ctx.lease_seconds)
                .await
            {
                Ok(runs) => runs,
                Err(e) => {
                    tracing::error!(error = %e, "Workflow claim error");
                    claim_failed = true;
                    Vec::new()
                }
            };
            drained = runs.is_empty();

            for run in runs {
                let pool = ctx.pool.clone();
                let pipeline = ctx.pipeline.clone();
                let lease_seconds = ctx.lease_seconds;
                tasks.spawn(async move { execute_run(&pool, &pipeline, run, lease_seconds).await });
            }
        }

        if tasks.is_empty() {
            break;
        }

        if let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => completed += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Workflow task panicked");
                    failed += 1;
                }
            }
        }
    }

    Ok((completed, failed))
}

/// How often a live run renews its lease
pub(crate) fn heartbeat_interval(lease_seconds: i64) -> Duration {
    let lease = u64::try_from(lease_seconds).unwrap_or(0);
    Duration::from_secs((lease / 3).max(1))
}

/// Drive `work` to completion, calling `beat` every `every` while it runs
pub(crate) async fn with_heartbeat<W, B, BF>(work: W, every: Duration, mut beat: B) -> W::Output
where
    W: Future,
    B: FnMut() -> BF,
    BF: Future<Output = ()>,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => beat().await,
        }
    }
}

/// Execute one claimed run. Returns false when the run did not complete.
async fn execute_run(pool: &PgPool, pipeline: &Pipeline, run: ClaimedRun, lease_seconds: i64) -> bool {
    let run_id = run.id;
    let claim = run.attempts;

    let event: SummarizeRequested = match (run.workflow.as_str(), serde_json::from_value(run.payload.0)) {
        (WORKFLOW_NAME, Ok(event)) => event,
        (workflow, Err(e)) => {
            tracing::error!(run_id = %run_id, workflow, error = %e, "Undecodable workflow payload");
            finish(pool, run_id, claim, "failed", Some(&e.to_string())).await;
            return false;
        }
        (workflow, Ok(_)) => {
            tracing::error!(run_id = %run_id, workflow, "Unknown workflow");
            finish(pool, run_id, claim, "failed", Some("unknown workflow")).await;
            return false;
        }
    };

    if claim > MAX_RUN_CLAIMS {
        let message = run.last_error.as_deref().unwrap_or(ABANDONED_MESSAGE);
        tracing::warn!(run_id = %run_id, item_id = %event.item_id, attempts = claim, "Abandoning workflow run");
        pipeline.on_failure(event.item_id, message).await;
        finish(pool, run_id, claim, "failed", Some(message)).await;
        return false;
    }

    let journal = PgJournal::new(pool.clone(), run_id);
    let outcome = with_heartbeat(
        pipeline.run(&event, &journal),
        heartbeat_interval(lease_seconds),
        || async move {
            match workflow_runs::touch_run(pool, run_id, claim).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(run_id = %run_id, "Workflow run claim was superseded"),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Failed to renew workflow lease"),
            }
        },
    )
    .await;

    match outcome {
        RunOutcome::Completed | RunOutcome::Skipped => {
            finish(pool, run_id, claim, "done", None).await;
            true
        }
        RunOutcome::Failed(failure) => {
            finish(pool, run_id, claim, "failed", Some(&failure.to_string())).await;
            false
        }
        RunOutcome::Interrupted(failure) => {
            if let Err(e) = workflow_runs::requeue_run(pool, run_id, claim, &failure.to_string()).await {
                // The lease will expire and the run will be claimed again
                tracing::warn!(run_id = %run_id, error = %e, "Failed to requeue interrupted run");
            }
            false
        }
    }
}

async fn finish(pool: &PgPool, run_id: uuid::Uuid, claim: i32, status: &str, error: Option<&str>) {
    if let Err(e) = workflow_runs::finish_run(pool, run_id, claim, status, error).await {
        // The lease will expire and the run will be claimed again
        tracing::error!(run_id = %run_id, status, error = %e, "CRITICAL: Failed to record run status");
    }
}
