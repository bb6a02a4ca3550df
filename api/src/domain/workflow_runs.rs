//! Workflow run domain - DB queries for workflow_runs and workflow_steps
//!
//! A run is one dispatched event. The worker claims runs with a lease; a
//! claim whose lease expires (crashed worker) becomes claimable again until
//! its claim budget is spent. A live worker keeps its lease by touching the
//! run, and every later write is scoped to the claim it holds (the attempt
//! number), so a superseded worker cannot overwrite a newer claim.

use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct ClaimedRun {
    pub id: Uuid,
    pub workflow: String,
    pub payload: Json<Value>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

pub async fn insert_run<'e, E>(
    executor: E,
    workflow: &str,
    payload: &Value,
) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        "INSERT INTO workflow_runs (id, workflow, payload)
         VALUES ($1, $2, $3)
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(workflow)
    .bind(Json(payload))
    .fetch_one(executor)
    .await
}

/// Claim queued runs, or running runs whose lease has expired, bumping each claim's attempt count
pub async fn claim_runs<'e, E>(
    executor: E,
    limit: i64,
    lease_seconds: i64,
) -> Result<Vec<ClaimedRun>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        WITH claimed AS (
            SELECT id
            FROM workflow_runs
            WHERE status = 'queued'
               OR (
                   status = 'running'
                   AND claimed_at IS NOT NULL
                   AND claimed_at < NOW() - $1 * INTERVAL '1 second'
               )
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE workflow_runs r
        SET status = 'running',
            claimed_at = NOW(),
            attempts = r.attempts + 1,
            updated_at = NOW()
        FROM claimed
        WHERE r.id = claimed.id
        RETURNING r.id, r.workflow, r.payload, r.attempts, r.last_error
        "#,
    )
    .bind(lease_seconds)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Extend the lease on a claim. Returns false when the claim was superseded or finished.
pub async fn touch_run<'e, E>(executor: E, id: Uuid, attempts: i32) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE workflow_runs
         SET claimed_at = NOW(), updated_at = NOW()
         WHERE id = $1 AND attempts = $2 AND status = 'running'",
    )
    .bind(id)
    .bind(attempts)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Mark a claimed run done or failed and drop its journal rows
pub async fn finish_run<'e, E>(
    executor: E,
    id: Uuid,
    attempts: i32,
    status: &str,
    error: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        WITH finished AS (
            UPDATE workflow_runs
            SET status = $3,
                last_error = COALESCE($4, last_error),
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND attempts = $2 AND status = 'running'
            RETURNING id
        )
        DELETE FROM workflow_steps
        WHERE run_id IN (SELECT id FROM finished)
        "#,
    )
    .bind(id)
    .bind(attempts)
    .bind(status)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Hand a claimed run back to the queue, keeping its journal and attempt count
pub async fn requeue_run<'e, E>(
    executor: E,
    id: Uuid,
    attempts: i32,
    error: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "UPDATE workflow_runs
         SET status = 'queued', last_error = $3, claimed_at = NULL, updated_at = NOW()
         WHERE id = $1 AND attempts = $2 AND status = 'running'",
    )
    .bind(id)
    .bind(attempts)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Delete done and failed runs last touched more than `retention_hours` ago.
/// Step rows go with them via the foreign key cascade.
pub async fn purge_finished_runs<'e, E>(
    executor: E,
    retention_hours: i64,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "DELETE FROM workflow_runs
         WHERE status IN ('done', 'failed')
           AND updated_at < NOW() - $1 * INTERVAL '1 hour'",
    )
    .bind(retention_hours)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn step_output<'e, E>(
    executor: E,
    run_id: Uuid,
    step: &str,
) -> Result<Option<Value>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<Json<Value>> = sqlx::query_scalar(
        "SELECT output FROM workflow_steps WHERE run_id = $1 AND step = $2",
    )
    .bind(run_id)
    .bind(step)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|j| j.0))
}

pub async fn record_step<'e, E>(
    executor: E,
    run_id: Uuid,
    step: &str,
    output: &Value,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO workflow_steps (run_id, step, output)
         VALUES ($1, $2, $3)
         ON CONFLICT (run_id, step) DO NOTHING",
    )
    .bind(run_id)
    .bind(step)
    .bind(Json(output))
    .execute(executor)
    .await?;
    Ok(())
}
