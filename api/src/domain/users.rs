//! User domain - plan lookup and the daily usage ledger
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use chrono::NaiveDate;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct UsageRow {
    pub daily_count: i32,
    pub reset_boundary: NaiveDate,
}

/// Create the user row with defaults if it doesn't exist yet
pub async fn ensure_user<'e, E>(executor: E, user_id: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn get_plan<'e, E>(executor: E, user_id: Uuid) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar("SELECT plan FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

pub async fn get_usage<'e, E>(executor: E, user_id: Uuid) -> Result<Option<UsageRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as("SELECT daily_count, reset_boundary FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

/// Take up to `requested` slots without passing `limit`, resetting the count
/// first if `today` is past the stored boundary. The row lock makes the
/// check and the increment one step. Returns the number granted; a grant of
/// zero writes nothing.
pub async fn reserve<'e, E>(
    executor: E,
    user_id: Uuid,
    limit: i32,
    requested: i32,
    today: NaiveDate,
) -> Result<i32, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let granted: Option<i32> = sqlx::query_scalar(
        r#"
        WITH current AS (
            SELECT id,
                   CASE WHEN reset_boundary < $4 THEN 0 ELSE daily_count END AS effective
            FROM users
            WHERE id = $1
            FOR UPDATE
        ),
        grant_calc AS (
            SELECT id, effective, LEAST($3, GREATEST($2 - effective, 0)) AS granted
            FROM current
        )
        UPDATE users u
        SET daily_count = g.effective + g.granted,
            reset_boundary = GREATEST(u.reset_boundary, $4)
        FROM grant_calc g
        WHERE u.id = g.id AND g.granted > 0
        RETURNING g.granted
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(requested)
    .bind(today)
    .fetch_optional(executor)
    .await?;

    Ok(granted.unwrap_or(0))
}

/// Return unused slots. Slots taken before the current boundary are already gone.
pub async fn release<'e, E>(
    executor: E,
    user_id: Uuid,
    count: i32,
    today: NaiveDate,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        "UPDATE users
         SET daily_count = GREATEST(daily_count - $2, 0)
         WHERE id = $1 AND reset_boundary >= $3",
    )
    .bind(user_id)
    .bind(count)
    .bind(today)
    .execute(executor)
    .await?;
    Ok(())
}
