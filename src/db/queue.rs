//! Claim-based worker queue.
//!
//! Submission enqueues one row per job; workers claim with
//! `FOR UPDATE SKIP LOCKED` so the process pool runs many jobs in parallel
//! with each task delivered to exactly one live worker at a time.
//! Cancellation sets a tombstone the engine polls at every monitoring cycle.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::Result;

/// Enqueue a task referencing the job.
pub async fn enqueue(pool: &PgPool, job_id: Uuid, queue: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_queue (job_id, queue)
        VALUES ($1, $2)
        ON CONFLICT (job_id) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(queue)
    .execute(pool)
    .await?;
    Ok(())
}

/// Claim the next pending task for this worker.
pub async fn claim(pool: &PgPool, worker_id: &str, queues: &[String]) -> Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        UPDATE job_queue
        SET worker_id = $1,
            claimed_at = NOW()
        WHERE job_id = (
            SELECT job_id FROM job_queue
            WHERE queue = ANY($2)
              AND claimed_at IS NULL
              AND cancelled = FALSE
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING job_id
        "#,
    )
    .bind(worker_id)
    .bind(queues)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("job_id")))
}

/// Mark a claimed task as finished.
pub async fn mark_done(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_queue
        SET done_at = NOW()
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set the cancellation tombstone.
///
/// Returns whether the task had already been claimed by a worker; an
/// unclaimed task will simply never start.
pub async fn cancel(pool: &PgPool, job_id: Uuid) -> Result<Option<bool>> {
    let row = sqlx::query(
        r#"
        UPDATE job_queue
        SET cancelled = TRUE
        WHERE job_id = $1
        RETURNING claimed_at IS NOT NULL AS claimed
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("claimed")))
}

/// Check the cancellation tombstone.
pub async fn is_cancelled(pool: &PgPool, job_id: Uuid) -> Result<bool> {
    let row = sqlx::query("SELECT cancelled FROM job_queue WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("cancelled")).unwrap_or(false))
}

/// Whether the task finished (used by the scheduler's bounded sync wait).
pub async fn is_done(pool: &PgPool, job_id: Uuid) -> Result<bool> {
    let row = sqlx::query("SELECT done_at IS NOT NULL AS done FROM job_queue WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("done")).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::jobs;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_claim_and_tombstone() {
        let settings = crate::config::Settings::load(None).unwrap();
        let pool = crate::db::connect(&settings).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();

        let job = jobs::tests::sample_job();
        jobs::save_job(&pool, &job).await.unwrap();
        enqueue(&pool, job.id, "default").await.unwrap();

        assert!(!is_cancelled(&pool, job.id).await.unwrap());

        let claimed = claim(&pool, "test-worker", &["default".to_string()])
            .await
            .unwrap();
        assert_eq!(claimed, Some(job.id));

        // a second claim finds nothing
        let nothing = claim(&pool, "test-worker", &["default".to_string()])
            .await
            .unwrap();
        assert_eq!(nothing, None);

        assert_eq!(cancel(&pool, job.id).await.unwrap(), Some(true));
        assert!(is_cancelled(&pool, job.id).await.unwrap());
    }
}
