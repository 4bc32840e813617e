//! Job persistence and the append-only job log.
//!
//! The execution engine is the only writer while a job is running; updates
//! are last-writer-wins over an optimistic revision counter. Log entries get
//! a globally monotonic sequence number so interleaved writes from the
//! engine and the runner reconcile at read time.

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::status::Status;
use crate::types::{Job, JobFilter, JobLogEntry, Subscribers};

fn job_from_row(row: &PgRow) -> Result<Job> {
    let results: JsonValue = row.get("results");
    let exceptions: JsonValue = row.get("exceptions");
    let subscribers: Option<JsonValue> = row.get("subscribers");
    Ok(Job {
        id: row.get("id"),
        process: row.get("process"),
        service: row.get("service"),
        status: row.get("status"),
        progress: row.get("progress"),
        inputs: row.get("inputs"),
        outputs: row.get("outputs"),
        results: serde_json::from_value(results)?,
        exceptions: serde_json::from_value(exceptions)?,
        statistics: row.get("statistics"),
        subscribers: subscribers
            .map(serde_json::from_value::<Subscribers>)
            .transpose()?,
        execute_async: row.get("execute_async"),
        execute_response: row.get("execute_response"),
        accept_language: row.get("accept_language"),
        context: row.get("context"),
        task_id: row.get("task_id"),
        wps_id: row.get("wps_id"),
        revision: row.get("revision"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

/// Persist a newly accepted job.
pub async fn save_job(pool: &PgPool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, process, service, status, progress, inputs, outputs,
            results, exceptions, statistics, subscribers,
            execute_async, execute_response, accept_language, context,
            task_id, wps_id, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                  $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(job.id)
    .bind(&job.process)
    .bind(&job.service)
    .bind(job.status)
    .bind(job.progress)
    .bind(&job.inputs)
    .bind(&job.outputs)
    .bind(serde_json::to_value(&job.results)?)
    .bind(serde_json::to_value(&job.exceptions)?)
    .bind(&job.statistics)
    .bind(
        job.subscribers
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?,
    )
    .bind(job.execute_async)
    .bind(job.execute_response)
    .bind(&job.accept_language)
    .bind(&job.context)
    .bind(&job.task_id)
    .bind(job.wps_id)
    .bind(job.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a job by id.
pub async fn fetch_by_id(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Update mutable job fields, bumping the optimistic revision.
pub async fn update_job(pool: &PgPool, job: &Job) -> Result<Job> {
    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            progress = $3,
            results = $4,
            exceptions = $5,
            statistics = $6,
            task_id = $7,
            wps_id = $8,
            started_at = $9,
            finished_at = $10,
            revision = revision + 1
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(job.id)
    .bind(job.status)
    .bind(job.progress)
    .bind(serde_json::to_value(&job.results)?)
    .bind(serde_json::to_value(&job.exceptions)?)
    .bind(&job.statistics)
    .bind(&job.task_id)
    .bind(job.wps_id)
    .bind(job.started_at)
    .bind(job.finished_at)
    .fetch_one(pool)
    .await?;
    job_from_row(&row)
}

/// Append a chronologically ordered log entry for a job.
pub async fn save_log(
    pool: &PgPool,
    job_id: Uuid,
    level: &str,
    message: &str,
    progress: Option<i32>,
    status: Option<Status>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_logs (job_id, level, message, progress, status)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(job_id)
    .bind(level)
    .bind(message)
    .bind(progress)
    .bind(status.map(|s| s.as_str()))
    .execute(pool)
    .await?;
    Ok(())
}

/// All log entries of a job, ordered by sequence number.
pub async fn fetch_logs(pool: &PgPool, job_id: Uuid) -> Result<Vec<JobLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM job_logs
        WHERE job_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| JobLogEntry {
            seq: row.get("seq"),
            job_id: row.get("job_id"),
            created_at: row.get("created_at"),
            level: row.get("level"),
            message: row.get("message"),
            progress: row.get("progress"),
            status: row.get("status"),
        })
        .collect())
}

/// Append an exception record to the job.
pub async fn append_exception(pool: &PgPool, job_id: Uuid, exception: JsonValue) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET exceptions = exceptions || $2::jsonb
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JsonValue::Array(vec![exception]))
    .execute(pool)
    .await?;
    Ok(())
}

/// List jobs matching the filter, most recent first, with the total count.
pub async fn list_jobs(pool: &PgPool, filter: &JobFilter) -> Result<(Vec<Job>, i64)> {
    let limit = if filter.limit > 0 { filter.limit } else { 20 };
    let offset = filter.page.max(0) * limit;

    let rows = sqlx::query(
        r#"
        SELECT *, COUNT(*) OVER() AS total FROM jobs
        WHERE ($1::text IS NULL OR process = $1)
          AND ($2::text IS NULL OR service = $2)
          AND ($3::text IS NULL OR status = $3)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(&filter.process)
    .bind(&filter.service)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total = rows
        .first()
        .map(|row| row.get::<i64, _>("total"))
        .unwrap_or(0);
    let mut jobs = Vec::with_capacity(rows.len());
    for row in &rows {
        jobs.push(job_from_row(row)?);
    }
    Ok((jobs, total))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::ExecuteResponse;
    use chrono::Utc;

    pub(crate) fn sample_job() -> Job {
        Job {
            id: Uuid::new_v4(),
            process: "echo".into(),
            service: None,
            status: Status::Accepted,
            progress: 0,
            inputs: Some(serde_json::json!({"message": "hello"})),
            outputs: None,
            results: vec![],
            exceptions: vec![],
            statistics: None,
            subscribers: None,
            execute_async: true,
            execute_response: ExecuteResponse::Document,
            accept_language: None,
            context: None,
            task_id: None,
            wps_id: None,
            revision: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_save_fetch_update_roundtrip() {
        let settings = crate::config::Settings::load(None).unwrap();
        let pool = crate::db::connect(&settings).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();

        let mut job = sample_job();
        save_job(&pool, &job).await.unwrap();

        let fetched = fetch_by_id(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, Status::Accepted);
        assert_eq!(fetched.revision, 0);

        job.status = Status::Started;
        job.progress = 1;
        let updated = update_job(&pool, &job).await.unwrap();
        assert_eq!(updated.status, Status::Started);
        assert_eq!(updated.revision, 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_log_sequence_is_monotonic() {
        let settings = crate::config::Settings::load(None).unwrap();
        let pool = crate::db::connect(&settings).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();

        let job = sample_job();
        save_job(&pool, &job).await.unwrap();
        for i in 0..3 {
            save_log(&pool, job.id, "INFO", &format!("line {i}"), Some(i), None)
                .await
                .unwrap();
        }
        let logs = fetch_logs(&pool, job.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.windows(2).all(|w| w[0].seq < w[1].seq));
    }
}
