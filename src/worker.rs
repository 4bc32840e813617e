//! Worker loop: claim queued jobs and run them through the engine.
//!
//! One worker processes one job at a time; parallelism comes from running
//! several worker processes against the same queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{error, info};

use crate::config::Settings;
use crate::db::queue;
use crate::execution::ExecutionEngine;
use crate::runner::CommandRuntime;

const IDLE_POLL: Duration = Duration::from_secs(1);

pub struct Worker {
    pool: PgPool,
    settings: Arc<Settings>,
    worker_id: String,
    engine: ExecutionEngine,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        settings: Arc<Settings>,
        runtime: Arc<dyn CommandRuntime>,
        worker_id: Option<String>,
    ) -> Result<Worker> {
        let worker_id =
            worker_id.unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
        let engine = ExecutionEngine::new(pool.clone(), settings.clone(), runtime)
            .context("Failed to initialize execution engine")?;
        Ok(Worker {
            pool,
            settings,
            worker_id,
            engine,
        })
    }

    /// Run until the process is stopped, claiming and executing jobs.
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.worker_id, queues = ?self.settings.worker.queues, "worker started");
        loop {
            match queue::claim(&self.pool, &self.worker_id, &self.settings.worker.queues).await {
                Ok(Some(job_id)) => {
                    info!(worker = %self.worker_id, job = %job_id, "claimed job");
                    if let Err(err) = self.engine.execute_job(job_id).await {
                        // the engine already persisted the failure; this only
                        // covers infrastructure errors around it
                        error!(worker = %self.worker_id, job = %job_id, error = %err,
                               "job execution aborted");
                        let _ = queue::mark_done(&self.pool, job_id).await;
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Err(err) => {
                    error!(worker = %self.worker_id, error = %err, "claim failed");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }
}
