//! Postgres persistence: pool factory, migrations, and the job, process,
//! service and queue stores.

pub mod jobs;
pub mod processes;
pub mod queue;
pub mod services;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Settings;

/// Create a connection pool from the settings.
pub async fn connect(settings: &Settings) -> Result<PgPool> {
    let url = settings
        .database_url()
        .context("Failed to resolve database URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .min_connections(settings.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            settings.database.acquire_timeout_secs,
        ))
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    Ok(pool)
}

/// Run database migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    Ok(())
}
