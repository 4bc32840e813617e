use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pelican_core::api::Api;
use pelican_core::cli::{Cli, Commands};
use pelican_core::config::Settings;
use pelican_core::db;
use pelican_core::runner::SubprocessRuntime;
use pelican_core::types::JobFilter;
use pelican_core::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(Settings::load(cli.config.as_deref())?);
    let pool = db::connect(&settings).await?;

    match cli.command {
        Commands::Migrate => {
            db::migrate(&pool).await?;
            for process in pelican_core::builtin::builtin_processes()? {
                match db::processes::deploy(&pool, &process).await {
                    Ok(()) => println!("registered builtin process [{}]", process.id),
                    Err(_) => println!("builtin process [{}] already registered", process.id),
                }
            }
            println!("migrations complete");
        }
        Commands::Worker { worker_id } => {
            db::migrate(&pool).await?;
            let worker = Worker::new(
                pool,
                settings,
                Arc::new(SubprocessRuntime),
                worker_id,
            )?;
            worker.run().await?;
        }
        Commands::Deploy {
            id,
            reference,
            public,
        } => {
            let api = Api::new(pool.clone(), settings.clone())?;
            let payload = if std::path::Path::new(&reference).is_file() {
                let content = std::fs::read_to_string(&reference)
                    .with_context(|| format!("cannot read package file [{reference}]"))?;
                let unit: serde_json::Value = serde_yaml::from_str(&content)
                    .with_context(|| format!("cannot parse package file [{reference}]"))?;
                serde_json::json!({
                    "processDescription": {"process": {"id": id}},
                    "executionUnit": [{"unit": unit}],
                })
            } else {
                serde_json::json!({
                    "processDescription": {"process": {"id": id}},
                    "executionUnit": [{"href": reference}],
                })
            };
            let summary = api.deploy_process(payload, &HashMap::new()).await?;
            if public {
                api.set_visibility(&id, serde_json::json!({"value": "public"}))
                    .await?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Processes => {
            let api = Api::new(pool, settings)?;
            let list = api.list_processes().await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Commands::Status { job_id } => {
            let api = Api::new(pool, settings)?;
            let status = api.job_status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Jobs {
            process,
            status,
            limit,
        } => {
            let filter = JobFilter {
                process,
                service: None,
                status: status
                    .as_deref()
                    .map(str::parse)
                    .transpose()
                    .map_err(|err: String| anyhow::anyhow!(err))?,
                page: 0,
                limit,
            };
            let (jobs, total) = db::jobs::list_jobs(&pool, &filter).await?;
            println!("{total} job(s)");
            for job in jobs {
                println!(
                    "{}  {:<10} {:>3}%  {}",
                    job.id,
                    job.status.as_str(),
                    job.progress,
                    job.process
                );
            }
        }
        Commands::Dismiss { job_id } => {
            let api = Api::new(pool, settings)?;
            let body = api.dismiss_job(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}
