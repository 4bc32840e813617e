//! Job execution engine.
//!
//! Drives one claimed job from `STARTED` to a terminal status: loads the
//! process, stages inputs, executes locally or through a remote dispatcher,
//! monitors progress, stages results, collects statistics and notifies
//! subscribers. The engine is the sole writer of the job document while the
//! job is running.

pub mod inputs;
pub mod local;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{jobs, processes, queue, services};
use crate::dispatch::{
    esgf::EsgfCwtProcess, ogc_api::OgcApiProcess, wps1::Wps1Process, DispatchContext,
    ExpectedOutputs, StatusUpdate, WorkflowInputs, WpsProcess,
};
use crate::error::{Error, Result};
use crate::fetch::HttpClient;
use crate::io::{IoKind, IoValue};
use crate::package::{loader::PackageLoader, AppRequirement, Process};
use crate::results::make_results_relative;
use crate::runner::CommandRuntime;
use crate::stager::{cleanup_job_artifacts, ResultStager};
use crate::status::{progress, Status};
use crate::types::{Job, ResultRecord, ServiceKind};

/// Interval at which the cancellation tombstone is polled.
const TOMBSTONE_POLL: Duration = Duration::from_secs(2);

/// Marker line separating captured stdout from stderr in the merged log.
const RUNNER_COMPLETED_MARKER: &str = "Tool execution completed.";

pub struct ExecutionEngine {
    pool: PgPool,
    settings: Arc<Settings>,
    http: HttpClient,
    runtime: Arc<dyn CommandRuntime>,
}

impl ExecutionEngine {
    pub fn new(
        pool: PgPool,
        settings: Arc<Settings>,
        runtime: Arc<dyn CommandRuntime>,
    ) -> Result<ExecutionEngine> {
        let http = HttpClient::new(settings.worker.request_timeout_secs)?;
        Ok(ExecutionEngine {
            pool,
            settings,
            http,
            runtime,
        })
    }

    /// Execute one claimed job to completion. Idempotent on the job id: a
    /// redelivered task for a finished job is a no-op.
    pub async fn execute_job(&self, job_id: Uuid) -> Result<Status> {
        let mut job = jobs::fetch_by_id(&self.pool, job_id)
            .await?
            .ok_or(Error::NoSuchJob(job_id))?;
        if job.status.is_terminal() {
            debug!(job = %job_id, status = %job.status, "job already finished, skipping");
            return Ok(job.status);
        }

        let rss_start = current_rss();

        job.status = Status::Started;
        job.started_at = Some(chrono::Utc::now());
        job.progress = progress::SETUP;
        job.wps_id = Some(job.id);
        job = jobs::update_job(&self.pool, &job).await?;
        self.log(&job, "Job task setup completed.").await;

        // cancellation watcher mirrors the queue tombstone into a token
        let cancel = CancellationToken::new();
        let watcher = {
            let pool = self.pool.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(TOMBSTONE_POLL).await;
                    match queue::is_cancelled(&pool, job_id).await {
                        Ok(true) => {
                            token.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(job = %job_id, error = %err, "tombstone poll failed");
                        }
                    }
                }
            })
        };

        let timeout = Duration::from_secs(self.settings.worker.job_timeout_secs);
        let outcome = match tokio::time::timeout(
            timeout,
            self.run_job(&mut job, cancel.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::MonitoringTimeout(format!(
                "job exceeded the wall-clock limit of {}s",
                timeout.as_secs()
            ))),
        };
        watcher.abort();

        let cancelled = queue::is_cancelled(&self.pool, job_id).await.unwrap_or(false);
        match outcome {
            Ok(records) => {
                job.results = make_results_relative(records, &self.settings);
                job.progress = progress::COLLECT_DONE;
                job.statistics = Some(self.collect_statistics(&job, rss_start).await);
                job = jobs::update_job(&self.pool, &job).await?;

                job.progress = progress::NOTIFY;
                crate::notify::notify_job_subscribers(&self.pool, &job, &self.settings).await;

                job.status = Status::Succeeded;
                job.progress = progress::DONE;
                job.finished_at = Some(chrono::Utc::now());
                job = jobs::update_job(&self.pool, &job).await?;
                self.log(&job, "Job succeeded.").await;
                self.write_status_artifacts(&job, "Job succeeded.").await;
            }
            Err(err) => {
                // a failure raised because the task was dismissed is not a
                // failure: rewrite it and remove every staged artifact
                if cancelled {
                    cleanup_job_artifacts(&job, &self.settings).await;
                    job.status = Status::Dismissed;
                    job.finished_at = Some(chrono::Utc::now());
                    job = jobs::update_job(&self.pool, &job).await?;
                    self.log(&job, "Job dismissed.").await;
                } else {
                    error!(job = %job.id, error = %err, "job execution failed");
                    job.exceptions.push(err.to_json());
                    job.status = Status::Failed;
                    job.finished_at = Some(chrono::Utc::now());
                    job = jobs::update_job(&self.pool, &job).await?;
                    let message = format!("Failed to run job: {err}");
                    self.log(&job, &message).await;
                    self.write_status_artifacts(&job, &message).await;
                }
                crate::notify::notify_job_subscribers(&self.pool, &job, &self.settings).await;
            }
        }

        queue::mark_done(&self.pool, job_id).await?;
        self.log(&job, "Job task complete.").await;
        Ok(job.status)
    }

    async fn run_job(
        &self,
        job: &mut Job,
        cancel: CancellationToken,
    ) -> Result<Vec<ResultRecord>> {
        let process = self.load_process(job).await?;
        self.log(job, &format!("Execute process [{}]", process.tagged_id()))
            .await;

        job.progress = progress::STAGE_INPUTS;
        *job = jobs::update_job(&self.pool, job).await?;
        self.log(job, "Fetching job input definitions.").await;
        let mut workflow_inputs =
            inputs::parse_job_inputs(job.inputs.as_ref(), &process.inputs)?;

        job.progress = progress::PLAN_OUTPUTS;
        self.log(job, "Fetching job output definitions.").await;
        let expected = expected_outputs_with_literals(&process);

        let workdir = tempfile::Builder::new().prefix("pelican-job").tempdir()?;

        let run_locally = matches!(
            process.requirement,
            AppRequirement::Builtin { .. } | AppRequirement::Docker { .. }
        ) && self.settings.mode.supports_local();
        if run_locally {
            self.log(job, "Staging job inputs locally.").await;
            inputs::stage_input_files(
                &mut workflow_inputs,
                workdir.path(),
                &self.settings,
                &self.http,
            )
            .await?;
            job.progress = progress::STAGE_INPUTS_DONE;
            *job = jobs::update_job(&self.pool, job).await?;
        }

        // dispatcher progress streams into the monitoring window
        let (sink, drain) = self.progress_drain(job.id);

        job.status = Status::Running;
        job.progress = progress::EXECUTE;
        *job = jobs::update_job(&self.pool, job).await?;
        self.log(job, "Starting job process execution.").await;
        self.log(
            job,
            "Following updates could take a while until the application package answers...",
        )
        .await;

        let stager = ResultStager::new(self.settings.clone()).await;
        let result = self
            .dispatch_execution(
                job,
                &process,
                &mut workflow_inputs,
                &expected,
                workdir.path(),
                sink,
                cancel,
                &stager,
            )
            .await;
        drain.abort();

        let records = result?;
        job.progress = progress::COLLECT;
        *job = jobs::update_job(&self.pool, job).await?;
        self.log(job, "Generating job results for response.").await;
        Ok(records)
    }

    /// Resolve the target process: a local deployment, or a lazily described
    /// process of a registered remote provider.
    async fn load_process(&self, job: &Job) -> Result<Process> {
        match &job.service {
            None => processes::fetch_by_id(&self.pool, &job.process).await,
            Some(service_name) => {
                let service = services::fetch_by_name(&self.pool, service_name).await?;
                let reference = match service.kind {
                    ServiceKind::Wps1 | ServiceKind::Wps2 => format!(
                        "{}?service=WPS&version=1.0.0&request=DescribeProcess&identifier={}",
                        service.url, job.process
                    ),
                    ServiceKind::Oap => {
                        format!("{}/processes/{}", service.url.trim_end_matches('/'), job.process)
                    }
                };
                let loader = PackageLoader::new(self.settings.clone())?;
                let (package, info) = loader.resolve_reference(&reference, None).await?;
                let offering = json!({"id": job.process, "title": info.get("title")});
                loader
                    .load_process(
                        &self.pool,
                        &offering,
                        crate::package::loader::PackageSource::Inline(package.raw),
                        &HashMap::new(),
                    )
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_execution(
        &self,
        job: &mut Job,
        process: &Process,
        workflow_inputs: &mut WorkflowInputs,
        expected: &ExpectedOutputs,
        workdir: &Path,
        sink: crate::dispatch::StatusSink,
        cancel: CancellationToken,
        stager: &ResultStager,
    ) -> Result<Vec<ResultRecord>> {
        match &process.requirement {
            AppRequirement::Workflow => {
                let ctx = crate::workflow::WorkflowContext {
                    settings: self.settings.clone(),
                    sink,
                    cancel,
                    http: self.http.clone(),
                    runtime: self.runtime.as_ref(),
                    forwarded_auth: None,
                };
                let finals = crate::workflow::run_workflow(
                    &ctx,
                    &process.package,
                    &process.step_packages,
                    workflow_inputs,
                    workdir,
                )
                .await?;
                self.stage_hosted_outputs(job, finals, stager).await
            }
            AppRequirement::OgcApi { process: url } => {
                let ctx = DispatchContext::new(self.settings.clone(), sink, cancel)?;
                let dispatcher = OgcApiProcess::new(ctx, url)?;
                dispatcher.execute(workflow_inputs, workdir, expected).await?;
                self.collect_dispatched_outputs(job, process, expected, workdir, stager)
                    .await
            }
            AppRequirement::Wps1 { provider, process: id } => {
                let ctx = DispatchContext::new(self.settings.clone(), sink, cancel)?;
                let dispatcher = Wps1Process::new(ctx, provider, id);
                dispatcher.execute(workflow_inputs, workdir, expected).await?;
                self.collect_dispatched_outputs(job, process, expected, workdir, stager)
                    .await
            }
            AppRequirement::EsgfCwt { provider, process: id } => {
                let ctx = DispatchContext::new(self.settings.clone(), sink, cancel)?;
                let dispatcher = EsgfCwtProcess::new(ctx, provider, id);
                dispatcher.execute(workflow_inputs, workdir, expected).await?;
                self.collect_dispatched_outputs(job, process, expected, workdir, stager)
                    .await
            }
            requirement @ (AppRequirement::Builtin { .. } | AppRequirement::Docker { .. }) => {
                if !self.settings.mode.supports_local() {
                    return Err(Error::PackageExecution(format!(
                        "requirement [{}] cannot execute on this instance",
                        requirement.class_name()
                    )));
                }
                let run = local::execute_tool(
                    &process.package,
                    requirement,
                    &process.outputs,
                    workflow_inputs,
                    workdir,
                    self.runtime.as_ref(),
                    &self.http,
                    &cancel,
                )
                .await;
                // captured subprocess logs merge into the job log in
                // chronological order around the completion marker
                if let Ok(run) = &run {
                    self.merge_captured_logs(job, &run.stdout, &run.stderr).await;
                }
                let run = run?;
                let mut records = Vec::new();
                for output in run.outputs {
                    match output {
                        local::CollectedOutput::Literal {
                            id,
                            value,
                            data_type,
                        } => records.push(ResultRecord {
                            id,
                            value: Some(value),
                            data_type,
                            ..Default::default()
                        }),
                        local::CollectedOutput::File {
                            id,
                            paths,
                            media_type,
                        } => {
                            for path in paths {
                                records.push(
                                    stager
                                        .stage_output(job, &id, &path, media_type.as_deref())
                                        .await?,
                                );
                            }
                        }
                    }
                }
                Ok(records)
            }
        }
    }

    /// Stage dispatcher-fetched outputs from the work directory into their
    /// final location.
    async fn collect_dispatched_outputs(
        &self,
        job: &Job,
        process: &Process,
        expected: &ExpectedOutputs,
        workdir: &Path,
        stager: &ResultStager,
    ) -> Result<Vec<ResultRecord>> {
        let mut records = Vec::new();
        for def in &process.outputs {
            let Some(glob) = expected.get(&def.id) else {
                continue;
            };
            let flat = glob.rsplit('/').next().unwrap_or(glob);
            let dir = workdir.join(&def.id);
            if def.kind == IoKind::Literal {
                let value_file = dir.join(format!("{}.txt", def.id));
                if value_file.is_file() {
                    let text = tokio::fs::read_to_string(&value_file).await?;
                    records.push(ResultRecord {
                        id: def.id.clone(),
                        value: Some(JsonValue::String(text)),
                        data_type: def
                            .literal
                            .as_ref()
                            .map(|domain| domain.data_type.as_str().to_string()),
                        ..Default::default()
                    });
                }
                continue;
            }
            let matcher = glob::Pattern::new(flat).map_err(|err| {
                Error::PackageExecution(format!("invalid output glob [{flat}]: {err}"))
            })?;
            let mut found = false;
            if dir.is_dir() {
                let mut paths: Vec<_> = std::fs::read_dir(&dir)?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| {
                        path.is_file()
                            && path
                                .file_name()
                                .map(|n| matcher.matches(&n.to_string_lossy()))
                                .unwrap_or(false)
                    })
                    .collect();
                paths.sort();
                for path in paths {
                    found = true;
                    records.push(
                        stager
                            .stage_output(job, &def.id, &path, def.default_format().map(|f| f.media_type.as_str()))
                            .await?,
                    );
                }
            }
            if !found {
                return Err(Error::PackageExecution(format!(
                    "remote execution produced no file for expected output '{}'",
                    def.id
                )));
            }
        }
        Ok(records)
    }

    /// Stage workflow final outputs (hosted URLs) into the job output
    /// location.
    async fn stage_hosted_outputs(
        &self,
        job: &Job,
        finals: HashMap<String, IoValue>,
        stager: &ResultStager,
    ) -> Result<Vec<ResultRecord>> {
        let mut records = Vec::new();
        for (id, value) in finals {
            let values = match value {
                IoValue::Array(values) => values,
                single => vec![single],
            };
            for value in values {
                match value {
                    IoValue::FileRef { href, media_type, .. } => {
                        let local = crate::stager::map_wps_output_location(&href, &self.settings)
                            .ok_or_else(|| {
                                Error::PackageExecution(format!(
                                    "workflow output '{id}' is not hosted locally: {href}"
                                ))
                            })?;
                        records.push(
                            stager
                                .stage_output(job, &id, &local, media_type.as_deref())
                                .await?,
                        );
                    }
                    IoValue::Literal { value, .. } => {
                        records.push(ResultRecord {
                            id: id.clone(),
                            value: Some(value),
                            ..Default::default()
                        });
                    }
                    other => {
                        warn!(output = %id, "unsupported workflow output value {other:?}");
                    }
                }
            }
        }
        Ok(records)
    }

    /// Spawn the drain task persisting dispatcher status updates as log
    /// entries and monotonic progress, mapped into the monitoring window.
    fn progress_drain(
        &self,
        job_id: Uuid,
    ) -> (crate::dispatch::StatusSink, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StatusUpdate>();
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let mapped = progress::map_range(
                    update.progress as f64,
                    progress::EXECUTE,
                    progress::MONITOR_DONE,
                );
                let _ = jobs::save_log(
                    &pool,
                    job_id,
                    "INFO",
                    &update.message,
                    Some(mapped),
                    Some(Status::Running),
                )
                .await;
                // progress is monotonic non-decreasing inside RUNNING
                let _ = sqlx::query(
                    "UPDATE jobs SET progress = GREATEST(progress, $2) WHERE id = $1",
                )
                .bind(job_id)
                .bind(mapped)
                .execute(&pool)
                .await;
            }
        });
        (tx, handle)
    }

    /// Merge captured stdout/stderr into the job log, stdout first, then the
    /// completion marker, then stderr, so interleaved reads stay coherent.
    async fn merge_captured_logs(&self, job: &Job, stdout: &str, stderr: &str) {
        for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
            let _ = jobs::save_log(&self.pool, job.id, "INFO", line, None, Some(Status::Running))
                .await;
        }
        let _ = jobs::save_log(
            &self.pool,
            job.id,
            "INFO",
            RUNNER_COMPLETED_MARKER,
            None,
            Some(Status::Running),
        )
        .await;
        for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
            let _ = jobs::save_log(&self.pool, job.id, "WARNING", line, None, Some(Status::Running))
                .await;
        }
    }

    /// RSS diff against the pre-execution baseline plus per-output sizes.
    async fn collect_statistics(&self, job: &Job, rss_start: Option<u64>) -> JsonValue {
        let mut stats = json!({});
        if let Some(rss) = current_rss() {
            let mut process_stats = json!({"rssBytes": rss});
            if let Some(start) = rss_start {
                process_stats["usedMemoryBytes"] = json!(rss.saturating_sub(start));
            }
            stats["process"] = process_stats;
        }

        let mut outputs = json!({});
        let mut total: u64 = 0;
        for record in &job.results {
            let Some(href) = &record.href else { continue };
            // pseudo-relative references resolve below the output directory
            let path = if href.starts_with('/') && !href.contains("://") {
                self.settings.wps.output_dir.join(href.trim_start_matches('/'))
            } else {
                continue;
            };
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                outputs[&record.id] = json!({"sizeBytes": meta.len()});
                total += meta.len();
            }
        }
        stats["outputs"] = outputs;
        stats["totalSizeBytes"] = json!(total);
        stats
    }

    /// Persist the `{jobId}.xml` status document and `{jobId}.log` text log
    /// next to the job outputs. Failures only log.
    async fn write_status_artifacts(&self, job: &Job, message: &str) {
        let base = match &job.context {
            Some(context) if !context.is_empty() => {
                self.settings.wps.output_dir.join(context.trim_matches('/'))
            }
            _ => self.settings.wps.output_dir.clone(),
        };
        if let Err(err) = tokio::fs::create_dir_all(&base).await {
            warn!(job = %job.id, error = %err, "cannot create output directory");
            return;
        }

        let xml = crate::package::wps_xml::build_status_document(
            &job.id,
            job.status,
            job.progress,
            message,
        );
        if let Err(err) = tokio::fs::write(base.join(format!("{}.xml", job.id)), xml).await {
            warn!(job = %job.id, error = %err, "cannot write status document");
        }

        match jobs::fetch_logs(&self.pool, job.id).await {
            Ok(entries) => {
                let mut text = String::new();
                for entry in entries {
                    text.push_str(&format!(
                        "[{}] {:>7} {}\n",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.level,
                        entry.message
                    ));
                }
                if let Err(err) =
                    tokio::fs::write(base.join(format!("{}.log", job.id)), text).await
                {
                    warn!(job = %job.id, error = %err, "cannot write job log file");
                }
            }
            Err(err) => warn!(job = %job.id, error = %err, "cannot read job log entries"),
        }
    }

    async fn log(&self, job: &Job, message: &str) {
        debug!(job = %job.id, "{message}");
        if let Err(err) = jobs::save_log(
            &self.pool,
            job.id,
            "INFO",
            message,
            Some(job.progress),
            Some(job.status),
        )
        .await
        {
            warn!(job = %job.id, error = %err, "could not persist job log entry");
        }
    }
}

/// Expected outputs including literal placeholders staged as text files.
fn expected_outputs_with_literals(process: &Process) -> ExpectedOutputs {
    process
        .outputs
        .iter()
        .map(|def| {
            let glob = def.glob.as_deref().unwrap_or("*");
            let flat = glob.rsplit('/').next().unwrap_or(glob);
            match def.kind {
                IoKind::Literal => (def.id.clone(), format!("{}/{}.txt", def.id, def.id)),
                _ => (def.id.clone(), format!("{}/{flat}", def.id)),
            }
        })
        .collect()
}

fn current_rss() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DataType, Format, LiteralDomain, OutputDef};

    fn output_def(id: &str, kind: IoKind, glob: Option<&str>) -> OutputDef {
        OutputDef {
            id: id.to_string(),
            title: None,
            description: None,
            keywords: vec![],
            kind,
            array: false,
            literal: matches!(kind, IoKind::Literal)
                .then(|| LiteralDomain::new(DataType::String)),
            formats: vec![Format::new("text/plain")],
            glob: glob.map(String::from),
        }
    }

    #[test]
    fn test_expected_outputs_strip_nested_directories() {
        let mut process_outputs = vec![
            output_def("result", IoKind::ComplexFile, Some("nested/dir/*.nc")),
            output_def("text", IoKind::Literal, None),
        ];
        let process = Process {
            id: "p".into(),
            version: None,
            title: None,
            description: None,
            keywords: vec![],
            package: crate::package::Package::new(json!({"class": "CommandLineTool"})),
            inputs: vec![],
            outputs: std::mem::take(&mut process_outputs),
            requirement: AppRequirement::Builtin { process: None },
            auth: None,
            visibility: crate::types::Visibility::Public,
            job_control_options: vec![],
            step_packages: Default::default(),
        };
        let expected = expected_outputs_with_literals(&process);
        assert_eq!(expected.get("result").map(String::as_str), Some("result/*.nc"));
        assert_eq!(expected.get("text").map(String::as_str), Some("text/text.txt"));
    }

    #[test]
    fn test_current_rss_reports_some_value() {
        // the reading itself must work on the host running the tests
        assert!(current_rss().unwrap_or(0) > 0);
    }
}
