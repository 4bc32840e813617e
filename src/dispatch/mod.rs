//! Remote process dispatchers.
//!
//! Every backend adapter implements [`WpsProcess`]: a phased template
//! (`prepare -> stage inputs -> format I/O -> dispatch -> monitor ->
//! get results -> stage results -> cleanup`) driven by [`WpsProcess::execute`]
//! with contractual progress markers. Phases return values; errors are
//! reserved for genuine failures.

pub mod ades;
pub mod esgf;
pub mod ogc_api;
pub mod wps1;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::fetch::HttpClient;
use crate::io::IoValue;
use crate::stager::map_wps_output_location;

/// Contractual progress markers of the dispatch template.
pub mod progress {
    pub const PREPARE: i32 = 2;
    pub const READY: i32 = 5;
    pub const STAGE_IN: i32 = 10;
    pub const FORMAT_IO: i32 = 12;
    pub const EXECUTE: i32 = 15;
    pub const MONITOR: i32 = 20;
    pub const RESULTS: i32 = 85;
    pub const STAGE_OUT: i32 = 90;
    pub const CLEANUP: i32 = 95;
    pub const COMPLETED: i32 = 100;
}

/// Inputs of one dispatched execution, keyed by input id.
pub type WorkflowInputs = HashMap<String, IoValue>;

/// Expected outputs as `outputId -> glob pattern`.
pub type ExpectedOutputs = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub message: String,
    pub progress: i32,
}

/// Channel used by dispatchers to stream progress back to the engine.
pub type StatusSink = tokio::sync::mpsc::UnboundedSender<StatusUpdate>;

#[derive(Debug, Clone, Default)]
pub struct RemoteInput {
    pub id: String,
    pub href: Option<String>,
    pub data: Option<String>,
    pub media_type: Option<String>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteResult {
    pub id: String,
    pub href: Option<String>,
    pub value: Option<JsonValue>,
    pub media_type: Option<String>,
}

/// Opaque handle produced by `dispatch` and consumed by `monitor` /
/// `get_results`.
#[derive(Debug, Clone, Default)]
pub struct MonitorReference {
    pub location: String,
    pub payload: JsonValue,
}

/// Context shared by all dispatcher implementations.
pub struct DispatchContext {
    pub settings: std::sync::Arc<Settings>,
    pub http: HttpClient,
    /// Cancellation tombstone mirror; checked at every monitoring cycle.
    pub cancel: tokio_util::sync::CancellationToken,
    sink: StatusSink,
    temp_staging: Mutex<Vec<PathBuf>>,
}

impl DispatchContext {
    pub fn new(
        settings: std::sync::Arc<Settings>,
        sink: StatusSink,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<DispatchContext> {
        let http = HttpClient::new(settings.worker.request_timeout_secs)?;
        Ok(DispatchContext {
            settings,
            http,
            cancel,
            sink,
            temp_staging: Mutex::new(Vec::new()),
        })
    }

    /// Monitoring backoff: starts at the configured initial delay, doubles
    /// each step, capped at the configured maximum.
    pub fn wait_delay(&self, step: u32) -> std::time::Duration {
        let initial = self.settings.worker.monitor_initial_secs.max(1);
        let max = self.settings.worker.monitor_max_secs.max(initial);
        let delay = initial.saturating_mul(1u64 << step.min(16));
        std::time::Duration::from_secs(delay.min(max))
    }

    /// Sleep between monitoring polls, returning `false` when cancellation
    /// interrupted the wait.
    pub async fn monitor_sleep(&self, step: u32) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.wait_delay(step)) => true,
        }
    }

    pub fn update_status(&self, message: impl Into<String>, progress: i32) {
        let update = StatusUpdate {
            message: message.into(),
            progress,
        };
        // the engine may already have stopped draining on cancellation
        let _ = self.sink.send(update);
    }

    /// Host an intermediate file under the WPS output URL so another host
    /// can fetch it. Files already below the output directory are simply
    /// re-addressed.
    pub async fn host_file(&self, file_path: &str) -> Result<String> {
        let local = file_path.strip_prefix("file://").unwrap_or(file_path);
        let out_dir = &self.settings.wps.output_dir;
        let out_url = self.settings.wps.output_url.trim_end_matches('/');

        if let Ok(relative) = Path::new(local).strip_prefix(out_dir) {
            let href = format!("{out_url}/{}", relative.to_string_lossy());
            debug!(path = %local, %href, "file already hosted on WPS outputs");
            return Ok(href);
        }

        tokio::fs::create_dir_all(out_dir).await?;
        let staging = tempfile::Builder::new()
            .prefix("tmp")
            .tempdir_in(out_dir)?
            .keep();
        let staged = crate::fetch::link_or_copy(Path::new(local), &staging).await?;
        self.temp_staging.lock().await.push(staging.clone());
        let relative = staged
            .strip_prefix(out_dir)
            .unwrap_or(&staged)
            .to_string_lossy()
            .into_owned();
        let href = format!("{out_url}/{relative}");
        debug!(path = %local, %href, "hosting intermediate file");
        Ok(href)
    }

    async fn cleanup_staging(&self) {
        let mut staged = self.temp_staging.lock().await;
        for path in staged.drain(..) {
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "could not clean staging path");
                }
            }
        }
    }
}

#[async_trait]
pub trait WpsProcess: Send + Sync {
    fn ctx(&self) -> &DispatchContext;

    /// Implementation dependent preparation (deploys, credential checks).
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Convert runtime inputs into remote submission inputs, hosting any
    /// local file so the remote end can fetch it.
    async fn stage_inputs(&self, inputs: &WorkflowInputs) -> Result<Vec<RemoteInput>> {
        let mut remote = Vec::new();
        for (id, value) in inputs {
            stage_input_value(self.ctx(), id, value, &mut remote).await?;
        }
        remote.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(remote)
    }

    /// Reorganize inputs into the backend representation. Pass-through by
    /// default.
    fn format_inputs(&self, inputs: Vec<RemoteInput>) -> Result<Vec<RemoteInput>> {
        Ok(inputs)
    }

    /// Reorganize expected outputs into the backend representation.
    fn format_outputs(&self, outputs: Vec<RemoteOutput>) -> Result<Vec<RemoteOutput>> {
        Ok(outputs)
    }

    /// Submit the execution, returning the monitoring handle.
    async fn dispatch(
        &self,
        inputs: Vec<RemoteInput>,
        outputs: Vec<RemoteOutput>,
    ) -> Result<MonitorReference>;

    /// Block until the remote job reaches a terminal state.
    async fn monitor(&self, reference: &MonitorReference) -> Result<bool>;

    /// Obtain result locations (without fetching them).
    async fn get_results(&self, reference: &MonitorReference) -> Result<Vec<RemoteResult>>;

    /// Best-effort cancellation of the remote job.
    async fn dismiss(&self, _reference: &MonitorReference) {}

    /// Stage expected results into `out_dir`, bypassing the fetch when the
    /// reference resolves to a local file of this instance.
    async fn stage_results(
        &self,
        results: &[RemoteResult],
        expected_outputs: &ExpectedOutputs,
        out_dir: &Path,
    ) -> Result<()> {
        let ctx = self.ctx();
        for result in results {
            let Some(glob) = expected_outputs.get(&result.id) else {
                continue;
            };
            // nested glob components decide the staging sub-directory
            let dest_dir = match glob.rsplit_once('/') {
                Some((prefix, _)) => out_dir.join(prefix),
                None => out_dir.to_path_buf(),
            };
            let Some(href) = result.href.as_deref() else {
                // inline value: write it as a text file named by the output
                tokio::fs::create_dir_all(&dest_dir).await?;
                let value = result.value.clone().unwrap_or(JsonValue::Null);
                let dest = dest_dir.join(format!("{}.txt", result.id));
                tokio::fs::write(&dest, crate::io::json_scalar_to_string(&value)).await?;
                continue;
            };
            if let Some(local) = map_wps_output_location(href, &ctx.settings) {
                info!(output = %result.id, %href, "result resolved locally, skipping fetch");
                crate::fetch::link_or_copy(&local, &dest_dir).await?;
            } else {
                info!(output = %result.id, %href, "fetching remote result");
                ctx.http.download(href, &dest_dir).await?;
            }
        }
        Ok(())
    }

    /// Remove temporary staging artifacts.
    async fn cleanup(&self) {
        self.ctx().cleanup_staging().await;
    }

    /// Execute the full phased template against the remote backend.
    async fn execute(
        &self,
        inputs: &WorkflowInputs,
        out_dir: &Path,
        expected_outputs: &ExpectedOutputs,
    ) -> Result<()> {
        let ctx = self.ctx();
        ctx.update_status("Preparing process for remote execution.", progress::PREPARE);
        self.prepare().await?;
        ctx.update_status("Process ready for remote execution.", progress::READY);

        ctx.update_status("Staging inputs for remote execution.", progress::STAGE_IN);
        let staged = self.stage_inputs(inputs).await?;

        ctx.update_status(
            "Preparing inputs/outputs for remote execution.",
            progress::FORMAT_IO,
        );
        let process_inputs = self.format_inputs(staged)?;
        let process_outputs = self.format_outputs(
            expected_outputs
                .keys()
                .map(|id| RemoteOutput { id: id.clone() })
                .collect(),
        )?;

        ctx.update_status("Executing remote process job.", progress::EXECUTE);
        let reference = match self.dispatch(process_inputs, process_outputs).await {
            Ok(reference) => reference,
            Err(err) => {
                ctx.update_status(
                    "Running final cleanup operations following failed execution.",
                    progress::CLEANUP,
                );
                self.cleanup().await;
                return Err(wrap_dispatch_error(err));
            }
        };

        ctx.update_status(
            "Monitoring remote process job until completion.",
            progress::MONITOR,
        );
        match self.monitor(&reference).await {
            Ok(true) => {}
            Ok(false) => {
                ctx.update_status(
                    "Running final cleanup operations following failed execution.",
                    progress::CLEANUP,
                );
                self.cleanup().await;
                return Err(Error::PackageExecution(
                    "failed dispatch and monitoring of remote process execution".into(),
                ));
            }
            Err(err) => {
                if ctx.cancel.is_cancelled() {
                    // best-effort cancellation of the remote job
                    self.dismiss(&reference).await;
                }
                ctx.update_status(
                    "Running final cleanup operations following failed execution.",
                    progress::CLEANUP,
                );
                self.cleanup().await;
                return Err(wrap_dispatch_error(err));
            }
        }

        ctx.update_status("Retrieving job results definitions.", progress::RESULTS);
        let results = self.get_results(&reference).await?;

        ctx.update_status("Staging job outputs from remote process.", progress::STAGE_OUT);
        self.stage_results(&results, expected_outputs, out_dir).await?;

        ctx.update_status(
            "Running final cleanup operations before completion.",
            progress::CLEANUP,
        );
        self.cleanup().await;

        ctx.update_status(
            "Execution of remote process completed successfully.",
            progress::COMPLETED,
        );
        Ok(())
    }
}

fn wrap_dispatch_error(err: Error) -> Error {
    match err {
        err @ (Error::RemoteExecution(_)
        | Error::MonitoringTimeout(_)
        | Error::PackageExecution(_)) => err,
        other => Error::PackageExecution(format!(
            "dispatch and monitoring of remote process caused an unhandled error: {other}"
        )),
    }
}

async fn stage_input_value(
    ctx: &DispatchContext,
    id: &str,
    value: &IoValue,
    remote: &mut Vec<RemoteInput>,
) -> Result<()> {
    match value {
        IoValue::Array(values) => {
            // array inputs repeat the id once per value
            for item in values {
                Box::pin(stage_input_value(ctx, id, item, remote)).await?;
            }
        }
        IoValue::FileRef {
            href,
            media_type,
            encoding,
            ..
        } => {
            let href = if href.starts_with("file://") || !href.contains("://") {
                ctx.host_file(href).await?
            } else {
                href.clone()
            };
            remote.push(RemoteInput {
                id: id.to_string(),
                href: Some(href),
                data: None,
                media_type: media_type.clone(),
                encoding: encoding.clone(),
            });
        }
        IoValue::DirRef { href } => {
            remote.push(RemoteInput {
                id: id.to_string(),
                href: Some(href.clone()),
                data: None,
                media_type: Some(crate::io::MEDIA_TYPE_DIRECTORY.to_string()),
                encoding: None,
            });
        }
        IoValue::Literal { value, .. } => {
            remote.push(RemoteInput {
                id: id.to_string(),
                href: None,
                data: Some(crate::io::json_scalar_to_string(value)),
                media_type: None,
                encoding: None,
            });
        }
        IoValue::BBox { bbox, crs } => {
            let mut parts: Vec<String> = bbox.iter().map(f64::to_string).collect();
            if let Some(crs) = crs {
                parts.push(crs.clone());
            }
            remote.push(RemoteInput {
                id: id.to_string(),
                href: None,
                data: Some(parts.join(",")),
                media_type: None,
                encoding: None,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::DataType;

    pub(crate) fn test_context(
        settings: std::sync::Arc<Settings>,
    ) -> (DispatchContext, tokio::sync::mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = tokio_util::sync::CancellationToken::new();
        (DispatchContext::new(settings, tx, cancel).unwrap(), rx)
    }

    fn make_settings(dir: &Path) -> std::sync::Arc<Settings> {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = Settings::load(None).unwrap();
        settings.wps.output_dir = dir.to_path_buf();
        std::sync::Arc::new(settings)
    }

    #[tokio::test]
    async fn test_host_file_skips_files_already_hosted() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = make_settings(tmp.path());
        let (ctx, _rx) = test_context(settings.clone());

        let hosted = tmp.path().join("job/out.txt");
        tokio::fs::create_dir_all(hosted.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&hosted, b"x").await.unwrap();

        let href = ctx.host_file(hosted.to_str().unwrap()).await.unwrap();
        assert_eq!(href, format!("{}/job/out.txt", settings.wps.output_url));
    }

    #[tokio::test]
    async fn test_host_file_stages_external_files() {
        let out = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let settings = make_settings(out.path());
        let (ctx, _rx) = test_context(settings.clone());

        let source = elsewhere.path().join("data.nc");
        tokio::fs::write(&source, b"netcdf").await.unwrap();

        let href = ctx
            .host_file(&format!("file://{}", source.display()))
            .await
            .unwrap();
        assert!(href.starts_with(&settings.wps.output_url));
        assert!(href.ends_with("data.nc"));
        ctx.cleanup_staging().await;
    }

    #[tokio::test]
    async fn test_stage_input_value_repeats_arrays() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = make_settings(tmp.path());
        let (ctx, _rx) = test_context(settings);

        let mut remote = Vec::new();
        let value = IoValue::Array(vec![
            IoValue::Literal {
                data_type: DataType::Int,
                value: serde_json::json!(1),
            },
            IoValue::Literal {
                data_type: DataType::Int,
                value: serde_json::json!(2),
            },
        ]);
        stage_input_value(&ctx, "n", &value, &mut remote).await.unwrap();
        assert_eq!(remote.len(), 2);
        assert!(remote.iter().all(|i| i.id == "n"));
        assert_eq!(remote[0].data.as_deref(), Some("1"));
        assert_eq!(remote[1].data.as_deref(), Some("2"));
    }
}
