//! Job submission: execute body validation, `Prefer` negotiation, job
//! creation, task enqueue and the bounded synchronous wait.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{jobs, processes, queue, services};
use crate::error::{Error, Result};
use crate::notify::SubscriberRequest;
use crate::results::{job_results_response, ResultsResponse};
use crate::status::Status;
use crate::types::{
    ExecuteMode, ExecuteResponse, Job, JobControlOption, Visibility,
};

/// Validated OGC execute request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub inputs: Option<JsonValue>,
    #[serde(default)]
    pub outputs: Option<JsonValue>,
    #[serde(default)]
    pub mode: ExecuteMode,
    #[serde(default)]
    pub response: ExecuteResponse,
    #[serde(default)]
    pub subscribers: SubscriberRequest,
    /// Back-compat alias for `successEmail` + `failedEmail`.
    #[serde(default)]
    pub notification_email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferHeader {
    pub respond_async: bool,
    pub wait: Option<u64>,
}

/// Parse `Prefer: respond-async, wait=<seconds>` (RFC 7240).
pub fn parse_prefer_header(value: &str) -> PreferHeader {
    let mut prefer = PreferHeader::default();
    for token in value.split([',', ';']) {
        let token = token.trim();
        if token.eq_ignore_ascii_case("respond-async") {
            prefer.respond_async = true;
        } else if let Some(wait) = token
            .strip_prefix("wait=")
            .or_else(|| token.strip_prefix("wait ="))
        {
            prefer.wait = wait.trim().parse().ok();
        }
    }
    prefer
}

/// Effective execution mode after negotiating the `Prefer` header, the body
/// `mode` and the process `jobControlOptions`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMode {
    pub execute_async: bool,
    /// Bounded sync wait, already clipped to the server maximum.
    pub wait_secs: u64,
    /// `Preference-Applied` header value to echo, when anything was applied.
    pub applied: Option<String>,
}

pub fn resolve_execution_mode(
    prefer: Option<&str>,
    body_mode: ExecuteMode,
    options: &[JobControlOption],
    max_wait: u64,
) -> ResolvedMode {
    let supports_sync =
        options.is_empty() || options.contains(&JobControlOption::SyncExecute);
    let supports_async =
        options.is_empty() || options.contains(&JobControlOption::AsyncExecute);

    let parsed = prefer.map(parse_prefer_header).unwrap_or_default();
    // precedence: Prefer header, then body mode, then process options
    let (wants_sync, wait, from_prefer) = if parsed.respond_async {
        (false, None, true)
    } else if let Some(wait) = parsed.wait {
        (true, Some(wait), true)
    } else {
        match body_mode {
            ExecuteMode::Sync => (true, None, false),
            ExecuteMode::Async | ExecuteMode::Auto => (false, None, false),
        }
    };

    if wants_sync {
        if !supports_sync {
            // downgrade: the process only executes asynchronously
            return ResolvedMode {
                execute_async: true,
                wait_secs: 0,
                applied: Some("respond-async".to_string()),
            };
        }
        let wait_secs = wait.unwrap_or(max_wait).min(max_wait);
        if wait_secs == 0 {
            // an empty wait window is an async submission
            return ResolvedMode {
                execute_async: true,
                wait_secs: 0,
                applied: None,
            };
        }
        return ResolvedMode {
            execute_async: false,
            wait_secs,
            applied: from_prefer.then(|| format!("wait={wait_secs}")),
        };
    }

    if !supports_async {
        // async requested but the process only supports sync execution
        return ResolvedMode {
            execute_async: false,
            wait_secs: max_wait,
            applied: Some(format!("wait={max_wait}")),
        };
    }
    ResolvedMode {
        execute_async: true,
        wait_secs: 0,
        applied: (from_prefer && parsed.respond_async)
            .then(|| "respond-async".to_string()),
    }
}

/// Outcome of a submission, ready for the HTTP glue.
#[derive(Debug)]
pub enum SubmissionOutcome {
    /// Sync execution finished successfully within the wait window.
    Completed {
        job: Job,
        response: ResultsResponse,
    },
    /// Sync execution finished in a non-success state.
    Failed {
        job: Job,
        status_code: u16,
        body: JsonValue,
    },
    /// Async submission (or sync window elapsed): `201 Created` + Location.
    Accepted {
        job: Job,
        location: String,
        preference_applied: Option<String>,
        body: JsonValue,
    },
}

pub struct Scheduler {
    pool: PgPool,
    settings: std::sync::Arc<Settings>,
}

impl Scheduler {
    pub fn new(pool: PgPool, settings: std::sync::Arc<Settings>) -> Scheduler {
        Scheduler { pool, settings }
    }

    /// Submit an execute request against a deployed process (or a remote
    /// provider process when `service` is given).
    pub async fn submit(
        &self,
        process_ref: &str,
        service: Option<&str>,
        payload: JsonValue,
        headers: &HashMap<String, String>,
        context: Option<String>,
    ) -> Result<SubmissionOutcome> {
        let body: ExecuteBody = serde_json::from_value(payload)
            .map_err(|err| Error::JobInvalidParameter(format!("invalid execute body: {err}")))?;

        // resolve the target and its execution capabilities
        let job_control_options = match service {
            None => {
                let process = processes::fetch_by_id(&self.pool, process_ref).await?;
                if process.visibility != Visibility::Public {
                    return Err(Error::ProcessNotAccessible(process_ref.to_string()));
                }
                process.job_control_options
            }
            Some(name) => {
                services::fetch_by_name(&self.pool, name).await?;
                vec![
                    JobControlOption::SyncExecute,
                    JobControlOption::AsyncExecute,
                ]
            }
        };

        let prefer = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("prefer"))
            .map(|(_, value)| value.as_str());
        let mode = resolve_execution_mode(
            prefer,
            body.mode,
            &job_control_options,
            self.settings.wps.max_sync_wait_secs,
        );

        let subscribers = crate::notify::map_subscribers(
            &body.subscribers,
            body.notification_email.as_deref(),
            &self.settings,
        )?;

        let accept_language = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("accept-language"))
            .map(|(_, value)| value.clone());

        let job_id = Uuid::new_v4();
        let job = Job {
            id: job_id,
            process: process_ref.to_string(),
            service: service.map(String::from),
            status: Status::Accepted,
            progress: 0,
            inputs: body.inputs.clone(),
            outputs: body.outputs.clone(),
            results: vec![],
            exceptions: vec![],
            statistics: None,
            subscribers,
            execute_async: mode.execute_async,
            execute_response: body.response,
            accept_language,
            context,
            task_id: Some(job_id.to_string()),
            wps_id: None,
            revision: 0,
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        };
        jobs::save_job(&self.pool, &job).await?;
        jobs::save_log(
            &self.pool,
            job.id,
            "INFO",
            "Job task submitted for execution.",
            Some(0),
            Some(Status::Accepted),
        )
        .await?;
        queue::enqueue(&self.pool, job.id, "default").await?;
        info!(job = %job.id, process = %process_ref, execute_async = mode.execute_async, "job submitted");

        let location = self.settings.wps.job_status_url(&job.id);

        if !mode.execute_async {
            if let Some(outcome) = self
                .wait_for_completion(&job, mode.wait_secs, &location)
                .await?
            {
                return Ok(outcome);
            }
            debug!(job = %job.id, wait = mode.wait_secs, "sync wait elapsed, continuing async");
        }

        Ok(self.accepted(job, location, mode.applied))
    }

    /// Block up to the wait window for the queued task to finish; `None`
    /// means the window elapsed and the submission falls back to async.
    async fn wait_for_completion(
        &self,
        job: &Job,
        wait_secs: u64,
        location: &str,
    ) -> Result<Option<SubmissionOutcome>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if queue::is_done(&self.pool, job.id).await? {
                let job = jobs::fetch_by_id(&self.pool, job.id)
                    .await?
                    .ok_or(Error::NoSuchJob(job.id))?;
                if job.status == Status::Succeeded {
                    let response = job_results_response(&job, &self.settings)?;
                    return Ok(Some(SubmissionOutcome::Completed { job, response }));
                }
                let mut body = job.status_document(location);
                body["location"] = json!(location);
                return Ok(Some(SubmissionOutcome::Failed {
                    job,
                    status_code: 400,
                    body,
                }));
            }
        }
        Ok(None)
    }

    fn accepted(
        &self,
        job: Job,
        location: String,
        preference_applied: Option<String>,
    ) -> SubmissionOutcome {
        let body = json!({
            "jobID": job.id,
            "processID": job.process,
            "providerID": job.service,
            "status": Status::Accepted.as_str(),
            "location": location,
        });
        SubmissionOutcome::Accepted {
            job,
            location,
            preference_applied,
            body,
        }
    }

    /// Dismiss a job: set the queue tombstone and, when the task never
    /// started, mark the job dismissed immediately.
    pub async fn dismiss(&self, job_id: Uuid) -> Result<Job> {
        let mut job = jobs::fetch_by_id(&self.pool, job_id)
            .await?
            .ok_or(Error::NoSuchJob(job_id))?;
        if job.status == Status::Dismissed {
            return Err(Error::JobDismissed(job_id));
        }
        if job.status.is_terminal() {
            return Err(Error::JobInvalidParameter(format!(
                "job {job_id} already finished as {}",
                job.status
            )));
        }
        let claimed = queue::cancel(&self.pool, job_id).await?;
        if claimed != Some(true) && job.status == Status::Accepted {
            // never started: no engine will observe the tombstone
            job.status = Status::Dismissed;
            job.finished_at = Some(chrono::Utc::now());
            job = jobs::update_job(&self.pool, &job).await?;
            jobs::save_log(
                &self.pool,
                job.id,
                "INFO",
                "Job dismissed before execution started.",
                Some(job.progress),
                Some(Status::Dismissed),
            )
            .await?;
            crate::stager::cleanup_job_artifacts(&job, &self.settings).await;
        } else {
            jobs::save_log(
                &self.pool,
                job.id,
                "INFO",
                "Job dismissal requested, waiting for the worker to stop.",
                Some(job.progress),
                Some(job.status),
            )
            .await?;
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: [JobControlOption; 2] = [
        JobControlOption::SyncExecute,
        JobControlOption::AsyncExecute,
    ];
    const ASYNC_ONLY: [JobControlOption; 1] = [JobControlOption::AsyncExecute];

    #[test]
    fn test_parse_prefer_header() {
        let prefer = parse_prefer_header("respond-async, wait=10");
        assert!(prefer.respond_async);
        assert_eq!(prefer.wait, Some(10));

        let prefer = parse_prefer_header("wait=0");
        assert!(!prefer.respond_async);
        assert_eq!(prefer.wait, Some(0));

        assert_eq!(parse_prefer_header("nonsense"), PreferHeader::default());
    }

    #[test]
    fn test_prefer_wait_runs_sync() {
        let mode = resolve_execution_mode(Some("wait=10"), ExecuteMode::Auto, &BOTH, 20);
        assert!(!mode.execute_async);
        assert_eq!(mode.wait_secs, 10);
        assert_eq!(mode.applied.as_deref(), Some("wait=10"));
    }

    #[test]
    fn test_prefer_wait_zero_is_async() {
        let mode = resolve_execution_mode(Some("wait=0"), ExecuteMode::Sync, &BOTH, 20);
        assert!(mode.execute_async);
        assert_eq!(mode.wait_secs, 0);
    }

    #[test]
    fn test_wait_clips_to_server_maximum() {
        let mode = resolve_execution_mode(Some("wait=9999"), ExecuteMode::Auto, &BOTH, 20);
        assert!(!mode.execute_async);
        assert_eq!(mode.wait_secs, 20);
        assert_eq!(mode.applied.as_deref(), Some("wait=20"));
    }

    #[test]
    fn test_prefer_overrides_body_mode() {
        let mode = resolve_execution_mode(Some("respond-async"), ExecuteMode::Sync, &BOTH, 20);
        assert!(mode.execute_async);
        assert_eq!(mode.applied.as_deref(), Some("respond-async"));
    }

    #[test]
    fn test_body_mode_sync_without_prefer() {
        let mode = resolve_execution_mode(None, ExecuteMode::Sync, &BOTH, 20);
        assert!(!mode.execute_async);
        assert_eq!(mode.wait_secs, 20);
        // nothing to echo when no preference was expressed
        assert_eq!(mode.applied, None);
    }

    #[test]
    fn test_async_only_process_downgrades_sync_request() {
        let mode = resolve_execution_mode(None, ExecuteMode::Sync, &ASYNC_ONLY, 20);
        assert!(mode.execute_async);
        assert_eq!(mode.applied.as_deref(), Some("respond-async"));

        let mode = resolve_execution_mode(Some("wait=5"), ExecuteMode::Auto, &ASYNC_ONLY, 20);
        assert!(mode.execute_async);
        assert_eq!(mode.applied.as_deref(), Some("respond-async"));
    }

    #[test]
    fn test_default_is_async() {
        let mode = resolve_execution_mode(None, ExecuteMode::Auto, &BOTH, 20);
        assert!(mode.execute_async);
        assert_eq!(mode.applied, None);
    }

    #[test]
    fn test_execute_body_parsing() {
        let body: ExecuteBody = serde_json::from_value(json!({
            "inputs": {"message": "hello"},
            "response": "raw",
            "subscribers": {"successEmail": "a@b.c"},
            "notification_email": "d@e.f",
        }))
        .unwrap();
        assert_eq!(body.response, ExecuteResponse::Raw);
        assert_eq!(body.subscribers.success_email.as_deref(), Some("a@b.c"));
        assert_eq!(body.notification_email.as_deref(), Some("d@e.f"));
        assert_eq!(body.mode, ExecuteMode::Auto);
    }
}
