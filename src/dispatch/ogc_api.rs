//! OGC API - Processes dispatcher.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::Method;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::status::{map_remote_status, Status};

use super::{
    DispatchContext, MonitorReference, RemoteInput, RemoteOutput, RemoteResult, WpsProcess,
};

pub struct OgcApiProcess {
    ctx: DispatchContext,
    pub provider: String,
    pub process: String,
}

impl OgcApiProcess {
    /// Resolve `provider` and `process` from a URL of form
    /// `{providerBase}/processes/{processId}`.
    pub fn new(ctx: DispatchContext, process_url: &str) -> Result<OgcApiProcess> {
        let (provider, process) = split_process_url(process_url)?;
        Ok(OgcApiProcess {
            ctx,
            provider,
            process,
        })
    }
}

pub(crate) fn split_process_url(process_url: &str) -> Result<(String, String)> {
    let trimmed = process_url.trim_end_matches('/');
    match trimmed.rsplit_once("/processes/") {
        Some((provider, process)) if !process.is_empty() => {
            Ok((provider.to_string(), process.to_string()))
        }
        _ => Err(Error::RemoteExecution(format!(
            "cannot resolve provider and process from [{process_url}]"
        ))),
    }
}

pub(crate) fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Build the OGC execute body from staged inputs: repeated ids fold into
/// arrays, references become `{href}` objects.
pub(crate) fn execute_body(inputs: &[RemoteInput], outputs: &[RemoteOutput]) -> JsonValue {
    let mut body_inputs = Map::new();
    for input in inputs {
        let entry = match (&input.href, &input.data) {
            (Some(href), _) => {
                let mut obj = Map::new();
                obj.insert("href".into(), json!(href));
                if let Some(media) = &input.media_type {
                    obj.insert("type".into(), json!(media));
                }
                JsonValue::Object(obj)
            }
            (None, Some(data)) => json!(data),
            (None, None) => JsonValue::Null,
        };
        match body_inputs.get_mut(&input.id) {
            Some(JsonValue::Array(list)) => list.push(entry),
            Some(existing) => {
                let previous = existing.take();
                *existing = JsonValue::Array(vec![previous, entry]);
            }
            None => {
                body_inputs.insert(input.id.clone(), entry);
            }
        }
    }

    let mut body_outputs = Map::new();
    for output in outputs {
        body_outputs.insert(
            output.id.clone(),
            json!({"transmissionMode": "reference"}),
        );
    }

    json!({
        "inputs": body_inputs,
        "outputs": body_outputs,
        "response": "document",
        "mode": "async",
    })
}

/// Submit the execute body and return the job status URL.
pub(crate) async fn dispatch_execute(
    ctx: &DispatchContext,
    provider: &str,
    process: &str,
    body: JsonValue,
    headers: HeaderMap,
) -> Result<MonitorReference> {
    let url = format!("{}/processes/{}/execution", provider.trim_end_matches('/'), process);
    debug!(%url, "submitting remote execute request");
    let response = ctx
        .http
        .request_with_retry(Method::POST, &url, Some(headers), Some(body), 1)
        .await?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(Error::RemoteExecution(format!(
            "remote execute submission answered {status}: {detail}"
        )));
    }
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let payload: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
    let location = location
        .or_else(|| {
            payload
                .get("location")
                .and_then(JsonValue::as_str)
                .map(String::from)
        })
        .or_else(|| {
            payload.get("jobID").and_then(JsonValue::as_str).map(|job| {
                format!("{}/jobs/{}", provider.trim_end_matches('/'), job)
            })
        })
        .ok_or_else(|| {
            Error::RemoteExecution("remote execute submission returned no status location".into())
        })?;
    Ok(MonitorReference {
        location,
        payload,
    })
}

/// Poll the status URL until terminal, with exponential backoff and at most
/// five consecutive read failures. Returns the success flag.
pub(crate) async fn monitor_status(
    ctx: &DispatchContext,
    status_url: &str,
    headers: HeaderMap,
    mut on_progress: impl FnMut(&DispatchContext, i32, &str) + Send,
) -> Result<bool> {
    const MAX_READ_FAILURES: u32 = 5;
    let mut step = 0u32;
    let mut failures = 0u32;

    loop {
        if !ctx.monitor_sleep(step).await {
            return Err(Error::PackageExecution(
                "remote monitoring interrupted by dismissal".into(),
            ));
        }
        let response = ctx
            .http
            .request_with_retry(Method::GET, status_url, Some(headers.clone()), None, 0)
            .await;
        let body: Result<JsonValue> = match response {
            Ok(response) if response.status().is_success() => {
                response.json().await.map_err(Error::from)
            }
            Ok(response) => Err(Error::RemoteExecution(format!(
                "status location answered {}",
                response.status()
            ))),
            Err(err) => Err(err),
        };
        match body {
            Ok(body) => {
                failures = 0;
                step += 1;
                let status = body
                    .get("status")
                    .and_then(JsonValue::as_str)
                    .and_then(map_remote_status)
                    .unwrap_or(Status::Running);
                let percent = body
                    .get("progress")
                    .and_then(JsonValue::as_i64)
                    .unwrap_or(0) as i32;
                let message = body
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("");
                on_progress(ctx, percent, message);
                match status {
                    Status::Succeeded => return Ok(true),
                    Status::Failed | Status::Dismissed => return Ok(false),
                    _ => continue,
                }
            }
            Err(err) => {
                failures += 1;
                warn!(%status_url, %err, failures, "failed reading remote job status");
                if failures >= MAX_READ_FAILURES {
                    return Err(Error::MonitoringTimeout(format!(
                        "could not read remote status after {MAX_READ_FAILURES} retries: {err}"
                    )));
                }
            }
        }
    }
}

/// Fetch the results document of a finished remote job.
pub(crate) async fn fetch_results(
    ctx: &DispatchContext,
    status_url: &str,
    headers: HeaderMap,
) -> Result<Vec<RemoteResult>> {
    let url = format!("{}/results", status_url.trim_end_matches('/'));
    let response = ctx
        .http
        .request_with_retry(Method::GET, &url, Some(headers), None, 2)
        .await?;
    if !response.status().is_success() {
        return Err(Error::RemoteExecution(format!(
            "remote results answered {}",
            response.status()
        )));
    }
    let body: JsonValue = response.json().await?;
    let mut results = Vec::new();
    if let Some(map) = body.as_object() {
        for (id, entry) in map {
            collect_result(id, entry, &mut results);
        }
    }
    Ok(results)
}

fn collect_result(id: &str, entry: &JsonValue, results: &mut Vec<RemoteResult>) {
    match entry {
        JsonValue::Array(list) => {
            for item in list {
                collect_result(id, item, results);
            }
        }
        JsonValue::Object(obj) => {
            results.push(RemoteResult {
                id: id.to_string(),
                href: obj.get("href").and_then(JsonValue::as_str).map(String::from),
                value: obj.get("value").cloned(),
                media_type: obj.get("type").and_then(JsonValue::as_str).map(String::from),
            });
        }
        other => {
            results.push(RemoteResult {
                id: id.to_string(),
                href: None,
                value: Some(other.clone()),
                media_type: None,
            });
        }
    }
}

#[async_trait]
impl WpsProcess for OgcApiProcess {
    fn ctx(&self) -> &DispatchContext {
        &self.ctx
    }

    async fn dispatch(
        &self,
        inputs: Vec<RemoteInput>,
        outputs: Vec<RemoteOutput>,
    ) -> Result<MonitorReference> {
        let body = execute_body(&inputs, &outputs);
        dispatch_execute(&self.ctx, &self.provider, &self.process, body, json_headers()).await
    }

    async fn monitor(&self, reference: &MonitorReference) -> Result<bool> {
        monitor_status(
            &self.ctx,
            &reference.location,
            json_headers(),
            |ctx, percent, message| {
                let progress = crate::status::progress::map_range(
                    percent as f64,
                    super::progress::MONITOR,
                    super::progress::RESULTS,
                );
                ctx.update_status(
                    format!("Remote job monitoring (progress: {percent}%, status: {message})."),
                    progress,
                );
            },
        )
        .await
    }

    async fn get_results(&self, reference: &MonitorReference) -> Result<Vec<RemoteResult>> {
        fetch_results(&self.ctx, &reference.location, json_headers()).await
    }

    async fn dismiss(&self, reference: &MonitorReference) {
        let _ = self
            .ctx
            .http
            .request_with_retry(Method::DELETE, &reference.location, None, None, 0)
            .await;
    }
}
