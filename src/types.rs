use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::status::{Status, StatusCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteMode {
    Auto,
    Sync,
    Async,
}

impl Default for ExecuteMode {
    fn default() -> Self {
        ExecuteMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecuteResponse {
    Raw,
    Document,
}

impl Default for ExecuteResponse {
    fn default() -> Self {
        ExecuteResponse::Document
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    Value,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobControlOption {
    #[serde(rename = "sync-execute")]
    SyncExecute,
    #[serde(rename = "async-execute")]
    AsyncExecute,
}

impl JobControlOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobControlOption::SyncExecute => "sync-execute",
            JobControlOption::AsyncExecute => "async-execute",
        }
    }

    pub fn from_name(name: &str) -> Option<JobControlOption> {
        match name {
            "sync-execute" => Some(JobControlOption::SyncExecute),
            "async-execute" => Some(JobControlOption::AsyncExecute),
            _ => None,
        }
    }
}

/// Remote provider protocol hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum ServiceKind {
    #[serde(rename = "WPS-1")]
    #[sqlx(rename = "WPS-1")]
    Wps1,
    #[serde(rename = "WPS-2")]
    #[sqlx(rename = "WPS-2")]
    Wps2,
    #[serde(rename = "OAP")]
    #[sqlx(rename = "OAP")]
    Oap,
}

/// A registered remote provider; its processes are listed lazily through
/// capability discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub url: String,
    pub kind: ServiceKind,
}

/// Per-category notification targets. E-mail entries hold the encrypted
/// token, never the plaintext address; callbacks hold raw URLs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscribers {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub emails: HashMap<StatusCategory, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub callbacks: HashMap<StatusCategory, String>,
}

impl Subscribers {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.callbacks.is_empty()
    }
}

/// One resolved output value of a finished job.
///
/// References under the configured WPS output location are stored as
/// pseudo-relative paths (`/`-rooted, to be prefixed with the configured
/// output URL or directory at read time); external URLs stay verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mediaType")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "dataType")]
    pub data_type: Option<String>,
}

/// Requested output customization from the execute body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputRequest {
    #[serde(default, rename = "transmissionMode")]
    pub transmission_mode: Option<TransmissionMode>,
    #[serde(default)]
    pub format: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Process identifier, possibly in `id:version` form.
    pub process: String,
    /// Remote provider name when the job targets a registered service.
    pub service: Option<String>,
    pub status: Status,
    pub progress: i32,
    pub inputs: Option<JsonValue>,
    pub outputs: Option<JsonValue>,
    pub results: Vec<ResultRecord>,
    pub exceptions: Vec<JsonValue>,
    pub statistics: Option<JsonValue>,
    pub subscribers: Option<Subscribers>,
    pub execute_async: bool,
    pub execute_response: ExecuteResponse,
    pub accept_language: Option<String>,
    /// Optional subdirectory prefix applied to output staging.
    pub context: Option<String>,
    /// Opaque worker handle of the queued task.
    pub task_id: Option<String>,
    /// UUID of the underlying local execution directory (may differ from `id`).
    pub wps_id: Option<Uuid>,
    pub revision: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_local(&self) -> bool {
        self.service.is_none()
    }

    /// Parsed output requests keyed by output id.
    pub fn output_requests(&self) -> HashMap<String, OutputRequest> {
        self.outputs
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Status document returned by `GET /jobs/{id}` and used as the callback
    /// body for non-success notifications.
    pub fn status_document(&self, status_url: &str) -> JsonValue {
        serde_json::json!({
            "jobID": self.id,
            "processID": self.process,
            "providerID": self.service,
            "type": "process",
            "status": self.status.as_str(),
            "progress": self.progress,
            "created": self.created_at,
            "started": self.started_at,
            "finished": self.finished_at,
            "links": [{
                "href": status_url,
                "rel": "self",
                "type": "application/json",
            }],
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub seq: i64,
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub progress: Option<i32>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub process: Option<String>,
    pub service: Option<String>,
    pub status: Option<Status>,
    pub page: i64,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_requests_parsing() {
        let job = Job {
            id: Uuid::new_v4(),
            process: "echo".into(),
            service: None,
            status: Status::Accepted,
            progress: 0,
            inputs: None,
            outputs: Some(serde_json::json!({
                "result": {"transmissionMode": "reference"}
            })),
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
        };
        let requests = job.output_requests();
        assert_eq!(
            requests.get("result").unwrap().transmission_mode,
            Some(TransmissionMode::Reference)
        );
    }

    #[test]
    fn test_job_control_option_names() {
        assert_eq!(
            JobControlOption::from_name("sync-execute"),
            Some(JobControlOption::SyncExecute)
        );
        assert_eq!(JobControlOption::SyncExecute.as_str(), "sync-execute");
        assert_eq!(JobControlOption::from_name("other"), None);
    }
}
