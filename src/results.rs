//! Job results materialization per the OGC raw/document response rules.

use std::path::PathBuf;

use serde_json::{json, Map, Value as JsonValue};
use tracing::warn;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::types::{ExecuteResponse, Job, ResultRecord, TransmissionMode};

/// Response content for `GET /jobs/{id}/results`, ready for the HTTP glue.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsResponse {
    /// `200 OK` with the value-keyed results document.
    Document {
        body: JsonValue,
        headers: Vec<(String, String)>,
    },
    /// `200 OK` with the single literal value as plain text.
    RawLiteral {
        body: Vec<u8>,
        content_type: String,
        headers: Vec<(String, String)>,
    },
    /// `200 OK` streaming the referenced file.
    RawFile {
        path: PathBuf,
        content_type: String,
        headers: Vec<(String, String)>,
    },
    /// `303 See Other` towards an external reference (e.g. S3).
    Redirect {
        location: String,
        headers: Vec<(String, String)>,
    },
    /// `204 No Content`: everything was returned by reference links.
    NoContent { headers: Vec<(String, String)> },
}

impl ResultsResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            ResultsResponse::NoContent { .. } => 204,
            ResultsResponse::Redirect { .. } => 303,
            _ => 200,
        }
    }
}

/// Expand a stored reference to its public URL: pseudo-relative paths are
/// prefixed with the configured WPS output URL, external URLs stay verbatim.
pub fn resolve_result_href(href: &str, settings: &Settings) -> String {
    if href.contains("://") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            settings.wps.output_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

/// Rewrite result references to pseudo-relative paths so the public URL can
/// be recomputed after reconfiguration. Only references under the configured
/// WPS output URL/path are touched.
pub fn make_results_relative(
    mut records: Vec<ResultRecord>,
    settings: &Settings,
) -> Vec<ResultRecord> {
    let wps_url = settings.wps.output_url.trim_end_matches('/');
    let wps_path = settings.wps.output_path.trim_end_matches('/');
    let wps_dir = settings.wps.output_dir.to_string_lossy();
    let wps_dir = wps_dir.trim_end_matches('/');
    for record in &mut records {
        if let Some(href) = record.href.as_mut() {
            for prefix in [wps_url, wps_dir, wps_path] {
                if !prefix.is_empty() && href.starts_with(prefix) {
                    *href = href[prefix.len()..].to_string();
                    if !href.starts_with('/') {
                        *href = format!("/{href}");
                    }
                    break;
                }
            }
        }
    }
    records
}

fn record_media_type(record: &ResultRecord) -> String {
    record.media_type.clone().unwrap_or_else(|| {
        record
            .href
            .as_deref()
            .map(|href| {
                mime_guess::from_path(href)
                    .first_raw()
                    .unwrap_or(crate::io::MEDIA_TYPE_TEXT)
                    .to_string()
            })
            .unwrap_or_else(|| crate::io::MEDIA_TYPE_TEXT.to_string())
    })
}

fn record_document_entry(record: &ResultRecord, settings: &Settings) -> JsonValue {
    if let Some(href) = &record.href {
        let mut entry = Map::new();
        entry.insert(
            "href".into(),
            json!(resolve_result_href(href, settings)),
        );
        entry.insert("type".into(), json!(record_media_type(record)));
        if let Some(encoding) = &record.encoding {
            entry.insert("encoding".into(), json!(encoding));
        }
        if let Some(schema) = &record.schema {
            entry.insert("schema".into(), json!(schema));
        }
        JsonValue::Object(entry)
    } else {
        let mut entry = Map::new();
        entry.insert("value".into(), record.value.clone().unwrap_or(JsonValue::Null));
        if let Some(data_type) = &record.data_type {
            entry.insert("dataType".into(), json!(data_type));
        }
        JsonValue::Object(entry)
    }
}

/// Value-keyed OGC results document (used for `response=document` and for
/// success callback bodies).
pub fn results_document(job: &Job, settings: &Settings) -> JsonValue {
    let mut body = Map::new();
    for record in &job.results {
        let entry = record_document_entry(record, settings);
        match body.get_mut(&record.id) {
            // arrays aggregate under the same output id
            Some(JsonValue::Array(list)) => list.push(entry),
            Some(existing) => {
                let previous = existing.take();
                *existing = JsonValue::Array(vec![previous, entry]);
            }
            None => {
                body.insert(record.id.clone(), entry);
            }
        }
    }
    JsonValue::Object(body)
}

fn reference_link(record: &ResultRecord, url: &str) -> (String, String) {
    let mut link = format!("<{url}>; rel=\"{}\"; type={}", record.id, record_media_type(record));
    if let Some(encoding) = &record.encoding {
        link.push_str(&format!("; charset={encoding}"));
    }
    (String::from("Link"), link)
}

/// Materialize a literal result as a text file under the job output location
/// so it can be returned by reference.
fn materialize_value_reference(
    record: &ResultRecord,
    job: &Job,
    settings: &Settings,
) -> Result<String> {
    let value = record.value.clone().unwrap_or(JsonValue::Null);
    let text = crate::io::json_scalar_to_string(&value);
    let relative = format!("{}/{}.txt", job.id, record.id);
    let path = settings.wps.output_dir.join(&relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, text.as_bytes())?;
    Ok(format!(
        "{}/{}",
        settings.wps.output_url.trim_end_matches('/'),
        relative
    ))
}

/// Guards shared by status and results access.
pub fn ensure_results_available(job: &Job) -> Result<()> {
    match job.status {
        Status::Dismissed => Err(Error::JobDismissed(job.id)),
        Status::Failed => Err(Error::JobResultsFailed(job.id)),
        Status::Succeeded => Ok(()),
        _ => Err(Error::JobResultsNotReady(job.id)),
    }
}

/// Build the results response honoring the `response` mode recorded at
/// submission and per-output transmission modes.
pub fn job_results_response(job: &Job, settings: &Settings) -> Result<ResultsResponse> {
    ensure_results_available(job)?;

    let mut headers = vec![(
        "Location".to_string(),
        settings.wps.job_status_url(&job.id),
    )];

    if job.execute_response == ExecuteResponse::Document {
        return Ok(ResultsResponse::Document {
            body: results_document(job, settings),
            headers,
        });
    }

    // raw: outputs requested by reference become Link headers
    let requests = job.output_requests();
    let mut value_records: Vec<&ResultRecord> = Vec::new();
    for record in &job.results {
        let as_reference = requests
            .get(&record.id)
            .and_then(|r| r.transmission_mode)
            == Some(TransmissionMode::Reference);
        if as_reference {
            let url = match &record.href {
                Some(href) => resolve_result_href(href, settings),
                None => materialize_value_reference(record, job, settings)?,
            };
            headers.push(reference_link(record, &url));
        } else {
            value_records.push(record);
        }
    }

    match value_records.as_slice() {
        [] => Ok(ResultsResponse::NoContent { headers }),
        [record] => {
            if let Some(href) = &record.href {
                if href.contains("://") {
                    // external references cannot be served from disk
                    return Ok(ResultsResponse::Redirect {
                        location: href.clone(),
                        headers,
                    });
                }
                Ok(ResultsResponse::RawFile {
                    path: settings.wps.output_dir.join(href.trim_start_matches('/')),
                    content_type: record_media_type(record),
                    headers,
                })
            } else {
                let value = record.value.clone().unwrap_or(JsonValue::Null);
                Ok(ResultsResponse::RawLiteral {
                    body: crate::io::json_scalar_to_string(&value).into_bytes(),
                    content_type: "text/plain; charset=UTF-8".to_string(),
                    headers,
                })
            }
        }
        multiple => {
            warn!(
                job = %job.id,
                outputs = multiple.len(),
                "multipart raw responses are not supported"
            );
            Err(Error::JobInvalidParameter(
                "multipart results with 'response=raw' are not supported; request 'document' or reference transmission".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::jobs::tests::sample_job;

    fn settings() -> Settings {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        Settings::load(None).unwrap()
    }

    fn succeeded_job() -> Job {
        let mut job = sample_job();
        job.status = Status::Succeeded;
        job.progress = 100;
        job
    }

    #[test]
    fn test_pseudo_relative_rewrite() {
        let settings = settings();
        let records = vec![
            ResultRecord {
                id: "output".into(),
                href: Some(format!(
                    "{}/abc/output/file.nc",
                    settings.wps.output_url
                )),
                ..Default::default()
            },
            ResultRecord {
                id: "remote".into(),
                href: Some("https://elsewhere.example.com/file.nc".into()),
                ..Default::default()
            },
        ];
        let relative = make_results_relative(records, &settings);
        assert_eq!(relative[0].href.as_deref(), Some("/abc/output/file.nc"));
        // external URLs stay verbatim
        assert_eq!(
            relative[1].href.as_deref(),
            Some("https://elsewhere.example.com/file.nc")
        );
    }

    #[test]
    fn test_resolve_result_href_roundtrip() {
        let settings = settings();
        let public = resolve_result_href("/job/out/file.nc", &settings);
        assert_eq!(
            public,
            format!("{}/job/out/file.nc", settings.wps.output_url)
        );
    }

    #[test]
    fn test_document_response() {
        let settings = settings();
        let mut job = succeeded_job();
        job.results = vec![ResultRecord {
            id: "output".into(),
            value: Some(json!("hello")),
            data_type: Some("string".into()),
            ..Default::default()
        }];
        let response = job_results_response(&job, &settings).unwrap();
        assert_eq!(response.status_code(), 200);
        match response {
            ResultsResponse::Document { body, .. } => {
                assert_eq!(body["output"]["value"], "hello");
                assert_eq!(body["output"]["dataType"], "string");
            }
            other => panic!("expected document response, got {other:?}"),
        }
    }

    #[test]
    fn test_document_generation_is_deterministic() {
        let settings = settings();
        let mut job = succeeded_job();
        job.results = vec![
            ResultRecord {
                id: "b".into(),
                value: Some(json!(2)),
                ..Default::default()
            },
            ResultRecord {
                id: "a".into(),
                href: Some("/x/a.txt".into()),
                ..Default::default()
            },
        ];
        let first = results_document(&job, &settings).to_string();
        let second = results_document(&job, &settings).to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_raw_single_literal() {
        let settings = settings();
        let mut job = succeeded_job();
        job.execute_response = ExecuteResponse::Raw;
        job.results = vec![ResultRecord {
            id: "output".into(),
            value: Some(json!("hello")),
            ..Default::default()
        }];
        match job_results_response(&job, &settings).unwrap() {
            ResultsResponse::RawLiteral {
                body, content_type, ..
            } => {
                assert_eq!(body, b"hello");
                assert_eq!(content_type, "text/plain; charset=UTF-8");
            }
            other => panic!("expected raw literal, got {other:?}"),
        }
    }

    #[test]
    fn test_raw_all_by_reference_yields_no_content() {
        let settings = settings();
        let mut job = succeeded_job();
        job.execute_response = ExecuteResponse::Raw;
        job.outputs = Some(json!({"output": {"transmissionMode": "reference"}}));
        job.results = vec![ResultRecord {
            id: "output".into(),
            href: Some("/job/output/file.txt".into()),
            media_type: Some("text/plain".into()),
            ..Default::default()
        }];
        match job_results_response(&job, &settings).unwrap() {
            ResultsResponse::NoContent { headers } => {
                let link = headers
                    .iter()
                    .find(|(name, _)| name == "Link")
                    .map(|(_, v)| v.clone())
                    .unwrap();
                assert!(link.contains("rel=\"output\""));
                assert!(link.contains("type=text/plain"));
            }
            other => panic!("expected no-content, got {other:?}"),
        }
    }

    #[test]
    fn test_results_guards() {
        let settings = settings();
        let mut job = succeeded_job();

        job.status = Status::Running;
        assert!(matches!(
            job_results_response(&job, &settings).unwrap_err(),
            Error::JobResultsNotReady(_)
        ));

        job.status = Status::Dismissed;
        assert!(matches!(
            job_results_response(&job, &settings).unwrap_err(),
            Error::JobDismissed(_)
        ));

        job.status = Status::Failed;
        assert!(matches!(
            job_results_response(&job, &settings).unwrap_err(),
            Error::JobResultsFailed(_)
        ));
    }
}
