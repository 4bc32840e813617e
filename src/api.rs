//! Typed operations behind the HTTP surface.
//!
//! Routing and view glue live outside this crate; every operation here
//! returns plain data (or [`SubmissionOutcome`]/[`ResultsResponse`]) that
//! the HTTP layer renders, and every error carries its status code and OGC
//! exception body via [`crate::error::Error`].

use std::collections::HashMap;

use serde_json::{json, Map, Value as JsonValue};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{jobs, processes, services};
use crate::error::{Error, Result};
use crate::fetch::HttpClient;
use crate::package::loader::{PackageLoader, PackageSource};
use crate::package::{convert, wps_xml, Process};
use crate::results::ResultsResponse;
use crate::scheduler::{Scheduler, SubmissionOutcome};
use crate::types::{Service, ServiceKind, Visibility};

pub struct Api {
    pool: PgPool,
    settings: std::sync::Arc<Settings>,
    scheduler: Scheduler,
    http: HttpClient,
}

impl Api {
    pub fn new(pool: PgPool, settings: std::sync::Arc<Settings>) -> Result<Api> {
        let scheduler = Scheduler::new(pool.clone(), settings.clone());
        let http = HttpClient::new(settings.worker.request_timeout_secs)?;
        Ok(Api {
            pool,
            settings,
            scheduler,
            http,
        })
    }

    /* ===================== Processes ===================== */

    /// `GET /processes`
    pub async fn list_processes(&self) -> Result<JsonValue> {
        let list = processes::list(&self.pool, true).await?;
        Ok(json!({
            "processes": list
                .iter()
                .map(|process| process_summary(process))
                .collect::<Vec<_>>(),
        }))
    }

    /// `POST /processes`: deploy from
    /// `{processDescription, executionUnit, deploymentProfileName}`.
    pub async fn deploy_process(
        &self,
        payload: JsonValue,
        headers: &HashMap<String, String>,
    ) -> Result<JsonValue> {
        let offering = payload
            .get("processDescription")
            .map(|description| description.get("process").unwrap_or(description))
            .cloned()
            .unwrap_or_else(|| payload.clone());

        let source = deployment_source(&payload)?;
        let loader = PackageLoader::new(self.settings.clone())?;
        let process = loader
            .load_process(&self.pool, &offering, source, headers)
            .await?;
        processes::deploy(&self.pool, &process).await?;
        Ok(json!({
            "processSummary": process_summary(&process),
            "deploymentDone": true,
        }))
    }

    /// `GET /processes/{id}`
    pub async fn describe_process(&self, reference: &str) -> Result<JsonValue> {
        let process = processes::fetch_by_id(&self.pool, reference).await?;
        if process.visibility != Visibility::Public {
            return Err(Error::ProcessNotAccessible(reference.to_string()));
        }
        Ok(process_description(&process))
    }

    /// `GET /processes/{id}/package`
    pub async fn get_package(&self, reference: &str) -> Result<JsonValue> {
        let process = processes::fetch_by_id(&self.pool, reference).await?;
        if process.visibility != Visibility::Public {
            return Err(Error::ProcessNotAccessible(reference.to_string()));
        }
        Ok(process.package.raw)
    }

    /// `PUT /processes/{id}/visibility`
    pub async fn set_visibility(&self, reference: &str, payload: JsonValue) -> Result<JsonValue> {
        let value: Visibility = payload
            .get("value")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .ok()
            .flatten()
            .ok_or_else(|| {
                Error::JobInvalidParameter(
                    "visibility body must be {\"value\": \"public\"|\"private\"}".into(),
                )
            })?;
        processes::set_visibility(&self.pool, reference, value).await?;
        Ok(json!({"value": value}))
    }

    /// `DELETE /processes/{id}`
    pub async fn undeploy_process(&self, reference: &str) -> Result<JsonValue> {
        processes::undeploy(&self.pool, reference).await?;
        Ok(json!({"undeploymentDone": true, "id": reference}))
    }

    /* ===================== Jobs ===================== */

    /// `POST /processes/{id}/execution` (and the legacy `/jobs` alias).
    pub async fn submit_job(
        &self,
        process_ref: &str,
        payload: JsonValue,
        headers: &HashMap<String, String>,
    ) -> Result<SubmissionOutcome> {
        let context = wps_output_context(headers)?;
        self.scheduler
            .submit(process_ref, None, payload, headers, context)
            .await
    }

    /// `POST /providers/{provider}/processes/{id}/execution`
    pub async fn submit_provider_job(
        &self,
        provider: &str,
        process_id: &str,
        payload: JsonValue,
        headers: &HashMap<String, String>,
    ) -> Result<SubmissionOutcome> {
        let context = wps_output_context(headers)?;
        self.scheduler
            .submit(process_id, Some(provider), payload, headers, context)
            .await
    }

    /// `GET /jobs/{id}`
    pub async fn job_status(&self, job_id: Uuid) -> Result<JsonValue> {
        let job = jobs::fetch_by_id(&self.pool, job_id)
            .await?
            .ok_or(Error::NoSuchJob(job_id))?;
        Ok(job.status_document(&self.settings.wps.job_status_url(&job.id)))
    }

    /// `GET /jobs/{id}/logs`
    pub async fn job_logs(&self, job_id: Uuid) -> Result<JsonValue> {
        jobs::fetch_by_id(&self.pool, job_id)
            .await?
            .ok_or(Error::NoSuchJob(job_id))?;
        let logs = jobs::fetch_logs(&self.pool, job_id).await?;
        Ok(json!(logs
            .iter()
            .map(|entry| {
                format!(
                    "[{}] {:>5} {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.level,
                    entry.message
                )
            })
            .collect::<Vec<_>>()))
    }

    /// `GET /jobs/{id}/results`
    pub async fn job_results(&self, job_id: Uuid) -> Result<ResultsResponse> {
        let job = jobs::fetch_by_id(&self.pool, job_id)
            .await?
            .ok_or(Error::NoSuchJob(job_id))?;
        crate::results::job_results_response(&job, &self.settings)
    }

    /// `DELETE /jobs/{id}`
    pub async fn dismiss_job(&self, job_id: Uuid) -> Result<JsonValue> {
        let job = self.scheduler.dismiss(job_id).await?;
        Ok(json!({
            "jobID": job.id,
            "status": job.status.as_str(),
            "message": "Job dismissed.",
        }))
    }

    /* ===================== Providers ===================== */

    /// `GET /providers`
    pub async fn list_providers(&self) -> Result<JsonValue> {
        let list = services::list(&self.pool).await?;
        Ok(json!({"providers": list}))
    }

    /// `POST /providers`
    pub async fn register_provider(&self, payload: JsonValue) -> Result<JsonValue> {
        let service: Service = serde_json::from_value(payload)
            .map_err(|err| Error::JobInvalidParameter(format!("invalid provider body: {err}")))?;
        services::register(&self.pool, &service).await?;
        Ok(json!({"name": service.name, "url": service.url}))
    }

    /// `GET /providers/{p}/processes`: lazy capability discovery.
    pub async fn provider_processes(&self, name: &str) -> Result<JsonValue> {
        let service = services::fetch_by_name(&self.pool, name).await?;
        match service.kind {
            ServiceKind::Wps1 | ServiceKind::Wps2 => {
                let url = format!(
                    "{}?service=WPS&version=1.0.0&request=GetCapabilities",
                    service.url
                );
                let (body, _) = self.http.get_text(&url).await.map_err(|err| {
                    Error::ServiceNotAccessible(format!("provider '{name}': {err}"))
                })?;
                let processes = wps_xml::parse_capabilities(&body)?;
                Ok(json!({
                    "processes": processes
                        .iter()
                        .map(|(id, title)| json!({"id": id, "title": title}))
                        .collect::<Vec<_>>(),
                }))
            }
            ServiceKind::Oap => {
                let url = format!("{}/processes", service.url.trim_end_matches('/'));
                let (body, _) = self.http.get_text(&url).await.map_err(|err| {
                    Error::ServiceNotAccessible(format!("provider '{name}': {err}"))
                })?;
                let parsed: JsonValue = serde_json::from_str(&body)?;
                Ok(parsed)
            }
        }
    }

    /// `GET /providers/{p}/processes/{id}`
    pub async fn provider_process(&self, name: &str, process_id: &str) -> Result<JsonValue> {
        let service = services::fetch_by_name(&self.pool, name).await?;
        let loader = PackageLoader::new(self.settings.clone())?;
        let reference = match service.kind {
            ServiceKind::Wps1 | ServiceKind::Wps2 => format!(
                "{}?service=WPS&version=1.0.0&request=DescribeProcess&identifier={process_id}",
                service.url
            ),
            ServiceKind::Oap => format!(
                "{}/processes/{process_id}",
                service.url.trim_end_matches('/')
            ),
        };
        let (package, _) = loader.resolve_reference(&reference, None).await?;
        let (inputs, outputs) = convert::package_io_defs(&package)?;
        let mut body = Map::new();
        body.insert("id".into(), json!(process_id));
        body.insert("inputs".into(), io_descriptions(&inputs, convert::oap_input_description));
        body.insert(
            "outputs".into(),
            io_descriptions(&outputs, convert::oap_output_description),
        );
        Ok(JsonValue::Object(body))
    }
}

fn deployment_source(payload: &JsonValue) -> Result<PackageSource> {
    let unit = payload
        .get("executionUnit")
        .and_then(|units| match units {
            JsonValue::Array(list) => list.first(),
            single => Some(single),
        })
        .ok_or_else(|| {
            Error::PackageRegistration("deployment body carries no executionUnit".into())
        })?;
    if let Some(inline) = unit.get("unit") {
        return Ok(PackageSource::Inline(inline.clone()));
    }
    if let Some(href) = unit.get("href").and_then(JsonValue::as_str) {
        return Ok(PackageSource::Reference(href.to_string()));
    }
    // tolerate a bare package document as the execution unit
    if unit.get("cwlVersion").is_some() || unit.get("class").is_some() {
        return Ok(PackageSource::Inline(unit.clone()));
    }
    Err(Error::PackageRegistration(
        "executionUnit must provide either 'unit' or 'href'".into(),
    ))
}

fn wps_output_context(headers: &HashMap<String, String>) -> Result<Option<String>> {
    let Some(context) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-wps-output-context"))
        .map(|(_, value)| value.trim().trim_matches('/').to_string())
    else {
        return Ok(None);
    };
    if context.is_empty() {
        return Ok(None);
    }
    if context
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(Error::JobInvalidParameter(format!(
            "invalid output context '{context}'"
        )));
    }
    Ok(Some(context))
}

fn process_summary(process: &Process) -> JsonValue {
    json!({
        "id": process.id,
        "version": process.version,
        "title": process.title,
        "description": process.description,
        "keywords": process.keywords,
        "jobControlOptions": process
            .job_control_options
            .iter()
            .map(|option| option.as_str())
            .collect::<Vec<_>>(),
    })
}

fn io_descriptions<T>(defs: &[T], describe: impl Fn(&T) -> JsonValue) -> JsonValue
where
    T: HasId,
{
    let mut body = Map::new();
    for def in defs {
        body.insert(def.id().to_string(), describe(def));
    }
    JsonValue::Object(body)
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for crate::io::InputDef {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for crate::io::OutputDef {
    fn id(&self) -> &str {
        &self.id
    }
}

fn process_description(process: &Process) -> JsonValue {
    json!({
        "id": process.id,
        "version": process.version,
        "title": process.title,
        "description": process.description,
        "keywords": process.keywords,
        "jobControlOptions": process
            .job_control_options
            .iter()
            .map(|option| option.as_str())
            .collect::<Vec<_>>(),
        "outputTransmission": ["value", "reference"],
        "inputs": io_descriptions(&process.inputs, convert::oap_input_description),
        "outputs": io_descriptions(&process.outputs, convert::oap_output_description),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_source_variants() {
        let inline = deployment_source(&json!({
            "executionUnit": [{"unit": {"cwlVersion": "v1.0", "class": "CommandLineTool"}}],
        }))
        .unwrap();
        assert!(matches!(inline, PackageSource::Inline(_)));

        let reference = deployment_source(&json!({
            "executionUnit": [{"href": "https://x/echo.cwl"}],
        }))
        .unwrap();
        assert!(matches!(reference, PackageSource::Reference(href) if href == "https://x/echo.cwl"));

        assert!(deployment_source(&json!({})).is_err());
    }

    #[test]
    fn test_output_context_validation() {
        let mut headers = HashMap::new();
        assert_eq!(wps_output_context(&headers).unwrap(), None);

        headers.insert("X-WPS-Output-Context".to_string(), "projects/demo".to_string());
        assert_eq!(
            wps_output_context(&headers).unwrap().as_deref(),
            Some("projects/demo")
        );

        headers.insert("X-WPS-Output-Context".to_string(), "../escape".to_string());
        assert!(wps_output_context(&headers).is_err());
    }
}
