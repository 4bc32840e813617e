//! Application Package loader.
//!
//! Converts heterogeneous process descriptions (inline packages, package
//! URLs, WPS-1/2 `DescribeProcess` XML, OGC API process descriptions) into a
//! normalized [`Process`] with merged I/O and a validated principal
//! requirement.

use std::collections::HashMap;

use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tracing::{debug, warn};
use url::Url;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::fetch::HttpClient;
use crate::package::{
    convert, get_application_requirement, sane_name, wps_xml, AppRequirement, DockerAuth,
    Package, Process, StepMap, StepPackage, ToolClass,
};
use crate::types::{JobControlOption, Visibility};

/// File extensions recognized as package documents.
pub const PACKAGE_EXTENSIONS: [&str; 4] = ["cwl", "yaml", "yml", "json"];

pub const X_AUTH_DOCKER_HEADER: &str = "x-auth-docker";

/// Where the package definition comes from.
#[derive(Debug, Clone)]
pub enum PackageSource {
    Inline(JsonValue),
    Reference(String),
}

/// Local-vs-remote classification of a loaded package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    AlwaysRemote,
    LocalCapable,
    Ambiguous,
}

pub struct PackageLoader {
    settings: std::sync::Arc<Settings>,
    http: HttpClient,
}

impl PackageLoader {
    pub fn new(settings: std::sync::Arc<Settings>) -> Result<PackageLoader> {
        let http = HttpClient::new(settings.worker.request_timeout_secs)?;
        Ok(PackageLoader { settings, http })
    }

    /// Full deployment pipeline: resolve the package, recursively resolve
    /// workflow steps, validate requirements against the instance
    /// configuration, merge I/O with the peer description, and extract any
    /// registry authentication from the deploy headers.
    pub async fn load_process(
        &self,
        pool: &PgPool,
        offering: &JsonValue,
        source: PackageSource,
        headers: &HashMap<String, String>,
    ) -> Result<Process> {
        let (mut package, info) = match source {
            PackageSource::Inline(raw) => (Package::new(raw), JsonValue::Null),
            PackageSource::Reference(reference) => {
                self.resolve_reference(&reference, Some(offering)).await?
            }
        };

        let class = package.class()?;
        let requirement = get_application_requirement(&package)?;
        self.check_instance_compatible(&requirement)?;

        let step_packages = if class == ToolClass::Workflow {
            self.resolve_workflow_steps(pool, &mut package).await?
        } else {
            StepMap::default()
        };

        // package I/O is authoritative; the offering only adds metadata
        let (package_inputs, package_outputs) = convert::package_io_defs(&package)?;
        let peer_inputs = peer_entries(offering, "inputs");
        let peer_outputs = peer_entries(offering, "outputs");
        let inputs = convert::merge_input_defs(package_inputs, &peer_inputs);
        let outputs = convert::merge_output_defs(package_outputs, &peer_outputs);

        let auth = extract_docker_auth(&requirement, headers)?;

        let id = offering
            .get("id")
            .or_else(|| offering.get("identifier"))
            .and_then(JsonValue::as_str)
            .map(str::to_owned)
            .or_else(|| info.get("id").and_then(JsonValue::as_str).map(str::to_owned))
            .or_else(|| package.id().map(str::to_owned))
            .ok_or_else(|| {
                Error::PackageRegistration("could not retrieve any process identifier".into())
            })?;
        let id = sane_name(&id)?;

        let title = offering
            .get("title")
            .and_then(JsonValue::as_str)
            .map(String::from)
            .or_else(|| package.raw.get("label").and_then(JsonValue::as_str).map(String::from))
            .or_else(|| info.get("title").and_then(JsonValue::as_str).map(String::from));
        let description = offering
            .get("abstract")
            .or_else(|| offering.get("description"))
            .and_then(JsonValue::as_str)
            .map(String::from)
            .or_else(|| package.raw.get("doc").and_then(JsonValue::as_str).map(String::from));
        let keywords = merge_keywords(offering, &package);

        let job_control_options = offering
            .get("jobControlOptions")
            .and_then(JsonValue::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(JsonValue::as_str)
                    .filter_map(JobControlOption::from_name)
                    .collect::<Vec<_>>()
            })
            .filter(|options| !options.is_empty())
            .unwrap_or_else(|| {
                vec![
                    JobControlOption::SyncExecute,
                    JobControlOption::AsyncExecute,
                ]
            });

        Ok(Process {
            id,
            version: offering
                .get("version")
                .and_then(JsonValue::as_str)
                .map(String::from),
            title,
            description,
            keywords,
            package,
            inputs,
            outputs,
            requirement,
            auth,
            visibility: Visibility::Private,
            job_control_options,
            step_packages,
        })
    }

    /// Resolve a reference into a package, inspecting `Content-Type` first
    /// and falling back to extension and content sniffing.
    pub async fn resolve_reference(
        &self,
        reference: &str,
        process_hint: Option<&JsonValue>,
    ) -> Result<(Package, JsonValue)> {
        let patched = patch_wps_reference(reference, process_hint);
        let (body, reported_type) = self.http.get_text(&patched).await.map_err(|err| {
            Error::PackageNotFound(format!("could not fetch reference '{reference}': {err}"))
        })?;

        let mut content_type = reported_type
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        if content_type.is_empty() || content_type == "text/plain" {
            content_type = sniff_content_type(reference, &body);
            debug!(%reference, %content_type, "resolved package content type by sniffing");
        }

        if content_type.contains("xml") {
            let provider = provider_base_from_describe_url(&patched);
            let (package, info) = wps_xml::describe_process_to_package(&body, &provider)?;
            let info = json!({"id": info.id, "title": info.title, "abstract": info.description});
            return Ok((package, info));
        }

        let payload: JsonValue = if content_type.contains("json") {
            serde_json::from_str(&body).map_err(|err| {
                Error::PackageRegistration(format!("invalid JSON package document: {err}"))
            })?
        } else {
            serde_yaml::from_str(&body).map_err(|err| {
                Error::PackageRegistration(format!("invalid YAML package document: {err}"))
            })?
        };

        if payload.get("cwlVersion").is_some() || payload.get("class").is_some() {
            let name = reference_name(reference);
            return Ok((Package::new(payload), json!({"id": name})));
        }
        if payload.get("process").is_some() || payload.get("id").is_some() {
            let package = convert::ogcapi_to_package(&payload, &patched)?;
            let info = payload.get("process").unwrap_or(&payload).clone();
            return Ok((package, info));
        }
        Err(Error::PackageNotFound(format!(
            "unknown parsing methodology of content type [{content_type}] for reference [{reference}]"
        )))
    }

    /// Recursively resolve `steps[*].run`, dumping each sub-package alongside
    /// the parent and re-writing the step reference to its local name.
    ///
    /// Returns `stepMap[stepName] = (id, subPackage)`.
    async fn resolve_workflow_steps(
        &self,
        pool: &PgPool,
        package: &mut Package,
    ) -> Result<StepMap> {
        crate::workflow::validate_step_graph(package)?;

        let mut step_map = StepMap::default();
        for (step_name, run_ref) in package.steps() {
            let step_id = step_reference_id(&run_ref);
            let sub_package = match &step_id {
                // a reference lacking a scheme is a sibling process id
                Some(process_id) => {
                    debug!(step = %step_name, process = %process_id, "resolving sibling step process");
                    let process = crate::db::processes::fetch_by_id(pool, process_id)
                        .await
                        .map_err(|_| {
                            Error::PackageNotFound(format!(
                                "workflow step '{step_name}' references unknown process '{process_id}'"
                            ))
                        })?;
                    process.package
                }
                None => {
                    debug!(step = %step_name, reference = %run_ref, "resolving remote step package");
                    let (sub, _) = Box::pin(self.resolve_reference(&run_ref, None)).await?;
                    sub
                }
            };

            // sub-packages must themselves hold a valid requirement
            get_application_requirement(&sub_package)?;

            let local_name = format!(
                "{}.cwl",
                step_id.unwrap_or_else(|| reference_name(&run_ref))
            );
            if let Some(run) = package
                .raw
                .pointer_mut(&format!("/steps/{step_name}/run"))
            {
                *run = JsonValue::String(local_name.clone());
            }
            step_map.insert(
                step_name,
                StepPackage {
                    id: local_name,
                    package: sub_package,
                },
            );
        }
        Ok(step_map)
    }

    /// Fail `always-remote` packages on instances that cannot dispatch them.
    fn check_instance_compatible(&self, requirement: &AppRequirement) -> Result<()> {
        let compatibility = classify(requirement);
        if compatibility == Compatibility::AlwaysRemote && !self.settings.mode.supports_remote() {
            return Err(Error::DeploymentIncompatible(format!(
                "package requirement [{}] requires a remote provider, but this instance only executes locally",
                requirement.class_name()
            )));
        }
        Ok(())
    }
}

/// Classify a requirement for the compatibility gate.
pub fn classify(requirement: &AppRequirement) -> Compatibility {
    if requirement.is_always_remote() {
        Compatibility::AlwaysRemote
    } else {
        match requirement {
            AppRequirement::Builtin { .. } | AppRequirement::Docker { .. } => {
                Compatibility::LocalCapable
            }
            _ => Compatibility::Ambiguous,
        }
    }
}

/// Extract Docker registry credentials from the `X-Auth-Docker` header when
/// the principal requirement pulls an image.
pub fn extract_docker_auth(
    requirement: &AppRequirement,
    headers: &HashMap<String, String>,
) -> Result<Option<DockerAuth>> {
    let header = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(X_AUTH_DOCKER_HEADER))
        .map(|(_, value)| value.as_str());
    let Some(value) = header else {
        return Ok(None);
    };
    let AppRequirement::Docker { docker_pull } = requirement else {
        debug!("ignoring docker authentication header for non-docker requirement");
        return Ok(None);
    };
    let mut parts = value.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().ok_or_else(|| {
        Error::PackageAuthentication(
            "authentication header provided without scheme or content".into(),
        )
    })?;
    let auth = DockerAuth::new(scheme, token, docker_pull)?;
    Ok(Some(auth))
}

fn peer_entries(offering: &JsonValue, field: &str) -> Vec<JsonValue> {
    match offering.get(field) {
        Some(JsonValue::Array(list)) => list.clone(),
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(id, def)| {
                let mut def = def.clone();
                if let Some(obj) = def.as_object_mut() {
                    obj.insert("id".to_string(), json!(id));
                }
                def
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn merge_keywords(offering: &JsonValue, package: &Package) -> Vec<String> {
    let mut keywords: Vec<String> = offering
        .get("keywords")
        .and_then(JsonValue::as_array)
        .map(|list| {
            list.iter()
                .filter_map(JsonValue::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if let Some(extra) = package.raw.get("s:keywords").and_then(JsonValue::as_array) {
        for keyword in extra.iter().filter_map(JsonValue::as_str) {
            if !keywords.iter().any(|k| k == keyword) {
                keywords.push(keyword.to_string());
            }
        }
    }
    keywords
}

/// Sniff the payload type when the reported `Content-Type` is absent or
/// `text/plain`: `{` means JSON, `<?xml` means XML, and the extension
/// decides between YAML and package documents otherwise.
fn sniff_content_type(reference: &str, body: &str) -> String {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') || reference.ends_with(".json") {
        "application/json".to_string()
    } else if trimmed.starts_with("<?xml") || trimmed.starts_with('<') || reference.ends_with(".xml")
    {
        "text/xml".to_string()
    } else if reference.ends_with(".yml") || reference.ends_with(".yaml") {
        "application/x-yaml".to_string()
    } else if reference.ends_with(".cwl") {
        "application/cwl+yaml".to_string()
    } else {
        "application/x-yaml".to_string()
    }
}

/// Rewrite a `GetCapabilities` URL into `DescribeProcess` form when a
/// process identifier is available from the query or the offering hint.
pub fn patch_wps_reference(reference: &str, process_hint: Option<&JsonValue>) -> String {
    let Ok(mut url) = Url::parse(reference) else {
        return reference.to_string();
    };
    let params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if params.is_empty() {
        return reference.to_string();
    }
    let request = params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("request"))
        .map(|(_, v)| v.to_ascii_lowercase());
    let identifier = params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("identifier"))
        .map(|(_, v)| v.clone())
        .or_else(|| {
            process_hint
                .and_then(|hint| hint.get("id").or_else(|| hint.get("identifier")))
                .and_then(JsonValue::as_str)
                .map(String::from)
        });

    if request.as_deref() == Some("getcapabilities") {
        if let Some(identifier) = identifier {
            let rewritten: Vec<(String, String)> = params
                .into_iter()
                .filter(|(k, _)| {
                    !k.eq_ignore_ascii_case("request") && !k.eq_ignore_ascii_case("identifier")
                })
                .chain([
                    ("request".to_string(), "DescribeProcess".to_string()),
                    ("identifier".to_string(), identifier),
                ])
                .collect();
            url.query_pairs_mut().clear().extend_pairs(rewritten);
            return url.to_string();
        }
        warn!(%reference, "GetCapabilities reference without process identifier");
    }
    reference.to_string()
}

/// Base name of a reference without its package extension.
fn reference_name(reference: &str) -> String {
    let name = crate::fetch::file_name_from_url(reference);
    match name.rsplit_once('.') {
        Some((stem, ext)) if PACKAGE_EXTENSIONS.contains(&ext) => stem.to_string(),
        _ => name,
    }
}

/// Interpret a workflow step `run` reference: scheme-less references are
/// sibling process ids (with any package extension stripped).
fn step_reference_id(run_ref: &str) -> Option<String> {
    if Url::parse(run_ref).is_ok() {
        return None;
    }
    let name = run_ref.trim_start_matches("./");
    if name.contains('/') {
        return None;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if PACKAGE_EXTENSIONS.contains(&ext) => Some(stem.to_string()),
        Some(_) => None,
        None => Some(name.to_string()),
    }
}

fn provider_base_from_describe_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}
