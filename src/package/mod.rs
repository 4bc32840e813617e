//! Application Package model.
//!
//! A package is the declarative description of a runnable unit (a single
//! command-line tool, an expression tool, or a workflow composing other
//! tools). [`Package`] wraps the raw document and exposes typed accessors;
//! [`Process`] is the normalized, deployable form with merged I/O and a
//! validated principal requirement.

pub mod convert;
pub mod loader;
pub mod wps_xml;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::io::{InputDef, OutputDef};
use crate::types::{JobControlOption, Visibility};

pub const REQUIREMENT_DOCKER: &str = "DockerRequirement";
pub const REQUIREMENT_BUILTIN: &str = "BuiltinRequirement";
pub const REQUIREMENT_WPS1: &str = "WPS1Requirement";
pub const REQUIREMENT_ESGF_CWT: &str = "ESGF-CWTRequirement";
pub const REQUIREMENT_OGC_API: &str = "OGCAPIRequirement";

/// Principal requirement classes: exactly one may appear in a package.
pub const REQUIREMENTS_PRINCIPAL: [&str; 5] = [
    REQUIREMENT_BUILTIN,
    REQUIREMENT_DOCKER,
    REQUIREMENT_OGC_API,
    REQUIREMENT_WPS1,
    REQUIREMENT_ESGF_CWT,
];

/// Auxiliary requirement classes tolerated alongside the principal one.
pub const REQUIREMENTS_AUXILIARY: [&str; 3] = [
    "EnvVarRequirement",
    "ResourceRequirement",
    "InitialWorkDirRequirement",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolClass {
    CommandLineTool,
    ExpressionTool,
    Workflow,
}

impl ToolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolClass::CommandLineTool => "CommandLineTool",
            ToolClass::ExpressionTool => "ExpressionTool",
            ToolClass::Workflow => "Workflow",
        }
    }

    pub fn from_name(name: &str) -> Result<ToolClass> {
        match name {
            "CommandLineTool" => Ok(ToolClass::CommandLineTool),
            "ExpressionTool" => Ok(ToolClass::ExpressionTool),
            "Workflow" => Ok(ToolClass::Workflow),
            other => Err(Error::PackageType(format!(
                "unknown package class '{other}', expected one of CommandLineTool, ExpressionTool, Workflow"
            ))),
        }
    }
}

/// Principal application requirement deciding how a process executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum AppRequirement {
    #[serde(rename = "BuiltinRequirement")]
    Builtin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process: Option<String>,
    },
    #[serde(rename = "DockerRequirement")]
    Docker {
        #[serde(rename = "dockerPull")]
        docker_pull: String,
    },
    #[serde(rename = "OGCAPIRequirement")]
    OgcApi {
        /// Full process URL: `{providerBase}/processes/{processId}`.
        process: String,
    },
    #[serde(rename = "WPS1Requirement")]
    Wps1 { provider: String, process: String },
    #[serde(rename = "ESGF-CWTRequirement")]
    EsgfCwt { provider: String, process: String },
    #[serde(rename = "Workflow")]
    Workflow,
}

impl AppRequirement {
    pub fn class_name(&self) -> &'static str {
        match self {
            AppRequirement::Builtin { .. } => REQUIREMENT_BUILTIN,
            AppRequirement::Docker { .. } => REQUIREMENT_DOCKER,
            AppRequirement::OgcApi { .. } => REQUIREMENT_OGC_API,
            AppRequirement::Wps1 { .. } => REQUIREMENT_WPS1,
            AppRequirement::EsgfCwt { .. } => REQUIREMENT_ESGF_CWT,
            AppRequirement::Workflow => "Workflow",
        }
    }

    /// Whether this requirement can only be satisfied by dispatching to an
    /// external provider.
    pub fn is_always_remote(&self) -> bool {
        matches!(
            self,
            AppRequirement::OgcApi { .. }
                | AppRequirement::Wps1 { .. }
                | AppRequirement::EsgfCwt { .. }
                | AppRequirement::Workflow
        )
    }

    fn from_entry(entry: &JsonValue) -> Result<AppRequirement> {
        let class = entry
            .get("class")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let field = |name: &str| -> Result<String> {
            entry
                .get(name)
                .and_then(JsonValue::as_str)
                .map(str::to_owned)
                .ok_or_else(|| {
                    Error::InvalidRequirement(format!("requirement {class} is missing '{name}'"))
                })
        };
        match class {
            REQUIREMENT_BUILTIN => Ok(AppRequirement::Builtin {
                process: entry
                    .get("process")
                    .and_then(JsonValue::as_str)
                    .map(str::to_owned),
            }),
            REQUIREMENT_DOCKER => Ok(AppRequirement::Docker {
                docker_pull: field("dockerPull")?,
            }),
            REQUIREMENT_OGC_API => Ok(AppRequirement::OgcApi {
                process: field("process")?,
            }),
            REQUIREMENT_WPS1 => Ok(AppRequirement::Wps1 {
                provider: field("provider")?,
                process: field("process")?,
            }),
            REQUIREMENT_ESGF_CWT => Ok(AppRequirement::EsgfCwt {
                provider: field("provider")?,
                process: field("process")?,
            }),
            other => Err(Error::InvalidRequirement(format!(
                "unknown application requirement class '{other}'"
            ))),
        }
    }
}

/// Registry authentication attached to a Docker application requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAuth {
    pub scheme: String,
    pub token: String,
    /// The `dockerPull` image reference the credentials are bound to.
    pub link: String,
}

impl DockerAuth {
    pub fn new(scheme: &str, token: &str, link: &str) -> Result<DockerAuth> {
        let scheme = capitalize(scheme.trim());
        if scheme != "Basic" {
            return Err(Error::InvalidAuthenticationScheme(format!(
                "authentication scheme '{scheme}' is not supported (supported: Basic)"
            )));
        }
        if token.trim().is_empty() {
            return Err(Error::PackageAuthentication(
                "empty authentication token".to_string(),
            ));
        }
        Ok(DockerAuth {
            scheme,
            token: token.trim().to_string(),
            link: link.to_string(),
        })
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Raw package document with typed accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Package {
    pub raw: JsonValue,
}

impl Package {
    pub fn new(raw: JsonValue) -> Package {
        Package { raw }
    }

    pub fn class(&self) -> Result<ToolClass> {
        let name = self
            .raw
            .get("class")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                Error::PackageRegistration("cannot obtain process type from package class".into())
            })?;
        ToolClass::from_name(name)
    }

    pub fn id(&self) -> Option<&str> {
        self.raw.get("id").and_then(JsonValue::as_str)
    }

    /// Requirements and hints, both containers normalized to a list of
    /// `{"class": ..., ...params}` entries regardless of the mapping or
    /// listing representation used in the document.
    pub fn requirements_and_hints(&self) -> Vec<JsonValue> {
        let mut entries = normalize_requirements(self.raw.get("requirements"));
        entries.extend(normalize_requirements(self.raw.get("hints")));
        entries
    }

    /// Workflow steps as `(name, run reference)` pairs, in document order.
    pub fn steps(&self) -> Vec<(String, String)> {
        let Some(steps) = self.raw.get("steps") else {
            return Vec::new();
        };
        match steps {
            JsonValue::Object(map) => map
                .iter()
                .filter_map(|(name, step)| {
                    step.get("run")
                        .and_then(JsonValue::as_str)
                        .map(|run| (name.clone(), run.to_string()))
                })
                .collect(),
            JsonValue::Array(list) => list
                .iter()
                .filter_map(|step| {
                    let name = step.get("id").and_then(JsonValue::as_str)?;
                    let run = step.get("run").and_then(JsonValue::as_str)?;
                    Some((name.to_string(), run.to_string()))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Step input connections of a workflow step, as
    /// `(input id, upstream "step/output" reference)` pairs.
    pub fn step_inputs(&self, step_name: &str) -> Vec<(String, String)> {
        let Some(step) = self.raw.pointer(&format!("/steps/{step_name}/in")) else {
            return Vec::new();
        };
        match step {
            JsonValue::Object(map) => map
                .iter()
                .filter_map(|(id, source)| {
                    source.as_str().map(|s| (id.clone(), s.to_string()))
                })
                .collect(),
            JsonValue::Array(list) => list
                .iter()
                .filter_map(|entry| {
                    let id = entry.get("id").and_then(JsonValue::as_str)?;
                    let source = entry.get("source").and_then(JsonValue::as_str)?;
                    Some((id.to_string(), source.to_string()))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// I/O definitions normalized to ordered `(id, definition)` pairs from
    /// either the mapping (`{id: def}`) or listing (`[{id, ...}]`) form.
    pub fn io_entries(&self, field: &str) -> Vec<(String, JsonValue)> {
        normalize_ordered_io(self.raw.get(field))
    }

    /// Canonical JSON serialization: object keys sorted recursively so that
    /// repeated deploys of the same package normalize byte-identically.
    pub fn canonical_json(&self) -> String {
        canonicalize(&self.raw).to_string()
    }
}

fn normalize_requirements(value: Option<&JsonValue>) -> Vec<JsonValue> {
    match value {
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(class, params)| {
                let mut entry = Map::new();
                entry.insert("class".to_string(), JsonValue::String(class.clone()));
                if let JsonValue::Object(params) = params {
                    for (k, v) in params {
                        entry.insert(k.clone(), v.clone());
                    }
                }
                JsonValue::Object(entry)
            })
            .collect(),
        Some(JsonValue::Array(list)) => list.clone(),
        _ => Vec::new(),
    }
}

/// Normalize a CWL I/O container into ordered `(id, definition)` pairs.
pub fn normalize_ordered_io(value: Option<&JsonValue>) -> Vec<(String, JsonValue)> {
    match value {
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(id, def)| {
                // shorthand "id: type" entries expand to {"type": ...}
                let def = if def.is_string() {
                    json!({ "type": def })
                } else {
                    def.clone()
                };
                (id.clone(), def)
            })
            .collect(),
        Some(JsonValue::Array(list)) => list
            .iter()
            .filter_map(|def| {
                let id = def.get("id").and_then(JsonValue::as_str)?;
                Some((id.to_string(), def.clone()))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut sorted: Vec<(&String, &JsonValue)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(list) => JsonValue::Array(list.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Extract the unique principal requirement, validating that every other
/// requirement/hint belongs to the supported auxiliary set.
pub fn get_application_requirement(package: &Package) -> Result<AppRequirement> {
    let entries = package.requirements_and_hints();
    let principal: Vec<&JsonValue> = entries
        .iter()
        .filter(|entry| {
            entry
                .get("class")
                .and_then(JsonValue::as_str)
                .map(|class| REQUIREMENTS_PRINCIPAL.iter().any(|p| class.ends_with(p)))
                .unwrap_or(false)
        })
        .collect();

    if principal.len() > 1 {
        return Err(Error::InvalidRequirement(format!(
            "package requirements/hints define {} conflicting application requirements, only one permitted amongst {:?}",
            principal.len(),
            REQUIREMENTS_PRINCIPAL
        )));
    }

    for entry in &entries {
        let class = entry
            .get("class")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let supported = REQUIREMENTS_PRINCIPAL.iter().any(|p| class.ends_with(p))
            || REQUIREMENTS_AUXILIARY.contains(&class);
        if !supported {
            return Err(Error::InvalidRequirement(format!(
                "unsupported requirement class '{class}'"
            )));
        }
    }

    if package.class()? == ToolClass::Workflow {
        return Ok(AppRequirement::Workflow);
    }
    match principal.first() {
        Some(entry) => AppRequirement::from_entry(entry),
        // CommandLineTool without an explicit application requirement runs
        // as a plain local command
        None => Ok(AppRequirement::Builtin { process: None }),
    }
}

/// Sub-packages resolved from workflow steps, keyed by step name.
pub type StepMap = IndexMap<String, StepPackage>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPackage {
    /// Local identifier the step's `run` reference was re-written to.
    pub id: String,
    pub package: Package,
}

/// Normalized, deployable process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "abstract")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub package: Package,
    pub inputs: Vec<InputDef>,
    pub outputs: Vec<OutputDef>,
    pub requirement: AppRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<DockerAuth>,
    pub visibility: Visibility,
    pub job_control_options: Vec<JobControlOption>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub step_packages: StepMap,
}

impl Process {
    pub fn supports_sync(&self) -> bool {
        self.job_control_options
            .contains(&JobControlOption::SyncExecute)
    }

    pub fn supports_async(&self) -> bool {
        self.job_control_options
            .contains(&JobControlOption::AsyncExecute)
    }

    /// Identifier in `id[:version]` form.
    pub fn tagged_id(&self) -> String {
        match &self.version {
            Some(version) if !version.is_empty() => format!("{}:{}", self.id, version),
            _ => self.id.clone(),
        }
    }
}

/// Restrict an identifier to a sane slug: `[A-Za-z0-9_-]`, length-capped.
pub fn sane_name(raw: &str) -> Result<String> {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches('-').to_string();
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidIdentifierValue(format!(
            "cannot derive a valid identifier from '{raw}'"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docker_package() -> Package {
        Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "CommandLineTool",
            "baseCommand": "echo",
            "requirements": {"DockerRequirement": {"dockerPull": "debian:stretch"}},
            "inputs": {"message": {"type": "string"}},
            "outputs": {}
        }))
    }

    #[test]
    fn test_requirement_extraction() {
        let req = get_application_requirement(&docker_package()).unwrap();
        assert_eq!(
            req,
            AppRequirement::Docker {
                docker_pull: "debian:stretch".to_string()
            }
        );
        assert!(!req.is_always_remote());
    }

    #[test]
    fn test_conflicting_principal_requirements_rejected() {
        let package = Package::new(json!({
            "class": "CommandLineTool",
            "requirements": {"DockerRequirement": {"dockerPull": "img"}},
            "hints": {"WPS1Requirement": {"provider": "https://wps.example.com", "process": "p"}},
            "inputs": {},
            "outputs": {}
        }));
        let err = get_application_requirement(&package).unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidRequirement(_)));
    }

    #[test]
    fn test_unsupported_auxiliary_requirement_rejected() {
        let package = Package::new(json!({
            "class": "CommandLineTool",
            "requirements": {"ShellCommandRequirement": {}},
            "inputs": {},
            "outputs": {}
        }));
        assert!(get_application_requirement(&package).is_err());
    }

    #[test]
    fn test_workflow_class_implies_workflow_requirement() {
        let package = Package::new(json!({
            "class": "Workflow",
            "inputs": {},
            "outputs": {},
            "steps": {}
        }));
        assert_eq!(
            get_application_requirement(&package).unwrap(),
            AppRequirement::Workflow
        );
    }

    #[test]
    fn test_requirement_list_normalization() {
        let mapping = docker_package();
        let listing = Package::new(json!({
            "class": "CommandLineTool",
            "requirements": [{"class": "DockerRequirement", "dockerPull": "debian:stretch"}],
            "inputs": {},
            "outputs": {}
        }));
        assert_eq!(
            mapping.requirements_and_hints(),
            listing.requirements_and_hints()
        );
    }

    #[test]
    fn test_docker_auth_scheme_validation() {
        assert!(DockerAuth::new("Basic", "dG9rZW4=", "registry/image:tag").is_ok());
        assert!(DockerAuth::new("basic", "dG9rZW4=", "registry/image:tag").is_ok());
        let err = DockerAuth::new("Bearer", "tok", "registry/image:tag").unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::InvalidAuthenticationScheme(_)
        ));
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let a = Package::new(json!({"b": 1, "a": {"z": 2, "y": 3}}));
        let b = Package::new(json!({"a": {"y": 3, "z": 2}, "b": 1}));
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn test_sane_name() {
        assert_eq!(sane_name("my process v1").unwrap(), "my-process-v1");
        assert_eq!(sane_name("jsonarray2netcdf").unwrap(), "jsonarray2netcdf");
        assert!(sane_name("???").is_err());
    }
}
