//! ESGF Compute Working Team dispatcher.
//!
//! ESGF-CWT endpoints speak WPS-1 with JSON-encoded data inputs: files are
//! packed as `Variable` records, and latitude/longitude/time bounds are
//! grouped from `{dim}_{start|end|crs}` literals into a `Domain`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::io::IoValue;

use super::wps1::Wps1Process;
use super::{
    DispatchContext, MonitorReference, RemoteInput, RemoteOutput, RemoteResult, WorkflowInputs,
    WpsProcess,
};

mod percent {
    pub const PREPARING: i32 = 2;
    pub const SENDING: i32 = 3;
    pub const COMPUTE_DONE: i32 = 98;
}

mod input_names {
    pub const FILES: &str = "files";
    pub const VARIABLE: &str = "variable";
    pub const API_KEY: &str = "api_key";
    pub const DIMENSIONS: [&str; 3] = ["time", "lat", "lon"];
}

const ALLOWED_CRS: [&str; 3] = ["values", "indices", "timestamps"];

pub struct EsgfCwtProcess {
    inner: Wps1Process,
}

impl EsgfCwtProcess {
    pub fn new(ctx: DispatchContext, provider: &str, process: &str) -> EsgfCwtProcess {
        EsgfCwtProcess {
            inner: Wps1Process::new(ctx, provider, process),
        }
    }
}

fn literal_text(value: &IoValue) -> Option<String> {
    match value {
        IoValue::Literal { value, .. } => Some(crate::io::json_scalar_to_string(value)),
        _ => None,
    }
}

fn get_variable(inputs: &WorkflowInputs) -> Result<String> {
    inputs
        .get(input_names::VARIABLE)
        .and_then(literal_text)
        .ok_or_else(|| {
            Error::InvalidParameterValue(format!(
                "missing required input: {}",
                input_names::VARIABLE
            ))
        })
}

fn get_file_urls(inputs: &WorkflowInputs) -> Result<Vec<String>> {
    let Some(files) = inputs.get(input_names::FILES) else {
        return Ok(Vec::new());
    };
    let entries: Vec<&IoValue> = match files {
        IoValue::Array(values) => values.iter().collect(),
        single => vec![single],
    };
    let mut urls = Vec::with_capacity(entries.len());
    for entry in entries {
        let href = entry.href().ok_or_else(|| {
            Error::InvalidParameterValue(format!(
                "input '{}' entries must be file references",
                input_names::FILES
            ))
        })?;
        if !href.starts_with("http") {
            return Err(Error::InvalidParameterValue(
                "ESGF processes only support URLs for file inputs".into(),
            ));
        }
        urls.push(href.to_string());
    }
    Ok(urls)
}

/// Group `{dim}_{start|end|crs}` literals into the CWT domain document.
///
/// `start`/`end` are cast to floats, the CRS must be one of
/// `values|indices|timestamps`, and latitude bounds are reversed
/// (`start = max`, `end = min`).
pub fn extract_domain(inputs: &WorkflowInputs) -> Result<Option<JsonValue>> {
    let mut grouped: BTreeMap<&str, BTreeMap<String, String>> = BTreeMap::new();
    for dim in input_names::DIMENSIONS {
        let prefix = format!("{dim}_");
        for (name, value) in inputs {
            if let Some(argument) = name.strip_prefix(&prefix) {
                if let Some(text) = literal_text(value) {
                    if !text.is_empty() {
                        grouped
                            .entry(dim)
                            .or_default()
                            .insert(argument.to_string(), text);
                    }
                }
            }
        }
    }

    if grouped.is_empty() {
        return Ok(None);
    }

    let mut dimensions = Map::new();
    for (dim, mut arguments) in grouped {
        for bound in ["start", "end"] {
            if !arguments.contains_key(bound) {
                return Err(Error::InvalidParameterValue(format!(
                    "missing required parameter: {dim}_{bound}"
                )));
            }
        }
        let mut start: f64 = parse_bound(dim, "start", &arguments)?;
        let mut end: f64 = parse_bound(dim, "end", &arguments)?;
        // latitude must be given reversed: start is the larger bound
        if dim == "lat" {
            let (hi, lo) = if start >= end { (start, end) } else { (end, start) };
            start = hi;
            end = lo;
        }
        let crs = match arguments.remove("crs") {
            Some(crs) => {
                if !ALLOWED_CRS.contains(&crs.as_str()) {
                    return Err(Error::InvalidParameterValue(format!(
                        "CRS must be in [{}]",
                        ALLOWED_CRS.join(", ")
                    )));
                }
                crs
            }
            None => "values".to_string(),
        };
        dimensions.insert(
            dim.to_string(),
            json!({"start": start, "end": end, "crs": crs}),
        );
    }

    let mut domain = Map::new();
    domain.insert("id".to_string(), json!("d0"));
    domain.extend(dimensions);
    Ok(Some(JsonValue::Object(domain)))
}

fn parse_bound(dim: &str, bound: &str, arguments: &BTreeMap<String, String>) -> Result<f64> {
    arguments
        .get(bound)
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| {
            Error::InvalidParameterValue(format!("cannot interpret {dim}_{bound} as a number"))
        })
}

/// CWT status messages end with the completion percentage.
pub(crate) fn trailing_percent(message: &str) -> Option<i32> {
    let tail = message.trim_end().rsplit(' ').next()?;
    let value: i32 = tail.parse().ok()?;
    (0..=100).contains(&value).then_some(value)
}

#[async_trait]
impl WpsProcess for EsgfCwtProcess {
    fn ctx(&self) -> &DispatchContext {
        self.inner.ctx()
    }

    async fn prepare(&self) -> Result<()> {
        self.inner.prepare().await
    }

    /// Pack CWT inputs: `variable` holds the `Variable(url, varname)` list,
    /// `domain` the grouped dimension bounds, `api_key` passes through.
    async fn stage_inputs(&self, inputs: &WorkflowInputs) -> Result<Vec<RemoteInput>> {
        self.ctx()
            .update_status("Preparing execute request for remote ESGF provider.", percent::PREPARING);

        let varname = get_variable(inputs)?;
        let urls = get_file_urls(inputs)?;
        let variables: Vec<JsonValue> = urls
            .iter()
            .map(|url| json!({"uri": url, "id": varname}))
            .collect();

        let mut remote = vec![RemoteInput {
            id: input_names::VARIABLE.to_string(),
            data: Some(JsonValue::Array(variables).to_string()),
            ..Default::default()
        }];
        if let Some(domain) = extract_domain(inputs)? {
            remote.push(RemoteInput {
                id: "domain".to_string(),
                data: Some(domain.to_string()),
                ..Default::default()
            });
        }
        if let Some(api_key) = inputs.get(input_names::API_KEY).and_then(literal_text) {
            remote.push(RemoteInput {
                id: input_names::API_KEY.to_string(),
                data: Some(api_key),
                ..Default::default()
            });
        }
        Ok(remote)
    }

    async fn dispatch(
        &self,
        inputs: Vec<RemoteInput>,
        outputs: Vec<RemoteOutput>,
    ) -> Result<MonitorReference> {
        self.ctx().update_status("Sending request.", percent::SENDING);
        self.inner.dispatch(inputs, outputs).await
    }

    async fn monitor(&self, reference: &MonitorReference) -> Result<bool> {
        self.inner
            .watch_status(&reference.location, |ctx, status| {
                let message = status.message.clone().unwrap_or_default();
                let percent = status
                    .percent
                    .or_else(|| trailing_percent(&message))
                    .unwrap_or(percent::SENDING)
                    .max(percent::SENDING)
                    .min(percent::COMPUTE_DONE);
                ctx.update_status(format!("ESGF status: {message}"), percent);
            })
            .await
    }

    async fn get_results(&self, reference: &MonitorReference) -> Result<Vec<RemoteResult>> {
        self.inner.get_results(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::DataType;

    fn literal(value: serde_json::Value) -> IoValue {
        IoValue::Literal {
            data_type: DataType::String,
            value,
        }
    }

    fn domain_inputs() -> WorkflowInputs {
        let mut inputs = WorkflowInputs::new();
        inputs.insert("lat_start".into(), literal(json!("10")));
        inputs.insert("lat_end".into(), literal(json!("60")));
        inputs.insert("lat_crs".into(), literal(json!("values")));
        inputs.insert("time_start".into(), literal(json!("0")));
        inputs.insert("time_end".into(), literal(json!("365")));
        inputs
    }

    #[test]
    fn test_domain_reverses_latitude() {
        let domain = extract_domain(&domain_inputs()).unwrap().unwrap();
        assert_eq!(domain["lat"]["start"], 60.0);
        assert_eq!(domain["lat"]["end"], 10.0);
        assert_eq!(domain["lat"]["crs"], "values");
        assert_eq!(domain["time"]["crs"], "values");
    }

    #[test]
    fn test_domain_requires_both_bounds() {
        let mut inputs = WorkflowInputs::new();
        inputs.insert("lon_start".into(), literal(json!("5")));
        let err = extract_domain(&inputs).unwrap_err();
        assert!(err.to_string().contains("lon_end"));
    }

    #[test]
    fn test_domain_validates_crs() {
        let mut inputs = domain_inputs();
        inputs.insert("lat_crs".into(), literal(json!("degrees")));
        assert!(extract_domain(&inputs).is_err());
    }

    #[test]
    fn test_no_domain_inputs() {
        let inputs = WorkflowInputs::new();
        assert!(extract_domain(&inputs).unwrap().is_none());
    }

    #[test]
    fn test_file_urls_must_be_http() {
        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "files".into(),
            IoValue::Array(vec![IoValue::file("/local/path.nc")]),
        );
        assert!(get_file_urls(&inputs).is_err());

        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "files".into(),
            IoValue::Array(vec![IoValue::file("https://esgf.example.com/x.nc")]),
        );
        assert_eq!(get_file_urls(&inputs).unwrap().len(), 1);
    }

    #[test]
    fn test_variable_required() {
        assert!(get_variable(&WorkflowInputs::new()).is_err());
        let mut inputs = WorkflowInputs::new();
        inputs.insert("variable".into(), literal(json!("tas")));
        assert_eq!(get_variable(&inputs).unwrap(), "tas");
    }

    #[test]
    fn test_trailing_percent() {
        assert_eq!(trailing_percent("ProcessStarted computing 42"), Some(42));
        assert_eq!(trailing_percent("no percent here"), None);
        assert_eq!(trailing_percent("too big 450"), None);
    }
}
