//! Builtin processes runnable without a container runtime.
//!
//! Each builtin ships its own package definition (registered at startup)
//! and an async implementation writing outputs into the job work directory.

use std::path::{Path, PathBuf};

use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::HttpClient;
use crate::io::IoValue;
use crate::package::{convert, AppRequirement, Package, Process, REQUIREMENT_BUILTIN};
use crate::types::{JobControlOption, Visibility};

pub const BUILTIN_ECHO: &str = "echo";
pub const BUILTIN_JSONARRAY2NETCDF: &str = "jsonarray2netcdf";
pub const BUILTIN_METALINK2NETCDF: &str = "metalink2netcdf";
pub const BUILTIN_FILE_INDEX_SELECTOR: &str = "file_index_selector";

/// Dispatch a builtin by process name.
pub async fn run_builtin(
    name: &str,
    inputs: &std::collections::HashMap<String, IoValue>,
    workdir: &Path,
    http: &HttpClient,
) -> Result<()> {
    match name {
        BUILTIN_ECHO => echo(inputs, workdir).await,
        BUILTIN_JSONARRAY2NETCDF => jsonarray2netcdf(inputs, workdir, http).await,
        BUILTIN_METALINK2NETCDF => metalink2netcdf(inputs, workdir, http).await,
        BUILTIN_FILE_INDEX_SELECTOR => file_index_selector(inputs, workdir, http).await,
        other => Err(Error::NoSuchProcess(format!("unknown builtin '{other}'"))),
    }
}

fn literal_input<'a>(
    inputs: &'a std::collections::HashMap<String, IoValue>,
    id: &str,
) -> Result<&'a JsonValue> {
    match inputs.get(id) {
        Some(IoValue::Literal { value, .. }) => Ok(value),
        _ => Err(Error::InvalidParameterValue(format!(
            "missing required literal input '{id}'"
        ))),
    }
}

/// Copy the message into the text output.
async fn echo(
    inputs: &std::collections::HashMap<String, IoValue>,
    workdir: &Path,
) -> Result<()> {
    let message = literal_input(inputs, "message")?;
    let text = crate::io::json_scalar_to_string(message);
    tokio::fs::write(workdir.join("output.txt"), text.as_bytes()).await?;
    Ok(())
}

async fn stage_local(
    href: &str,
    workdir: &Path,
    http: &HttpClient,
) -> Result<PathBuf> {
    if href.starts_with("http://") || href.starts_with("https://") {
        http.download(href, workdir).await
    } else {
        let local = href.strip_prefix("file://").unwrap_or(href);
        crate::fetch::link_or_copy(Path::new(local), workdir).await
    }
}

/// Read a JSON array of NetCDF file URLs and stage the referenced files as
/// the output.
async fn jsonarray2netcdf(
    inputs: &std::collections::HashMap<String, IoValue>,
    workdir: &Path,
    http: &HttpClient,
) -> Result<()> {
    let href = inputs
        .get("input")
        .and_then(IoValue::href)
        .ok_or_else(|| {
            Error::InvalidParameterValue("missing required file input 'input'".into())
        })?;
    let listing = stage_local(href, workdir, http).await?;
    let content = tokio::fs::read_to_string(&listing).await?;
    let urls: Vec<String> = serde_json::from_str(&content).map_err(|err| {
        Error::InvalidParameterValue(format!("input is not a JSON array of URLs: {err}"))
    })?;
    if urls.is_empty() {
        return Err(Error::InvalidParameterValue(
            "input JSON array contains no file reference".into(),
        ));
    }
    for url in &urls {
        if !url.ends_with(".nc") {
            return Err(Error::InvalidParameterValue(format!(
                "reference '{url}' is not a NetCDF file"
            )));
        }
        let staged = stage_local(url, workdir, http).await?;
        debug!(source = %url, dest = %staged.display(), "staged NetCDF reference");
    }
    tokio::fs::remove_file(&listing).await.ok();
    Ok(())
}

/// Extract the file URLs of a Metalink document, in listing order.
///
/// Both layouts are recognized: v3 (`files/file/resources/url`) and v4
/// (`file/metaurl`); the first URL of each `file` entry wins.
fn parse_metalink_urls(xml: &str) -> Result<Vec<String>> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut current: Option<Option<String>> = None;
    let mut in_url = false;

    let local = |raw: &[u8]| -> String {
        let name = String::from_utf8_lossy(raw);
        name.rsplit(':').next().unwrap_or(&name).to_string()
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local(e.name().as_ref()).as_str() {
                "file" => current = Some(None),
                "url" | "metaurl" => in_url = current.is_some(),
                _ => {}
            },
            Ok(Event::End(e)) => match local(e.name().as_ref()).as_str() {
                "file" => {
                    if let Some(url) = current.take().flatten() {
                        urls.push(url);
                    }
                }
                "url" | "metaurl" => in_url = false,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_url {
                    let text = t
                        .unescape()
                        .map_err(|err| {
                            Error::InvalidParameterValue(format!(
                                "invalid Metalink document: {err}"
                            ))
                        })?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        if let Some(slot) = current.as_mut() {
                            if slot.is_none() {
                                *slot = Some(text);
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(Error::InvalidParameterValue(format!(
                    "invalid Metalink document: {err}"
                )))
            }
        }
    }
    Ok(urls)
}

/// Fetch the NetCDF file listed at the given index (first element is 1) of
/// a Metalink document and stage it as the output.
async fn metalink2netcdf(
    inputs: &std::collections::HashMap<String, IoValue>,
    workdir: &Path,
    http: &HttpClient,
) -> Result<()> {
    let index = literal_input(inputs, "index")?
        .as_i64()
        .ok_or_else(|| Error::InvalidParameterValue("'index' must be an integer".into()))?;
    let href = inputs
        .get("metalink")
        .and_then(IoValue::href)
        .ok_or_else(|| {
            Error::InvalidParameterValue("missing required file input 'metalink'".into())
        })?;
    let listing = stage_local(href, workdir, http).await?;
    let content = tokio::fs::read_to_string(&listing).await?;
    let urls = parse_metalink_urls(&content)?;
    if index < 1 || index as usize > urls.len() {
        return Err(Error::InvalidParameterValue(format!(
            "index {index} is out of the Metalink file range (1..={})",
            urls.len()
        )));
    }
    let url = &urls[index as usize - 1];
    if !url.ends_with(".nc") {
        return Err(Error::InvalidParameterValue(format!(
            "resolved file URL '{url}' is not a valid NetCDF reference"
        )));
    }
    let staged = stage_local(url, workdir, http).await?;
    debug!(source = %url, dest = %staged.display(), "staged NetCDF reference from Metalink");
    tokio::fs::remove_file(&listing).await.ok();
    Ok(())
}

/// Select the i-th entry of a file array.
async fn file_index_selector(
    inputs: &std::collections::HashMap<String, IoValue>,
    workdir: &Path,
    http: &HttpClient,
) -> Result<()> {
    let index = literal_input(inputs, "index")?
        .as_i64()
        .ok_or_else(|| Error::InvalidParameterValue("'index' must be an integer".into()))?;
    let files = match inputs.get("files") {
        Some(IoValue::Array(values)) => values.clone(),
        Some(single) => vec![single.clone()],
        None => {
            return Err(Error::InvalidParameterValue(
                "missing required input 'files'".into(),
            ))
        }
    };
    let selected = files
        .get(usize::try_from(index).map_err(|_| {
            Error::InvalidParameterValue(format!("index {index} is out of range"))
        })?)
        .and_then(IoValue::href)
        .ok_or_else(|| {
            Error::InvalidParameterValue(format!(
                "index {index} does not select a file reference (got {} entries)",
                files.len()
            ))
        })?;
    stage_local(selected, workdir, http).await?;
    Ok(())
}

fn builtin_package(id: &str, inputs: JsonValue, outputs: JsonValue) -> Package {
    let mut hints = serde_json::Map::new();
    hints.insert(REQUIREMENT_BUILTIN.to_string(), json!({"process": id}));
    Package::new(json!({
        "cwlVersion": "v1.0",
        "class": "CommandLineTool",
        "id": id,
        "hints": hints,
        "inputs": inputs,
        "outputs": outputs,
    }))
}

/// Package definitions of every builtin, ready for registration.
pub fn builtin_processes() -> Result<Vec<Process>> {
    let definitions = [
        builtin_package(
            BUILTIN_ECHO,
            json!({"message": {"type": "string"}}),
            json!({"output": {"type": "File", "format": "text/plain",
                    "outputBinding": {"glob": "output.txt"}}}),
        ),
        builtin_package(
            BUILTIN_JSONARRAY2NETCDF,
            json!({"input": {"type": "File", "format": "application/json"}}),
            json!({"output": {"type": "File", "format": "application/x-netcdf",
                    "outputBinding": {"glob": "*.nc"}}}),
        ),
        builtin_package(
            BUILTIN_METALINK2NETCDF,
            json!({
                "metalink": {"type": "File", "format": "application/metalink4+xml"},
                "index": {"type": "int"},
            }),
            json!({"output": {"type": "File", "format": "application/x-netcdf",
                    "outputBinding": {"glob": "*.nc"}}}),
        ),
        builtin_package(
            BUILTIN_FILE_INDEX_SELECTOR,
            json!({
                "files": {"type": {"type": "array", "items": "File"}},
                "index": {"type": "int"},
            }),
            json!({"output": {"type": "File", "outputBinding": {"glob": "*"}}}),
        ),
    ];

    let mut processes = Vec::new();
    for package in definitions {
        let id = package
            .id()
            .map(String::from)
            .unwrap_or_default();
        let (inputs, outputs) = convert::package_io_defs(&package)?;
        processes.push(Process {
            id: id.clone(),
            version: None,
            title: Some(id.clone()),
            description: None,
            keywords: vec!["builtin".to_string()],
            package,
            inputs,
            outputs,
            requirement: AppRequirement::Builtin {
                process: Some(id),
            },
            auth: None,
            visibility: Visibility::Public,
            job_control_options: vec![
                JobControlOption::SyncExecute,
                JobControlOption::AsyncExecute,
            ],
            step_packages: Default::default(),
        });
    }
    Ok(processes)
}
