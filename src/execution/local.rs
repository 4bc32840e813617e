//! Local execution of command-line tool and builtin packages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::dispatch::WorkflowInputs;
use crate::error::{Error, Result};
use crate::fetch::HttpClient;
use crate::io::{IoKind, IoValue, OutputDef};
use crate::package::{AppRequirement, Package};
use crate::runner::{assemble_command, environment_from_package, CommandRuntime};

/// One collected output of a finished local run.
#[derive(Debug, Clone)]
pub enum CollectedOutput {
    File {
        id: String,
        paths: Vec<PathBuf>,
        media_type: Option<String>,
    },
    Literal {
        id: String,
        value: JsonValue,
        data_type: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct LocalRunOutput {
    pub outputs: Vec<CollectedOutput>,
    pub stdout: String,
    pub stderr: String,
}

/// Flatten an input value into the strings placed on the command line:
/// literals as text, file references as their staged local path.
fn command_values(value: &IoValue) -> Vec<String> {
    match value {
        IoValue::Array(values) => values.iter().flat_map(command_values).collect(),
        IoValue::Literal { value, .. } => vec![crate::io::json_scalar_to_string(value)],
        IoValue::FileRef { href, .. } | IoValue::DirRef { href } => {
            vec![href.strip_prefix("file://").unwrap_or(href).to_string()]
        }
        IoValue::BBox { bbox, .. } => vec![bbox
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(",")],
    }
}

/// Execute a locally runnable package in `workdir` and collect its outputs.
///
/// Subprocess stdout/stderr are captured into `stdout.log` / `stderr.log`
/// next to the produced outputs so they can be merged into the job log.
pub async fn execute_tool(
    package: &Package,
    requirement: &AppRequirement,
    output_defs: &[OutputDef],
    inputs: &WorkflowInputs,
    workdir: &Path,
    runtime: &dyn CommandRuntime,
    http: &HttpClient,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<LocalRunOutput> {
    tokio::fs::create_dir_all(workdir).await?;

    let mut run = LocalRunOutput::default();
    match requirement {
        AppRequirement::Builtin {
            process: Some(name),
        } => {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::PackageExecution("local execution dismissed".into()));
                }
                result = crate::builtin::run_builtin(name, inputs, workdir, http) => result?,
            }
        }
        AppRequirement::Builtin { process: None } | AppRequirement::Docker { .. } => {
            let mut values: HashMap<String, Vec<String>> = HashMap::new();
            for (id, value) in inputs {
                values.insert(id.clone(), command_values(value));
            }
            let command = assemble_command(package, &values)?;
            let env = environment_from_package(package);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::PackageExecution("local execution dismissed".into()));
                }
                outcome = runtime.run(command, env, workdir) => outcome?,
            };
            let succeeded = outcome.success();
            run.stdout = outcome.stdout;
            run.stderr = outcome.stderr;
            tokio::fs::write(workdir.join("stdout.log"), run.stdout.as_bytes()).await?;
            tokio::fs::write(workdir.join("stderr.log"), run.stderr.as_bytes()).await?;
            if !succeeded {
                let tail: String = run
                    .stderr
                    .lines()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(Error::PackageExecution(format!(
                    "tool exited with code {}: {tail}",
                    outcome.exit_code
                )));
            }
        }
        other => {
            return Err(Error::PackageExecution(format!(
                "requirement [{}] cannot execute locally",
                other.class_name()
            )))
        }
    }

    run.outputs = collect_outputs(output_defs, workdir, &run.stdout)?;
    Ok(run)
}

/// Map `outputId -> glob` with nested directory components stripped, the
/// way workflow steps stage each output in a flat per-id folder.
pub fn expected_outputs(output_defs: &[OutputDef]) -> HashMap<String, String> {
    output_defs
        .iter()
        .filter(|def| matches!(def.kind, IoKind::ComplexFile | IoKind::ComplexDirectory))
        .map(|def| {
            let glob = def.glob.as_deref().unwrap_or("*");
            let flat = glob.rsplit('/').next().unwrap_or(glob);
            (def.id.clone(), flat.to_string())
        })
        .collect()
}

fn collect_outputs(
    output_defs: &[OutputDef],
    workdir: &Path,
    stdout: &str,
) -> Result<Vec<CollectedOutput>> {
    let mut collected = Vec::new();
    for def in output_defs {
        match def.kind {
            IoKind::Literal => {
                // literal outputs carry the captured tool output
                collected.push(CollectedOutput::Literal {
                    id: def.id.clone(),
                    value: JsonValue::String(stdout.trim_end().to_string()),
                    data_type: def
                        .literal
                        .as_ref()
                        .map(|domain| domain.data_type.as_str().to_string()),
                });
            }
            IoKind::BoundingBox => {
                warn!(output = %def.id, "bounding box outputs are not produced by local runs");
            }
            IoKind::ComplexFile | IoKind::ComplexDirectory => {
                let glob = def.glob.as_deref().unwrap_or("*");
                let flat = glob.rsplit('/').next().unwrap_or(glob);
                let mut paths = find_matches(workdir, flat)?;
                if paths.is_empty() {
                    return Err(Error::PackageExecution(format!(
                        "expected output '{}' produced no file matching [{flat}]",
                        def.id
                    )));
                }
                if !def.array && paths.len() > 1 {
                    // tolerated with a warning, keeping the first match
                    warn!(
                        output = %def.id,
                        matched = paths.len(),
                        "single-value output matched multiple files, keeping the first"
                    );
                    paths.truncate(1);
                }
                debug!(output = %def.id, files = paths.len(), "collected output files");
                collected.push(CollectedOutput::File {
                    id: def.id.clone(),
                    paths,
                    media_type: def.default_format().map(|f| f.media_type.clone()),
                });
            }
        }
    }
    Ok(collected)
}

fn find_matches(workdir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = glob::Pattern::new(pattern).map_err(|err| {
        Error::PackageExecution(format!("invalid output glob [{pattern}]: {err}"))
    })?;
    let mut matches: Vec<PathBuf> = std::fs::read_dir(workdir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            // log captures are execution plumbing, never outputs
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name != "stdout.log" && name != "stderr.log" && matcher.matches(&name)
        })
        .collect();
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::convert::package_io_defs;
    use crate::runner::SubprocessRuntime;
    use serde_json::json;

    fn cancel() -> tokio_util::sync::CancellationToken {
        tokio_util::sync::CancellationToken::new()
    }

    #[tokio::test]
    async fn test_execute_echo_tool() {
        let package = Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "CommandLineTool",
            "baseCommand": "echo",
            "inputs": {"message": {"type": "string", "inputBinding": {"position": 1}}},
            "outputs": {"result": {"type": "string"}},
        }));
        let (_, outputs) = package_io_defs(&package).unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let http = HttpClient::new(5).unwrap();

        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "message".to_string(),
            IoValue::Literal {
                data_type: crate::io::DataType::String,
                value: json!("hello"),
            },
        );

        let run = execute_tool(
            &package,
            &AppRequirement::Builtin { process: None },
            &outputs,
            &inputs,
            workdir.path(),
            &SubprocessRuntime,
            &http,
            &cancel(),
        )
        .await
        .unwrap();

        assert_eq!(run.stdout.trim(), "hello");
        assert!(workdir.path().join("stdout.log").is_file());
        match &run.outputs[0] {
            CollectedOutput::Literal { value, .. } => assert_eq!(value, "hello"),
            other => panic!("expected literal output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_output_fails() {
        let package = Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "CommandLineTool",
            "baseCommand": "true",
            "inputs": {},
            "outputs": {"result": {"type": "File", "outputBinding": {"glob": "*.nc"}}},
        }));
        let (_, outputs) = package_io_defs(&package).unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let http = HttpClient::new(5).unwrap();

        let err = execute_tool(
            &package,
            &AppRequirement::Builtin { process: None },
            &outputs,
            &WorkflowInputs::new(),
            workdir.path(),
            &SubprocessRuntime,
            &http,
            &cancel(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::PackageExecution(_)));
    }

    #[test]
    fn test_expected_outputs_strip_nested_dirs() {
        let package = Package::new(json!({
            "class": "CommandLineTool",
            "inputs": {},
            "outputs": {
                "result": {"type": "File", "outputBinding": {"glob": "outputs/data/*.nc"}},
                "count": {"type": "int"},
            },
        }));
        let (_, outputs) = package_io_defs(&package).unwrap();
        let expected = expected_outputs(&outputs);
        assert_eq!(expected.get("result").map(String::as_str), Some("*.nc"));
        // literal outputs are not file expectations
        assert!(!expected.contains_key("count"));
    }

    #[tokio::test]
    async fn test_collect_prefers_first_for_single_output() {
        let workdir = tempfile::tempdir().unwrap();
        tokio::fs::write(workdir.path().join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(workdir.path().join("b.txt"), b"b").await.unwrap();

        let package = Package::new(json!({
            "class": "CommandLineTool",
            "inputs": {},
            "outputs": {"out": {"type": "File", "outputBinding": {"glob": "*.txt"}}},
        }));
        let (_, defs) = package_io_defs(&package).unwrap();
        let collected = collect_outputs(&defs, workdir.path(), "").unwrap();
        match &collected[0] {
            CollectedOutput::File { paths, .. } => {
                assert_eq!(paths.len(), 1);
                assert!(paths[0].ends_with("a.txt"));
            }
            other => panic!("expected file output, got {other:?}"),
        }
    }
}
