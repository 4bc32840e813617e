//! Workflow step runner.
//!
//! Walks a workflow package's steps in topological order, dispatches each
//! step to the backend selected by its principal requirement, and re-hosts
//! intermediate outputs under the WPS output URL so downstream steps
//! (possibly on another host) can fetch them over HTTP.

use std::collections::HashMap;
use std::path::Path;

use petgraph::graph::DiGraph;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::config::Settings;
use crate::dispatch::{
    ades::AdesProcess, esgf::EsgfCwtProcess, ogc_api::OgcApiProcess, wps1::Wps1Process,
    DispatchContext, ExpectedOutputs, StatusSink, StatusUpdate, WorkflowInputs, WpsProcess,
};
use crate::error::{Error, Result};
use crate::execution::local;
use crate::fetch::HttpClient;
use crate::io::{IoKind, IoValue};
use crate::package::{
    convert, get_application_requirement, AppRequirement, Package, StepMap,
};
use crate::runner::CommandRuntime;
use crate::status::progress::map_range;

/// Parent-job progress window allotted to workflow steps.
const STEP_WINDOW_MIN: i32 = 10;
const STEP_WINDOW_MAX: i32 = 95;

pub struct WorkflowContext<'a> {
    pub settings: std::sync::Arc<Settings>,
    pub sink: StatusSink,
    pub cancel: tokio_util::sync::CancellationToken,
    pub http: HttpClient,
    pub runtime: &'a dyn CommandRuntime,
    /// `Authorization` header of the originating request, forwarded to
    /// remote ADES dispatches.
    pub forwarded_auth: Option<String>,
}

/// Reject step graphs with cycles or references to unknown steps.
///
/// Steps refer to each other by name (`stepName/outputId` sources); the
/// graph is keyed by step name, never by pointer.
pub fn validate_step_graph(package: &Package) -> Result<()> {
    step_order(package).map(|_| ())
}

/// Topological order of the workflow steps.
pub fn step_order(package: &Package) -> Result<Vec<String>> {
    let steps = package.steps();
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut indices = HashMap::new();
    for (name, _) in &steps {
        let index = graph.add_node(name.clone());
        indices.insert(name.clone(), index);
    }
    for (name, _) in &steps {
        for (_, source) in package.step_inputs(name) {
            if let Some((upstream, _)) = source.split_once('/') {
                let Some(&from) = indices.get(upstream) else {
                    return Err(Error::PackageType(format!(
                        "workflow step '{name}' references unknown step '{upstream}'"
                    )));
                };
                let Some(&to) = indices.get(name) else {
                    continue;
                };
                graph.add_edge(from, to, ());
            }
        }
    }
    let sorted = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
        Error::PackageType(format!(
            "workflow steps form a cycle around '{}'",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(sorted.into_iter().map(|index| graph[index].clone()).collect())
}

fn deploy_body(step_id: &str, package: &Package) -> JsonValue {
    json!({
        "processDescription": {"process": {"id": step_id}},
        "executionUnit": [{"unit": package.raw}],
        "deploymentProfileName": "http://www.opengis.net/profiles/eoc/dockerizedApplication",
    })
}

/// Forward dispatcher progress into the step's slice of the parent window.
fn step_sink(
    parent: StatusSink,
    window: (i32, i32),
    step_name: String,
) -> (StatusSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StatusUpdate>();
    let handle = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let mapped = map_range(update.progress as f64, window.0, window.1);
            let _ = parent.send(StatusUpdate {
                message: format!("[{step_name}] {}", update.message),
                progress: mapped,
            });
        }
    });
    (tx, handle)
}

/// Run the workflow and return its final outputs keyed by output id.
pub async fn run_workflow(
    ctx: &WorkflowContext<'_>,
    package: &Package,
    step_map: &StepMap,
    inputs: &WorkflowInputs,
    work_root: &Path,
) -> Result<HashMap<String, IoValue>> {
    let order = step_order(package)?;
    let total = order.len().max(1);
    let host_ctx = DispatchContext::new(
        ctx.settings.clone(),
        ctx.sink.clone(),
        ctx.cancel.clone(),
    )?;

    let mut step_outputs: HashMap<String, HashMap<String, IoValue>> = HashMap::new();
    for (index, step_name) in order.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(Error::PackageExecution("workflow dismissed".into()));
        }
        let step = step_map.get(step_name).ok_or_else(|| {
            Error::PackageNotFound(format!("workflow step '{step_name}' has no resolved package"))
        })?;
        let requirement = get_application_requirement(&step.package)?;
        let (_, output_defs) = convert::package_io_defs(&step.package)?;

        let window = (
            map_range(
                index as f64 / total as f64 * 100.0,
                STEP_WINDOW_MIN,
                STEP_WINDOW_MAX,
            ),
            map_range(
                (index + 1) as f64 / total as f64 * 100.0,
                STEP_WINDOW_MIN,
                STEP_WINDOW_MAX,
            ),
        );
        info!(step = %step_name, requirement = requirement.class_name(), "running workflow step");
        let _ = ctx.sink.send(StatusUpdate {
            message: format!(
                "Running workflow step [{step_name}] ({}/{total}).",
                index + 1
            ),
            progress: window.0,
        });

        // resolve step inputs from workflow inputs and upstream outputs
        let mut step_inputs = WorkflowInputs::new();
        for (input_id, source) in package.step_inputs(step_name) {
            let value = match source.split_once('/') {
                Some((upstream, output_id)) if step_outputs.contains_key(upstream) => step_outputs
                    [upstream]
                    .get(output_id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::PackageExecution(format!(
                            "step '{step_name}' references missing output '{source}'"
                        ))
                    })?,
                _ => inputs.get(source.as_str()).cloned().ok_or_else(|| {
                    Error::InvalidParameterValue(format!(
                        "step '{step_name}' input '{input_id}' is not satisfied by '{source}'"
                    ))
                })?,
            };
            step_inputs.insert(input_id, value);
        }

        let step_dir = work_root.join(step_name);
        tokio::fs::create_dir_all(&step_dir).await?;

        // upstream output locations flatten to one directory per output id
        let flat_expected = local::expected_outputs(&output_defs);
        let mut nested_expected: ExpectedOutputs = flat_expected
            .iter()
            .map(|(id, glob)| (id.clone(), format!("{id}/{glob}")))
            .collect();
        for def in output_defs.iter().filter(|def| def.kind == IoKind::Literal) {
            // inline remote values stage as text files named by the output
            nested_expected.insert(def.id.clone(), format!("{}/{}.txt", def.id, def.id));
        }

        let (sink, forwarder) = step_sink(ctx.sink.clone(), window, step_name.clone());
        let dispatch_ctx =
            DispatchContext::new(ctx.settings.clone(), sink, ctx.cancel.clone())?;

        let mut remote_nested = true;
        match &requirement {
            AppRequirement::OgcApi { process } => {
                let dispatcher = OgcApiProcess::new(dispatch_ctx, process)?;
                dispatcher
                    .execute(&step_inputs, &step_dir, &nested_expected)
                    .await?;
            }
            AppRequirement::Wps1 { provider, process } => {
                let dispatcher = Wps1Process::new(dispatch_ctx, provider, process);
                dispatcher
                    .execute(&step_inputs, &step_dir, &nested_expected)
                    .await?;
            }
            AppRequirement::EsgfCwt { provider, process } => {
                let dispatcher = EsgfCwtProcess::new(dispatch_ctx, provider, process);
                dispatcher
                    .execute(&step_inputs, &step_dir, &nested_expected)
                    .await?;
            }
            AppRequirement::Builtin { .. } | AppRequirement::Docker { .. } => {
                if ctx.settings.mode.supports_local() {
                    remote_nested = false;
                    let mut staged = step_inputs.clone();
                    crate::execution::inputs::stage_input_files(
                        &mut staged,
                        &step_dir,
                        &ctx.settings,
                        &ctx.http,
                    )
                    .await?;
                    local::execute_tool(
                        &step.package,
                        &requirement,
                        &output_defs,
                        &staged,
                        &step_dir,
                        ctx.runtime,
                        &ctx.http,
                        &ctx.cancel,
                    )
                    .await?;
                } else {
                    let provider = ctx.settings.ades.url.as_deref().ok_or_else(|| {
                        Error::DeploymentIncompatible(
                            "application step requires a remote ADES but none is configured"
                                .into(),
                        )
                    })?;
                    let dispatcher = AdesProcess::new(
                        dispatch_ctx,
                        provider,
                        step.id.trim_end_matches(".cwl"),
                        deploy_body(step.id.trim_end_matches(".cwl"), &step.package),
                        ctx.forwarded_auth.clone(),
                    );
                    dispatcher
                        .execute(&step_inputs, &step_dir, &nested_expected)
                        .await?;
                }
            }
            AppRequirement::Workflow => {
                return Err(Error::PackageType(format!(
                    "step '{step_name}' nests another workflow, which is not supported"
                )))
            }
        }
        forwarder.abort();

        // host produced outputs so any downstream step can fetch them
        let mut outputs = HashMap::new();
        for def in &output_defs {
            // literal step outputs surface as text files written by the
            // dispatcher staging layer under the output id folder
            let Some(glob) = flat_expected.get(&def.id).cloned().or_else(|| {
                (def.kind == IoKind::Literal && remote_nested)
                    .then(|| format!("{}.txt", def.id))
            }) else {
                continue;
            };
            let search_dir = if remote_nested {
                step_dir.join(&def.id)
            } else {
                step_dir.clone()
            };
            let matches = find_step_outputs(&search_dir, &glob)?;
            let mut values = Vec::with_capacity(matches.len());
            for path in matches {
                let href = host_ctx
                    .host_file(&path.to_string_lossy())
                    .await?;
                values.push(IoValue::file(href));
            }
            let value = match (def.array, values.len()) {
                (_, 0) => continue,
                (false, _) => values.into_iter().next().unwrap_or(IoValue::file("")),
                (true, _) => IoValue::Array(values),
            };
            outputs.insert(def.id.clone(), value);
        }
        debug!(step = %step_name, outputs = outputs.len(), "workflow step outputs hosted");
        step_outputs.insert(step_name.clone(), outputs);
    }

    // final workflow outputs follow their `outputSource` references
    let mut final_outputs = HashMap::new();
    for (output_id, def) in package.io_entries("outputs") {
        let source = def
            .get("outputSource")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                Error::PackageType(format!(
                    "workflow output '{output_id}' has no outputSource"
                ))
            })?;
        let (step_name, step_output) = source
            .trim_start_matches("#")
            .split_once('/')
            .ok_or_else(|| {
                Error::PackageType(format!(
                    "workflow output '{output_id}' source '{source}' is not 'step/output'"
                ))
            })?;
        let value = step_outputs
            .get(step_name)
            .and_then(|outputs| outputs.get(step_output))
            .cloned()
            .ok_or_else(|| {
                Error::PackageExecution(format!(
                    "workflow output '{output_id}' source '{source}' was never produced"
                ))
            })?;
        final_outputs.insert(output_id, value);
    }
    Ok(final_outputs)
}

fn find_step_outputs(dir: &Path, pattern: &str) -> Result<Vec<std::path::PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let matcher = glob::Pattern::new(pattern).map_err(|err| {
        Error::PackageExecution(format!("invalid step output glob [{pattern}]: {err}"))
    })?;
    let mut matches: Vec<std::path::PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.is_file()
                && name != "stdout.log"
                && name != "stderr.log"
                && matcher.matches(&name)
        })
        .collect();
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::StepPackage;
    use crate::runner::SubprocessRuntime;

    fn two_step_workflow() -> Package {
        Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "Workflow",
            "inputs": {"message": {"type": "string"}},
            "outputs": {
                "result": {"type": "File", "outputSource": "second/output"},
            },
            "steps": {
                "first": {
                    "run": "echo.cwl",
                    "in": {"message": "message"},
                    "out": ["output"],
                },
                "second": {
                    "run": "echo2.cwl",
                    "in": {"message": "first/output"},
                    "out": ["output"],
                },
            },
        }))
    }

    #[test]
    fn test_step_order_topological() {
        let order = step_order(&two_step_workflow()).unwrap();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let package = Package::new(json!({
            "class": "Workflow",
            "inputs": {},
            "outputs": {},
            "steps": {
                "a": {"run": "a.cwl", "in": {"x": "b/out"}, "out": ["out"]},
                "b": {"run": "b.cwl", "in": {"x": "a/out"}, "out": ["out"]},
            },
        }));
        let err = step_order(&package).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_step_reference_rejected() {
        let package = Package::new(json!({
            "class": "Workflow",
            "inputs": {},
            "outputs": {},
            "steps": {
                "a": {"run": "a.cwl", "in": {"x": "ghost/out"}, "out": ["out"]},
            },
        }));
        assert!(step_order(&package).is_err());
    }

    #[tokio::test]
    async fn test_run_workflow_chains_local_steps() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let out_dir = tempfile::tempdir().unwrap();
        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.wps.output_dir = out_dir.path().to_path_buf();
        let settings = std::sync::Arc::new(settings);

        // first step writes its message, second step reads the hosted file
        let echo_package = Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "CommandLineTool",
            "baseCommand": ["sh", "-c", "echo hello-from-step > result.txt"],
            "inputs": {"message": {"type": "string"}},
            "outputs": {"output": {"type": "File", "outputBinding": {"glob": "result.txt"}}},
        }));
        let upper_package = Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "CommandLineTool",
            "baseCommand": ["sh", "-c", "cat */result.txt result.txt 2>/dev/null | tr a-z A-Z > upper.txt"],
            "inputs": {"message": {"type": "File"}},
            "outputs": {"output": {"type": "File", "outputBinding": {"glob": "upper.txt"}}},
        }));

        let mut step_map = StepMap::default();
        step_map.insert(
            "first".to_string(),
            StepPackage {
                id: "echo.cwl".to_string(),
                package: echo_package,
            },
        );
        step_map.insert(
            "second".to_string(),
            StepPackage {
                id: "echo2.cwl".to_string(),
                package: upper_package,
            },
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let ctx = WorkflowContext {
            settings: settings.clone(),
            sink: tx,
            cancel: tokio_util::sync::CancellationToken::new(),
            http: HttpClient::new(5).unwrap(),
            runtime: &SubprocessRuntime,
            forwarded_auth: None,
        };

        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "message".to_string(),
            IoValue::Literal {
                data_type: crate::io::DataType::String,
                value: json!("hi"),
            },
        );

        let work_root = tempfile::tempdir().unwrap();
        let outputs = run_workflow(
            &ctx,
            &two_step_workflow(),
            &step_map,
            &inputs,
            work_root.path(),
        )
        .await
        .unwrap();

        let result = outputs.get("result").unwrap();
        let href = result.href().unwrap();
        // intermediate results are re-hosted under the WPS output URL
        assert!(href.starts_with(&settings.wps.output_url));
        drain.abort();
    }
}
