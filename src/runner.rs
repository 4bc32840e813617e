//! Local execution seam for command-line tool packages.
//!
//! The container runtime itself stays external: packages that require
//! container isolation are executed through whatever [`CommandRuntime`]
//! implementation the embedding service provides. [`SubprocessRuntime`]
//! covers tools that run as plain local commands.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::package::Package;

/// Captured result of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Narrow interface to the runtime that actually spawns the application.
#[async_trait]
pub trait CommandRuntime: Send + Sync {
    async fn run(
        &self,
        command: Vec<String>,
        env: HashMap<String, String>,
        workdir: &Path,
    ) -> Result<RunOutcome>;
}

/// Runs the assembled command as a local subprocess.
pub struct SubprocessRuntime;

#[async_trait]
impl CommandRuntime for SubprocessRuntime {
    async fn run(
        &self,
        command: Vec<String>,
        env: HashMap<String, String>,
        workdir: &Path,
    ) -> Result<RunOutcome> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::PackageExecution("package resolves to an empty command line".into())
        })?;
        debug!(%program, ?args, workdir = %workdir.display(), "spawning tool subprocess");
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(env)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::PackageExecution(format!("cannot spawn command '{program}': {err}"))
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout).await?;
        }
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).await?;
        }
        let status = child.wait().await?;
        Ok(RunOutcome {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

#[derive(Debug, Clone)]
struct BoundArgument {
    position: i64,
    order: usize,
    prefix: Option<String>,
    values: Vec<String>,
}

/// Assemble the tool command line: `baseCommand`, then `arguments`, then
/// inputs ordered by `inputBinding.position` (document order breaking ties).
pub fn assemble_command(
    package: &Package,
    input_values: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let mut command: Vec<String> = match package.raw.get("baseCommand") {
        Some(JsonValue::String(single)) => vec![single.clone()],
        Some(JsonValue::Array(parts)) => parts
            .iter()
            .filter_map(JsonValue::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    };
    if command.is_empty() {
        return Err(Error::PackageExecution(
            "package has no baseCommand to execute".into(),
        ));
    }

    if let Some(arguments) = package.raw.get("arguments").and_then(JsonValue::as_array) {
        command.extend(
            arguments
                .iter()
                .filter_map(JsonValue::as_str)
                .map(String::from),
        );
    }

    let mut bound: Vec<BoundArgument> = Vec::new();
    for (order, (id, def)) in package.io_entries("inputs").into_iter().enumerate() {
        let Some(values) = input_values.get(&id) else {
            continue;
        };
        // inputs without an inputBinding never reach the command line
        let Some(binding) = def.get("inputBinding") else {
            continue;
        };
        let position = binding
            .get("position")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);
        let prefix = binding
            .get("prefix")
            .and_then(JsonValue::as_str)
            .map(String::from);
        bound.push(BoundArgument {
            position,
            order,
            prefix,
            values: values.clone(),
        });
    }
    bound.sort_by_key(|b| (b.position, b.order));
    for argument in bound {
        for value in argument.values {
            if let Some(prefix) = &argument.prefix {
                command.push(prefix.clone());
            }
            command.push(value);
        }
    }
    Ok(command)
}

/// Environment from an `EnvVarRequirement`, if present.
pub fn environment_from_package(package: &Package) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for entry in package.requirements_and_hints() {
        if entry.get("class").and_then(JsonValue::as_str) != Some("EnvVarRequirement") {
            continue;
        }
        match entry.get("envDef") {
            Some(JsonValue::Object(map)) => {
                for (name, value) in map {
                    if let Some(value) = value.as_str() {
                        env.insert(name.clone(), value.to_string());
                    }
                }
            }
            Some(JsonValue::Array(list)) => {
                for def in list {
                    if let (Some(name), Some(value)) = (
                        def.get("envName").and_then(JsonValue::as_str),
                        def.get("envValue").and_then(JsonValue::as_str),
                    ) {
                        env.insert(name.to_string(), value.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_package() -> Package {
        Package::new(json!({
            "cwlVersion": "v1.0",
            "class": "CommandLineTool",
            "baseCommand": "echo",
            "inputs": {
                "flag": {"type": "string?", "inputBinding": {"position": 2, "prefix": "-m"}},
                "message": {"type": "string", "inputBinding": {"position": 1}},
            },
            "outputs": {}
        }))
    }

    #[test]
    fn test_assemble_orders_by_position() {
        let mut values = HashMap::new();
        values.insert("message".to_string(), vec!["hello".to_string()]);
        values.insert("flag".to_string(), vec!["x".to_string()]);
        let command = assemble_command(&echo_package(), &values).unwrap();
        assert_eq!(command, vec!["echo", "hello", "-m", "x"]);
    }

    #[test]
    fn test_assemble_skips_absent_optional() {
        let mut values = HashMap::new();
        values.insert("message".to_string(), vec!["hi".to_string()]);
        let command = assemble_command(&echo_package(), &values).unwrap();
        assert_eq!(command, vec!["echo", "hi"]);
    }

    #[test]
    fn test_missing_base_command() {
        let package = Package::new(json!({"class": "CommandLineTool", "inputs": {}, "outputs": {}}));
        assert!(assemble_command(&package, &HashMap::new()).is_err());
    }

    #[test]
    fn test_environment_extraction() {
        let package = Package::new(json!({
            "class": "CommandLineTool",
            "baseCommand": "env",
            "requirements": {"EnvVarRequirement": {"envDef": {"MODE": "fast"}}},
            "inputs": {},
            "outputs": {}
        }));
        let env = environment_from_package(&package);
        assert_eq!(env.get("MODE").map(String::as_str), Some("fast"));
    }

    #[tokio::test]
    async fn test_subprocess_runtime_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = SubprocessRuntime
            .run(
                vec!["echo".to_string(), "hello".to_string()],
                HashMap::new(),
                dir.path(),
            )
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_subprocess_runtime_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = SubprocessRuntime
            .run(
                vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
                HashMap::new(),
                dir.path(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
    }
}
