//! Deployed process store.
//!
//! Deploy and undeploy serialize on a per-process advisory lock; reads are
//! lock-free. A process identifier may carry an explicit revision as
//! `id:version`.

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::package::{Process, StepMap};
use crate::types::{JobControlOption, Visibility};

/// Split an `id[:version]` reference.
pub fn split_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.split_once(':') {
        Some((id, version)) if !version.is_empty() => (id, Some(version)),
        _ => (reference, None),
    }
}

fn process_from_row(row: &PgRow) -> Result<Process> {
    let package: JsonValue = row.get("package");
    let inputs: JsonValue = row.get("inputs");
    let outputs: JsonValue = row.get("outputs");
    let requirement: JsonValue = row.get("requirement");
    let auth: Option<JsonValue> = row.get("auth");
    let steps: Option<JsonValue> = row.get("step_packages");
    let options: Vec<String> = row.get("job_control_options");
    let version: String = row.get("version");

    Ok(Process {
        id: row.get("id"),
        version: (!version.is_empty()).then_some(version),
        title: package
            .get("label")
            .and_then(JsonValue::as_str)
            .map(String::from),
        description: package
            .get("doc")
            .and_then(JsonValue::as_str)
            .map(String::from),
        keywords: Vec::new(),
        package: crate::package::Package::new(package),
        inputs: serde_json::from_value(inputs)?,
        outputs: serde_json::from_value(outputs)?,
        requirement: serde_json::from_value(requirement)?,
        auth: auth.map(serde_json::from_value).transpose()?,
        visibility: row.get("visibility"),
        job_control_options: options
            .iter()
            .filter_map(|o| JobControlOption::from_name(o))
            .collect(),
        step_packages: steps
            .map(serde_json::from_value::<StepMap>)
            .transpose()?
            .unwrap_or_default(),
    })
}

/// Register a deployed process. Fails on an existing `(id, version)` pair.
pub async fn deploy(pool: &PgPool, process: &Process) -> Result<()> {
    let mut tx = pool.begin().await?;
    // serialize concurrent deploy/undeploy of the same process id
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&process.id)
        .execute(&mut *tx)
        .await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO processes (
            id, version, package, inputs, outputs, requirement, auth,
            visibility, job_control_options, step_packages
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id, version) DO NOTHING
        "#,
    )
    .bind(&process.id)
    .bind(process.version.as_deref().unwrap_or(""))
    .bind(&process.package.raw)
    .bind(serde_json::to_value(&process.inputs)?)
    .bind(serde_json::to_value(&process.outputs)?)
    .bind(serde_json::to_value(&process.requirement)?)
    .bind(process.auth.as_ref().map(serde_json::to_value).transpose()?)
    .bind(process.visibility)
    .bind(
        process
            .job_control_options
            .iter()
            .map(|o| o.as_str().to_string())
            .collect::<Vec<_>>(),
    )
    .bind(if process.step_packages.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&process.step_packages)?)
    })
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;
    if inserted == 0 {
        return Err(Error::PackageRegistration(format!(
            "process '{}' is already deployed",
            process.tagged_id()
        )));
    }
    Ok(())
}

/// Fetch a process by `id[:version]`; without a version, the most recently
/// deployed revision wins.
pub async fn fetch_by_id(pool: &PgPool, reference: &str) -> Result<Process> {
    let (id, version) = split_tag(reference);
    let row = sqlx::query(
        r#"
        SELECT * FROM processes
        WHERE id = $1 AND ($2::text IS NULL OR version = $2)
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(id)
    .bind(version)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => process_from_row(&row),
        None => Err(Error::NoSuchProcess(reference.to_string())),
    }
}

/// List deployed processes, optionally restricted to public visibility.
pub async fn list(pool: &PgPool, public_only: bool) -> Result<Vec<Process>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT ON (id) * FROM processes
        WHERE ($1 = FALSE OR visibility = 'public')
        ORDER BY id, created_at DESC
        "#,
    )
    .bind(public_only)
    .fetch_all(pool)
    .await?;
    let mut processes = Vec::with_capacity(rows.len());
    for row in &rows {
        processes.push(process_from_row(row)?);
    }
    Ok(processes)
}

/// Change process visibility; the only permitted mutation after deploy.
pub async fn set_visibility(
    pool: &PgPool,
    reference: &str,
    visibility: Visibility,
) -> Result<()> {
    let (id, version) = split_tag(reference);
    let updated = sqlx::query(
        r#"
        UPDATE processes
        SET visibility = $3
        WHERE id = $1 AND ($2::text IS NULL OR version = $2)
        "#,
    )
    .bind(id)
    .bind(version)
    .bind(visibility)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(Error::NoSuchProcess(reference.to_string()));
    }
    Ok(())
}

/// Remove a deployed process.
pub async fn undeploy(pool: &PgPool, reference: &str) -> Result<()> {
    let (id, version) = split_tag(reference);
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query(
        r#"
        DELETE FROM processes
        WHERE id = $1 AND ($2::text IS NULL OR version = $2)
        "#,
    )
    .bind(id)
    .bind(version)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    if deleted == 0 {
        return Err(Error::NoSuchProcess(reference.to_string()));
    }
    Ok(())
}
