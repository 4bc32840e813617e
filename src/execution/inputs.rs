//! Submitted input parsing, validation and local staging.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::dispatch::WorkflowInputs;
use crate::error::{Error, Result};
use crate::fetch::{link_or_copy, HttpClient};
use crate::io::{promote_literal, InputDef, IoKind, IoValue};
use crate::stager::map_wps_output_location;

/// Parse the submitted execute inputs against the process definitions,
/// promoting literals and validating cardinality.
pub fn parse_job_inputs(raw: Option<&JsonValue>, defs: &[InputDef]) -> Result<WorkflowInputs> {
    let submitted = collect_submitted(raw)?;

    for id in submitted.keys() {
        if !defs.iter().any(|def| def.id == *id) {
            return Err(Error::InvalidIdentifierValue(format!(
                "input '{id}' is not defined by the process"
            )));
        }
    }

    let mut inputs = WorkflowInputs::new();
    for def in defs {
        let values = submitted.get(&def.id).cloned().unwrap_or_default();
        let count = values.len() as u32;
        if count < def.min_occurs {
            return Err(Error::InvalidParameterValue(format!(
                "input '{}' requires at least {} value(s), got {count}",
                def.id, def.min_occurs
            )));
        }
        if let Some(max) = def.max_occurs {
            if count > max {
                return Err(Error::InvalidParameterValue(format!(
                    "input '{}' accepts at most {max} value(s), got {count}",
                    def.id
                )));
            }
        }
        if values.is_empty() {
            continue;
        }

        let mut converted = Vec::with_capacity(values.len());
        for value in &values {
            converted.push(convert_value(def, value)?);
        }
        let value = if def.is_array() || converted.len() > 1 {
            IoValue::Array(converted)
        } else {
            converted
                .into_iter()
                .next()
                .unwrap_or(IoValue::Literal {
                    data_type: crate::io::DataType::String,
                    value: JsonValue::Null,
                })
        };
        inputs.insert(def.id.clone(), value);
    }
    Ok(inputs)
}

fn collect_submitted(raw: Option<&JsonValue>) -> Result<HashMap<String, Vec<JsonValue>>> {
    let mut submitted: HashMap<String, Vec<JsonValue>> = HashMap::new();
    match raw {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Object(map)) => {
            for (id, value) in map {
                let values = match value {
                    JsonValue::Array(list) => list.clone(),
                    single => vec![single.clone()],
                };
                submitted.insert(id.clone(), values);
            }
        }
        Some(JsonValue::Array(list)) => {
            for entry in list {
                let id = entry
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        Error::JobInvalidParameter("input listing entry without 'id'".into())
                    })?;
                submitted.entry(id.to_string()).or_default().push(entry.clone());
            }
        }
        Some(other) => {
            return Err(Error::JobInvalidParameter(format!(
                "cannot interpret execute inputs from {other}"
            )))
        }
    }
    Ok(submitted)
}

fn convert_value(def: &InputDef, value: &JsonValue) -> Result<IoValue> {
    match def.kind {
        IoKind::Literal => {
            let domain = def.literal.as_ref().ok_or_else(|| {
                Error::InvalidParameterValue(format!("input '{}' has no literal domain", def.id))
            })?;
            let raw = value
                .get("value")
                .or_else(|| value.get("data"))
                .unwrap_or(value);
            let promoted = promote_literal(raw, domain)?;
            Ok(IoValue::Literal {
                data_type: domain.data_type,
                value: promoted,
            })
        }
        IoKind::BoundingBox => {
            let bbox = value
                .get("bbox")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| {
                    Error::InvalidParameterValue(format!(
                        "input '{}' requires a 'bbox' coordinate array",
                        def.id
                    ))
                })?
                .iter()
                .filter_map(JsonValue::as_f64)
                .collect::<Vec<_>>();
            Ok(IoValue::BBox {
                bbox,
                crs: value
                    .get("crs")
                    .and_then(JsonValue::as_str)
                    .map(String::from),
            })
        }
        IoKind::ComplexFile => {
            let href = extract_href(def, value)?;
            Ok(IoValue::FileRef {
                href,
                media_type: value
                    .get("type")
                    .or_else(|| value.get("format").and_then(|f| f.get("mediaType")))
                    .and_then(JsonValue::as_str)
                    .map(String::from)
                    .or_else(|| def.default_format().map(|f| f.media_type.clone())),
                encoding: value
                    .get("encoding")
                    .and_then(JsonValue::as_str)
                    .map(String::from),
                schema: None,
            })
        }
        IoKind::ComplexDirectory => {
            let href = extract_href(def, value)?;
            Ok(IoValue::DirRef { href })
        }
    }
}

fn extract_href(def: &InputDef, value: &JsonValue) -> Result<String> {
    value
        .get("href")
        .or_else(|| value.get("reference"))
        .and_then(JsonValue::as_str)
        .map(String::from)
        .or_else(|| value.as_str().map(String::from))
        .ok_or_else(|| {
            Error::InvalidParameterValue(format!(
                "input '{}' requires a reference ('href')",
                def.id
            ))
        })
}

/// Stage every file reference of local-bound inputs into the job work
/// directory, rewriting references to the staged local paths.
///
/// References under the configured WPS output location map straight to local
/// paths; `vault://` references are HEAD-validated, fetched and removed at
/// the source; directories are fetched recursively.
pub async fn stage_input_files(
    inputs: &mut WorkflowInputs,
    workdir: &Path,
    settings: &Settings,
    http: &HttpClient,
) -> Result<()> {
    let ids: Vec<String> = inputs.keys().cloned().collect();
    for id in ids {
        if let Some(value) = inputs.remove(&id) {
            let staged = stage_value(value, workdir, settings, http).await?;
            inputs.insert(id, staged);
        }
    }
    Ok(())
}

async fn stage_value(
    value: IoValue,
    workdir: &Path,
    settings: &Settings,
    http: &HttpClient,
) -> Result<IoValue> {
    match value {
        IoValue::Array(values) => {
            let mut staged = Vec::with_capacity(values.len());
            for item in values {
                staged.push(Box::pin(stage_value(item, workdir, settings, http)).await?);
            }
            Ok(IoValue::Array(staged))
        }
        IoValue::FileRef {
            href,
            media_type,
            encoding,
            schema,
        } => {
            let local = stage_reference(&href, workdir, settings, http).await?;
            Ok(IoValue::FileRef {
                href: local.to_string_lossy().into_owned(),
                media_type,
                encoding,
                schema,
            })
        }
        IoValue::DirRef { href } => {
            let local = stage_directory(&href, workdir, settings, http).await?;
            Ok(IoValue::DirRef {
                href: local.to_string_lossy().into_owned(),
            })
        }
        other => Ok(other),
    }
}

async fn stage_reference(
    href: &str,
    workdir: &Path,
    settings: &Settings,
    http: &HttpClient,
) -> Result<PathBuf> {
    // our own outputs resolve to local paths, skipping the network round-trip
    if let Some(local) = map_wps_output_location(href, settings) {
        if local.is_file() {
            info!(%href, local = %local.display(), "input reference resolved locally");
            return link_or_copy(&local, workdir).await;
        }
    }
    if let Some(id) = href.strip_prefix("vault://") {
        return stage_vault_reference(id, workdir, settings, http).await;
    }
    if href.starts_with("s3://") {
        return stage_s3_reference(href, workdir, settings).await;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return http.download(href, workdir).await;
    }
    let local = href.strip_prefix("file://").unwrap_or(href);
    link_or_copy(Path::new(local), workdir).await
}

/// Fetch a single-use vault upload: validate with `HEAD`, download, decrypt
/// the payload locally, then delete the source.
async fn stage_vault_reference(
    id: &str,
    workdir: &Path,
    settings: &Settings,
    http: &HttpClient,
) -> Result<PathBuf> {
    let base = settings.vault.url.as_deref().ok_or_else(|| {
        Error::InvalidParameterValue("vault reference submitted but no vault is configured".into())
    })?;
    let secret = settings.vault.encrypt_secret.as_deref().ok_or_else(|| {
        Error::InvalidParameterValue(
            "vault reference submitted but no vault decryption secret is configured".into(),
        )
    })?;
    let url = format!("{}/vault/{id}", base.trim_end_matches('/'));

    let head = http
        .request_with_retry(reqwest::Method::HEAD, &url, None, None, 1)
        .await?;
    if !head.status().is_success() {
        return Err(Error::InvalidParameterValue(format!(
            "vault reference '{id}' is not available ({})",
            head.status()
        )));
    }

    let staged = http.download(&url, workdir).await?;

    // uploads are encrypted at rest; decrypt in place before the tool sees it
    let sealed = tokio::fs::read(&staged).await?;
    let plain = crate::notify::open_token(&sealed, secret).map_err(|_| {
        Error::InvalidParameterValue(format!("vault reference '{id}' cannot be decrypted"))
    })?;
    tokio::fs::write(&staged, &plain).await?;

    // vault uploads are single-use
    let _ = http
        .request_with_retry(reqwest::Method::DELETE, &url, None, None, 0)
        .await;
    debug!(%id, "vault reference decrypted and consumed");
    Ok(staged)
}

async fn stage_s3_reference(href: &str, workdir: &Path, settings: &Settings) -> Result<PathBuf> {
    let (bucket, key) = parse_s3_url(href)?;
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = settings.storage.region.clone() {
        loader = loader.region(aws_config::Region::new(region));
    }
    let config = loader.load().await;
    let client = aws_sdk_s3::Client::new(&config);
    let object = client
        .get_object()
        .bucket(&bucket)
        .key(&key)
        .send()
        .await
        .map_err(|err| Error::ServiceNotAccessible(format!("cannot fetch {href}: {err}")))?;
    let bytes = object
        .body
        .collect()
        .await
        .map_err(|err| Error::ServiceNotAccessible(format!("cannot read {href}: {err}")))?
        .into_bytes();
    tokio::fs::create_dir_all(workdir).await?;
    let name = key.rsplit('/').next().unwrap_or("download");
    let dest = workdir.join(name);
    tokio::fs::write(&dest, &bytes).await?;
    Ok(dest)
}

pub(crate) fn parse_s3_url(href: &str) -> Result<(String, String)> {
    let rest = href.strip_prefix("s3://").ok_or_else(|| {
        Error::InvalidParameterValue(format!("not an S3 reference: {href}"))
    })?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(Error::InvalidParameterValue(format!(
            "invalid S3 reference: {href}"
        ))),
    }
}

async fn stage_directory(
    href: &str,
    workdir: &Path,
    settings: &Settings,
    _http: &HttpClient,
) -> Result<PathBuf> {
    let local_source = map_wps_output_location(href, settings)
        .filter(|p| p.is_dir())
        .or_else(|| {
            let path = href.strip_prefix("file://").unwrap_or(href);
            let path = Path::new(path);
            (!href.contains("://") || href.starts_with("file://"))
                .then(|| path.to_path_buf())
        });
    let Some(source) = local_source else {
        return Err(Error::UnsupportedMediaType(format!(
            "directory input '{href}' must resolve to a local or WPS-output location"
        )));
    };
    if !source.is_dir() {
        return Err(Error::InvalidParameterValue(format!(
            "directory input '{href}' does not exist"
        )));
    }
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "directory".to_string());
    let dest_root = workdir.join(name);
    for entry in WalkDir::new(&source)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let relative = entry.path().strip_prefix(&source).unwrap_or(entry.path());
        let dest = dest_root.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(entry.path(), &dest).await?;
    }
    Ok(dest_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DataType, Format, LiteralDomain};
    use serde_json::json;

    fn string_input(id: &str) -> InputDef {
        InputDef {
            id: id.to_string(),
            title: None,
            description: None,
            keywords: vec![],
            kind: IoKind::Literal,
            min_occurs: 1,
            max_occurs: Some(1),
            literal: Some(LiteralDomain::new(DataType::String)),
            formats: vec![],
        }
    }

    fn file_input(id: &str, max: Option<u32>) -> InputDef {
        InputDef {
            id: id.to_string(),
            title: None,
            description: None,
            keywords: vec![],
            kind: IoKind::ComplexFile,
            min_occurs: 1,
            max_occurs: max,
            literal: None,
            formats: vec![Format::new("application/x-netcdf")],
        }
    }

    #[test]
    fn test_parse_mapping_inputs() {
        let defs = vec![string_input("message")];
        let inputs =
            parse_job_inputs(Some(&json!({"message": "hello"})), &defs).unwrap();
        assert!(matches!(
            inputs.get("message").unwrap(),
            IoValue::Literal { value, .. } if value == "hello"
        ));
    }

    #[test]
    fn test_parse_listing_inputs_with_href() {
        let defs = vec![file_input("data", Some(1))];
        let inputs = parse_job_inputs(
            Some(&json!([{"id": "data", "href": "https://x/file.nc"}])),
            &defs,
        )
        .unwrap();
        assert_eq!(
            inputs.get("data").unwrap().href(),
            Some("https://x/file.nc")
        );
    }

    #[test]
    fn test_parse_rejects_unknown_input() {
        let defs = vec![string_input("message")];
        let err =
            parse_job_inputs(Some(&json!({"other": "x"})), &defs).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifierValue(_)));
    }

    #[test]
    fn test_parse_enforces_cardinality() {
        let defs = vec![file_input("data", Some(1))];
        let err = parse_job_inputs(
            Some(&json!({"data": [{"href": "a"}, {"href": "b"}]})),
            &defs,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameterValue(_)));

        let missing = parse_job_inputs(Some(&json!({})), &defs).unwrap_err();
        assert!(matches!(missing, Error::InvalidParameterValue(_)));
    }

    #[test]
    fn test_parse_array_input() {
        let defs = vec![file_input("data", None)];
        let inputs = parse_job_inputs(
            Some(&json!({"data": [{"href": "https://x/a.nc"}, {"href": "https://x/b.nc"}]})),
            &defs,
        )
        .unwrap();
        match inputs.get("data").unwrap() {
            IoValue::Array(values) => assert_eq!(values.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_s3_url() {
        assert_eq!(
            parse_s3_url("s3://bucket/key/name.nc").unwrap(),
            ("bucket".to_string(), "key/name.nc".to_string())
        );
        assert!(parse_s3_url("s3://bucket").is_err());
        assert!(parse_s3_url("https://x").is_err());
    }

    #[tokio::test]
    async fn test_stage_local_file_reference() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let settings = crate::config::Settings::load(None).unwrap();
        let http = HttpClient::new(5).unwrap();

        let source_dir = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("input.nc");
        tokio::fs::write(&source, b"nc").await.unwrap();

        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "data".to_string(),
            IoValue::file(format!("file://{}", source.display())),
        );
        stage_input_files(&mut inputs, workdir.path(), &settings, &http)
            .await
            .unwrap();
        let staged = inputs.get("data").unwrap().href().unwrap();
        assert!(staged.starts_with(workdir.path().to_str().unwrap()));
        assert!(Path::new(staged).is_file());
    }

    #[tokio::test]
    async fn test_stage_wps_output_reference_bypasses_fetch() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let out_dir = tempfile::tempdir().unwrap();
        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.wps.output_dir = out_dir.path().to_path_buf();
        let http = HttpClient::new(5).unwrap();

        let hosted = out_dir.path().join("prev-job/output/result.nc");
        tokio::fs::create_dir_all(hosted.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&hosted, b"nc").await.unwrap();

        let workdir = tempfile::tempdir().unwrap();
        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "data".to_string(),
            // an URL of this instance, never actually served anywhere
            IoValue::file(format!(
                "{}/prev-job/output/result.nc",
                settings.wps.output_url
            )),
        );
        stage_input_files(&mut inputs, workdir.path(), &settings, &http)
            .await
            .unwrap();
        let staged = inputs.get("data").unwrap().href().unwrap();
        assert!(Path::new(staged).is_file());
    }

    #[tokio::test]
    async fn test_stage_vault_reference_decrypts_and_consumes() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let server = MockServer::start().await;
        let sealed =
            crate::notify::seal_token(b"plain netcdf bytes", "vault-secret", 1000).unwrap();

        Mock::given(method("HEAD"))
            .and(path("/vault/abc123"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/vault/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(sealed))
            .mount(&server)
            .await;
        let deleted = Mock::given(method("DELETE"))
            .and(path("/vault/abc123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.vault.url = Some(server.uri());
        settings.vault.encrypt_secret = Some("vault-secret".to_string());
        let http = HttpClient::new(5).unwrap();

        let workdir = tempfile::tempdir().unwrap();
        let mut inputs = WorkflowInputs::new();
        inputs.insert("data".to_string(), IoValue::file("vault://abc123"));
        stage_input_files(&mut inputs, workdir.path(), &settings, &http)
            .await
            .unwrap();

        let staged = inputs.get("data").unwrap().href().unwrap();
        // the staged file holds the decrypted payload, never the ciphertext
        assert_eq!(
            tokio::fs::read(staged).await.unwrap(),
            b"plain netcdf bytes"
        );
        drop(deleted);
    }

    #[tokio::test]
    async fn test_stage_vault_reference_requires_secret() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.vault.url = Some("http://vault.example.com".to_string());
        settings.vault.encrypt_secret = None;
        let http = HttpClient::new(5).unwrap();

        let workdir = tempfile::tempdir().unwrap();
        let mut inputs = WorkflowInputs::new();
        inputs.insert("data".to_string(), IoValue::file("vault://abc123"));
        let err = stage_input_files(&mut inputs, workdir.path(), &settings, &http)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameterValue(_)));
    }

    #[tokio::test]
    async fn test_stage_directory_recursive() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let settings = crate::config::Settings::load(None).unwrap();
        let http = HttpClient::new(5).unwrap();

        let source_dir = tempfile::tempdir().unwrap();
        let data = source_dir.path().join("collection");
        tokio::fs::create_dir_all(data.join("sub")).await.unwrap();
        tokio::fs::write(data.join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(data.join("sub/b.txt"), b"b").await.unwrap();

        let workdir = tempfile::tempdir().unwrap();
        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "dir".to_string(),
            IoValue::DirRef {
                href: data.display().to_string(),
            },
        );
        stage_input_files(&mut inputs, workdir.path(), &settings, &http)
            .await
            .unwrap();
        let staged = PathBuf::from(inputs.get("dir").unwrap().href().unwrap());
        assert!(staged.join("a.txt").is_file());
        assert!(staged.join("sub/b.txt").is_file());
    }
}
