//! Output staging to the WPS output directory or the configured S3 bucket.
//!
//! Outputs are moved (not copied) into `{outputDir}/{context?}/{jobId}/{outputId}/`
//! or uploaded under the mirrored S3 key. Directory outputs keep their
//! internal structure, each contained file stored individually.

use std::path::{Path, PathBuf};

use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::io::MEDIA_TYPE_DIRECTORY;
use crate::types::{Job, ResultRecord};

pub struct ResultStager {
    settings: std::sync::Arc<Settings>,
    s3: Option<(String, aws_sdk_s3::Client)>,
}

impl ResultStager {
    /// Build the stager; an S3 client is created only when a bucket is
    /// configured.
    pub async fn new(settings: std::sync::Arc<Settings>) -> ResultStager {
        let s3 = match &settings.storage.bucket {
            Some(bucket) => {
                let mut loader =
                    aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = settings.storage.region.clone() {
                    loader = loader.region(aws_config::Region::new(region));
                }
                let config = loader.load().await;
                Some((bucket.clone(), aws_sdk_s3::Client::new(&config)))
            }
            None => None,
        };
        ResultStager { settings, s3 }
    }

    /// `{context?}/{jobId}` prefix shared by filesystem and S3 layouts.
    fn job_prefix(&self, job: &Job) -> String {
        match &job.context {
            Some(context) if !context.is_empty() => {
                format!("{}/{}", context.trim_matches('/'), job.id)
            }
            _ => job.id.to_string(),
        }
    }

    /// Stage one produced output (file or directory) and return its result
    /// record with the publicly resolvable reference.
    pub async fn stage_output(
        &self,
        job: &Job,
        output_id: &str,
        source: &Path,
        media_type: Option<&str>,
    ) -> Result<ResultRecord> {
        let prefix = format!("{}/{}", self.job_prefix(job), output_id);
        if source.is_dir() {
            self.stage_directory(&prefix, source, output_id).await
        } else {
            self.stage_file(&prefix, source, output_id, media_type).await
        }
    }

    async fn stage_file(
        &self,
        prefix: &str,
        source: &Path,
        output_id: &str,
        media_type: Option<&str>,
    ) -> Result<ResultRecord> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::PackageExecution(format!(
                    "output '{output_id}' has no staged file at [{}]",
                    source.display()
                ))
            })?;
        let media_type = media_type
            .map(String::from)
            .or_else(|| mime_guess::from_path(&name).first_raw().map(String::from));

        if let Some((bucket, client)) = &self.s3 {
            let key = format!("{prefix}/{name}");
            let body = ByteStream::from_path(source).await.map_err(|err| {
                Error::PackageExecution(format!("cannot read output [{}]: {err}", source.display()))
            })?;
            let mut request = client.put_object().bucket(bucket).key(&key).body(body);
            if let Some(media) = &media_type {
                request = request.content_type(media);
            }
            request.send().await.map_err(|err| {
                Error::PackageExecution(format!("S3 upload of [{key}] failed: {err}"))
            })?;
            tokio::fs::remove_file(source).await.ok();
            debug!(%key, "output uploaded to object storage");
            return Ok(ResultRecord {
                id: output_id.to_string(),
                href: Some(format!("s3://{bucket}/{key}")),
                media_type,
                ..Default::default()
            });
        }

        let dest_dir = self.settings.wps.output_dir.join(prefix);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(&name);
        move_file(source, &dest).await?;
        debug!(dest = %dest.display(), "output moved to WPS output directory");
        Ok(ResultRecord {
            id: output_id.to_string(),
            href: Some(format!(
                "{}/{prefix}/{name}",
                self.settings.wps.output_url.trim_end_matches('/')
            )),
            media_type,
            ..Default::default()
        })
    }

    async fn stage_directory(
        &self,
        prefix: &str,
        source: &Path,
        output_id: &str,
    ) -> Result<ResultRecord> {
        let files: Vec<PathBuf> = WalkDir::new(source)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();

        if let Some((bucket, client)) = &self.s3 {
            // zero-byte marker object representing the directory itself
            let marker = format!("{prefix}/");
            client
                .put_object()
                .bucket(bucket)
                .key(&marker)
                .content_type(MEDIA_TYPE_DIRECTORY)
                .body(ByteStream::from_static(b""))
                .send()
                .await
                .map_err(|err| {
                    Error::PackageExecution(format!("S3 upload of [{marker}] failed: {err}"))
                })?;
            for file in &files {
                let relative = file.strip_prefix(source).unwrap_or(file);
                let key = format!("{prefix}/{}", relative.to_string_lossy());
                let body = ByteStream::from_path(file).await.map_err(|err| {
                    Error::PackageExecution(format!(
                        "cannot read output [{}]: {err}",
                        file.display()
                    ))
                })?;
                client
                    .put_object()
                    .bucket(bucket)
                    .key(&key)
                    .body(body)
                    .send()
                    .await
                    .map_err(|err| {
                        Error::PackageExecution(format!("S3 upload of [{key}] failed: {err}"))
                    })?;
            }
            tokio::fs::remove_dir_all(source).await.ok();
            return Ok(ResultRecord {
                id: output_id.to_string(),
                href: Some(format!("s3://{bucket}/{prefix}/")),
                media_type: Some(MEDIA_TYPE_DIRECTORY.to_string()),
                ..Default::default()
            });
        }

        let dest_root = self.settings.wps.output_dir.join(prefix);
        for file in &files {
            let relative = file.strip_prefix(source).unwrap_or(file);
            let dest = dest_root.join(relative);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            move_file(file, &dest).await?;
        }
        tokio::fs::remove_dir_all(source).await.ok();
        Ok(ResultRecord {
            id: output_id.to_string(),
            href: Some(format!(
                "{}/{prefix}/",
                self.settings.wps.output_url.trim_end_matches('/')
            )),
            media_type: Some(MEDIA_TYPE_DIRECTORY.to_string()),
            ..Default::default()
        })
    }
}

/// Rename with a copy fallback for cross-device moves.
async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if tokio::fs::rename(source, dest).await.is_err() {
        tokio::fs::copy(source, dest).await?;
        tokio::fs::remove_file(source).await?;
    }
    Ok(())
}

/// Map a URL that falls inside the configured WPS output location back to
/// the corresponding local file path, avoiding a network round-trip.
pub fn map_wps_output_location(href: &str, settings: &Settings) -> Option<PathBuf> {
    let href = href.strip_prefix("file://").unwrap_or(href);
    let wps_url = settings.wps.output_url.trim_end_matches('/');
    let wps_path = settings.wps.output_path.trim_end_matches('/');

    let relative = if let Some(rest) = href.strip_prefix(wps_url) {
        rest.trim_start_matches('/')
    } else if !href.contains("://") {
        if let Some(rest) = href.strip_prefix(wps_path) {
            rest.trim_start_matches('/')
        } else if Path::new(href).starts_with(&settings.wps.output_dir) {
            return Some(PathBuf::from(href));
        } else {
            return None;
        }
    } else {
        return None;
    };
    if relative.is_empty() {
        return None;
    }
    Some(settings.wps.output_dir.join(relative))
}

/// Remove every artifact of a dismissed job: the staged output directory and
/// the status/log documents.
pub async fn cleanup_job_artifacts(job: &Job, settings: &Settings) {
    let base = match &job.context {
        Some(context) if !context.is_empty() => {
            settings.wps.output_dir.join(context.trim_matches('/'))
        }
        _ => settings.wps.output_dir.clone(),
    };
    let mut ids = vec![job.id.to_string()];
    if let Some(wps_id) = job.wps_id {
        if wps_id != job.id {
            ids.push(wps_id.to_string());
        }
    }
    for id in ids {
        let dir = base.join(&id);
        if tokio::fs::remove_dir_all(&dir).await.is_ok() {
            debug!(dir = %dir.display(), "removed staged job outputs");
        }
        for extension in ["log", "xml"] {
            let file = base.join(format!("{id}.{extension}"));
            if let Err(err) = tokio::fs::remove_file(&file).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %file.display(), error = %err, "could not remove job artifact");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::jobs::tests::sample_job;

    fn settings_with_dir(dir: &Path) -> std::sync::Arc<Settings> {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = Settings::load(None).unwrap();
        settings.wps.output_dir = dir.to_path_buf();
        settings.storage.bucket = None;
        std::sync::Arc::new(settings)
    }

    #[tokio::test]
    async fn test_stage_file_moves_into_job_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let out_root = tmp.path().join("outputs");
        let settings = settings_with_dir(&out_root);
        let stager = ResultStager::new(settings.clone()).await;

        let work = tmp.path().join("work");
        tokio::fs::create_dir_all(&work).await.unwrap();
        let produced = work.join("result.txt");
        tokio::fs::write(&produced, b"data").await.unwrap();

        let job = sample_job();
        let record = stager
            .stage_output(&job, "output", &produced, Some("text/plain"))
            .await
            .unwrap();

        // moved, not copied
        assert!(!produced.exists());
        let staged = out_root
            .join(job.id.to_string())
            .join("output")
            .join("result.txt");
        assert!(staged.is_file());
        assert_eq!(
            record.href.as_deref().unwrap(),
            format!("{}/{}/output/result.txt", settings.wps.output_url, job.id)
        );
    }

    #[tokio::test]
    async fn test_stage_directory_preserves_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let out_root = tmp.path().join("outputs");
        let settings = settings_with_dir(&out_root);
        let stager = ResultStager::new(settings.clone()).await;

        let dir = tmp.path().join("collection");
        tokio::fs::create_dir_all(dir.join("nested")).await.unwrap();
        tokio::fs::write(dir.join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(dir.join("nested/b.txt"), b"b").await.unwrap();

        let mut job = sample_job();
        job.context = Some("tests".into());
        let record = stager
            .stage_output(&job, "collection", &dir, None)
            .await
            .unwrap();

        let base = out_root
            .join("tests")
            .join(job.id.to_string())
            .join("collection");
        assert!(base.join("a.txt").is_file());
        assert!(base.join("nested/b.txt").is_file());
        assert_eq!(
            record.media_type.as_deref(),
            Some(MEDIA_TYPE_DIRECTORY)
        );
        assert!(record.href.unwrap().ends_with('/'));
    }

    #[tokio::test]
    async fn test_cleanup_removes_all_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let out_root = tmp.path().join("outputs");
        let settings = settings_with_dir(&out_root);

        let job = sample_job();
        let job_dir = out_root.join(job.id.to_string());
        tokio::fs::create_dir_all(&job_dir).await.unwrap();
        tokio::fs::write(job_dir.join("file.txt"), b"x").await.unwrap();
        tokio::fs::write(out_root.join(format!("{}.log", job.id)), b"log")
            .await
            .unwrap();
        tokio::fs::write(out_root.join(format!("{}.xml", job.id)), b"xml")
            .await
            .unwrap();

        cleanup_job_artifacts(&job, &settings).await;

        let mut entries = tokio::fs::read_dir(&out_root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[test]
    fn test_map_wps_output_location() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_with_dir(tmp.path());
        let url = format!("{}/job/out/file.nc", settings.wps.output_url);
        assert_eq!(
            map_wps_output_location(&url, &settings),
            Some(tmp.path().join("job/out/file.nc"))
        );
        assert_eq!(
            map_wps_output_location("https://elsewhere.example.com/f.nc", &settings),
            None
        );
        let path_ref = format!("{}/job/file.nc", settings.wps.output_path);
        assert_eq!(
            map_wps_output_location(&path_ref, &settings),
            Some(tmp.path().join("job/file.nc"))
        );
    }
}
