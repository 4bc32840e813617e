//! Shared HTTP client with bounded retries and file download helpers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout_secs: u64) -> Result<HttpClient> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(HttpClient { client })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request, retrying transient failures (connection errors and
    /// 5xx responses) with a short linear backoff.
    pub async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<JsonValue>,
        retries: u32,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(headers) = &headers {
                request = request.headers(headers.clone());
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) if response.status().is_server_error() && attempt < retries => {
                    warn!(%url, status = %response.status(), "retrying after server error");
                }
                Ok(response) => return Ok(response),
                Err(err) if attempt < retries => {
                    warn!(%url, error = %err, "retrying after request error");
                }
                Err(err) => return Err(err.into()),
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request_with_retry(Method::GET, url, None, None, 0).await
    }

    /// GET returning `(body, content type)` for content sniffing.
    pub async fn get_text(&self, url: &str) -> Result<(String, Option<String>)> {
        let response = self
            .request_with_retry(Method::GET, url, None, None, 2)
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Error::ServiceNotAccessible(format!(
                "GET {url} answered {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok((response.text().await?, content_type))
    }

    /// Download a remote file into `dest_dir`, keeping its base name.
    pub async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let response = self
            .request_with_retry(Method::GET, url, None, None, 2)
            .await?;
        if !response.status().is_success() {
            return Err(Error::ServiceNotAccessible(format!(
                "GET {url} answered {}",
                response.status()
            )));
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let name = file_name_from_url(url);
        let dest = dest_dir.join(&name);
        let bytes = response.bytes().await?;
        tokio::fs::write(&dest, &bytes).await?;
        debug!(%url, dest = %dest.display(), size = bytes.len(), "downloaded file");
        Ok(dest)
    }
}

/// Base file name of a URL path, with a stable fallback for bare hosts.
pub fn file_name_from_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        return parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(String::from)
            .unwrap_or_else(|| "download".to_string());
    }
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}

/// Stage a local file into a directory: hard link when possible, copy
/// otherwise. Used to avoid re-downloading resources already on this host.
pub async fn link_or_copy(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let dest = dest_dir.join(name);
    if dest == src {
        return Ok(dest);
    }
    if tokio::fs::hard_link(src, &dest).await.is_err() {
        tokio::fs::copy(src, &dest).await?;
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://example.com/data/output.nc"),
            "output.nc"
        );
        assert_eq!(
            file_name_from_url("https://example.com/data/output.nc?sig=abc"),
            "output.nc"
        );
        assert_eq!(file_name_from_url("https://example.com/"), "download");
    }

    #[tokio::test]
    async fn test_link_or_copy_places_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.txt");
        tokio::fs::write(&src, b"data").await.unwrap();
        let dest_dir = dir.path().join("staged");
        let dest = link_or_copy(&src, &dest_dir).await.unwrap();
        assert_eq!(dest.file_name().unwrap(), "input.txt");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"data");
    }
}
