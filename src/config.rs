//! Application settings.
//!
//! All components receive an explicit [`Settings`] record (usually behind an
//! `Arc`); nothing reads configuration from process-global state. Values are
//! loaded from an optional TOML file and overridden by `PELICAN__*`
//! environment variables, with `DATABASE_URL` / `POSTGRES_*` handled as
//! conventional fallbacks for the database connection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;

/// Instance execution capability.
///
/// An ADES executes packages locally, an EMS only dispatches them to remote
/// providers, and a HYBRID instance does either depending on the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceMode {
    Ades,
    Ems,
    Hybrid,
}

impl InstanceMode {
    pub fn supports_local(&self) -> bool {
        matches!(self, InstanceMode::Ades | InstanceMode::Hybrid)
    }

    pub fn supports_remote(&self) -> bool {
        matches!(self, InstanceMode::Ems | InstanceMode::Hybrid)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WpsSettings {
    /// Directory where job status documents, logs and outputs are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Public URL prefix under which `output_dir` is served.
    #[serde(default = "default_output_url")]
    pub output_url: String,
    /// URL path component of `output_url`, used to recognize our own
    /// references when only a path is available.
    #[serde(default = "default_output_path")]
    pub output_path: String,
    /// Upper bound applied to `Prefer: wait=<seconds>`.
    #[serde(default = "default_max_sync_wait")]
    pub max_sync_wait_secs: u64,
    /// Public base URL of the API, used to build job status locations.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl WpsSettings {
    pub fn job_status_url(&self, job_id: &uuid::Uuid) -> String {
        format!("{}/jobs/{}", self.api_url.trim_end_matches('/'), job_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmtpSettings {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Use an implicit TLS connection instead of opportunistic STARTTLS.
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSettings {
    /// S3 bucket for output staging. Outputs stay on the filesystem when unset.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifySettings {
    /// Directory of handlebars e-mail templates. The embedded default
    /// template is used when unset.
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
    #[serde(default = "default_template_name")]
    pub template_default: String,
    /// PBKDF2 rounds for the subscriber e-mail encryption key.
    #[serde(default = "default_encrypt_rounds")]
    pub encrypt_rounds: u32,
    /// Instance secret the e-mail encryption key is derived from.
    #[serde(default)]
    pub encrypt_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdesSettings {
    /// Default remote ADES receiving dispatched application steps when this
    /// instance does not execute locally.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub use_auth_token: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub wso2_hostname: Option<String>,
    #[serde(default)]
    pub wso2_client_id: Option<String>,
    #[serde(default)]
    pub wso2_client_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultSettings {
    /// Base URL of the vault component serving `vault://{id}` references.
    #[serde(default)]
    pub url: Option<String>,
    /// Secret the vault upload encryption key is derived from; uploads are
    /// decrypted locally after fetch.
    #[serde(default)]
    pub encrypt_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Initial delay of the remote monitoring backoff.
    #[serde(default = "default_monitor_initial")]
    pub monitor_initial_secs: u64,
    /// Upper bound of the remote monitoring backoff.
    #[serde(default = "default_monitor_max")]
    pub monitor_max_secs: u64,
    /// Wall-clock limit for a single job execution.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Per-request timeout applied to remote fetches and dispatches.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            monitor_initial_secs: default_monitor_initial(),
            monitor_max_secs: default_monitor_max(),
            job_timeout_secs: default_job_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default = "default_instance_mode")]
    pub mode: InstanceMode,
    #[serde(default = "default_wps")]
    pub wps: WpsSettings,
    #[serde(default)]
    pub smtp: SmtpSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub ades: AdesSettings,
    #[serde(default)]
    pub vault: VaultSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
}

impl Settings {
    /// Load settings from the optional TOML file and the environment.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = config_path
            .map(str::to_owned)
            .or_else(|| std::env::var("PELICAN_CONFIG_PATH").ok())
            .unwrap_or_else(|| "pelican.toml".to_string());

        let loader = ConfigLoader::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("PELICAN").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let mut settings: Settings = loader
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if settings.database.url.is_none() {
            settings.database.url = database_url_from_env();
        }

        Ok(settings)
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .context("No database URL configured (set DATABASE_URL or POSTGRES_* variables)")
    }
}

/// Compose the database URL from `DATABASE_URL` or the `POSTGRES_*` family.
fn database_url_from_env() -> Option<String> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return Some(url);
    }
    let host = std::env::var("POSTGRES_HOST").ok()?;
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| user.clone());
    if password.is_empty() {
        Some(format!("postgresql://{user}@{host}:{port}/{db}"))
    } else {
        Some(format!("postgresql://{user}:{password}@{host}:{port}/{db}"))
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/tmp/pelican/outputs")
}

fn default_output_url() -> String {
    "http://localhost:4002/wpsoutputs".to_string()
}

fn default_output_path() -> String {
    "/wpsoutputs".to_string()
}

fn default_api_url() -> String {
    "http://localhost:4002".to_string()
}

fn default_max_sync_wait() -> u64 {
    20
}

fn default_smtp_port() -> u16 {
    25
}

fn default_smtp_timeout() -> u64 {
    10
}

fn default_template_name() -> String {
    "default.hbs".to_string()
}

fn default_encrypt_rounds() -> u32 {
    100_000
}

fn default_true() -> bool {
    true
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_monitor_initial() -> u64 {
    2
}

fn default_monitor_max() -> u64 {
    60
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    30
}

fn default_instance_mode() -> InstanceMode {
    InstanceMode::Hybrid
}

fn default_wps() -> WpsSettings {
    WpsSettings {
        output_dir: default_output_dir(),
        output_url: default_output_url(),
        output_path: default_output_path(),
        max_sync_wait_secs: default_max_sync_wait(),
        api_url: default_api_url(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_mode_capabilities() {
        assert!(InstanceMode::Ades.supports_local());
        assert!(!InstanceMode::Ades.supports_remote());
        assert!(!InstanceMode::Ems.supports_local());
        assert!(InstanceMode::Ems.supports_remote());
        assert!(InstanceMode::Hybrid.supports_local());
        assert!(InstanceMode::Hybrid.supports_remote());
    }

    #[test]
    fn test_status_url() {
        let wps = default_wps();
        let id = uuid::Uuid::nil();
        assert_eq!(
            wps.job_status_url(&id),
            format!("http://localhost:4002/jobs/{id}")
        );
    }
}
