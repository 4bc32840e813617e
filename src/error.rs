//! Error taxonomy and the OGC exception report shape.

use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

const OGC_EXCEPTION_BASE: &str = "http://www.opengis.net/def/exceptions/ogcapi-processes-1/1.0";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Deployment
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("package registration failed: {0}")]
    PackageRegistration(String),
    #[error("invalid package type: {0}")]
    PackageType(String),
    #[error("package authentication failed: {0}")]
    PackageAuthentication(String),
    #[error("invalid requirement: {0}")]
    InvalidRequirement(String),
    #[error("deployment incompatible with instance configuration: {0}")]
    DeploymentIncompatible(String),
    #[error("invalid authentication scheme: {0}")]
    InvalidAuthenticationScheme(String),

    // Execution
    #[error("package execution failed: {0}")]
    PackageExecution(String),
    #[error("remote execution failed: {0}")]
    RemoteExecution(String),
    #[error("monitoring timed out: {0}")]
    MonitoringTimeout(String),

    // Job lifecycle
    #[error("no such job: {0}")]
    NoSuchJob(Uuid),
    #[error("invalid job parameter: {0}")]
    JobInvalidParameter(String),
    #[error("job dismissed: {0}")]
    JobDismissed(Uuid),
    #[error("job results not ready: {0}")]
    JobResultsNotReady(Uuid),
    #[error("job failed, no results available: {0}")]
    JobResultsFailed(Uuid),

    // Providers and processes
    #[error("no such process: {0}")]
    NoSuchProcess(String),
    #[error("no such provider: {0}")]
    NoSuchProvider(String),
    #[error("process not accessible: {0}")]
    ProcessNotAccessible(String),
    #[error("service not accessible: {0}")]
    ServiceNotAccessible(String),

    // Inputs
    #[error("invalid parameter value: {0}")]
    InvalidParameterValue(String),
    #[error("invalid identifier value: {0}")]
    InvalidIdentifierValue(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    // Plumbing
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Short PascalCase name used as the exception `title`.
    pub fn title(&self) -> &'static str {
        match self {
            Error::PackageNotFound(_) => "PackageNotFound",
            Error::PackageRegistration(_) => "PackageRegistrationError",
            Error::PackageType(_) => "PackageTypeError",
            Error::PackageAuthentication(_) => "PackageAuthenticationError",
            Error::InvalidRequirement(_) => "InvalidRequirement",
            Error::DeploymentIncompatible(_) => "DeploymentIncompatible",
            Error::InvalidAuthenticationScheme(_) => "InvalidAuthenticationScheme",
            Error::PackageExecution(_) => "PackageExecutionError",
            Error::RemoteExecution(_) => "RemoteExecutionError",
            Error::MonitoringTimeout(_) => "MonitoringTimeout",
            Error::NoSuchJob(_) => "NoSuchJob",
            Error::JobInvalidParameter(_) => "JobInvalidParameter",
            Error::JobDismissed(_) => "JobDismissed",
            Error::JobResultsNotReady(_) => "JobResultsNotReady",
            Error::JobResultsFailed(_) => "JobResultsFailed",
            Error::NoSuchProcess(_) => "NoSuchProcess",
            Error::NoSuchProvider(_) => "NoSuchProvider",
            Error::ProcessNotAccessible(_) => "ProcessNotAccessible",
            Error::ServiceNotAccessible(_) => "ServiceNotAccessible",
            Error::InvalidParameterValue(_) => "InvalidParameterValue",
            Error::InvalidIdentifierValue(_) => "InvalidIdentifierValue",
            Error::UnsupportedMediaType(_) => "UnsupportedMediaType",
            Error::Database(_) => "DatabaseError",
            Error::Http(_) => "RequestError",
            Error::Io(_) => "IoError",
            Error::Serialization(_) => "SerializationError",
        }
    }

    /// HTTP status code associated with this error.
    pub fn status(&self) -> u16 {
        match self {
            Error::NoSuchJob(_)
            | Error::NoSuchProcess(_)
            | Error::NoSuchProvider(_)
            | Error::PackageNotFound(_) => 404,
            Error::JobDismissed(_) => 410,
            Error::ProcessNotAccessible(_) => 403,
            Error::JobResultsNotReady(_) => 409,
            Error::UnsupportedMediaType(_) => 415,
            Error::InvalidParameterValue(_)
            | Error::InvalidIdentifierValue(_)
            | Error::JobInvalidParameter(_)
            | Error::InvalidRequirement(_)
            | Error::InvalidAuthenticationScheme(_)
            | Error::PackageType(_)
            | Error::PackageRegistration(_)
            | Error::PackageAuthentication(_)
            | Error::DeploymentIncompatible(_) => 400,
            Error::ServiceNotAccessible(_) => 502,
            _ => 500,
        }
    }

    /// Canonical exception type URI.
    pub fn type_uri(&self) -> String {
        let slug = match self {
            Error::NoSuchJob(_) => "no-such-job",
            Error::NoSuchProcess(_) | Error::PackageNotFound(_) => "no-such-process",
            Error::JobResultsNotReady(_) => "result-not-ready",
            Error::JobDismissed(_) => "dismissed-job",
            Error::InvalidParameterValue(_) | Error::JobInvalidParameter(_) => "invalid-parameter",
            Error::UnsupportedMediaType(_) => "unsupported-media-type",
            _ => "no-applicable-code",
        };
        format!("{OGC_EXCEPTION_BASE}/{slug}")
    }

    /// Exception report body: `{title, type, detail, status, cause?}`.
    pub fn to_json(&self) -> JsonValue {
        let mut body = json!({
            "title": self.title(),
            "type": self.type_uri(),
            "detail": self.to_string(),
            "status": self.status(),
        });
        if let Some(cause) = std::error::Error::source(self) {
            body["cause"] = JsonValue::String(cause.to_string());
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NoSuchJob(Uuid::nil()).status(), 404);
        assert_eq!(Error::JobDismissed(Uuid::nil()).status(), 410);
        assert_eq!(Error::ProcessNotAccessible("p".into()).status(), 403);
        assert_eq!(Error::InvalidParameterValue("x".into()).status(), 400);
        assert_eq!(Error::RemoteExecution("x".into()).status(), 500);
    }

    #[test]
    fn test_exception_body_shape() {
        let err = Error::NoSuchJob(Uuid::nil());
        let body = err.to_json();
        assert_eq!(body["title"], "NoSuchJob");
        assert_eq!(body["status"], 404);
        assert_eq!(
            body["type"],
            format!("{OGC_EXCEPTION_BASE}/no-such-job").as_str()
        );
        assert!(body["detail"].as_str().unwrap().contains("no such job"));
    }
}
