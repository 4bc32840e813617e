//! ADES dispatcher: OGC API - Processes submission with deploy-if-absent.
//!
//! Workflow steps dispatched to a remote ADES first ensure the step package
//! is deployed and publicly visible there, acquiring an OAuth2 bearer from
//! the configured identity provider when credentials are available, or
//! forwarding the originating request's `Authorization` header otherwise.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::ogc_api::{dispatch_execute, execute_body, fetch_results, json_headers, monitor_status};
use super::{
    DispatchContext, MonitorReference, RemoteInput, RemoteOutput, RemoteResult, WpsProcess,
};

mod progress {
    pub const DEPLOY: i32 = 3;
    pub const VISIBLE: i32 = 4;
}

pub struct AdesProcess {
    ctx: DispatchContext,
    pub provider: String,
    pub process: String,
    /// Deployment body posted when the process is absent on the remote ADES.
    pub deploy_body: JsonValue,
    /// `Authorization` header forwarded from the originating request.
    pub forwarded_auth: Option<String>,
}

impl AdesProcess {
    pub fn new(
        ctx: DispatchContext,
        provider: &str,
        process: &str,
        deploy_body: JsonValue,
        forwarded_auth: Option<String>,
    ) -> AdesProcess {
        AdesProcess {
            ctx,
            provider: provider.trim_end_matches('/').to_string(),
            process: process.to_string(),
            deploy_body,
            forwarded_auth,
        }
    }

    /// Acquire a bearer token via the resource-owner password grant, or fall
    /// back to the forwarded `Authorization` header.
    async fn auth_headers(&self) -> HeaderMap {
        let mut headers = json_headers();
        if !self.ctx.settings.ades.use_auth_token {
            return headers;
        }
        let ades = &self.ctx.settings.ades;
        if let (Some(user), Some(password), Some(host), Some(client), Some(secret)) = (
            &ades.username,
            &ades.password,
            &ades.wso2_hostname,
            &ades.wso2_client_id,
            &ades.wso2_client_secret,
        ) {
            let token_url = format!("{}/oauth2/token", host.trim_end_matches('/'));
            let form = [
                ("grant_type", "password"),
                ("client_id", client.as_str()),
                ("client_secret", secret.as_str()),
                ("username", user.as_str()),
                ("password", password.as_str()),
                ("scope", "openid"),
            ];
            match self.ctx.http.inner().post(&token_url).form(&form).send().await {
                Ok(response) if response.status().is_success() => {
                    let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
                    match body.get("access_token").and_then(JsonValue::as_str) {
                        Some(token) => {
                            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                                headers.insert(AUTHORIZATION, value);
                            }
                            return headers;
                        }
                        None => warn!(
                            "token endpoint response did not contain an access token"
                        ),
                    }
                }
                Ok(response) => {
                    warn!(status = %response.status(), "could not acquire ADES access token")
                }
                Err(err) => warn!(error = %err, "could not reach ADES token endpoint"),
            }
        }
        if let Some(auth) = &self.forwarded_auth {
            debug!("forwarding originating request authorization to ADES");
            if let Ok(value) = HeaderValue::from_str(auth) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn process_url(&self) -> String {
        format!("{}/processes/{}", self.provider, self.process)
    }

    /// `Some(visible)` when retrievable, `None` on unauthorized access.
    async fn visibility(&self, headers: &HeaderMap) -> Result<Option<bool>> {
        let url = self.process_url();
        let response = self
            .ctx
            .http
            .request_with_retry(Method::GET, &url, Some(headers.clone()), None, 0)
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            StatusCode::NOT_FOUND => Ok(Some(false)),
            status if status.is_success() => Ok(Some(true)),
            status => Err(Error::RemoteExecution(format!(
                "remote process description answered {status}"
            ))),
        }
    }

    async fn deploy(&self, headers: &HeaderMap) -> Result<()> {
        self.ctx
            .update_status("Deploying process on remote ADES.", progress::DEPLOY);
        let url = format!("{}/processes", self.provider);
        let response = self
            .ctx
            .http
            .request_with_retry(
                Method::POST,
                &url,
                Some(headers.clone()),
                Some(self.deploy_body.clone()),
                1,
            )
            .await?;
        match response.status() {
            // an already-deployed process is not an error on redeploy
            StatusCode::CONFLICT => {
                info!(process = %self.process, "process already deployed on remote ADES");
                Ok(())
            }
            status if status.is_success() => Ok(()),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::RemoteExecution(format!(
                    "remote deployment answered {status}: {detail}"
                )))
            }
        }
    }

    async fn set_public(&self, headers: &HeaderMap) -> Result<()> {
        self.ctx
            .update_status("Updating process visibility on remote ADES.", progress::VISIBLE);
        let url = format!("{}/visibility", self.process_url());
        let response = self
            .ctx
            .http
            .request_with_retry(
                Method::PUT,
                &url,
                Some(headers.clone()),
                Some(json!({"value": "public"})),
                0,
            )
            .await?;
        match response.status() {
            // visibility endpoint not supported: assume already public
            StatusCode::NOT_FOUND => {
                warn!(
                    process = %self.process,
                    "remote ADES does not expose visibility, assuming process is public"
                );
                Ok(())
            }
            status if status.is_success() => Ok(()),
            status => Err(Error::RemoteExecution(format!(
                "remote visibility update answered {status}"
            ))),
        }
    }
}

#[async_trait]
impl WpsProcess for AdesProcess {
    fn ctx(&self) -> &DispatchContext {
        &self.ctx
    }

    /// Deploy-if-absent, then enforce public visibility.
    async fn prepare(&self) -> Result<()> {
        let headers = self.auth_headers().await;
        let visible = self.visibility(&headers).await?;
        match visible {
            Some(true) => {
                info!(process = %self.process, provider = %self.provider,
                      "process already deployed and visible on remote ADES");
                return Ok(());
            }
            Some(false) => {
                info!(process = %self.process, provider = %self.provider,
                      "process not deployed on remote ADES, deploying");
            }
            None => {
                info!(process = %self.process, provider = %self.provider,
                      "process access unauthorized on remote ADES, deploying");
            }
        }
        self.deploy(&headers).await?;
        self.set_public(&headers).await
    }

    async fn dispatch(
        &self,
        inputs: Vec<RemoteInput>,
        outputs: Vec<RemoteOutput>,
    ) -> Result<MonitorReference> {
        let headers = self.auth_headers().await;
        let body = execute_body(&inputs, &outputs);
        dispatch_execute(&self.ctx, &self.provider, &self.process, body, headers).await
    }

    async fn monitor(&self, reference: &MonitorReference) -> Result<bool> {
        let headers = self.auth_headers().await;
        monitor_status(
            &self.ctx,
            &reference.location,
            headers,
            |ctx, percent, message| {
                let progress = crate::status::progress::map_range(
                    percent as f64,
                    super::progress::MONITOR,
                    super::progress::RESULTS,
                );
                ctx.update_status(
                    format!("Remote ADES monitoring (progress: {percent}%, status: {message})."),
                    progress,
                );
            },
        )
        .await
    }

    async fn get_results(&self, reference: &MonitorReference) -> Result<Vec<RemoteResult>> {
        let headers = self.auth_headers().await;
        fetch_results(&self.ctx, &reference.location, headers).await
    }

    async fn dismiss(&self, reference: &MonitorReference) {
        let headers = self.auth_headers().await;
        let _ = self
            .ctx
            .http
            .request_with_retry(Method::DELETE, &reference.location, Some(headers), None, 0)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::test_context;
    use wiremock::matchers::{body_json_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_settings() -> std::sync::Arc<crate::config::Settings> {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.worker.monitor_initial_secs = 1;
        settings.ades.use_auth_token = false;
        std::sync::Arc::new(settings)
    }

    #[tokio::test]
    async fn test_prepare_deploys_absent_process() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/processes/step"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let deploy = Mock::given(method("POST"))
            .and(path("/processes"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount_as_scoped(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/processes/step/visibility"))
            .and(body_json_string(r#"{"value": "public"}"#))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (ctx, _rx) = test_context(make_settings());
        let process = AdesProcess::new(
            ctx,
            &server.uri(),
            "step",
            serde_json::json!({"processDescription": {"id": "step"}}),
            None,
        );
        process.prepare().await.unwrap();
        drop(deploy);
    }

    #[tokio::test]
    async fn test_prepare_swallows_conflict_on_redeploy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/processes/step"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/processes"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/processes/step/visibility"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (ctx, _rx) = test_context(make_settings());
        let process =
            AdesProcess::new(ctx, &server.uri(), "step", serde_json::json!({}), None);
        process.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_skips_deploy_when_visible() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/processes/step"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "step"})),
            )
            .mount(&server)
            .await;

        let (ctx, _rx) = test_context(make_settings());
        let process =
            AdesProcess::new(ctx, &server.uri(), "step", serde_json::json!({}), None);
        process.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn test_oauth_token_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"access_token": "tok123", "token_type": "Bearer"}),
            ))
            .mount(&server)
            .await;

        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.ades.use_auth_token = true;
        settings.ades.username = Some("user".into());
        settings.ades.password = Some("pass".into());
        settings.ades.wso2_hostname = Some(server.uri());
        settings.ades.wso2_client_id = Some("client".into());
        settings.ades.wso2_client_secret = Some("secret".into());

        let (ctx, _rx) = test_context(std::sync::Arc::new(settings));
        let process =
            AdesProcess::new(ctx, "https://ades.example.com", "step", serde_json::json!({}), None);
        let headers = process.auth_headers().await;
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap().to_str().unwrap(),
            "Bearer tok123"
        );
    }
}
