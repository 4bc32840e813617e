//! Legacy WPS-1/2 dispatcher.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::package::wps_xml::{
    self, build_execute_request, parse_execute_status, WpsExecuteInput,
};
use crate::status::Status;

use super::{
    DispatchContext, MonitorReference, RemoteInput, RemoteOutput, RemoteResult, WpsProcess,
};

pub struct Wps1Process {
    ctx: DispatchContext,
    pub provider: String,
    pub process: String,
}

impl Wps1Process {
    pub fn new(ctx: DispatchContext, provider: &str, process: &str) -> Wps1Process {
        Wps1Process {
            ctx,
            provider: provider.to_string(),
            process: process.to_string(),
        }
    }

    fn xml_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        headers
    }

    async fn describe_process(&self) -> Result<()> {
        let url = format!(
            "{}?service=WPS&version=1.0.0&request=DescribeProcess&identifier={}",
            self.provider, self.process
        );
        let (body, _) = self.ctx.http.get_text(&url).await?;
        let (_, info) = wps_xml::describe_process_to_package(&body, &self.provider)?;
        if info.id != self.process {
            return Err(Error::NoSuchProcess(format!(
                "provider [{}] does not describe process [{}]",
                self.provider, self.process
            )));
        }
        Ok(())
    }

    /// Poll the stored status document until terminal.
    pub(crate) async fn watch_status(
        &self,
        location: &str,
        mut on_status: impl FnMut(&DispatchContext, &wps_xml::WpsExecutionStatus) + Send,
    ) -> Result<bool> {
        const MAX_READ_FAILURES: u32 = 5;
        let mut step = 0u32;
        let mut failures = 0u32;
        loop {
            if !self.ctx.monitor_sleep(step).await {
                return Err(Error::PackageExecution(
                    "remote monitoring interrupted by dismissal".into(),
                ));
            }
            match self.read_status(location).await {
                Ok(status) => {
                    failures = 0;
                    step += 1;
                    on_status(&self.ctx, &status);
                    match status.status {
                        Status::Succeeded => return Ok(true),
                        Status::Failed | Status::Dismissed => return Ok(false),
                        _ => continue,
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(%location, %err, failures, "failed reading WPS status document");
                    if failures >= MAX_READ_FAILURES {
                        return Err(Error::MonitoringTimeout(format!(
                            "could not read status document after {MAX_READ_FAILURES} retries: {err}"
                        )));
                    }
                }
            }
        }
    }

    async fn read_status(&self, location: &str) -> Result<wps_xml::WpsExecutionStatus> {
        let (body, _) = self.ctx.http.get_text(location).await?;
        parse_execute_status(&body)
    }
}

pub(crate) fn to_wps_inputs(inputs: &[RemoteInput]) -> Vec<(String, WpsExecuteInput)> {
    inputs
        .iter()
        .map(|input| {
            let value = match (&input.href, &input.data) {
                (Some(href), _) => WpsExecuteInput::Complex {
                    href: href.clone(),
                    media_type: input.media_type.clone(),
                    encoding: input.encoding.clone(),
                },
                (None, Some(data)) => WpsExecuteInput::Literal(data.clone()),
                (None, None) => WpsExecuteInput::Literal(String::new()),
            };
            (input.id.clone(), value)
        })
        .collect()
}

#[async_trait]
impl WpsProcess for Wps1Process {
    fn ctx(&self) -> &DispatchContext {
        &self.ctx
    }

    async fn prepare(&self) -> Result<()> {
        self.describe_process().await
    }

    async fn dispatch(
        &self,
        inputs: Vec<RemoteInput>,
        _outputs: Vec<RemoteOutput>,
    ) -> Result<MonitorReference> {
        let request = build_execute_request(&self.process, &to_wps_inputs(&inputs));
        debug!(provider = %self.provider, process = %self.process, "posting WPS Execute request");
        let response = self
            .ctx
            .http
            .inner()
            .post(&self.provider)
            .headers(Self::xml_headers())
            .body(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::RemoteExecution(format!(
                "WPS execute answered {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        let status = parse_execute_status(&body)?;
        if status.status == Status::Failed {
            return Err(Error::RemoteExecution(format!(
                "WPS execute rejected: {}",
                status.message.unwrap_or_default()
            )));
        }
        let location = status.status_location.clone().ok_or_else(|| {
            Error::RemoteExecution("WPS execute response carries no status location".into())
        })?;
        Ok(MonitorReference {
            location,
            payload: json!({"response": body}),
        })
    }

    async fn monitor(&self, reference: &MonitorReference) -> Result<bool> {
        self.watch_status(&reference.location, |ctx, status| {
            let percent = status.percent.unwrap_or(0);
            let progress = crate::status::progress::map_range(
                percent as f64,
                super::progress::MONITOR,
                super::progress::RESULTS,
            );
            let message = status.message.clone().unwrap_or_else(|| "n/a".into());
            ctx.update_status(
                format!("Remote WPS monitoring (progress: {percent}%, status: {message})."),
                progress,
            );
        })
        .await
    }

    async fn get_results(&self, reference: &MonitorReference) -> Result<Vec<RemoteResult>> {
        let status = self.read_status(&reference.location).await?;
        Ok(status
            .outputs
            .into_iter()
            .map(|output| RemoteResult {
                id: output.id,
                href: output.href,
                value: output.data.map(serde_json::Value::String),
                media_type: output.media_type,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::test_context;
    use crate::dispatch::{ExpectedOutputs, WorkflowInputs};
    use crate::io::IoValue;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_settings() -> std::sync::Arc<crate::config::Settings> {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/pelican");
        let mut settings = crate::config::Settings::load(None).unwrap();
        settings.worker.monitor_initial_secs = 1;
        std::sync::Arc::new(settings)
    }

    const DESCRIBE_XML: &str = r#"<wps:ProcessDescriptions xmlns:wps="http://www.opengis.net/wps/1.0.0"
        xmlns:ows="http://www.opengis.net/ows/1.1">
      <ProcessDescription>
        <ows:Identifier>ncdump</ows:Identifier>
        <DataInputs>
          <Input><ows:Identifier>dataset</ows:Identifier>
            <ComplexData><Default><Format><MimeType>application/x-netcdf</MimeType></Format></Default></ComplexData>
          </Input>
        </DataInputs>
        <ProcessOutputs>
          <Output><ows:Identifier>output</ows:Identifier>
            <ComplexOutput><Default><Format><MimeType>text/plain</MimeType></Format></Default></ComplexOutput>
          </Output>
        </ProcessOutputs>
      </ProcessDescription>
    </wps:ProcessDescriptions>"#;

    #[tokio::test]
    async fn test_full_wps1_dispatch_sequence() {
        let server = MockServer::start().await;
        let status_url = format!("{}/status/xyz.xml", server.uri());

        Mock::given(method("GET"))
            .and(path("/wps"))
            .and(query_param("request", "DescribeProcess"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DESCRIBE_XML))
            .mount(&server)
            .await;

        let accepted = format!(
            r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0"
                statusLocation="{status_url}">
               <wps:Status><wps:ProcessAccepted>queued</wps:ProcessAccepted></wps:Status>
             </wps:ExecuteResponse>"#
        );
        Mock::given(method("POST"))
            .and(path("/wps"))
            .and(body_string_contains("ows:Identifier>ncdump"))
            .respond_with(ResponseTemplate::new(200).set_body_string(accepted))
            .mount(&server)
            .await;

        let succeeded = format!(
            r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0"
                xmlns:ows="http://www.opengis.net/ows/1.1" xmlns:xlink="http://www.w3.org/1999/xlink">
               <wps:Status><wps:ProcessSucceeded>done</wps:ProcessSucceeded></wps:Status>
               <wps:ProcessOutputs><wps:Output>
                 <ows:Identifier>output</ows:Identifier>
                 <wps:Reference xlink:href="{}/out/result.txt" mimeType="text/plain"/>
               </wps:Output></wps:ProcessOutputs>
             </wps:ExecuteResponse>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/status/xyz.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(succeeded))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/out/result.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&server)
            .await;

        let (ctx, _rx) = test_context(make_settings());
        let process = Wps1Process::new(ctx, &format!("{}/wps", server.uri()), "ncdump");

        let out_dir = tempfile::tempdir().unwrap();
        let mut inputs = WorkflowInputs::new();
        inputs.insert(
            "dataset".into(),
            IoValue::FileRef {
                href: format!("{}/data/input.nc", server.uri()),
                media_type: Some("application/x-netcdf".into()),
                encoding: None,
                schema: None,
            },
        );
        let mut expected = ExpectedOutputs::new();
        expected.insert("output".into(), "output/*".into());

        process
            .execute(&inputs, out_dir.path(), &expected)
            .await
            .unwrap();

        let staged = out_dir.path().join("output/result.txt");
        assert!(staged.is_file());
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "payload");
    }

    #[test]
    fn test_to_wps_inputs() {
        let inputs = vec![
            RemoteInput {
                id: "mode".into(),
                data: Some("full".into()),
                ..Default::default()
            },
            RemoteInput {
                id: "dataset".into(),
                href: Some("https://x/in.nc".into()),
                media_type: Some("application/x-netcdf".into()),
                ..Default::default()
            },
        ];
        let converted = to_wps_inputs(&inputs);
        assert!(matches!(&converted[0].1, WpsExecuteInput::Literal(v) if v == "full"));
        assert!(matches!(&converted[1].1, WpsExecuteInput::Complex { href, .. } if href == "https://x/in.nc"));
    }
}
