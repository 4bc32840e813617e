//! WPS-1/2 XML documents: `DescribeProcess` parsing into a package skeleton,
//! `Execute` request generation, and execute status/response parsing.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::io::MEDIA_TYPE_DIRECTORY;
use crate::package::{Package, REQUIREMENT_WPS1};
use crate::status::{map_remote_status, Status};

#[derive(Debug, Clone, Default)]
pub struct WpsProcessInfo {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Input value as submitted in a WPS `Execute` request.
#[derive(Debug, Clone)]
pub enum WpsExecuteInput {
    Literal(String),
    Complex {
        href: String,
        media_type: Option<String>,
        encoding: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct WpsOutputRef {
    pub id: String,
    pub href: Option<String>,
    pub data: Option<String>,
    pub media_type: Option<String>,
}

/// Parsed WPS execute response / status document.
#[derive(Debug, Clone)]
pub struct WpsExecutionStatus {
    pub status: Status,
    pub percent: Option<i32>,
    pub message: Option<String>,
    pub status_location: Option<String>,
    pub outputs: Vec<WpsOutputRef>,
}

#[derive(Debug, Clone)]
struct IoDraft {
    id: String,
    title: Option<String>,
    description: Option<String>,
    literal_type: Option<String>,
    symbols: Vec<String>,
    formats: Vec<(String, Option<String>, Option<String>)>,
    min_occurs: u32,
    max_occurs: Option<u32>,
    complex: bool,
}

impl Default for IoDraft {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: None,
            description: None,
            literal_type: None,
            symbols: Vec::new(),
            formats: Vec::new(),
            min_occurs: 1,
            max_occurs: Some(1),
            complex: false,
        }
    }
}

fn xml_err(context: &str, err: quick_xml::Error) -> Error {
    Error::PackageRegistration(format!("{context}: {err}"))
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.rsplit(':').next().unwrap_or(&name).to_string()
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        let key = local_name(attr.key.as_ref());
        if key == name {
            attr.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Parse a `DescribeProcess` response into a package skeleton dispatching to
/// the remote WPS provider.
///
/// Literal data maps to the matching scalar type, complex data to `File`
/// (or `Directory` for `application/directory`), `maxOccurs > 1` to arrays
/// and `AllowedValues` to enum symbols.
pub fn describe_process_to_package(
    xml: &str,
    provider_url: &str,
) -> Result<(Package, WpsProcessInfo)> {
    let (info, inputs, outputs) = parse_describe(xml)?;
    if info.id.is_empty() {
        return Err(Error::PackageRegistration(
            "DescribeProcess response contains no process identifier".to_string(),
        ));
    }

    let mut cwl_inputs = Map::new();
    for draft in inputs {
        cwl_inputs.insert(draft.id.clone(), draft_to_cwl_input(&draft));
    }
    let mut cwl_outputs = Map::new();
    for draft in outputs {
        cwl_outputs.insert(draft.id.clone(), draft_to_cwl_output(&draft));
    }

    let mut hints = Map::new();
    hints.insert(
        REQUIREMENT_WPS1.to_string(),
        json!({"provider": provider_url, "process": &info.id}),
    );
    let package = json!({
        "cwlVersion": "v1.0",
        "class": "CommandLineTool",
        "hints": hints,
        "inputs": JsonValue::Object(cwl_inputs),
        "outputs": JsonValue::Object(cwl_outputs),
    });
    Ok((Package::new(package), info))
}

fn parse_describe(xml: &str) -> Result<(WpsProcessInfo, Vec<IoDraft>, Vec<IoDraft>)> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut info = WpsProcessInfo::default();
    let mut inputs: Vec<IoDraft> = Vec::new();
    let mut outputs: Vec<IoDraft> = Vec::new();
    let mut draft: Option<IoDraft> = None;
    let mut draft_is_input = true;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "Input" => {
                        let mut new = IoDraft::default();
                        new.min_occurs = attr_value(&e, "minOccurs")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(1);
                        new.max_occurs = match attr_value(&e, "maxOccurs").as_deref() {
                            Some("unbounded") => None,
                            Some(v) => v.parse().ok(),
                            None => Some(1),
                        };
                        draft = Some(new);
                        draft_is_input = true;
                    }
                    "Output" if stack.iter().any(|s| s == "ProcessOutputs") => {
                        draft = Some(IoDraft::default());
                        draft_is_input = false;
                    }
                    "ComplexData" | "ComplexOutput" => {
                        if let Some(d) = draft.as_mut() {
                            d.complex = true;
                        }
                    }
                    "Format" => {
                        if let Some(d) = draft.as_mut() {
                            d.formats.push((String::new(), None, None));
                        }
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                while let Some(top) = stack.pop() {
                    if top == name {
                        break;
                    }
                }
                match name.as_str() {
                    "Input" => {
                        if let Some(d) = draft.take() {
                            inputs.push(d);
                        }
                    }
                    "Output" => {
                        if let Some(d) = draft.take() {
                            if !draft_is_input {
                                outputs.push(d);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| xml_err("invalid DescribeProcess text", e))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let element = stack.last().map(String::as_str).unwrap_or("");
                match (element, draft.as_mut()) {
                    ("Identifier", Some(d)) => d.id = text,
                    ("Title", Some(d)) => d.title = Some(text),
                    ("Abstract", Some(d)) => d.description = Some(text),
                    ("DataType", Some(d)) => d.literal_type = Some(text),
                    ("Value", Some(d)) if stack.iter().any(|s| s == "AllowedValues") => {
                        d.symbols.push(text)
                    }
                    ("MimeType", Some(d)) => {
                        if let Some(last) = d.formats.last_mut() {
                            last.0 = text;
                        }
                    }
                    ("Encoding", Some(d)) => {
                        if let Some(last) = d.formats.last_mut() {
                            last.1 = Some(text);
                        }
                    }
                    ("Schema", Some(d)) => {
                        if let Some(last) = d.formats.last_mut() {
                            last.2 = Some(text);
                        }
                    }
                    ("Identifier", None) if info.id.is_empty() => info.id = text,
                    ("Title", None) if info.title.is_none() => info.title = Some(text),
                    ("Abstract", None) if info.description.is_none() => {
                        info.description = Some(text)
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_err("invalid DescribeProcess document", e)),
        }
    }
    Ok((info, inputs, outputs))
}

fn literal_type_name(declared: Option<&str>) -> &'static str {
    let name = declared
        .map(|d| d.rsplit(':').next().unwrap_or(d).to_ascii_lowercase())
        .unwrap_or_default();
    match name.as_str() {
        "integer" | "int" | "long" | "nonnegativeinteger" | "positiveinteger" => "int",
        "float" | "double" | "decimal" => "float",
        "boolean" | "bool" => "boolean",
        _ => "string",
    }
}

fn draft_to_cwl_input(draft: &IoDraft) -> JsonValue {
    let mut def = Map::new();
    let base: JsonValue = if draft.complex {
        if draft
            .formats
            .first()
            .map(|f| f.0 == MEDIA_TYPE_DIRECTORY)
            .unwrap_or(false)
        {
            json!("Directory")
        } else {
            json!("File")
        }
    } else if !draft.symbols.is_empty() {
        json!({"type": "enum", "symbols": draft.symbols})
    } else {
        json!(literal_type_name(draft.literal_type.as_deref()))
    };

    let array = draft.max_occurs.map(|m| m > 1).unwrap_or(true);
    let mut type_value = if array {
        json!({"type": "array", "items": base})
    } else {
        base
    };
    if draft.min_occurs == 0 {
        type_value = match type_value {
            JsonValue::String(name) => JsonValue::String(format!("{name}?")),
            other => json!(["null", other]),
        };
    }
    def.insert("type".into(), type_value);

    if draft.complex {
        let media: Vec<JsonValue> = draft
            .formats
            .iter()
            .filter(|f| !f.0.is_empty())
            .map(|f| json!(f.0))
            .collect();
        if media.len() == 1 {
            def.insert("format".into(), media.into_iter().next().unwrap_or_default());
        } else if !media.is_empty() {
            def.insert("format".into(), JsonValue::Array(media));
        }
    }
    if let Some(title) = &draft.title {
        def.insert("label".into(), json!(title));
    }
    if let Some(description) = &draft.description {
        def.insert("doc".into(), json!(description));
    }
    JsonValue::Object(def)
}

fn draft_to_cwl_output(draft: &IoDraft) -> JsonValue {
    let mut def = Map::new();
    if draft.complex {
        let directory = draft
            .formats
            .first()
            .map(|f| f.0 == MEDIA_TYPE_DIRECTORY)
            .unwrap_or(false);
        def.insert(
            "type".into(),
            if directory {
                json!("Directory")
            } else {
                json!("File")
            },
        );
        if let Some((media, _, _)) = draft.formats.first() {
            if !media.is_empty() && !directory {
                def.insert("format".into(), json!(media));
            }
        }
        // remote outputs stage into a per-id folder, glob accordingly
        def.insert("outputBinding".into(), json!({"glob": format!("{}/*", draft.id)}));
    } else {
        def.insert(
            "type".into(),
            json!(literal_type_name(draft.literal_type.as_deref())),
        );
    }
    if let Some(title) = &draft.title {
        def.insert("label".into(), json!(title));
    }
    JsonValue::Object(def)
}

/// Build a WPS 1.0.0 `Execute` request asking for a stored, asynchronous
/// status document.
pub fn build_execute_request(process_id: &str, inputs: &[(String, WpsExecuteInput)]) -> String {
    let mut body = String::new();
    body.push_str(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <wps:Execute service=\"WPS\" version=\"1.0.0\" \
         xmlns:wps=\"http://www.opengis.net/wps/1.0.0\" \
         xmlns:ows=\"http://www.opengis.net/ows/1.1\" \
         xmlns:xlink=\"http://www.w3.org/1999/xlink\">\n",
    );
    body.push_str(&format!(
        "  <ows:Identifier>{}</ows:Identifier>\n  <wps:DataInputs>\n",
        escape(process_id)
    ));
    for (id, input) in inputs {
        body.push_str("    <wps:Input>\n");
        body.push_str(&format!(
            "      <ows:Identifier>{}</ows:Identifier>\n",
            escape(id)
        ));
        match input {
            WpsExecuteInput::Literal(value) => {
                body.push_str(&format!(
                    "      <wps:Data><wps:LiteralData>{}</wps:LiteralData></wps:Data>\n",
                    escape(value)
                ));
            }
            WpsExecuteInput::Complex {
                href,
                media_type,
                encoding,
            } => {
                let mut attrs = format!(" xlink:href=\"{}\"", escape(href));
                if let Some(media) = media_type {
                    attrs.push_str(&format!(" mimeType=\"{}\"", escape(media)));
                }
                if let Some(encoding) = encoding {
                    attrs.push_str(&format!(" encoding=\"{}\"", escape(encoding)));
                }
                body.push_str(&format!("      <wps:Reference{attrs}/>\n"));
            }
        }
        body.push_str("    </wps:Input>\n");
    }
    body.push_str(
        "  </wps:DataInputs>\n\
         \x20 <wps:ResponseForm>\n\
         \x20   <wps:ResponseDocument storeExecuteResponse=\"true\" status=\"true\"/>\n\
         \x20 </wps:ResponseForm>\n\
         </wps:Execute>\n",
    );
    body
}

/// Render the stored status document of a job, mirroring the WPS execute
/// response layout.
pub fn build_status_document(
    job_id: &uuid::Uuid,
    status: Status,
    progress: i32,
    message: &str,
) -> String {
    let status_element = match status {
        Status::Accepted => format!(
            "<wps:ProcessAccepted>{}</wps:ProcessAccepted>",
            escape(message)
        ),
        Status::Started | Status::Running => format!(
            "<wps:ProcessStarted percentCompleted=\"{progress}\">{}</wps:ProcessStarted>",
            escape(message)
        ),
        Status::Succeeded => format!(
            "<wps:ProcessSucceeded>{}</wps:ProcessSucceeded>",
            escape(message)
        ),
        Status::Failed | Status::Dismissed => format!(
            "<wps:ProcessFailed><wps:ExceptionReport><ows:Exception>\
             <ows:ExceptionText>{}</ows:ExceptionText>\
             </ows:Exception></wps:ExceptionReport></wps:ProcessFailed>",
            escape(message)
        ),
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <wps:ExecuteResponse service=\"WPS\" version=\"1.0.0\" \
         xmlns:wps=\"http://www.opengis.net/wps/1.0.0\" \
         xmlns:ows=\"http://www.opengis.net/ows/1.1\">\n\
         \x20 <wps:Process><ows:Identifier>{job_id}</ows:Identifier></wps:Process>\n\
         \x20 <wps:Status>{status_element}</wps:Status>\n\
         </wps:ExecuteResponse>\n"
    )
}

/// Parse a WPS execute response or stored status document.
pub fn parse_execute_status(xml: &str) -> Result<WpsExecutionStatus> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut status = None;
    let mut percent = None;
    let mut message = None;
    let mut status_location = None;
    let mut outputs: Vec<WpsOutputRef> = Vec::new();
    let mut current_output: Option<WpsOutputRef> = None;

    let as_remote_err =
        |context: &str, e: quick_xml::Error| Error::RemoteExecution(format!("{context}: {e}"));

    let mut handle_element = |e: &quick_xml::events::BytesStart<'_>,
                              status: &mut Option<Status>,
                              percent: &mut Option<i32>,
                              status_location: &mut Option<String>,
                              current_output: &mut Option<WpsOutputRef>| {
        let name = local_name(e.name().as_ref());
        match name.as_str() {
            "ExecuteResponse" => {
                *status_location = attr_value(e, "statusLocation");
            }
            "ProcessAccepted" => *status = Some(Status::Accepted),
            "ProcessStarted" | "ProcessPaused" => {
                *status = Some(Status::Running);
                *percent = attr_value(e, "percentCompleted").and_then(|v| v.parse().ok());
            }
            "ProcessSucceeded" => *status = Some(Status::Succeeded),
            "ProcessFailed" => *status = Some(Status::Failed),
            "Output" => *current_output = Some(WpsOutputRef::default()),
            "Reference" => {
                if let Some(out) = current_output.as_mut() {
                    out.href = attr_value(e, "href");
                    out.media_type = attr_value(e, "mimeType");
                }
            }
            _ => {}
        }
        name
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = handle_element(
                    &e,
                    &mut status,
                    &mut percent,
                    &mut status_location,
                    &mut current_output,
                );
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                // self-closing elements carry attributes but no children
                handle_element(
                    &e,
                    &mut status,
                    &mut percent,
                    &mut status_location,
                    &mut current_output,
                );
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                while let Some(top) = stack.pop() {
                    if top == name {
                        break;
                    }
                }
                if name == "Output" {
                    if let Some(out) = current_output.take() {
                        outputs.push(out);
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| as_remote_err("invalid status text", e))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let element = stack.last().map(String::as_str).unwrap_or("");
                match element {
                    "ProcessAccepted" | "ProcessStarted" | "ProcessSucceeded"
                    | "ProcessPaused" => message = Some(text),
                    "ExceptionText" | "Exception" => message = Some(text),
                    "Identifier" => {
                        if let Some(out) = current_output.as_mut() {
                            out.id = text;
                        }
                    }
                    "LiteralData" => {
                        if let Some(out) = current_output.as_mut() {
                            out.data = Some(text);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(as_remote_err("invalid status document", e)),
        }
    }

    let status = status
        .or_else(|| message.as_deref().and_then(map_remote_status))
        .ok_or_else(|| {
            Error::RemoteExecution("status document carries no recognizable status".to_string())
        })?;
    Ok(WpsExecutionStatus {
        status,
        percent,
        message,
        status_location,
        outputs,
    })
}

/// Extract `(identifier, title)` pairs from a `GetCapabilities` response.
pub fn parse_capabilities(xml: &str) -> Result<Vec<(String, Option<String>)>> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut processes = Vec::new();
    let mut current: Option<(String, Option<String>)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "Process" {
                    current = Some((String::new(), None));
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                while let Some(top) = stack.pop() {
                    if top == name {
                        break;
                    }
                }
                if name == "Process" {
                    if let Some((id, title)) = current.take() {
                        if !id.is_empty() {
                            processes.push((id, title));
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::ServiceNotAccessible(format!("invalid capabilities: {e}")))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let element = stack.last().map(String::as_str).unwrap_or("");
                if let Some((id, title)) = current.as_mut() {
                    match element {
                        "Identifier" => *id = text,
                        "Title" => *title = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::ServiceNotAccessible(format!(
                    "invalid capabilities document: {e}"
                )))
            }
        }
    }
    Ok(processes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoKind;
    use crate::package::convert::package_io_defs;

    const DESCRIBE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<wps:ProcessDescriptions xmlns:wps="http://www.opengis.net/wps/1.0.0"
                         xmlns:ows="http://www.opengis.net/ows/1.1">
  <ProcessDescription storeSupported="true" statusSupported="true">
    <ows:Identifier>ncdump</ows:Identifier>
    <ows:Title>Dump NetCDF</ows:Title>
    <ows:Abstract>Runs ncdump on the provided dataset.</ows:Abstract>
    <DataInputs>
      <Input minOccurs="1" maxOccurs="unbounded">
        <ows:Identifier>dataset</ows:Identifier>
        <ows:Title>Dataset</ows:Title>
        <ComplexData>
          <Default><Format><MimeType>application/x-netcdf</MimeType></Format></Default>
          <Supported><Format><MimeType>application/json</MimeType></Format></Supported>
        </ComplexData>
      </Input>
      <Input minOccurs="0" maxOccurs="1">
        <ows:Identifier>mode</ows:Identifier>
        <LiteralData>
          <ows:DataType>xs:string</ows:DataType>
          <ows:AllowedValues>
            <ows:Value>header</ows:Value>
            <ows:Value>full</ows:Value>
          </ows:AllowedValues>
        </LiteralData>
      </Input>
    </DataInputs>
    <ProcessOutputs>
      <Output>
        <ows:Identifier>output</ows:Identifier>
        <ComplexOutput>
          <Default><Format><MimeType>text/plain</MimeType></Format></Default>
        </ComplexOutput>
      </Output>
    </ProcessOutputs>
  </ProcessDescription>
</wps:ProcessDescriptions>"#;

    #[test]
    fn test_describe_process_mapping() {
        let (package, info) =
            describe_process_to_package(DESCRIBE_XML, "https://wps.example.com/wps").unwrap();
        assert_eq!(info.id, "ncdump");
        assert_eq!(info.title.as_deref(), Some("Dump NetCDF"));

        let (inputs, outputs) = package_io_defs(&package).unwrap();
        let dataset = inputs.iter().find(|d| d.id == "dataset").unwrap();
        assert_eq!(dataset.kind, IoKind::ComplexFile);
        assert_eq!(dataset.max_occurs, None);
        assert_eq!(dataset.formats[0].media_type, "application/x-netcdf");

        let mode = inputs.iter().find(|d| d.id == "mode").unwrap();
        assert_eq!(mode.min_occurs, 0);
        assert_eq!(
            mode.literal.as_ref().unwrap().symbols,
            vec!["header", "full"]
        );

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, IoKind::ComplexFile);

        let hint = &package.raw["hints"][REQUIREMENT_WPS1];
        assert_eq!(hint["provider"], "https://wps.example.com/wps");
        assert_eq!(hint["process"], "ncdump");
    }

    #[test]
    fn test_execute_request_contains_inputs() {
        let body = build_execute_request(
            "ncdump",
            &[
                ("mode".to_string(), WpsExecuteInput::Literal("<full>".into())),
                (
                    "dataset".to_string(),
                    WpsExecuteInput::Complex {
                        href: "https://data.example.com/file.nc".into(),
                        media_type: Some("application/x-netcdf".into()),
                        encoding: None,
                    },
                ),
            ],
        );
        assert!(body.contains("<ows:Identifier>ncdump</ows:Identifier>"));
        assert!(body.contains("&lt;full&gt;"));
        assert!(body.contains("xlink:href=\"https://data.example.com/file.nc\""));
        assert!(body.contains("storeExecuteResponse=\"true\""));
    }

    #[test]
    fn test_status_document_roundtrip() {
        let job_id = uuid::Uuid::new_v4();
        let xml = build_status_document(&job_id, Status::Succeeded, 100, "Job succeeded.");
        let parsed = parse_execute_status(&xml).unwrap();
        assert_eq!(parsed.status, Status::Succeeded);
        assert_eq!(parsed.message.as_deref(), Some("Job succeeded."));

        let xml = build_status_document(&job_id, Status::Running, 42, "working");
        let parsed = parse_execute_status(&xml).unwrap();
        assert_eq!(parsed.status, Status::Running);
        assert_eq!(parsed.percent, Some(42));
    }

    #[test]
    fn test_parse_running_status() {
        let xml = r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0"
            statusLocation="https://wps.example.com/status/123.xml">
            <wps:Status><wps:ProcessStarted percentCompleted="42">working</wps:ProcessStarted></wps:Status>
        </wps:ExecuteResponse>"#;
        let status = parse_execute_status(xml).unwrap();
        assert_eq!(status.status, Status::Running);
        assert_eq!(status.percent, Some(42));
        assert_eq!(
            status.status_location.as_deref(),
            Some("https://wps.example.com/status/123.xml")
        );
    }

    #[test]
    fn test_parse_succeeded_with_outputs() {
        let xml = r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0"
            xmlns:ows="http://www.opengis.net/ows/1.1" xmlns:xlink="http://www.w3.org/1999/xlink">
            <wps:Status><wps:ProcessSucceeded>done</wps:ProcessSucceeded></wps:Status>
            <wps:ProcessOutputs>
              <wps:Output>
                <ows:Identifier>output</ows:Identifier>
                <wps:Reference xlink:href="https://wps.example.com/out/output.txt" mimeType="text/plain"/>
              </wps:Output>
              <wps:Output>
                <ows:Identifier>count</ows:Identifier>
                <wps:Data><wps:LiteralData>3</wps:LiteralData></wps:Data>
              </wps:Output>
            </wps:ProcessOutputs>
        </wps:ExecuteResponse>"#;
        let status = parse_execute_status(xml).unwrap();
        assert_eq!(status.status, Status::Succeeded);
        assert_eq!(status.outputs.len(), 2);
        assert_eq!(
            status.outputs[0].href.as_deref(),
            Some("https://wps.example.com/out/output.txt")
        );
        assert_eq!(status.outputs[1].data.as_deref(), Some("3"));
    }

    #[test]
    fn test_parse_failed_status_with_exception() {
        let xml = r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0"
            xmlns:ows="http://www.opengis.net/ows/1.1">
            <wps:Status><wps:ProcessFailed>
              <wps:ExceptionReport><ows:Exception>
                <ows:ExceptionText>it broke</ows:ExceptionText>
              </ows:Exception></wps:ExceptionReport>
            </wps:ProcessFailed></wps:Status>
        </wps:ExecuteResponse>"#;
        let status = parse_execute_status(xml).unwrap();
        assert_eq!(status.status, Status::Failed);
        assert_eq!(status.message.as_deref(), Some("it broke"));
    }

    #[test]
    fn test_parse_capabilities() {
        let xml = r#"<wps:Capabilities xmlns:wps="http://www.opengis.net/wps/1.0.0"
            xmlns:ows="http://www.opengis.net/ows/1.1">
          <wps:ProcessOfferings>
            <wps:Process><ows:Identifier>ncdump</ows:Identifier><ows:Title>Dump</ows:Title></wps:Process>
            <wps:Process><ows:Identifier>subset</ows:Identifier></wps:Process>
          </wps:ProcessOfferings>
        </wps:Capabilities>"#;
        let processes = parse_capabilities(xml).unwrap();
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].0, "ncdump");
        assert_eq!(processes[0].1.as_deref(), Some("Dump"));
    }
}
