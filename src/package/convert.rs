//! I/O conversion between package, OGC API and peer-description forms.
//!
//! The package definition is authoritative for types and cardinality; the
//! peer description only contributes human metadata and additional supported
//! formats (see [`merge_input_defs`] / [`merge_output_defs`]).

use serde_json::{json, Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::io::{
    DataType, Format, InputDef, IoKind, LiteralDomain, OutputDef, MEDIA_TYPE_DIRECTORY,
};
use crate::package::Package;

#[derive(Debug, Clone, PartialEq)]
enum BaseType {
    Literal(DataType),
    Enum(Vec<String>),
    File,
    Directory,
}

#[derive(Debug, Clone)]
struct ParsedType {
    base: BaseType,
    array: bool,
    optional: bool,
}

/// Parse a CWL `type` field: scalar names, `File`/`Directory`, `T[]` and `T?`
/// shorthands, `{type: array, items}`, `{type: enum, symbols}` and the
/// `["null", T]` optional union.
fn parse_type(value: &JsonValue) -> Result<ParsedType> {
    match value {
        JsonValue::String(name) => {
            let mut name = name.as_str();
            let mut optional = false;
            let mut array = false;
            if let Some(stripped) = name.strip_suffix('?') {
                optional = true;
                name = stripped;
            }
            if let Some(stripped) = name.strip_suffix("[]") {
                array = true;
                name = stripped;
            }
            let base = base_from_name(name)?;
            Ok(ParsedType {
                base,
                array,
                optional,
            })
        }
        JsonValue::Array(union) => {
            let mut optional = false;
            let mut inner = None;
            for entry in union {
                if entry.as_str() == Some("null") {
                    optional = true;
                } else if inner.is_none() {
                    inner = Some(parse_type(entry)?);
                } else {
                    return Err(Error::PackageType(
                        "unions beyond ['null', T] are not supported".to_string(),
                    ));
                }
            }
            let mut parsed = inner.ok_or_else(|| {
                Error::PackageType("empty type union in package I/O".to_string())
            })?;
            parsed.optional = parsed.optional || optional;
            Ok(parsed)
        }
        JsonValue::Object(map) => {
            let kind = map.get("type").and_then(JsonValue::as_str).unwrap_or("");
            match kind {
                "array" => {
                    let items = map.get("items").ok_or_else(|| {
                        Error::PackageType("array type without 'items'".to_string())
                    })?;
                    let mut parsed = parse_type(items)?;
                    parsed.array = true;
                    Ok(parsed)
                }
                "enum" => {
                    let symbols = map
                        .get("symbols")
                        .and_then(JsonValue::as_array)
                        .map(|list| {
                            list.iter()
                                .filter_map(JsonValue::as_str)
                                // symbols may carry a 'file#' fragment prefix
                                .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    Ok(ParsedType {
                        base: BaseType::Enum(symbols),
                        array: false,
                        optional: false,
                    })
                }
                other => Err(Error::PackageType(format!(
                    "unsupported compound type '{other}'"
                ))),
            }
        }
        other => Err(Error::PackageType(format!(
            "cannot interpret I/O type from {other}"
        ))),
    }
}

fn base_from_name(name: &str) -> Result<BaseType> {
    match name {
        "File" => Ok(BaseType::File),
        "Directory" => Ok(BaseType::Directory),
        other => DataType::from_name(other)
            .map(BaseType::Literal)
            .ok_or_else(|| Error::PackageType(format!("unknown I/O type '{other}'"))),
    }
}

fn formats_from_def(def: &JsonValue) -> Vec<Format> {
    let value = def.get("format").or_else(|| def.get("formats"));
    let mut formats: Vec<Format> = match value {
        Some(JsonValue::String(media)) => vec![Format::new(media.clone())],
        Some(JsonValue::Array(list)) => list
            .iter()
            .filter_map(|entry| match entry {
                JsonValue::String(media) => Some(Format::new(media.clone())),
                JsonValue::Object(_) => serde_json::from_value(entry.clone()).ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if let Some(first) = formats.first_mut() {
        first.default = true;
    }
    formats
}

/// Convert one package input entry into its typed definition.
pub fn input_def_from_cwl(id: &str, def: &JsonValue) -> Result<InputDef> {
    let type_field = def
        .get("type")
        .ok_or_else(|| Error::PackageType(format!("input '{id}' has no type")))?;
    let parsed = parse_type(type_field)?;
    let has_default = def.get("default").map(|d| !d.is_null()).unwrap_or(false);
    let min_occurs = if parsed.optional || has_default { 0 } else { 1 };
    let max_occurs = if parsed.array { None } else { Some(1) };

    let (kind, literal, formats) = match parsed.base {
        BaseType::Literal(data_type) => (IoKind::Literal, Some(LiteralDomain::new(data_type)), vec![]),
        BaseType::Enum(symbols) => {
            let mut domain = LiteralDomain::new(DataType::String);
            domain.symbols = symbols;
            (IoKind::Literal, Some(domain), vec![])
        }
        BaseType::File => {
            let mut formats = formats_from_def(def);
            if formats.is_empty() {
                let mut fallback = Format::new(crate::io::MEDIA_TYPE_TEXT);
                fallback.default = true;
                formats.push(fallback);
            }
            (IoKind::ComplexFile, None, formats)
        }
        BaseType::Directory => {
            let mut format = Format::new(MEDIA_TYPE_DIRECTORY);
            format.default = true;
            (IoKind::ComplexDirectory, None, vec![format])
        }
    };

    Ok(InputDef {
        id: id.to_string(),
        title: def.get("label").and_then(JsonValue::as_str).map(String::from),
        description: def.get("doc").and_then(JsonValue::as_str).map(String::from),
        keywords: vec![],
        kind,
        min_occurs,
        max_occurs,
        literal,
        formats,
    })
}

/// Convert one package output entry into its typed definition.
pub fn output_def_from_cwl(id: &str, def: &JsonValue) -> Result<OutputDef> {
    let type_field = def
        .get("type")
        .ok_or_else(|| Error::PackageType(format!("output '{id}' has no type")))?;
    let parsed = parse_type(type_field)?;

    let (kind, literal, formats) = match parsed.base {
        BaseType::Literal(data_type) => (IoKind::Literal, Some(LiteralDomain::new(data_type)), vec![]),
        BaseType::Enum(symbols) => {
            let mut domain = LiteralDomain::new(DataType::String);
            domain.symbols = symbols;
            (IoKind::Literal, Some(domain), vec![])
        }
        BaseType::File => (IoKind::ComplexFile, None, formats_from_def(def)),
        BaseType::Directory => {
            let mut format = Format::new(MEDIA_TYPE_DIRECTORY);
            format.default = true;
            (IoKind::ComplexDirectory, None, vec![format])
        }
    };

    Ok(OutputDef {
        id: id.to_string(),
        title: def.get("label").and_then(JsonValue::as_str).map(String::from),
        description: def.get("doc").and_then(JsonValue::as_str).map(String::from),
        keywords: vec![],
        kind,
        array: parsed.array,
        literal,
        formats,
        glob: def
            .pointer("/outputBinding/glob")
            .and_then(JsonValue::as_str)
            .map(String::from),
    })
}

/// Extract the typed I/O of a package document.
pub fn package_io_defs(package: &Package) -> Result<(Vec<InputDef>, Vec<OutputDef>)> {
    let mut inputs = Vec::new();
    for (id, def) in package.io_entries("inputs") {
        inputs.push(input_def_from_cwl(&id, &def)?);
    }
    let mut outputs = Vec::new();
    for (id, def) in package.io_entries("outputs") {
        // stdout/stderr capture outputs are execution plumbing, not I/O
        let ty = def.get("type").and_then(JsonValue::as_str).unwrap_or("");
        if ty == "stdout" || ty == "stderr" {
            continue;
        }
        outputs.push(output_def_from_cwl(&id, &def)?);
    }
    Ok((inputs, outputs))
}

fn merge_metadata(
    title: &mut Option<String>,
    description: &mut Option<String>,
    keywords: &mut Vec<String>,
    formats: &mut Vec<Format>,
    peer: &JsonValue,
) {
    if title.is_none() {
        *title = peer
            .get("title")
            .and_then(JsonValue::as_str)
            .map(String::from);
    }
    if description.is_none() {
        *description = peer
            .get("abstract")
            .or_else(|| peer.get("description"))
            .and_then(JsonValue::as_str)
            .map(String::from);
    }
    if let Some(extra) = peer.get("keywords").and_then(JsonValue::as_array) {
        for keyword in extra.iter().filter_map(JsonValue::as_str) {
            if !keywords.iter().any(|k| k == keyword) {
                keywords.push(keyword.to_string());
            }
        }
    }

    // peer formats may add entries; duplicates by (mediaType, encoding,
    // schema) fold into the package entry, keeping its default flag
    for peer_format in peer_formats(peer) {
        if let Some(existing) = formats.iter_mut().find(|f| f.key() == peer_format.key()) {
            if existing.default {
                // package default confirmed by the peer list
                existing.default = true;
            }
            if existing.encoding.is_none() {
                existing.encoding = peer_format.encoding.clone();
            }
            if existing.schema.is_none() {
                existing.schema = peer_format.schema.clone();
            }
        } else {
            let mut format = peer_format;
            format.default = false;
            formats.push(format);
        }
    }
}

fn peer_formats(peer: &JsonValue) -> Vec<Format> {
    peer.get("formats")
        .and_then(JsonValue::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    let media = entry
                        .get("mediaType")
                        .or_else(|| entry.get("mimeType"))
                        .and_then(JsonValue::as_str)?;
                    Some(Format {
                        media_type: media.to_string(),
                        encoding: entry
                            .get("encoding")
                            .and_then(JsonValue::as_str)
                            .map(String::from),
                        schema: entry
                            .get("schema")
                            .and_then(JsonValue::as_str)
                            .map(String::from),
                        default: entry
                            .get("default")
                            .and_then(JsonValue::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Merge package inputs with their peer-description counterparts by id.
pub fn merge_input_defs(mut defs: Vec<InputDef>, peers: &[JsonValue]) -> Vec<InputDef> {
    for def in &mut defs {
        if let Some(peer) = find_peer(peers, &def.id) {
            merge_metadata(
                &mut def.title,
                &mut def.description,
                &mut def.keywords,
                &mut def.formats,
                peer,
            );
        }
    }
    defs
}

/// Merge package outputs with their peer-description counterparts by id.
pub fn merge_output_defs(mut defs: Vec<OutputDef>, peers: &[JsonValue]) -> Vec<OutputDef> {
    for def in &mut defs {
        if let Some(peer) = find_peer(peers, &def.id) {
            merge_metadata(
                &mut def.title,
                &mut def.description,
                &mut def.keywords,
                &mut def.formats,
                peer,
            );
        }
    }
    defs
}

fn find_peer<'a>(peers: &'a [JsonValue], id: &str) -> Option<&'a JsonValue> {
    peers.iter().find(|peer| {
        peer.get("id")
            .or_else(|| peer.get("identifier"))
            .and_then(JsonValue::as_str)
            == Some(id)
    })
}

/// OGC API `schema` description of an input.
pub fn oap_input_description(def: &InputDef) -> JsonValue {
    let mut body = Map::new();
    if let Some(title) = &def.title {
        body.insert("title".into(), json!(title));
    }
    if let Some(description) = &def.description {
        body.insert("description".into(), json!(description));
    }
    if !def.keywords.is_empty() {
        body.insert("keywords".into(), json!(def.keywords));
    }
    body.insert("minOccurs".into(), json!(def.min_occurs));
    match def.max_occurs {
        Some(max) => body.insert("maxOccurs".into(), json!(max)),
        None => body.insert("maxOccurs".into(), json!("unbounded")),
    };
    body.insert("schema".into(), io_schema(def.kind, def.literal.as_ref(), &def.formats));
    JsonValue::Object(body)
}

/// OGC API `schema` description of an output.
pub fn oap_output_description(def: &OutputDef) -> JsonValue {
    let mut body = Map::new();
    if let Some(title) = &def.title {
        body.insert("title".into(), json!(title));
    }
    if let Some(description) = &def.description {
        body.insert("description".into(), json!(description));
    }
    let mut schema = io_schema(def.kind, def.literal.as_ref(), &def.formats);
    if def.array {
        schema = json!({"type": "array", "items": schema});
    }
    body.insert("schema".into(), schema);
    JsonValue::Object(body)
}

fn io_schema(kind: IoKind, literal: Option<&LiteralDomain>, formats: &[Format]) -> JsonValue {
    match kind {
        IoKind::Literal => {
            let Some(domain) = literal else {
                return json!({"type": "string"});
            };
            let base = match domain.data_type {
                DataType::String => "string",
                DataType::Int => "integer",
                DataType::Float => "number",
                DataType::Bool => "boolean",
            };
            let mut schema = Map::new();
            schema.insert("type".into(), json!(base));
            if !domain.symbols.is_empty() {
                schema.insert("enum".into(), json!(domain.symbols));
            }
            if let Some((lo, hi)) = domain.range {
                schema.insert("minimum".into(), json!(lo));
                schema.insert("maximum".into(), json!(hi));
            }
            JsonValue::Object(schema)
        }
        IoKind::BoundingBox => json!({
            "type": "object",
            "format": "ogc-bbox",
            "properties": {
                "bbox": {"type": "array", "items": {"type": "number"}},
                "crs": {"type": "string"},
            },
        }),
        IoKind::ComplexDirectory => json!({
            "type": "string",
            "format": "uri",
            "contentMediaType": MEDIA_TYPE_DIRECTORY,
        }),
        IoKind::ComplexFile => {
            let entries: Vec<JsonValue> = formats
                .iter()
                .map(|f| {
                    let mut entry = Map::new();
                    entry.insert("type".into(), json!("string"));
                    entry.insert("format".into(), json!("binary"));
                    entry.insert("contentMediaType".into(), json!(f.media_type));
                    if let Some(encoding) = &f.encoding {
                        entry.insert("contentEncoding".into(), json!(encoding));
                    }
                    if let Some(schema) = &f.schema {
                        entry.insert("contentSchema".into(), json!(schema));
                    }
                    JsonValue::Object(entry)
                })
                .collect();
            match entries.len() {
                0 => json!({"type": "string", "format": "binary"}),
                1 => entries.into_iter().next().unwrap_or_default(),
                _ => json!({"oneOf": entries}),
            }
        }
    }
}

/// Map an OGC API process description to a package skeleton targeting the
/// remote process, applying the same typing rules as the XML mapping.
pub fn ogcapi_to_package(description: &JsonValue, reference: &str) -> Result<Package> {
    // older payloads nest everything under 'process'
    let body = description.get("process").unwrap_or(description);
    let mut inputs = Map::new();
    for (id, input) in ordered_entries(body.get("inputs")) {
        inputs.insert(id, oap_schema_to_cwl(&input, true)?);
    }
    let mut outputs = Map::new();
    for (id, output) in ordered_entries(body.get("outputs")) {
        outputs.insert(id, oap_schema_to_cwl(&output, false)?);
    }

    let mut hints = Map::new();
    hints.insert(
        super::REQUIREMENT_OGC_API.to_string(),
        json!({"process": reference}),
    );
    let package = json!({
        "cwlVersion": "v1.0",
        "class": "CommandLineTool",
        "hints": hints,
        "inputs": JsonValue::Object(inputs),
        "outputs": JsonValue::Object(outputs),
    });
    Ok(Package::new(package))
}

fn ordered_entries(value: Option<&JsonValue>) -> Vec<(String, JsonValue)> {
    super::normalize_ordered_io(value)
}

/// Convert an OGC API I/O description (JSON schema flavored) back into the
/// package representation.
fn oap_schema_to_cwl(io: &JsonValue, is_input: bool) -> Result<JsonValue> {
    let schema = io.get("schema").unwrap_or(io);
    let mut def = Map::new();

    let (type_value, format) = schema_to_cwl_type(schema)?;
    let min_occurs = io
        .get("minOccurs")
        .and_then(JsonValue::as_u64)
        .unwrap_or(1);
    let max_unbounded = matches!(io.get("maxOccurs"), Some(JsonValue::String(s)) if s == "unbounded")
        || io
            .get("maxOccurs")
            .and_then(JsonValue::as_u64)
            .map(|m| m > 1)
            .unwrap_or(false);

    let mut type_value = type_value;
    if max_unbounded {
        type_value = json!({"type": "array", "items": type_value});
    }
    if is_input && min_occurs == 0 {
        type_value = match type_value {
            JsonValue::String(name) => JsonValue::String(format!("{name}?")),
            other => json!(["null", other]),
        };
    }
    def.insert("type".into(), type_value);
    if let Some(format) = format {
        def.insert("format".into(), json!(format));
    }
    if !is_input {
        def.insert("outputBinding".into(), json!({"glob": "*"}));
    }
    if let Some(title) = io.get("title").and_then(JsonValue::as_str) {
        def.insert("label".into(), json!(title));
    }
    Ok(JsonValue::Object(def))
}

fn schema_to_cwl_type(schema: &JsonValue) -> Result<(JsonValue, Option<String>)> {
    if let Some(one_of) = schema.get("oneOf").and_then(JsonValue::as_array) {
        // prefer the binary/file alternative when present
        for entry in one_of {
            if entry.get("contentMediaType").is_some()
                || entry.get("format").and_then(JsonValue::as_str) == Some("binary")
            {
                return schema_to_cwl_type(entry);
            }
        }
        if let Some(first) = one_of.first() {
            return schema_to_cwl_type(first);
        }
    }

    if let Some(symbols) = schema.get("enum").and_then(JsonValue::as_array) {
        return Ok((
            json!({"type": "enum", "symbols": symbols}),
            None,
        ));
    }

    if let Some(media) = schema.get("contentMediaType").and_then(JsonValue::as_str) {
        if media == MEDIA_TYPE_DIRECTORY {
            return Ok((json!("Directory"), None));
        }
        return Ok((json!("File"), Some(media.to_string())));
    }

    match schema.get("type").and_then(JsonValue::as_str) {
        Some("string") => {
            if matches!(
                schema.get("format").and_then(JsonValue::as_str),
                Some("binary") | Some("uri")
            ) {
                Ok((json!("File"), None))
            } else {
                Ok((json!("string"), None))
            }
        }
        Some("integer") => Ok((json!("int"), None)),
        Some("number") => Ok((json!("float"), None)),
        Some("boolean") => Ok((json!("boolean"), None)),
        Some("array") => {
            let items = schema.get("items").cloned().unwrap_or(json!("string"));
            let (inner, format) = schema_to_cwl_type(&items)?;
            Ok((json!({"type": "array", "items": inner}), format))
        }
        other => Err(Error::PackageType(format!(
            "cannot map process description schema type {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_scalar() {
        let def = input_def_from_cwl("message", &json!({"type": "string"})).unwrap();
        assert_eq!(def.kind, IoKind::Literal);
        assert_eq!(def.min_occurs, 1);
        assert_eq!(def.max_occurs, Some(1));
        assert_eq!(def.literal.unwrap().data_type, DataType::String);
    }

    #[test]
    fn test_input_optional_shorthand() {
        let def = input_def_from_cwl("count", &json!({"type": "int?"})).unwrap();
        assert_eq!(def.min_occurs, 0);
        assert!(!def.is_array());
    }

    #[test]
    fn test_input_null_union() {
        let def = input_def_from_cwl("count", &json!({"type": ["null", "int"]})).unwrap();
        assert_eq!(def.min_occurs, 0);
    }

    #[test]
    fn test_input_file_array_with_formats() {
        let def = input_def_from_cwl(
            "files",
            &json!({
                "type": {"type": "array", "items": "File"},
                "format": ["application/x-netcdf", "application/json"],
            }),
        )
        .unwrap();
        assert_eq!(def.kind, IoKind::ComplexFile);
        assert_eq!(def.max_occurs, None);
        assert_eq!(def.formats.len(), 2);
        assert!(def.formats[0].default);
    }

    #[test]
    fn test_input_enum() {
        let def = input_def_from_cwl(
            "mode",
            &json!({"type": {"type": "enum", "symbols": ["a", "b"]}}),
        )
        .unwrap();
        let domain = def.literal.unwrap();
        assert_eq!(domain.symbols, vec!["a", "b"]);
    }

    #[test]
    fn test_directory_single_media_type() {
        let def = input_def_from_cwl("data", &json!({"type": "Directory"})).unwrap();
        assert_eq!(def.kind, IoKind::ComplexDirectory);
        assert_eq!(def.formats.len(), 1);
        assert_eq!(def.formats[0].media_type, MEDIA_TYPE_DIRECTORY);
    }

    #[test]
    fn test_output_glob() {
        let def = output_def_from_cwl(
            "output",
            &json!({"type": "File", "outputBinding": {"glob": "*.nc"}}),
        )
        .unwrap();
        assert_eq!(def.glob.as_deref(), Some("*.nc"));
    }

    #[test]
    fn test_merge_peer_metadata_and_formats() {
        let defs = vec![input_def_from_cwl(
            "data",
            &json!({"type": "File", "format": "application/json"}),
        )
        .unwrap()];
        let peers = vec![json!({
            "id": "data",
            "title": "Some data",
            "abstract": "Input data file.",
            "keywords": ["data"],
            "formats": [
                {"mediaType": "application/json", "default": true},
                {"mediaType": "text/csv"},
            ],
        })];
        let merged = merge_input_defs(defs, &peers);
        let def = &merged[0];
        assert_eq!(def.title.as_deref(), Some("Some data"));
        assert_eq!(def.keywords, vec!["data"]);
        assert_eq!(def.formats.len(), 2);
        // package default survives the merge
        assert!(def.formats[0].default);
        assert!(!def.formats[1].default);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let make = || {
            merge_input_defs(
                vec![input_def_from_cwl("x", &json!({"type": "string"})).unwrap()],
                &[json!({"id": "x", "title": "X"})],
            )
        };
        let a = serde_json::to_string(&make()).unwrap();
        let b = serde_json::to_string(&make()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_oap_describe_literal_bounds() {
        let mut def = input_def_from_cwl("level", &json!({"type": "float"})).unwrap();
        def.literal.as_mut().unwrap().range = Some((0.0, 10.0));
        let body = oap_input_description(&def);
        assert_eq!(body["schema"]["type"], "number");
        assert_eq!(body["schema"]["minimum"], 0.0);
        assert_eq!(body["schema"]["maximum"], 10.0);
    }

    #[test]
    fn test_ogcapi_description_roundtrip() {
        let description = json!({
            "id": "remote-proc",
            "inputs": {
                "count": {"schema": {"type": "integer"}, "minOccurs": 0},
                "data": {"schema": {"type": "string", "format": "binary",
                                     "contentMediaType": "application/x-netcdf"}},
                "mode": {"schema": {"type": "string", "enum": ["fast", "slow"]}},
            },
            "outputs": {
                "result": {"schema": {"type": "string", "contentMediaType": "application/json"}},
            },
        });
        let package =
            ogcapi_to_package(&description, "https://ades.example.com/processes/remote-proc")
                .unwrap();
        let (inputs, outputs) = package_io_defs(&package).unwrap();
        assert_eq!(inputs.len(), 3);
        assert_eq!(outputs.len(), 1);
        let count = inputs.iter().find(|d| d.id == "count").unwrap();
        assert_eq!(count.min_occurs, 0);
        let data = inputs.iter().find(|d| d.id == "data").unwrap();
        assert_eq!(data.kind, IoKind::ComplexFile);
        assert_eq!(data.formats[0].media_type, "application/x-netcdf");
        let mode = inputs.iter().find(|d| d.id == "mode").unwrap();
        assert_eq!(mode.literal.as_ref().unwrap().symbols, vec!["fast", "slow"]);
    }
}
