//! Typed process I/O definitions and runtime values.
//!
//! The package and peer descriptions both reduce to [`InputDef`] /
//! [`OutputDef`]; submitted and produced values are carried as the tagged
//! [`IoValue`] variant with coercion applied only at conversion boundaries.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

pub const MEDIA_TYPE_DIRECTORY: &str = "application/directory";
pub const MEDIA_TYPE_TEXT: &str = "text/plain";
pub const MEDIA_TYPE_BINARY: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
        }
    }

    /// Parse a CWL/OAP scalar type name.
    pub fn from_name(name: &str) -> Option<DataType> {
        match name {
            "string" => Some(DataType::String),
            "int" | "integer" | "long" => Some(DataType::Int),
            "float" | "double" | "number" => Some(DataType::Float),
            "bool" | "boolean" => Some(DataType::Bool),
            _ => None,
        }
    }
}

/// A supported media-type/encoding/schema triple of a complex I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

impl Format {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            encoding: None,
            schema: None,
            default: false,
        }
    }

    /// Identity triple used for deduplication during I/O merge.
    pub fn key(&self) -> (String, Option<String>, Option<String>) {
        (
            self.media_type.to_ascii_lowercase(),
            self.encoding.as_ref().map(|e| e.to_ascii_lowercase()),
            self.schema.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IoKind {
    Literal,
    BoundingBox,
    ComplexFile,
    ComplexDirectory,
}

/// Constraints of a literal I/O: its type, optional enum symbols and an
/// optional inclusive numeric range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralDomain {
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
}

impl LiteralDomain {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            symbols: Vec::new(),
            range: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "abstract")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub kind: IoKind,
    #[serde(default = "default_occurs")]
    pub min_occurs: u32,
    /// `None` means unbounded (`maxOccurs: "unbounded"`).
    #[serde(default = "default_max_occurs")]
    pub max_occurs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<LiteralDomain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<Format>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "abstract")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub kind: IoKind,
    /// Output may be an array; outputs carry no min/max cardinality.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub array: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<LiteralDomain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<Format>,
    /// Glob pattern collecting the produced files, from `outputBinding.glob`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

fn default_occurs() -> u32 {
    1
}

fn default_max_occurs() -> Option<u32> {
    Some(1)
}

impl InputDef {
    pub fn is_array(&self) -> bool {
        self.max_occurs.map(|m| m > 1).unwrap_or(true)
    }

    pub fn is_optional(&self) -> bool {
        self.min_occurs == 0
    }

    pub fn default_format(&self) -> Option<&Format> {
        self.formats
            .iter()
            .find(|f| f.default)
            .or_else(|| self.formats.first())
    }
}

impl OutputDef {
    pub fn default_format(&self) -> Option<&Format> {
        self.formats
            .iter()
            .find(|f| f.default)
            .or_else(|| self.formats.first())
    }
}

/// Runtime value of an input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "camelCase")]
pub enum IoValue {
    Literal {
        data_type: DataType,
        value: JsonValue,
    },
    BBox {
        bbox: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crs: Option<String>,
    },
    FileRef {
        href: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
    },
    DirRef {
        href: String,
    },
    Array(Vec<IoValue>),
}

impl IoValue {
    pub fn file(href: impl Into<String>) -> Self {
        IoValue::FileRef {
            href: href.into(),
            media_type: None,
            encoding: None,
            schema: None,
        }
    }

    /// Reference location when the value is a file or directory.
    pub fn href(&self) -> Option<&str> {
        match self {
            IoValue::FileRef { href, .. } | IoValue::DirRef { href } => Some(href),
            _ => None,
        }
    }
}

/// Promote a submitted literal into the declared type, validating enum
/// symbols and allowed ranges.
///
/// Strings that parse as the declared numeric/boolean type are promoted;
/// anything that does not fit fails with `InvalidParameterValue`.
pub fn promote_literal(raw: &JsonValue, domain: &LiteralDomain) -> Result<JsonValue> {
    let value = match (domain.data_type, raw) {
        (DataType::String, JsonValue::String(s)) => JsonValue::String(s.clone()),
        (DataType::String, other) if !other.is_object() && !other.is_array() => {
            JsonValue::String(json_scalar_to_string(other))
        }
        (DataType::Int, JsonValue::Number(n)) if n.is_i64() || n.is_u64() => raw.clone(),
        (DataType::Int, JsonValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(JsonValue::from)
            .map_err(|_| invalid_value(raw, "int"))?,
        (DataType::Float, JsonValue::Number(_)) => raw.clone(),
        (DataType::Float, JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(|| invalid_value(raw, "float"))?,
        (DataType::Bool, JsonValue::Bool(_)) => raw.clone(),
        (DataType::Bool, JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => JsonValue::Bool(true),
            "false" | "0" => JsonValue::Bool(false),
            _ => return Err(invalid_value(raw, "bool")),
        },
        (expected, _) => return Err(invalid_value(raw, expected.as_str())),
    };

    if !domain.symbols.is_empty() {
        let as_symbol = json_scalar_to_string(&value);
        if !domain.symbols.iter().any(|s| *s == as_symbol) {
            return Err(Error::InvalidParameterValue(format!(
                "value '{as_symbol}' not in allowed symbols {:?}",
                domain.symbols
            )));
        }
    }

    if let Some((lo, hi)) = domain.range {
        if let Some(n) = value.as_f64() {
            if n < lo || n > hi {
                return Err(Error::InvalidParameterValue(format!(
                    "value {n} outside allowed range [{lo}, {hi}]"
                )));
            }
        }
    }

    Ok(value)
}

fn invalid_value(raw: &JsonValue, expected: &str) -> Error {
    Error::InvalidParameterValue(format!("cannot interpret {raw} as {expected}"))
}

pub fn json_scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Media type for a literal value materialized as a file reference.
pub fn infer_value_media_type(value: &JsonValue) -> &'static str {
    if value.is_string() || value.is_number() || value.is_boolean() {
        "text/plain; charset=utf-8"
    } else {
        MEDIA_TYPE_BINARY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_promote_string_to_int() {
        let domain = LiteralDomain::new(DataType::Int);
        assert_eq!(promote_literal(&json!("42"), &domain).unwrap(), json!(42));
        assert!(promote_literal(&json!("4.5"), &domain).is_err());
    }

    #[test]
    fn test_promote_string_to_bool() {
        let domain = LiteralDomain::new(DataType::Bool);
        assert_eq!(promote_literal(&json!("true"), &domain).unwrap(), json!(true));
        assert_eq!(promote_literal(&json!("0"), &domain).unwrap(), json!(false));
        assert!(promote_literal(&json!("yes"), &domain).is_err());
    }

    #[test]
    fn test_enum_symbols_enforced() {
        let mut domain = LiteralDomain::new(DataType::String);
        domain.symbols = vec!["red".into(), "green".into()];
        assert!(promote_literal(&json!("red"), &domain).is_ok());
        let err = promote_literal(&json!("blue"), &domain).unwrap_err();
        assert!(matches!(err, Error::InvalidParameterValue(_)));
    }

    #[test]
    fn test_range_enforced() {
        let mut domain = LiteralDomain::new(DataType::Float);
        domain.range = Some((0.0, 1.0));
        assert!(promote_literal(&json!(0.5), &domain).is_ok());
        assert!(promote_literal(&json!(2.0), &domain).is_err());
    }

    #[test]
    fn test_value_media_type_inference() {
        assert_eq!(infer_value_media_type(&json!("text")), "text/plain; charset=utf-8");
        assert_eq!(infer_value_media_type(&json!(3)), "text/plain; charset=utf-8");
        assert_eq!(infer_value_media_type(&json!({"k": 1})), MEDIA_TYPE_BINARY);
    }

    #[test]
    fn test_format_key_case_insensitive() {
        let a = Format::new("Application/JSON");
        let b = Format::new("application/json");
        assert_eq!(a.key(), b.key());
    }
}
