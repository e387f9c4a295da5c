//! Conversion between plain JSON documents and Firestore's typed value encoding.
//!
//! The Firestore REST API represents every field as a single-key object naming its type, as in
//! ```json
//! { "ticketNumber": { "stringValue": "TKT-00123456" } }
//! ```
//! Plain JSON cannot tell a timestamp or a geo point apart from a string or a map, so fields which
//! should be stored with those types are identified by name.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

/// Fields stored as Firestore timestamps.
pub const TIMESTAMP_FIELDS: &[&str] = &["createdAt", "timestamp", "updatedAt", "slaDeadlineAt"];

/// Fields stored as Firestore geo points.
pub const GEO_POINT_FIELDS: &[&str] = &["location"];

/// A document as returned by the Firestore REST API.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Document {
    /// The full resource name, `projects/{p}/databases/{d}/documents/{path}`.
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Encode the top-level fields of a JSON document.
pub fn encode_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), encode_field(name, value)))
        .collect()
}

fn encode_field(name: &str, value: &Value) -> Value {
    match value {
        Value::String(s) if TIMESTAMP_FIELDS.contains(&name) => json!({ "timestampValue": s }),
        Value::Object(point) if GEO_POINT_FIELDS.contains(&name) => {
            match (point.get("latitude"), point.get("longitude")) {
                (Some(latitude), Some(longitude)) => json!({
                    "geoPointValue": { "latitude": latitude, "longitude": longitude }
                }),
                _ => encode_value(value),
            }
        }
        _ => encode_value(value),
    }
}

/// Encode a JSON value with no field-specific typing.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            // Integers travel as decimal strings to avoid precision loss.
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(values) => json!({
            "arrayValue": { "values": values.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(fields) => json!({
            "mapValue": {
                "fields": fields
                    .iter()
                    .map(|(k, v)| (k.clone(), encode_value(v)))
                    .collect::<Map<_, _>>()
            }
        }),
    }
}

/// Decode the fields of a Firestore document into plain JSON.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    fields
        .iter()
        .map(|(name, value)| {
            decode_value(value)
                .map(|value| (name.clone(), value))
                .map_err(|err| format!("field {name}: {err}"))
        })
        .collect()
}

/// Decode a single Firestore value into plain JSON.
///
/// Timestamps become RFC 3339 strings and geo points become `{latitude, longitude}` maps.
pub fn decode_value(value: &Value) -> Result<Value, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("expected typed value, found {value}"))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| "empty typed value".to_string())?;
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => Ok(Value::Bool(inner.as_bool().unwrap_or_default())),
        "integerValue" => {
            let i = match inner {
                Value::String(s) => s.parse::<i64>().map_err(|err| err.to_string())?,
                Value::Number(n) => n.as_i64().ok_or_else(|| format!("bad integer {n}"))?,
                _ => return Err(format!("bad integer {inner}")),
            };
            Ok(Value::Number(i.into()))
        }
        "doubleValue" => {
            let f = inner
                .as_f64()
                .ok_or_else(|| format!("bad double {inner}"))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => Ok(inner.clone()),
        // Firestore omits zero coordinates.
        "geoPointValue" => Ok(json!({
            "latitude": inner.get("latitude").and_then(Value::as_f64).unwrap_or_default(),
            "longitude": inner.get("longitude").and_then(Value::as_f64).unwrap_or_default(),
        })),
        "arrayValue" => {
            let values = match inner.get("values") {
                Some(Value::Array(values)) => values
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>, _>>()?,
                _ => vec![],
            };
            Ok(Value::Array(values))
        }
        "mapValue" => {
            let fields = match inner.get("fields") {
                Some(Value::Object(fields)) => decode_fields(fields)?,
                _ => Map::new(),
            };
            Ok(Value::Object(fields))
        }
        other => Err(format!("unsupported value type {other}")),
    }
}
