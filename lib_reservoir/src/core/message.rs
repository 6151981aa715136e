//! # Records and Wire Codec
//!
//! A `Record` is one `(date, value)` observation. On the wire it travels as a
//! JSON object such as `{"Date": "2023-01-01", "TAF": 10.0}`. The decoder only
//! looks at the two configured fields; anything else in the object is ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Default name of the date field, matching the CSV header.
pub const DEFAULT_DATE_FIELD: &str = "Date";
/// Default name of the measurement field (thousand acre-feet).
pub const DEFAULT_VALUE_FIELD: &str = "TAF";

/// One observation for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Calendar date, kept in the string form the source supplied.
    pub date: String,
    /// Measured value.
    pub value: f64,
}

impl Record {
    pub fn new(date: impl Into<String>, value: f64) -> Self {
        Self {
            date: date.into(),
            value,
        }
    }
}

/// Failures while turning records into payloads and back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("field '{field}' has the wrong type: expected {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("value {0} cannot be represented in JSON")]
    NonFinite(f64),
}

/// # Wire Codec
///
/// Encodes records for the publisher and decodes payloads for the session
/// manager. Both sides must agree on the field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCodec {
    date_field: String,
    value_field: String,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DATE_FIELD, DEFAULT_VALUE_FIELD)
    }
}

impl WireCodec {
    pub fn new(date_field: impl Into<String>, value_field: impl Into<String>) -> Self {
        Self {
            date_field: date_field.into(),
            value_field: value_field.into(),
        }
    }

    pub fn value_field(&self) -> &str {
        &self.value_field
    }

    /// Serializes a record to its JSON payload.
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>, CodecError> {
        let number = Number::from_f64(record.value).ok_or(CodecError::NonFinite(record.value))?;

        let mut object = Map::new();
        object.insert(self.date_field.clone(), Value::String(record.date.clone()));
        object.insert(self.value_field.clone(), Value::Number(number));

        Ok(serde_json::to_vec(&Value::Object(object))?)
    }

    /// Parses a payload back into a record.
    pub fn decode(&self, raw: &[u8]) -> Result<Record, CodecError> {
        let value: Value = serde_json::from_slice(raw)?;
        let object = value.as_object().ok_or(CodecError::NotAnObject)?;

        let date = match object.get(&self.date_field) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(_) => {
                return Err(CodecError::WrongType {
                    field: self.date_field.clone(),
                    expected: "non-empty string",
                })
            }
            None => return Err(CodecError::MissingField(self.date_field.clone())),
        };

        let value = match object.get(&self.value_field) {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| CodecError::WrongType {
                field: self.value_field.clone(),
                expected: "number",
            })?,
            Some(_) => {
                return Err(CodecError::WrongType {
                    field: self.value_field.clone(),
                    expected: "number",
                })
            }
            None => return Err(CodecError::MissingField(self.value_field.clone())),
        };

        Ok(Record { date, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_csv_shaped_payload() {
        let codec = WireCodec::default();
        let record = codec.decode(br#"{"Date":"2023-01-01","TAF":10}"#).unwrap();
        assert_eq!(record, Record::new("2023-01-01", 10.0));
    }

    #[test]
    fn ignores_extra_fields() {
        let codec = WireCodec::default();
        let raw = br#"{"Date":"2023-01-02","TAF":4.5,"Reservoir":"Shasta","Elevation":1067}"#;
        assert_eq!(codec.decode(raw).unwrap(), Record::new("2023-01-02", 4.5));
    }

    #[test]
    fn encode_uses_configured_field_names() {
        let codec = WireCodec::new("day", "storage");
        let raw = codec.encode(&Record::new("2023-03-01", 12.25)).unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["day"], "2023-03-01");
        assert_eq!(value["storage"], 12.25);
        assert_eq!(codec.decode(&raw).unwrap(), Record::new("2023-03-01", 12.25));
    }

    #[test]
    fn rejects_malformed_payloads() {
        let codec = WireCodec::default();
        assert!(matches!(codec.decode(b"not json"), Err(CodecError::Json(_))));
        assert!(matches!(codec.decode(b"[1,2]"), Err(CodecError::NotAnObject)));
        assert!(matches!(
            codec.decode(br#"{"Date":"2023-01-01"}"#),
            Err(CodecError::MissingField(f)) if f == "TAF"
        ));
        assert!(matches!(
            codec.decode(br#"{"Date":"2023-01-01","TAF":"ten"}"#),
            Err(CodecError::WrongType { .. })
        ));
        assert!(matches!(
            codec.decode(br#"{"Date":20230101,"TAF":1}"#),
            Err(CodecError::WrongType { .. })
        ));
    }

    #[test]
    fn refuses_to_encode_nan() {
        let codec = WireCodec::default();
        assert!(matches!(
            codec.encode(&Record::new("2023-01-01", f64::NAN)),
            Err(CodecError::NonFinite(_))
        ));
    }
}
