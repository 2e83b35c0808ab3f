//! Conversion between the backend's wire records and plain `Record`s.
//!
//! Inbound, field values wrapped in `{ "value": ..., "displayValue": ... }`
//! envelopes are unwrapped, date-kind fields become `DateTime<Utc>`, and a
//! missing `id` is taken from the backend's `__rowKey`. Outbound, dates are
//! written back as epoch milliseconds.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ApiError, Result};
use crate::metadata::{ClassAccessor, PropertyKind};
use crate::types::{FieldValue, Record};

/// Backend-internal row identifier, used as the id fallback.
pub const ROW_KEY_FIELD: &str = "__rowKey";

/// Decodes one wire record into a plain record.
pub fn to_plain_record(accessor: &ClassAccessor, raw: Value) -> Result<Record> {
    let fields = match raw {
        Value::Object(fields) => fields,
        other => {
            return Err(ApiError::Deserialization(format!(
                "expected a record object, got {other}"
            )))
        }
    };

    let mut record: Record = fields
        .into_iter()
        .map(|(name, value)| {
            let value = unwrap_envelope(value);
            let value = match accessor.kind_of(&name) {
                PropertyKind::Date => decode_date_field(&name, value),
                PropertyKind::Other => FieldValue::Json(value),
            };
            (name, value)
        })
        .collect();

    if let Some(row_key) = record.remove(ROW_KEY_FIELD) {
        if !record.contains("id") {
            record.insert("id", row_key);
        }
    }
    Ok(record)
}

/// Encodes a record for a create or update body.
pub fn to_wire_json(accessor: &ClassAccessor, record: &Record) -> Value {
    let fields: Map<String, Value> = record
        .fields()
        .map(|(name, value)| {
            let wire = match value {
                FieldValue::Date(date) => encode_date(*date),
                FieldValue::Json(Value::String(s))
                    if accessor.kind_of(name) == PropertyKind::Date =>
                {
                    parse_date(&Value::String(s.clone()))
                        .map(encode_date)
                        .unwrap_or_else(|| Value::String(s.clone()))
                }
                FieldValue::Json(v) => v.clone(),
            };
            (name.clone(), wire)
        })
        .collect();
    Value::Object(fields)
}

pub fn encode_date(date: DateTime<Utc>) -> Value {
    Value::from(date.timestamp_millis())
}

/// Parses epoch milliseconds (number or numeric string), RFC 3339 or a bare
/// `YYYY-MM-DD` date.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            if let Ok(millis) = s.parse::<i64>() {
                return DateTime::from_timestamp_millis(millis);
            }
            if let Ok(date) = DateTime::parse_from_rfc3339(s) {
                return Some(date.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        }
        _ => None,
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut envelope) if envelope.contains_key("value") => envelope
            .remove("value")
            .unwrap_or(Value::Null),
        other => other,
    }
}

fn decode_date_field(name: &str, value: Value) -> FieldValue {
    if value.is_null() {
        return FieldValue::Json(value);
    }
    match parse_date(&value) {
        Some(date) => FieldValue::Date(date),
        None => {
            debug!(field = name, %value, "date field left undecoded");
            FieldValue::Json(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Property;
    use serde_json::json;

    fn accessor() -> ClassAccessor {
        ClassAccessor {
            properties: vec![
                Property {
                    name: "name".to_string(),
                    type_name: "java.lang.String".to_string(),
                },
                Property {
                    name: "placed_at".to_string(),
                    type_name: "java.sql.Timestamp".to_string(),
                },
            ],
        }
    }

    #[test]
    fn strips_envelope_and_promotes_row_key() {
        let record =
            to_plain_record(&accessor(), json!({"name": {"value": "Bob"}, "__rowKey": "7"}))
                .unwrap();
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"name": "Bob", "id": "7"})
        );
    }

    #[test]
    fn keeps_existing_id_and_drops_row_key() {
        let record = to_plain_record(
            &accessor(),
            json!({"id": {"value": 3, "displayValue": "3"}, "__rowKey": "3"}),
        )
        .unwrap();
        assert_eq!(record.id(), Some(3.into()));
        assert!(!record.contains(ROW_KEY_FIELD));
    }

    #[test]
    fn timestamp_round_trips_through_millis() {
        let record = to_plain_record(
            &accessor(),
            json!({"placed_at": {"value": 1_609_459_200_000_i64, "displayValue": "2021-01-01"}}),
        )
        .unwrap();
        let date = record.get("placed_at").and_then(FieldValue::as_date).unwrap();
        assert_eq!(
            date,
            DateTime::UNIX_EPOCH + chrono::Duration::milliseconds(1_609_459_200_000)
        );

        let wire = to_wire_json(&accessor(), &record);
        assert_eq!(wire["placed_at"], json!(1_609_459_200_000_i64));
    }

    #[test]
    fn date_strings_are_encoded_as_millis() {
        let record = Record::new().with("placed_at", "2021-01-01T00:00:00Z");
        let wire = to_wire_json(&accessor(), &record);
        assert_eq!(wire["placed_at"], json!(1_609_459_200_000_i64));
    }

    #[test]
    fn non_date_strings_pass_through() {
        let record = Record::new().with("name", "2021-01-01");
        let wire = to_wire_json(&accessor(), &record);
        assert_eq!(wire["name"], json!("2021-01-01"));
    }

    #[test]
    fn null_dates_stay_null() {
        let record = to_plain_record(&accessor(), json!({"placed_at": null})).unwrap();
        assert_eq!(record.get("placed_at"), Some(&FieldValue::Json(Value::Null)));
    }

    #[test]
    fn parse_date_accepts_plain_dates() {
        let date = parse_date(&json!("2021-01-01")).unwrap();
        assert_eq!(date.timestamp_millis(), 1_609_459_200_000);
    }

    #[test]
    fn rejects_non_object_rows() {
        let err = to_plain_record(&accessor(), json!("row")).unwrap_err();
        assert!(matches!(err, ApiError::Deserialization(_)));
    }
}
