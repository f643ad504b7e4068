use std::collections::HashSet;
use std::sync::OnceLock;

use rayon::prelude::*;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ParseError;
use crate::model::{DiningRecord, Rejection, SourceDocument};

/// Turns one raw document into a canonical record. Must be pure.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, doc: &SourceDocument) -> Result<DiningRecord, ParseError>;
}

/// Normalizer for the JSON location feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNormalizer;

#[derive(Deserialize)]
struct RawLocation {
    #[serde(default, alias = "slug", alias = "identifier")]
    id: Option<Value>,
    #[serde(default, alias = "title", alias = "display_name")]
    name: Option<Value>,
    #[serde(default, alias = "lat")]
    latitude: Option<Value>,
    #[serde(default, alias = "lon", alias = "lng")]
    longitude: Option<Value>,
}

impl Normalizer for JsonNormalizer {
    fn normalize(&self, doc: &SourceDocument) -> Result<DiningRecord, ParseError> {
        let value: Value = serde_json::from_str(&doc.body)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(ParseError::Malformed(format!(
                "expected a location object, got {}",
                json_kind(&value)
            )));
        }
        let raw = RawLocation::deserialize(value)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;

        let id = scalar_text(raw.id, "id")?;
        if id.is_empty() {
            return Err(ParseError::EmptyIdentifier);
        }
        let name = scalar_text(raw.name, "name")?;
        if name.is_empty() {
            return Err(ParseError::MissingField("name"));
        }
        let latitude = coordinate(raw.latitude, "latitude", 90.0)?;
        let longitude = coordinate(raw.longitude, "longitude", 180.0)?;

        Ok(DiningRecord {
            id,
            name,
            latitude,
            longitude,
            active: true,
            last_seen: doc.fetched_at,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Trimmed text of a string or number field.
fn scalar_text(value: Option<Value>, field: &'static str) -> Result<String, ParseError> {
    match value {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ParseError::Malformed(format!(
            "{} must be a string, got {}",
            field, other
        ))),
    }
}

fn decimal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)$").unwrap())
}

/// Validate a coordinate and return its decimal text.
fn coordinate(value: Option<Value>, field: &'static str, limit: f64) -> Result<String, ParseError> {
    let text = match value {
        None | Some(Value::Null) => return Err(ParseError::MissingField(field)),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(ParseError::InvalidCoordinate {
                field,
                value: other.to_string(),
            })
        }
    };
    if text.is_empty() {
        return Err(ParseError::MissingField(field));
    }
    if !decimal_re().is_match(&text) {
        return Err(ParseError::InvalidCoordinate { field, value: text });
    }
    let parsed: f64 = text.parse().map_err(|_| ParseError::InvalidCoordinate {
        field,
        value: text.clone(),
    })?;
    if !parsed.is_finite() || parsed.abs() > limit {
        return Err(ParseError::OutOfRange { field, value: text });
    }
    Ok(text)
}

/// Records that survived normalization plus everything that did not.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub records: Vec<DiningRecord>,
    pub rejections: Vec<Rejection>,
}

/// Normalize a batch of documents in parallel.
///
/// Output keeps input order. A rejected document never affects the others.
/// The first occurrence of an identifier wins; later ones are rejected so the
/// output holds each identifier at most once.
pub fn normalize_all(normalizer: &dyn Normalizer, docs: &[SourceDocument]) -> NormalizeReport {
    let results: Vec<_> = docs.par_iter().map(|d| normalizer.normalize(d)).collect();

    let mut report = NormalizeReport::default();
    let mut seen = HashSet::new();
    for (doc, result) in docs.iter().zip(results) {
        let result = result.and_then(|record| {
            if seen.insert(record.id.clone()) {
                Ok(record)
            } else {
                Err(ParseError::DuplicateIdentifier(record.id))
            }
        });
        match result {
            Ok(record) => report.records.push(record),
            Err(error) => {
                debug!(url = %doc.url, page = doc.page, position = doc.position, %error, "rejected document");
                report.rejections.push(Rejection {
                    url: doc.url.clone(),
                    page: doc.page,
                    position: doc.position,
                    error,
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn doc(body: &str) -> SourceDocument {
        SourceDocument {
            url: "https://dining.example.edu/api?page=1".into(),
            page: 1,
            position: 0,
            fetched_at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
            body: body.to_string(),
        }
    }

    fn norm(body: &str) -> Result<DiningRecord, ParseError> {
        JsonNormalizer.normalize(&doc(body))
    }

    #[test]
    fn canonical_record() {
        let r = norm(r#"{"id":" north ","name":"North Dining","lat":"42.36","lon":"-71.09"}"#).unwrap();
        assert_eq!(r.id, "north");
        assert_eq!(r.name, "North Dining");
        assert_eq!(r.latitude, "42.36");
        assert_eq!(r.longitude, "-71.09");
        assert!(r.active);
        assert_eq!(r.last_seen, Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn aliases_and_numbers() {
        let r = norm(r#"{"slug":"maseeh","title":"Maseeh Hall","latitude":42.3576,"lng":-71.0934}"#).unwrap();
        assert_eq!(r.id, "maseeh");
        assert_eq!(r.latitude, "42.3576");
        assert_eq!(r.longitude, "-71.0934");

        let r = norm(r#"{"id":17,"display_name":"Cafe 17","latitude":"0","longitude":"180"}"#).unwrap();
        assert_eq!(r.id, "17");
        assert_eq!(r.longitude, "180");
    }

    #[test]
    fn deterministic() {
        let body = r#"{"id":"north","name":"North","lat":"42.36","lon":"-71.09"}"#;
        assert_eq!(norm(body), norm(body));
    }

    #[test]
    fn rejects_non_numeric_latitude() {
        let err = norm(r#"{"id":"x","name":"X","lat":"notanumber","lon":"1"}"#).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidCoordinate {
                field: "latitude",
                value: "notanumber".into()
            }
        );
    }

    #[test]
    fn rejects_special_floats() {
        for bad in ["NaN", "inf", "-infinity", "1e3", "0x10"] {
            let body = format!(r#"{{"id":"x","name":"X","lat":"{}","lon":"1"}}"#, bad);
            assert!(
                matches!(norm(&body), Err(ParseError::InvalidCoordinate { .. })),
                "{} accepted",
                bad
            );
        }
    }

    #[test]
    fn rejects_out_of_range() {
        let err = norm(r#"{"id":"x","name":"X","lat":"90.5","lon":"1"}"#).unwrap_err();
        assert!(matches!(err, ParseError::OutOfRange { field: "latitude", .. }));
        let err = norm(r#"{"id":"x","name":"X","lat":"-90","lon":"-180.01"}"#).unwrap_err();
        assert!(matches!(err, ParseError::OutOfRange { field: "longitude", .. }));
    }

    #[test]
    fn rejects_missing_and_empty() {
        assert_eq!(
            norm(r#"{"id":"   ","name":"X","lat":"1","lon":"1"}"#),
            Err(ParseError::EmptyIdentifier)
        );
        assert_eq!(
            norm(r#"{"name":"X","lat":"1","lon":"1"}"#),
            Err(ParseError::MissingField("id"))
        );
        assert_eq!(
            norm(r#"{"id":"x","lat":"1","lon":"1"}"#),
            Err(ParseError::MissingField("name"))
        );
        assert_eq!(
            norm(r#"{"id":"x","name":"X","lon":"1"}"#),
            Err(ParseError::MissingField("latitude"))
        );
        assert_eq!(
            norm(r#"{"id":"x","name":"X","lat":"1","lon":""}"#),
            Err(ParseError::MissingField("longitude"))
        );
    }

    #[test]
    fn rejects_malformed_body() {
        assert!(matches!(norm("<html></html>"), Err(ParseError::Malformed(_))));
        assert!(matches!(norm("42"), Err(ParseError::Malformed(_))));
        assert!(matches!(
            norm(r#"{"id":{"a":1},"name":"X","lat":"1","lon":"1"}"#),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_positional_array() {
        let err = norm(r#"["north","North","42.36","-71.09"]"#).unwrap_err();
        assert_eq!(
            err,
            ParseError::Malformed("expected a location object, got an array".into())
        );
        assert!(matches!(norm(r#""north""#), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn batch_isolates_rejections() {
        let mut docs = vec![
            doc(r#"{"id":"north","name":"North","lat":"42.36","lon":"-71.09"}"#),
            doc(r#"{"id":"bad","name":"Bad","lat":"notanumber","lon":"-71.09"}"#),
            doc(r#"{"id":"south","name":"South","lat":"42.34","lon":"-71.10"}"#),
        ];
        for (i, d) in docs.iter_mut().enumerate() {
            d.position = i;
        }
        let report = normalize_all(&JsonNormalizer, &docs);
        let ids: Vec<&str> = report.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["north", "south"]);
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.rejections[0].position, 1);
    }

    #[test]
    fn batch_rejects_duplicate_ids() {
        let docs = vec![
            doc(r#"{"id":"north","name":"North","lat":"42.36","lon":"-71.09"}"#),
            doc(r#"{"id":"north","name":"North Again","lat":"42.36","lon":"-71.09"}"#),
        ];
        let report = normalize_all(&JsonNormalizer, &docs);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].name, "North");
        assert_eq!(
            report.rejections[0].error,
            ParseError::DuplicateIdentifier("north".into())
        );
    }
}
