//! One structured crawler log line.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a log line was rejected.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("missing or non-string field `{0}`")]
    MissingField(&'static str),

    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),
}

/// A parsed log line. `fields` keeps the whole original object, including
/// the three typed fields, so re-serialization loses nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub log_level: String,
    pub context: String,
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Parse one newline-free line of NDJSON.
    ///
    /// Invalid UTF-8 sequences are skipped rather than rejecting the line.
    pub fn from_line(line: &[u8]) -> Result<Self, RecordError> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => Cow::Borrowed(text),
            Err(_) => Cow::Owned(line.utf8_chunks().map(|chunk| chunk.valid()).collect()),
        };
        let Value::Object(fields) = serde_json::from_str::<Value>(&text)? else {
            return Err(RecordError::NotAnObject);
        };

        let raw_ts = string_field(&fields, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|_| RecordError::BadTimestamp(raw_ts.to_string()))?
            .with_timezone(&Utc);
        let log_level = string_field(&fields, "logLevel")?.to_string();
        let context = string_field(&fields, "context")?.to_string();

        Ok(Self {
            timestamp,
            log_level,
            context,
            fields,
        })
    }

    /// The record as one line of NDJSON, newline included.
    pub fn to_json_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(&self.fields)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Extra field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn string_field<'a>(fields: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, RecordError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_crawler_line() {
        let line = br#"{"timestamp":"2023-02-01T10:00:00.123Z","logLevel":"info","context":"general","message":"Crawl started","details":{"page":1}}"#;
        let record = LogRecord::from_line(line).unwrap();
        assert_eq!(record.log_level, "info");
        assert_eq!(record.context, "general");
        assert_eq!(record.get("message").and_then(Value::as_str), Some("Crawl started"));
        assert_eq!(record.timestamp.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn output_line_keeps_key_order() {
        let line = br#"{"timestamp":"2023-02-01T10:00:00Z","logLevel":"info","context":"general","message":"m","details":{"z":1,"a":2}}"#;
        let out = LogRecord::from_line(line).unwrap().to_json_line().unwrap();
        assert_eq!(&out[..out.len() - 1], &line[..]);
    }

    #[test]
    fn invalid_utf8_is_skipped() {
        let mut line = br#"{"timestamp":"2023-02-01T10:00:00Z","logLevel":"info","context":"general","message":"ab"#.to_vec();
        line.extend_from_slice(&[0xff, 0xfe]);
        line.extend_from_slice(br#"c"}"#);
        let record = LogRecord::from_line(&line).unwrap();
        assert_eq!(record.get("message").and_then(Value::as_str), Some("abc"));
    }

    #[test]
    fn output_line_keeps_every_field() {
        let line = br#"{"timestamp":"2023-02-01T10:00:00Z","logLevel":"warn","context":"behavior","extra":[1,2]}"#;
        let record = LogRecord::from_line(line).unwrap();
        let out = record.to_json_line().unwrap();
        assert_eq!(out.last(), Some(&b'\n'));
        let reparsed = LogRecord::from_line(&out[..out.len() - 1]).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn rejects_incomplete_lines() {
        assert!(matches!(
            LogRecord::from_line(b"{\"timestamp\":"),
            Err(RecordError::Json(_))
        ));
        assert!(matches!(
            LogRecord::from_line(b"[1,2]"),
            Err(RecordError::NotAnObject)
        ));
        assert!(matches!(
            LogRecord::from_line(br#"{"timestamp":"2023-02-01T10:00:00Z","logLevel":"info"}"#),
            Err(RecordError::MissingField("context"))
        ));
        assert!(matches!(
            LogRecord::from_line(br#"{"timestamp":"yesterday","logLevel":"info","context":"x"}"#),
            Err(RecordError::BadTimestamp(_))
        ));
    }
}
