//! Turning fetched bytes into events.
//!
//! A codec decodes one byte range into a lazy, single-pass sequence of
//! events. Every fetch gets a fresh decode; nothing is buffered between
//! calls.

use serde::Serialize;
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::collections::HashMap;

use crate::config::CodecKind;
use crate::error::{CodecError, JsonLineSnafu, Utf8LineSnafu};

/// A decoded event, always a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Event with a single `message` field.
    pub fn message(value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".to_string(), value.into());
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Attach provenance and static fields.
    ///
    /// Fields already present in the event win over `add_fields`.
    pub fn decorate(&mut self, container: &str, blob: &str, add_fields: &HashMap<String, String>) {
        for (key, value) in add_fields {
            self.0
                .entry(key.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        self.insert("container", container);
        self.insert("blob", blob);
    }
}

impl From<Value> for Event {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self(fields),
            other => Self::message(other),
        }
    }
}

/// Lazily decoded events borrowed from a fetched buffer.
pub type Events<'a> = Box<dyn Iterator<Item = Result<Event, CodecError>> + Send + 'a>;

/// Decodes a byte range into events.
pub trait Codec: Send + Sync {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Events<'a>;
}

/// Build the codec selected in configuration.
pub fn from_kind(kind: CodecKind) -> Box<dyn Codec> {
    match kind {
        CodecKind::JsonLines => Box::new(JsonLinesCodec),
        CodecKind::Line => Box::new(LineCodec),
    }
}

/// Newline-separated lines with their 1-based line numbers. A trailing
/// `\r` is stripped and a final unterminated line is still yielded.
fn numbered_lines(bytes: &[u8]) -> impl Iterator<Item = (usize, &[u8])> + Send + '_ {
    let trimmed = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let lines = if bytes.is_empty() {
        None
    } else {
        Some(trimmed.split(|b| *b == b'\n'))
    };
    lines
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.strip_suffix(b"\r").unwrap_or(line)))
}

/// One JSON document per line. Blank lines are ignored and non-object
/// documents are wrapped in a `message` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl Codec for JsonLinesCodec {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Events<'a> {
        Box::new(
            numbered_lines(bytes)
                .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
                .map(|(line_no, line)| {
                    serde_json::from_slice::<Value>(line)
                        .map(Event::from)
                        .context(JsonLineSnafu { line: line_no })
                }),
        )
    }
}

/// Each line becomes `{"message": line}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl Codec for LineCodec {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Events<'a> {
        Box::new(numbered_lines(bytes).map(|(line_no, line)| {
            std::str::from_utf8(line)
                .map(Event::message)
                .context(Utf8LineSnafu { line: line_no })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &dyn Codec, bytes: &[u8]) -> Vec<Result<Event, CodecError>> {
        codec.decode(bytes).collect()
    }

    #[test]
    fn test_json_lines_decodes_objects_and_skips_blanks() {
        let input = b"{\"a\":1}\n\n  \r\n{\"b\":\"x\"}\r\n";
        let events: Vec<Event> = decode_all(&JsonLinesCodec, input)
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].get("a"), Some(&json!(1)));
        assert_eq!(events[1].get("b"), Some(&json!("x")));
    }

    #[test]
    fn test_json_lines_wraps_scalars() {
        let events = decode_all(&JsonLinesCodec, b"42\n\"hi\"");
        assert_eq!(events[0].as_ref().unwrap().get("message"), Some(&json!(42)));
        assert_eq!(events[1].as_ref().unwrap().get("message"), Some(&json!("hi")));
    }

    #[test]
    fn test_json_lines_reports_line_number() {
        let mut events = JsonLinesCodec.decode(b"{}\n{broken\n{}\n");
        assert!(events.next().unwrap().is_ok());
        match events.next().unwrap() {
            Err(CodecError::JsonLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected json error, got {other:?}"),
        }
    }

    #[test]
    fn test_line_codec() {
        let events: Vec<Event> = LineCodec
            .decode(b"first\nsecond\n")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events, vec![Event::message("first"), Event::message("second")]);

        assert_eq!(LineCodec.decode(b"").count(), 0);
        assert!(matches!(
            LineCodec.decode(b"\xff\n").next(),
            Some(Err(CodecError::Utf8Line { line: 1, .. }))
        ));
    }

    #[test]
    fn test_decorate_keeps_event_fields() {
        let mut event = Event::from(json!({"env": "dev", "msg": "x"}));
        let add_fields = HashMap::from([
            ("env".to_string(), "prod".to_string()),
            ("team".to_string(), "ops".to_string()),
        ]);
        event.decorate("logs", "a.json", &add_fields);
        assert_eq!(event.get("env"), Some(&json!("dev")));
        assert_eq!(event.get("team"), Some(&json!("ops")));
        assert_eq!(event.get("container"), Some(&json!("logs")));
        assert_eq!(event.get("blob"), Some(&json!("a.json")));
    }
}
