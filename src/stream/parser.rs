// Event stream parsing
//
// The bus sends line-oriented records:
//
//   event: insert
//   id: 1042
//   data: {"id":"...","data":{...row in snake_case...},"ts":"..."}
//   <blank line>
//
// Lines starting with ':' are comments. Records are dispatched on the blank
// line. Chunks can split lines (and UTF-8 sequences) anywhere, so raw bytes
// are buffered until a full line is available.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::bus::Message;
use crate::router::DELIVERY_MODE_KEY;

/// One complete record from the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRecord {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental record parser.
#[derive(Debug, Default)]
pub struct RecordParser {
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl RecordParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(record) = self.dispatch() {
                    records.push(record);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        records
    }

    fn dispatch(&mut self) -> Option<StreamRecord> {
        if self.event.is_none() && self.id.is_none() && self.data.is_empty() {
            return None;
        }
        Some(StreamRecord {
            event: self.event.take(),
            id: self.id.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Envelope of an `insert` record.
#[derive(Debug, Deserialize)]
struct InsertEnvelope {
    #[serde(default)]
    id: Option<Value>,
    data: Value,
    #[serde(default)]
    #[allow(dead_code)]
    ts: Option<Value>,
}

/// Result of decoding one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    /// A record the consumers do not care about (other event kinds).
    Ignored,
}

/// Decode a record into a message. Errors describe malformed payloads.
pub fn decode_record(record: &StreamRecord) -> Result<Decoded, String> {
    let event = record.event.as_deref().unwrap_or("message");
    if event != "insert" {
        return Ok(Decoded::Ignored);
    }
    if record.data.trim().is_empty() {
        return Err("insert record without data".to_string());
    }

    let envelope: InsertEnvelope =
        serde_json::from_str(&record.data).map_err(|e| format!("bad envelope: {}", e))?;
    let mut row = normalize_keys(envelope.data);
    // Some emitters only carry the row id on the envelope.
    if let (Value::Object(map), Some(id)) = (&mut row, envelope.id) {
        map.entry("id").or_insert(id);
    }
    let message: Message =
        serde_json::from_value(row).map_err(|e| format!("bad message row: {}", e))?;
    Ok(Decoded::Message(message))
}

/// Convert a row's top-level keys from snake_case to camelCase. Keys that
/// are already camelCase pass through unchanged.
///
/// `metadata` is the sender's own bag and keeps its keys as sent, so stream
/// consumers and REST readers see the same shape. The one exception is the
/// delivery mode key, which some emitters write as `delivery_mode`.
pub fn normalize_keys(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    Value::Object(
        map.into_iter()
            .map(|(key, value)| {
                let key = snake_to_camel(&key);
                let value = if key == "metadata" {
                    normalize_metadata(value)
                } else {
                    value
                };
                (key, value)
            })
            .collect::<Map<String, Value>>(),
    )
}

fn normalize_metadata(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    if !map.contains_key(DELIVERY_MODE_KEY) {
        if let Some(mode) = map.remove("delivery_mode") {
            map.insert(DELIVERY_MODE_KEY.to_string(), mode);
        }
    }
    Value::Object(map)
}

fn snake_to_camel(key: &str) -> String {
    if !key.contains('_') {
        return key.to_string();
    }
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for (i, c) in key.chars().enumerate() {
        if c == '_' && i > 0 {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageStatus, MessageType};

    const INSERT: &str = "event: insert\nid: 7\ndata: {\"id\":\"7\",\"data\":{\"id\":\"m1\",\"sender_id\":\"agentA\",\"target_type\":\"agent\",\"target_address\":\"agent://m2/s2\",\"message_type\":\"command\",\"content\":\"ping\",\"metadata\":{\"delivery_mode\":\"push\"},\"status\":\"pending\",\"thread_id\":\"t1\"},\"ts\":\"2026-01-01T00:00:00Z\"}\n\n";

    #[test]
    fn test_parses_complete_record() {
        let mut parser = RecordParser::new();
        let records = parser.push(INSERT.as_bytes());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.as_deref(), Some("insert"));
        assert_eq!(records[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_record_split_across_chunks() {
        let mut parser = RecordParser::new();
        let bytes = INSERT.as_bytes();
        let mut records = Vec::new();
        for chunk in bytes.chunks(5) {
            records.extend(parser.push(chunk));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut parser = RecordParser::new();
        let records = parser.push(b": keepalive\r\n\r\nevent: update\r\ndata: {}\r\n\r\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.as_deref(), Some("update"));
        assert_eq!(records[0].data, "{}");
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut parser = RecordParser::new();
        let records = parser.push(b"data: a\ndata: b\n\n");
        assert_eq!(records[0].data, "a\nb");
    }

    #[test]
    fn test_decode_insert_normalizes_casing() {
        let mut parser = RecordParser::new();
        let record = parser.push(INSERT.as_bytes()).remove(0);
        let Decoded::Message(msg) = decode_record(&record).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.sender_id, "agentA");
        assert_eq!(msg.message_type, MessageType::Command);
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.thread_id.as_deref(), Some("t1"));
        assert_eq!(msg.metadata["deliveryMode"], "push");
    }

    #[test]
    fn test_metadata_keys_are_kept_as_sent() {
        let row = serde_json::json!({
            "sender_id": "agentA",
            "metadata": {
                "delivery_mode": "pull",
                "file_path": "/work/api/src/lib.rs",
                "review": {"line_count": 3}
            }
        });
        let normalized = normalize_keys(row);
        assert_eq!(normalized["senderId"], "agentA");
        let metadata = &normalized["metadata"];
        assert_eq!(metadata["deliveryMode"], "pull");
        assert!(metadata.get("delivery_mode").is_none());
        assert_eq!(metadata["file_path"], "/work/api/src/lib.rs");
        assert_eq!(metadata["review"]["line_count"], 3);
    }

    #[test]
    fn test_decode_non_insert_is_ignored() {
        let record = StreamRecord {
            event: Some("update".to_string()),
            id: None,
            data: "{}".to_string(),
        };
        assert_eq!(decode_record(&record).unwrap(), Decoded::Ignored);
    }

    #[test]
    fn test_decode_malformed_insert_is_error() {
        let record = StreamRecord {
            event: Some("insert".to_string()),
            id: None,
            data: "{not json".to_string(),
        };
        assert!(decode_record(&record).is_err());
    }

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel("target_agent_id"), "targetAgentId");
        assert_eq!(snake_to_camel("targetAddress"), "targetAddress");
        assert_eq!(snake_to_camel("_private"), "_private");
        assert_eq!(snake_to_camel("id"), "id");
    }
}
