//! Kernel message envelope.
//!
//! Wire shape (JSON): `{ "header": { "msg_type", "session", ... },
//! "content": { "code", ... }, ... }`. Unknown fields are captured in
//! flattened maps so a rewritten message re-serializes with everything
//! the client originally sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind that triggers cell-source substitution. Also used as the
/// fast-path marker: payloads not containing this substring are forwarded
/// without being parsed at all.
pub const EXECUTE_REQUEST: &str = "execute_request";

/// Message header: kind and originating session identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// A structured kernel-protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: MessageHeader,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl KernelMessage {
    /// Whether this message's kind makes it eligible for rewriting.
    pub fn is_execute_request(&self) -> bool {
        self.header.msg_type == EXECUTE_REQUEST
    }

    /// The `content.code` field, if present and a string.
    pub fn code(&self) -> Option<&str> {
        self.content.get("code").and_then(Value::as_str)
    }

    /// Replace `content.code` with the given source text.
    pub fn set_code(&mut self, source: String) {
        if let Value::Object(content) = &mut self.content {
            content.insert("code".to_string(), Value::String(source));
        }
    }
}

/// Parse a cell index from `content.code`.
///
/// Accepts only the canonical base-10 decimal representation of a
/// non-negative integer: the re-serialization of the parsed value must
/// equal the input exactly, which rejects `"456; foo=1"`, `"+5"`,
/// `"01"`, and anything with surrounding whitespace.
pub fn parse_cell_index(code: &str) -> Option<usize> {
    let index: usize = code.parse().ok()?;
    (index.to_string() == code).then_some(index)
}
