//! Streaming decoder for the GetMessages response body
//!
//! GetMessages returns an unbounded stream of concatenated JSON objects
//! with no array wrapper:
//!
//! ```text
//! {"Id":     {"Id":1428773900924989332,"Reply":1},
//!  "Session":{"Id":1428773900606543398,"Reply":0},
//!  "Type":   3,
//!  "Data":   ":robustirc.net 001 nick :Welcome"}
//! {"Id":     {"Id":0,"Reply":0},
//!  "Session":{"Id":0,"Reply":0},
//!  "Type":   4,
//!  "Data":   "",
//!  "Servers":["localhost:13003","localhost:13001","localhost:13002"]}
//! ```
//!
//! [`FrameDecoder`] accepts arbitrary byte chunks, tracks brace depth
//! (and string/escape state, so braces inside string values do not
//! count), and decodes each complete top-level object with `serde_json`.
//! An object that fails to decode is logged and discarded; the stream is
//! never torn down for a parse error, because later bytes resync at the
//! next top-level brace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `Type` value of a frame carrying one inbound IRC line.
pub const IRC_TO_CLIENT: i64 = 3;

/// `Type` value of a RobustPing frame.
pub const ROBUST_PING: i64 = 4;

/// A message id on the wire: `(Id, Reply)`.
///
/// Both components are unsigned 64-bit and regularly exceed 2^53, so
/// they must never pass through a lossy float representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageId {
    #[serde(rename = "Id")]
    pub id: u64,
    #[serde(rename = "Reply")]
    pub reply: u64,
}

impl fmt::Display for MessageId {
    /// Renders the `"<id>.<reply>"` form used as the `lastseen` cursor.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.reply)
    }
}

/// One decoded GetMessages frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobustMessage {
    #[serde(rename = "Id")]
    pub id: MessageId,
    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<MessageId>,
    #[serde(rename = "Type")]
    pub message_type: i64,
    #[serde(rename = "Data", default)]
    pub data: String,
    #[serde(rename = "Servers", default)]
    pub servers: Vec<String>,
}

/// Incremental splitter for a stream of concatenated JSON objects.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes of the current, incomplete top-level object.
    buf: Vec<u8>,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `chunk` into the decoder, returning every frame it completed.
    ///
    /// Bytes between top-level objects (whitespace, stray garbage) are
    /// skipped. A complete object that does not decode as a
    /// [`RobustMessage`] is logged and dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RobustMessage> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.depth == 0 {
                if byte == b'{' {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.depth = 1;
                }
                continue;
            }

            self.buf.push(byte);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        match serde_json::from_slice::<RobustMessage>(&self.buf) {
                            Ok(message) => frames.push(message),
                            Err(err) => tracing::warn!(
                                "discarding unparsable frame {:?}: {err}",
                                String::from_utf8_lossy(&self.buf)
                            ),
                        }
                        self.buf.clear();
                    }
                }
                _ => {}
            }
        }
        frames
    }
}
