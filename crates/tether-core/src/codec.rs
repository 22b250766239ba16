//! Newline-delimited frame codec.
//!
//! Every frame on the wire is one line of JSON: `[kind, body]` followed by
//! `\n`. `kind` is one of `"message"`, `"ping"`, `"pong"`. Lines may end in
//! `\r\n`. Lines that are not valid frames are skipped.
//!
//! Carriers with a message size concern send a frame as several text pieces of
//! at most [`MAX_CHUNK_CHARS`] characters followed by a lone `"\n"` piece; the
//! receiving [`FrameDecoder`] reassembles them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Upper bound, in characters, of one outbound text piece.
pub const MAX_CHUNK_CHARS: usize = 8192;

/// Frame type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Application payload.
    Message,
    /// Liveness probe; answered with a `Pong` carrying the same body.
    Ping,
    /// Liveness answer.
    Pong,
}

impl FrameKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Frame type.
    pub kind: FrameKind,
    /// Frame payload. `Null` when the sender omitted it.
    pub body: Value,
}

impl Frame {
    /// Build a frame.
    #[must_use]
    pub fn new(kind: FrameKind, body: Value) -> Self {
        Self { kind, body }
    }

    /// Serialize as a JSON array without the trailing newline.
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::Array(vec![Value::from(self.kind.as_str()), self.body.clone()]).to_string()
    }
}

/// Encode a frame as one complete line, newline included.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    let mut line = frame.to_json();
    line.push('\n');
    line
}

/// Encode a frame as bounded text pieces followed by a lone `"\n"`.
#[must_use]
pub fn encode_chunks(frame: &Frame) -> Vec<String> {
    let json = frame.to_json();
    let mut pieces = Vec::with_capacity(json.len() / MAX_CHUNK_CHARS + 2);
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in json.char_indices() {
        if count == MAX_CHUNK_CHARS {
            pieces.push(json[start..idx].to_owned());
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < json.len() {
        pieces.push(json[start..].to_owned());
    }
    pieces.push("\n".to_owned());
    pieces
}

/// Parse one line (terminator already removed).
///
/// Returns `None` for anything that is not a JSON array whose first element is
/// a known frame kind.
#[must_use]
pub fn parse_line(line: &str) -> Option<Frame> {
    let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(line) else {
        return None;
    };
    let kind = items.first().and_then(Value::as_str).and_then(FrameKind::parse)?;
    let body = if items.len() > 1 {
        items.swap_remove(1)
    } else {
        Value::Null
    };
    Some(Frame { kind, body })
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameDecoder
// ─────────────────────────────────────────────────────────────────────────────

/// Buffering decoder for newline-delimited frames.
///
/// Text is appended with [`push`](Self::push). [`drain`](Self::drain) yields
/// every complete line and keeps the trailing partial line for later.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    backlog: String,
}

impl FrameDecoder {
    /// New empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received text to the backlog.
    pub fn push(&mut self, chunk: &str) {
        self.backlog.push_str(chunk);
    }

    /// Take every complete line from the backlog and parse it.
    ///
    /// Unparseable lines are dropped. The trailing partial line stays buffered.
    pub fn drain(&mut self) -> Vec<Frame> {
        let Some(last) = self.backlog.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.backlog.split_off(last + 1);
        let complete = std::mem::replace(&mut self.backlog, rest);
        complete
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter_map(|line| {
                let frame = parse_line(line);
                if frame.is_none() && !line.is_empty() {
                    trace!(len = line.len(), "dropping malformed frame");
                }
                frame
            })
            .collect()
    }

    /// Buffered text not yet drained.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.backlog
    }

    /// Discard the backlog.
    pub fn clear(&mut self) {
        self.backlog.clear();
    }
}
