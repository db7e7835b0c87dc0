//! Incremental decoder for the text event-stream wire format.

/// Event name used when a frame has no `event:` line.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `event:` line, or `"message"`.
    pub event: String,
    /// `data:` lines joined by `\n`.
    pub data: String,
}

/// Decoder over a cumulative body.
///
/// The caller passes the whole body received so far on every call; the
/// decoder remembers how far it has consumed and only scans what lies
/// beyond. A trailing segment without its blank-line terminator is left
/// unconsumed until more bytes complete it, so a frame is never emitted
/// twice and never emitted partially.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    consumed: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte length of the body prefix already turned into frames.
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.consumed
    }

    /// Decode every complete frame appended since the last call.
    pub fn decode(&mut self, body: &str) -> Vec<Frame> {
        // A mark past the end or inside a character means the body was
        // replaced rather than appended to; start over.
        let fresh = if let Some(fresh) = body.get(self.consumed..) {
            fresh
        } else {
            self.consumed = 0;
            body
        };
        let Some(end) = last_boundary(fresh) else {
            return Vec::new();
        };
        self.consumed += end;

        normalize_newlines(&fresh[..end])
            .split("\n\n")
            .filter_map(parse_frame)
            .collect()
    }

    /// Drop the consumed prefix from `body` and rebase the mark to zero.
    ///
    /// Keeps a long-lived body from growing without bound.
    pub fn compact(&mut self, body: &mut String) {
        let consumed = self.consumed.min(body.len());
        body.drain(..consumed);
        self.consumed = 0;
    }

    /// Decode a complete body in one shot.
    #[must_use]
    pub fn decode_all(body: &str) -> Vec<Frame> {
        Self::new().decode(body)
    }
}

/// Offset just past the last blank line in `text`.
///
/// CRLF, CR and LF each count as one line break; two breaks in a row end a
/// frame.
fn last_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut index = 0;
    let mut after_break = false;
    let mut boundary = None;

    while index < bytes.len() {
        let width = match bytes[index] {
            b'\r' if bytes.get(index + 1) == Some(&b'\n') => 2,
            b'\r' | b'\n' => 1,
            _ => 0,
        };
        if width == 0 {
            after_break = false;
            index += 1;
            continue;
        }

        index += width;
        if after_break {
            boundary = Some(index);
            after_break = false;
        } else {
            after_break = true;
        }
    }

    boundary
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Strip the single optional space after a field colon.
fn field_value(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}

fn parse_frame(block: &str) -> Option<Frame> {
    if block.trim().is_empty() {
        return None;
    }

    let mut data = String::new();
    let mut event = None;

    for line in block.split('\n') {
        if let Some(value) = line.strip_prefix("data:") {
            data.push_str(field_value(value));
            data.push('\n');
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = field_value(value);
            event = (!value.is_empty()).then(|| value.to_owned());
        }
    }

    if data.ends_with('\n') {
        data.pop();
    }

    Some(Frame {
        event: event.unwrap_or_else(|| DEFAULT_EVENT_NAME.to_owned()),
        data,
    })
}
