use serde_json::Value;

const FRAME_SEPARATOR: &[u8] = b"\n\n";
const DATA_FIELD: &str = "data:";

/// Incremental decoder for `text/event-stream` bodies.
///
/// Frames are cut on raw bytes before any text decoding happens. A newline byte
/// never occurs inside a multi-byte UTF-8 sequence, so a code point split across
/// two chunks is always reassembled before its frame is decoded.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    // Bytes of `buffer` already known not to start a separator.
    scanned: usize,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and drains every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.next_boundary() {
            let frame: Vec<u8> = self.buffer.drain(..end + FRAME_SEPARATOR.len()).collect();
            self.scanned = 0;
            if let Some(event) = decode_frame(&frame[..end]) {
                events.push(event);
            }
        }

        events
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn next_boundary(&mut self) -> Option<usize> {
        let found = self.buffer[self.scanned..]
            .windows(FRAME_SEPARATOR.len())
            .position(|window| window == FRAME_SEPARATOR)
            .map(|offset| self.scanned + offset);
        if found.is_none() {
            self.scanned = self.buffer.len().saturating_sub(FRAME_SEPARATOR.len() - 1);
        }
        found
    }
}

/// Parses one frame (without its trailing blank line).
///
/// Returns `None` when the frame has no `data:` lines or its payload is not JSON.
pub fn decode_frame(frame: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(frame);
    let data_lines: Vec<&str> = text
        .split('\n')
        .map(str::trim_end)
        .filter_map(|line| line.strip_prefix(DATA_FIELD))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    match serde_json::from_str::<Value>(&data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(error = %err, bytes = data.len(), "dropping malformed event frame");
            None
        }
    }
}
