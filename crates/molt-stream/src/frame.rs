//! Incremental parser for the backend's `event:` / `data:` stream format.
//!
//! The backend writes one frame per event:
//!
//! ```text
//! event: output
//! data: {"text":"hi","ts":1700000000000}
//!
//! ```
//!
//! Network chunks may split a frame anywhere, including inside a multi-byte
//! UTF-8 sequence. [`FrameParser`] buffers whatever is incomplete and only
//! yields frames once their terminating blank line has arrived.
//!
//! Within a frame:
//! - the last `event:` line names the frame (default [`DEFAULT_EVENT`])
//! - every `data:` line is trimmed and appended, with no separator
//! - comments (`:`) and unknown fields are ignored
//!
//! Frames whose data is empty or not valid JSON are dropped.

use serde_json::Value;
use tracing::{debug, warn};

/// Event name used when a frame carries no (or an empty) `event:` line.
pub const DEFAULT_EVENT: &str = "message";

/// Largest incomplete frame held in memory. Anything longer is discarded
/// up to its terminating blank line.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const FRAME_BOUNDARY: &str = "\n\n";

/// One decoded upstream unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Event name, e.g. `output` or `status`.
    pub event: String,
    /// JSON-decoded data payload.
    pub payload: Value,
}

/// Stateful splitter turning chunks into [`Frame`]s.
///
/// One parser belongs to one upstream stream; it is never shared or reset.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
    pending_bytes: Vec<u8>,
    discarding: bool,
}

impl FrameParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw byte chunk.
    ///
    /// A UTF-8 sequence cut off at the end of the chunk is held back until
    /// the next call. Invalid bytes become U+FFFD.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending_bytes.extend_from_slice(chunk);
        let text = take_decoded(&mut self.pending_bytes);
        self.push(&text)
    }

    /// Feed a text chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<Frame> {
        // Only a trailing '\n' can pair with the new chunk; the rest of the
        // retained text was already searched.
        let mut search_from = if self.buffer.ends_with('\n') {
            self.buffer.len() - 1
        } else {
            self.buffer.len()
        };
        self.buffer.extend(chunk.chars().filter(|&c| c != '\r'));

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[search_from..].find(FRAME_BOUNDARY) {
            let end = search_from + offset;
            if self.discarding {
                self.discarding = false;
                debug!("skipped remainder of oversized frame");
            } else if let Some(frame) = parse_frame(&self.buffer[consumed..end]) {
                frames.push(frame);
            }
            consumed = end + FRAME_BOUNDARY.len();
            search_from = consumed;
        }
        if consumed > 0 {
            self.buffer.replace_range(..consumed, "");
        }

        if self.buffer.len() > MAX_FRAME_LEN {
            warn!(buffered = self.buffer.len(), "frame exceeds size limit, discarding");
            let trailing_newline = self.buffer.ends_with('\n');
            self.buffer.clear();
            if trailing_newline {
                self.buffer.push('\n');
            }
            self.discarding = true;
        }
        frames
    }

    /// Bytes held back waiting for a frame boundary or the rest of a
    /// UTF-8 sequence.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending_bytes.len()
    }
}

/// Decode one frame block (the text between two boundaries).
///
/// Returns `None` when the block has no data or its data is not JSON.
pub fn parse_frame(block: &str) -> Option<Frame> {
    let mut event: Option<&str> = None;
    let mut data = String::new();

    for line in block.split('\n') {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim());
        }
    }

    if data.is_empty() {
        return None;
    }

    let payload = match serde_json::from_str::<Value>(&data) {
        Ok(payload) => payload,
        Err(error) => {
            debug!(%error, data_len = data.len(), "dropping frame with undecodable data");
            return None;
        }
    };

    let event = match event {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => DEFAULT_EVENT.to_string(),
    };

    Some(Frame { event, payload })
}

/// Decode as much of `pending` as possible, leaving a trailing partial
/// UTF-8 sequence in place.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let mut out = String::with_capacity(pending.len());
    let mut rest: &[u8] = pending.as_slice();

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                rest = &[];
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                if let Some(invalid_len) = err.error_len() {
                    out.push(char::REPLACEMENT_CHARACTER);
                    rest = &after[invalid_len..];
                } else {
                    rest = after;
                    break;
                }
            }
        }
    }

    let tail = rest.to_vec();
    *pending = tail;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn frame(event: &str, payload: Value) -> Frame {
        Frame {
            event: event.to_string(),
            payload,
        }
    }

    // ── parse_frame ──

    #[test]
    fn named_frame() {
        let parsed = parse_frame("event: output\ndata: {\"text\":\"hi\"}").unwrap();
        assert_eq!(parsed, frame("output", json!({"text": "hi"})));
    }

    #[test]
    fn missing_event_defaults_to_message() {
        let parsed = parse_frame("data: {\"a\":1}").unwrap();
        assert_eq!(parsed.event, "message");
    }

    #[test]
    fn empty_event_defaults_to_message() {
        let parsed = parse_frame("event:\ndata: 1").unwrap();
        assert_eq!(parsed.event, DEFAULT_EVENT);
    }

    #[test]
    fn last_event_line_wins() {
        let parsed = parse_frame("event: first\nevent: second\ndata: {}").unwrap();
        assert_eq!(parsed.event, "second");
    }

    #[test]
    fn no_space_after_colon() {
        let parsed = parse_frame("event:status\ndata:{\"s\":\"idle\"}").unwrap();
        assert_eq!(parsed, frame("status", json!({"s": "idle"})));
    }

    #[test]
    fn data_lines_concatenate_without_separator() {
        let parsed = parse_frame("data: {\"text\":\ndata: \"joined\"}").unwrap();
        assert_eq!(parsed.payload, json!({"text": "joined"}));
    }

    #[test]
    fn empty_data_is_discarded() {
        assert!(parse_frame("event: output").is_none());
        assert!(parse_frame("event: output\ndata:").is_none());
        assert!(parse_frame("data:   ").is_none());
        assert!(parse_frame("").is_none());
    }

    #[test]
    fn invalid_json_is_discarded() {
        assert!(parse_frame("data: not json").is_none());
        assert!(parse_frame("data: {\"open\":").is_none());
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let parsed = parse_frame(": keepalive\nid: 7\nretry: 100\ndata: [1,2]").unwrap();
        assert_eq!(parsed, frame("message", json!([1, 2])));
    }

    // ── FrameParser ──

    #[test]
    fn two_frames_in_one_chunk() {
        let mut parser = FrameParser::new();
        let frames = parser.push(
            "event: output\ndata: {\"text\":\"hi\"}\n\ndata: {\"text\":\" there\"}\n\n",
        );
        assert_eq!(
            frames,
            vec![
                frame("output", json!({"text": "hi"})),
                frame("message", json!({"text": " there"})),
            ]
        );
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn split_exactly_at_blank_line() {
        let mut parser = FrameParser::new();
        assert!(parser.push("data: {\"a\":1}\n").is_empty());
        let frames = parser.push("\n");
        assert_eq!(frames, vec![frame("message", json!({"a": 1}))]);
    }

    #[test]
    fn split_inside_data_line() {
        let mut parser = FrameParser::new();
        assert!(parser.push("event: output\ndata: {\"te").is_empty());
        let frames = parser.push("xt\":\"hi\"}\n\n");
        assert_eq!(frames, vec![frame("output", json!({"text": "hi"}))]);
    }

    #[test]
    fn partial_first_line_only() {
        let mut parser = FrameParser::new();
        assert!(parser.push("eve").is_empty());
        assert_eq!(parser.buffered_len(), 3);
        let frames = parser.push("nt: status\ndata: {}\n\n");
        assert_eq!(frames, vec![frame("status", json!({}))]);
    }

    #[test]
    fn trailing_partial_frame_kept() {
        let mut parser = FrameParser::new();
        let frames = parser.push("data: 1\n\ndata: 2");
        assert_eq!(frames.len(), 1);
        assert_eq!(parser.buffered_len(), "data: 2".len());
        assert_eq!(parser.push("\n\n"), vec![frame("message", json!(2))]);
    }

    #[test]
    fn crlf_line_endings() {
        let mut parser = FrameParser::new();
        let frames = parser.push("event: output\r\ndata: {\"x\":1}\r\n\r\n");
        assert_eq!(frames, vec![frame("output", json!({"x": 1}))]);
    }

    #[test]
    fn crlf_split_between_cr_and_lf() {
        let mut parser = FrameParser::new();
        assert!(parser.push("data: 5\r\n\r").is_empty());
        assert_eq!(parser.push("\n"), vec![frame("message", json!(5))]);
    }

    #[test]
    fn bad_frame_does_not_poison_stream() {
        let mut parser = FrameParser::new();
        let frames = parser.push("data: nope\n\nevent: output\ndata: {\"ok\":true}\n\n");
        assert_eq!(frames, vec![frame("output", json!({"ok": true}))]);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let bytes = "data: {\"t\":\"é🚀\"}\n\n".as_bytes();
        let cut = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut parser = FrameParser::new();
        assert!(parser.push_bytes(&bytes[..cut]).is_empty());
        let frames = parser.push_bytes(&bytes[cut..]);
        assert_eq!(frames, vec![frame("message", json!({"t": "é🚀"}))]);
    }

    #[test]
    fn four_byte_char_split_byte_by_byte() {
        let bytes = "data: \"🚀\"\n\n".as_bytes();
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in bytes {
            frames.extend(parser.push_bytes(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![frame("message", json!("🚀"))]);
    }

    #[test]
    fn invalid_utf8_replaced() {
        let mut parser = FrameParser::new();
        let frames = parser.push_bytes(b"data: \"a\xffb\"\n\n");
        assert_eq!(frames, vec![frame("message", json!("a\u{FFFD}b"))]);
    }

    #[test]
    fn large_frame_in_small_chunks() {
        let text = "y".repeat(100_000);
        let encoded = format!("event: big\ndata: \"{text}\"\n\ndata: 2\n\n");
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for piece in encoded.as_bytes().chunks(7) {
            frames.extend(parser.push_bytes(piece));
        }
        assert_eq!(frames, vec![frame("big", json!(text)), frame("message", json!(2))]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn boundary_newlines_in_separate_chunks_after_multibyte() {
        let mut parser = FrameParser::new();
        assert!(parser.push("data: \"é\"\n").is_empty());
        assert_eq!(parser.push("\n"), vec![frame("message", json!("é"))]);
    }

    #[test]
    fn oversized_frame_discarded_until_boundary() {
        let mut parser = FrameParser::new();
        let huge = format!("data: \"{}", "z".repeat(MAX_FRAME_LEN));
        assert!(parser.push(&huge).is_empty());
        assert!(parser.buffered_len() <= 1);

        // The tail of the oversized frame is skipped; the next frame survives.
        assert!(parser.push("zzz\"").is_empty());
        let frames = parser.push("\n\ndata: {\"ok\":1}\n\n");
        assert_eq!(frames, vec![frame("message", json!({"ok": 1}))]);
    }

    // ── chunking independence ──

    fn arb_frame() -> impl Strategy<Value = (Option<String>, Value)> {
        (
            proptest::option::of("[a-z]{1,8}"),
            "[a-zA-Z0-9 é中🚀]{0,12}",
            any::<i64>(),
        )
            .prop_map(|(event, text, n)| (event, json!({"text": text, "n": n})))
    }

    fn encode(frames: &[(Option<String>, Value)]) -> Vec<u8> {
        let mut out = String::new();
        for (event, payload) in frames {
            if let Some(event) = event {
                out.push_str(&format!("event: {event}\n"));
            }
            out.push_str(&format!("data: {payload}\n\n"));
        }
        out.into_bytes()
    }

    proptest! {
        #[test]
        fn any_chunking_yields_same_frames(
            frames in proptest::collection::vec(arb_frame(), 0..6),
            cuts in proptest::collection::vec(any::<proptest::sample::Index>(), 0..10),
        ) {
            let bytes = encode(&frames);
            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            offsets.sort_unstable();

            let mut parser = FrameParser::new();
            let mut decoded = Vec::new();
            let mut start = 0;
            for offset in offsets.into_iter().chain(std::iter::once(bytes.len())) {
                decoded.extend(parser.push_bytes(&bytes[start..offset]));
                start = offset;
            }

            let expected: Vec<Frame> = frames
                .into_iter()
                .map(|(event, payload)| Frame {
                    event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
                    payload,
                })
                .collect();
            prop_assert_eq!(decoded, expected);
            prop_assert_eq!(parser.buffered_len(), 0);
        }
    }
}
