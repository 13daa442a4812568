//! Server-sent event framing for the streaming relay.
//!
//! [`FrameDecoder`] splits a backend byte stream into whole events (blank-line
//! terminated) regardless of how the bytes were chunked on the wire.
//! [`SseFrame::rewrite`] swaps the model id inside `data:` payloads and leaves
//! every other line as it arrived.

use bytes::Bytes;
use serde_json::Value;

use crate::mapping::ModelMapping;

pub const DONE_PAYLOAD: &str = "[DONE]";
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// One complete event as received from the backend, line endings normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    lines: Vec<String>,
}

impl SseFrame {
    pub fn from_lines(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Joined `data:` payload, or `None` for frames without data lines.
    pub fn data(&self) -> Option<String> {
        let mut parts = self.lines.iter().filter_map(|l| data_value(l)).peekable();
        parts.peek()?;
        Some(parts.collect::<Vec<_>>().join("\n"))
    }

    pub fn is_done(&self) -> bool {
        self.data().is_some_and(|d| d.trim() == DONE_PAYLOAD)
    }

    /// Reverse-map the `model` field of a JSON payload. Frames whose payload
    /// is not a JSON object with a string `model` come back unchanged.
    pub fn rewrite(self, mapping: &ModelMapping) -> Self {
        let Some(data) = self.data() else {
            return self;
        };
        let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(&data) else {
            return self;
        };
        let Some(Value::String(model)) = obj.get("model") else {
            return self;
        };
        let external = mapping.map_reverse(model);
        if external == model.as_str() {
            return self;
        }
        let external = external.to_string();
        obj.insert("model".to_string(), Value::String(external));

        let Ok(payload) = serde_json::to_string(&obj) else {
            return self;
        };

        // Collapse the data lines into one, in the position of the first.
        let mut lines = Vec::with_capacity(self.lines.len());
        let mut replaced = false;
        for line in self.lines {
            if data_value(&line).is_some() {
                if !replaced {
                    lines.push(format!("data: {payload}"));
                    replaced = true;
                }
            } else {
                lines.push(line);
            }
        }
        Self { lines }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

fn data_value(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Incremental splitter from raw bytes to [`SseFrame`]s.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    pending: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let mut line = &self.buffer[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.is_empty() {
                if !self.pending.is_empty() {
                    frames.push(SseFrame::from_lines(std::mem::take(&mut self.pending)));
                }
            } else {
                self.pending.push(String::from_utf8_lossy(line).into_owned());
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        frames
    }

    /// Whatever is left once the backend closes without a trailing blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if !line.is_empty() {
                self.pending.push(line);
            }
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(SseFrame::from_lines(std::mem::take(&mut self.pending)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ModelMapping {
        ModelMapping::from_pairs([("gpt-3.5-turbo", "llama-3.1-instruct-13b")]).unwrap()
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: {\"a\":").is_empty());
        assert!(dec.push(b"1}\n").is_empty());
        let frames = dec.push(b"\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data().as_deref(), Some("{\"a\":1}"));
        assert!(frames[1].is_done());
    }

    #[test]
    fn test_decoder_normalizes_crlf_and_keeps_comments() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b": keep-alive\r\n\r\nevent: delta\r\ndata: x\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].to_bytes(), Bytes::from_static(b": keep-alive\n\n"));
        assert_eq!(frames[1].to_bytes(), Bytes::from_static(b"event: delta\ndata: x\n\n"));
    }

    #[test]
    fn test_decoder_keeps_multibyte_chars_across_chunks() {
        let mut dec = FrameDecoder::new();
        let text = "data: héllo\n\n".as_bytes();
        let (a, b) = text.split_at(8); // splits the two-byte 'é'
        assert!(dec.push(a).is_empty());
        let frames = dec.push(b);
        assert_eq!(frames[0].data().as_deref(), Some("héllo"));
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        let last = dec.finish().unwrap();
        assert_eq!(last.data().as_deref(), Some("tail"));
        assert!(dec.finish().is_none());
    }

    #[test]
    fn test_rewrite_reverse_maps_model_preserving_key_order() {
        let frame = SseFrame::from_lines(vec![
            r#"data: {"id":"c1","object":"chat.completion.chunk","model":"llama-3.1-instruct-13b","choices":[{"index":0,"delta":{"content":"H"}}]}"#.to_string(),
        ]);
        let out = frame.rewrite(&mapping());
        assert_eq!(
            out.to_bytes(),
            Bytes::from_static(
                br#"data: {"id":"c1","object":"chat.completion.chunk","model":"gpt-3.5-turbo","choices":[{"index":0,"delta":{"content":"H"}}]}

"#
            )
        );
    }

    #[test]
    fn test_rewrite_leaves_unmapped_and_non_json_frames_byte_identical() {
        let raw = r#"data:   {"model": "unmapped",  "x": 1}"#.to_string();
        let frame = SseFrame::from_lines(vec![raw.clone()]);
        assert_eq!(frame.clone().rewrite(&mapping()), frame);

        let frame = SseFrame::from_lines(vec!["data: not json".to_string()]);
        assert_eq!(frame.clone().rewrite(&mapping()), frame);
    }

    #[test]
    fn test_done_detection() {
        assert!(SseFrame::from_lines(vec!["data: [DONE]".to_string()]).is_done());
        assert!(SseFrame::from_lines(vec!["data:[DONE]".to_string()]).is_done());
        assert!(!SseFrame::from_lines(vec![": comment".to_string()]).is_done());
    }
}
