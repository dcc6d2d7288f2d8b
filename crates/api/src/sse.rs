//! Server-Sent Events (SSE) frame decoding.
//!
//! Response bodies arrive in arbitrary chunks. [`SseDecoder`] buffers them, splits on the blank
//! line that terminates each event (`\n\n` or `\r\n\r\n`), and parses every complete frame.

use tracing::warn;

/// A single parsed SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `data:` lines joined with `\n`.
    pub data: Option<String>,
    pub id: Option<String>,
    pub event: Option<String>,
    pub retry: Option<u64>,
}

/// Incremental decoder fed with raw body chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer) {
            let separator = find_separator_len(&self.buffer[end..]);
            match std::str::from_utf8(&self.buffer[..end]) {
                Ok(text) => frames.extend(parse_sse_frame(text)),
                Err(error) => warn!(error = %error, "dropping SSE frame with invalid UTF-8"),
            }
            self.buffer.drain(..end + separator);
        }
        frames
    }

    /// Parses whatever is left once the body ends without a trailing blank line.
    pub fn finish(self) -> Option<SseFrame> {
        let text = String::from_utf8_lossy(&self.buffer);
        if text.trim().is_empty() { None } else { parse_sse_frame(&text) }
    }
}

/// Decodes a complete SSE body.
pub fn decode_sse_body(body: &str) -> Vec<SseFrame> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(body.as_bytes());
    frames.extend(decoder.finish());
    frames
}

/// Finds the end of the first SSE frame in the buffer.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&index| buf[index..].starts_with(b"\n\n") || buf[index..].starts_with(b"\r\n\r\n"))
}

/// Finds the length of the SSE frame separator.
fn find_separator_len(slice: &[u8]) -> usize {
    if slice.starts_with(b"\n\n") {
        2
    } else if slice.starts_with(b"\r\n\r\n") {
        4
    } else {
        0
    }
}

/// Parses the text of one frame. Returns `None` for frames made only of comments.
pub fn parse_sse_frame(frame_text: &str) -> Option<SseFrame> {
    let mut data_lines = Vec::new();
    let mut frame = SseFrame::default();

    for line in frame_text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("id:") {
            frame.id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            frame.retry = rest.trim().parse().ok();
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }
    (frame != SseFrame::default()).then_some(frame)
}
