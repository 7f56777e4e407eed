//! Server-Sent Events framing
//!
//! [`SseDecoder`] turns an arbitrarily chunked byte stream into complete [`SseFrame`]s.
//! Bytes are held until a blank-line boundary is seen, then the whole frame is decoded
//! as UTF-8, so a multi-byte character split across chunks is never mangled.

/// One blank-line terminated SSE block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Parse the text of a single frame (without its terminating blank line)
    #[must_use]
    pub fn parse(block: &str) -> Self {
        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => event = Some(value.to_string()),
                "data" => data_lines.push(value),
                _ => {}
            }
        }

        Self {
            event,
            data: data_lines.join("\n"),
        }
    }

    /// A frame carrying nothing (comment or keep-alive)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }
}

/// Incremental frame splitter
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `chunk` and return every frame it completes, in order.
    pub fn push(
        &mut self,
        chunk: &[u8],
    ) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, boundary_len)) = find_boundary(&self.buf) {
            let block: Vec<u8> = self.buf.drain(..end + boundary_len).take(end).collect();
            frames.push(SseFrame::parse(&String::from_utf8_lossy(&block)));
        }
        frames
    }

    /// Flush a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        if text.trim().is_empty() {
            return None;
        }
        Some(SseFrame::parse(&text))
    }

    /// Bytes held back waiting for a boundary
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Locate the first blank line. Returns the frame length and the boundary length.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some((i, 2)),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some((i, 3)),
                _ => {}
            }
        } else if buf[i] == b'\r' && buf.get(i + 1) == Some(&b'\n') {
            match buf.get(i + 2) {
                Some(b'\n') => return Some((i, 3)),
                Some(b'\r') if buf.get(i + 3) == Some(&b'\n') => return Some((i, 4)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}
