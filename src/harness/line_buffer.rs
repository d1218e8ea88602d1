/// One decoded server-sent-events field from an upstream completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

/// Splits an upstream byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line is available so multi-byte characters
/// split across network chunks decode intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_buffer_bytes: Option<usize>,
    overflowed_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_buffer_bytes: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_bytes,
            overflowed_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(chunk);
        if let Some(max) = self.max_buffer_bytes {
            if self.buffer.len() > max {
                let excess = self.buffer.len() - max;
                self.buffer.drain(..excess);
                self.overflowed_bytes = self.overflowed_bytes.saturating_add(excess);
            }
        }

        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=idx).collect();
            if let Some(line) = decode_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    pub fn consume_overflowed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.overflowed_bytes)
    }

    /// Decodes whatever trails the last newline once the stream has ended.
    pub fn flush(&mut self) -> Option<SseLine> {
        let raw = std::mem::take(&mut self.buffer);
        decode_line(&raw)
    }
}

fn decode_line(raw: &[u8]) -> Option<SseLine> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\n', '\r']);
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        return Some(SseLine::Done);
    }
    if payload.is_empty() {
        return None;
    }
    Some(SseLine::Data(payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{LineBuffer, SseLine};

    #[test]
    fn decodes_data_lines_and_skips_other_fields() {
        let mut buffer = LineBuffer::new(None);
        let lines = buffer.push(b": keep-alive\nevent: chunk\ndata: {\"a\":1}\r\n\ndata: [DONE]\n");
        assert_eq!(
            lines,
            vec![SseLine::Data("{\"a\":1}".to_string()), SseLine::Done]
        );
    }

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut buffer = LineBuffer::new(None);
        assert!(buffer.push(b"data: {\"text\":\"caf").is_empty());
        let euro = "é\"}\n".as_bytes();
        assert!(buffer.push(&euro[..1]).is_empty());
        let lines = buffer.push(&euro[1..]);
        assert_eq!(lines, vec![SseLine::Data("{\"text\":\"café\"}".to_string())]);
    }

    #[test]
    fn flushes_trailing_line() {
        let mut buffer = LineBuffer::new(None);
        assert!(buffer.push(b"data: tail").is_empty());
        assert_eq!(buffer.flush(), Some(SseLine::Data("tail".to_string())));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn trims_when_over_limit() {
        let mut buffer = LineBuffer::new(Some(4));
        let _ = buffer.push(b"abcdef");
        assert_eq!(buffer.consume_overflowed_bytes(), 2);
        assert_eq!(buffer.consume_overflowed_bytes(), 0);
    }
}
