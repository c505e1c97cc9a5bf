use bytes::Bytes;

pub const DEFAULT_SCAN_LIMIT: usize = 1_048_576; // 1 MiB
pub const GEMINI_SCAN_LIMIT: usize = 52_428_800; // Gemini inline data can be huge

/// Incremental line splitter over an upstream byte stream.
///
/// Splits on `\n`, strips a trailing `\r`, and enforces a maximum line
/// length. Exceeding the limit poisons the scanner; the stream must be torn
/// down.
#[derive(Debug)]
pub struct LineScanner {
    buffer: Vec<u8>,
    limit: usize,
    poisoned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

impl LineScanner {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            poisoned: false,
        }
    }

    /// Feeds a chunk and returns the complete lines it unlocked.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, LineTooLong> {
        if self.poisoned {
            return Err(LineTooLong { limit: self.limit });
        }
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0usize;
        while let Some(offset) = memchr(&self.buffer[start..], b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            lines.push(Bytes::copy_from_slice(line));
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.limit {
            self.poisoned = true;
            return Err(LineTooLong { limit: self.limit });
        }
        Ok(lines)
    }

    /// Returns the trailing partial line at EOF, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.poisoned || self.buffer.is_empty() {
            return None;
        }
        let mut line: &[u8] = &self.buffer;
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let out = Bytes::copy_from_slice(line);
        self.buffer.clear();
        if out.is_empty() { None } else { Some(out) }
    }
}

fn memchr(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut scanner = LineScanner::new(DEFAULT_SCAN_LIMIT);
        let lines = scanner.push(b"data: one\ndata: tw").expect("push");
        assert_eq!(lines, vec![Bytes::from_static(b"data: one")]);
        let lines = scanner.push(b"o\r\n\n").expect("push");
        assert_eq!(
            lines,
            vec![Bytes::from_static(b"data: two"), Bytes::new()]
        );
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn finish_returns_trailing_partial() {
        let mut scanner = LineScanner::new(DEFAULT_SCAN_LIMIT);
        scanner.push(b"tail without newline").expect("push");
        assert_eq!(scanner.finish(), Some(Bytes::from_static(b"tail without newline")));
    }

    #[test]
    fn oversized_line_poisons_scanner() {
        let mut scanner = LineScanner::new(8);
        let err = scanner.push(b"0123456789abcdef").expect_err("too long");
        assert_eq!(err.limit, 8);
        assert!(scanner.push(b"\n").is_err());
    }
}
