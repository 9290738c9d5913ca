//! Newline splitting over arbitrarily chunked bytes.

/// Splits a byte stream into lines, holding a trailing partial line until
/// the next chunk (or [`finish`](Self::finish)) completes it.
#[derive(Debug, Default)]
pub struct LineDecoder {
    partial: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completes. Lines come back
    /// without their `\n` (or `\r\n`); blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            let line = if self.partial.is_empty() {
                head.to_vec()
            } else {
                let mut line = std::mem::take(&mut self.partial);
                line.extend_from_slice(head);
                line
            };
            push_line(&mut lines, line);
            rest = &tail[1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// The unterminated remainder at end of input, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let mut lines = Vec::with_capacity(1);
        push_line(&mut lines, std::mem::take(&mut self.partial));
        lines.pop()
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

fn push_line(lines: &mut Vec<Vec<u8>>, mut line: Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if !line.iter().all(u8::is_ascii_whitespace) {
        lines.push(line);
    }
}
