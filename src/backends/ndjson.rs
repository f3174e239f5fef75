//! Newline-delimited JSON framing over a chunked HTTP body.

#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `chunk` and returns every line it completed, without the line
    /// terminator. Blank lines are skipped.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !is_blank(&line) {
                lines.push(line);
            }
        }
        lines
    }

    /// The unterminated last line, if the body ended without a newline.
    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.pending);
        (!is_blank(&rest)).then_some(rest)
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lines_split_across_chunks_are_joined() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push(b"{\"event\":").is_empty());
        let lines = buffer.push(b"\"step\"}\r\n{\"url\":\"/a.png\"}\n\n{\"ev");

        assert_eq!(lines, vec![b"{\"event\":\"step\"}".to_vec(), b"{\"url\":\"/a.png\"}".to_vec()]);
        assert_eq!(buffer.finish(), Some(b"{\"ev".to_vec()));
    }

    #[test]
    fn trailing_whitespace_is_not_a_line() {
        let mut buffer = LineBuffer::default();

        buffer.push(b"{}\n  ");

        assert_eq!(buffer.finish(), None);
    }
}
