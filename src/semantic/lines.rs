//! Byte stream to text lines

/// Splits a byte stream into lines
///
/// Bytes are buffered until `\n`. A trailing `\r` is dropped and invalid
/// UTF-8 is replaced, so a renderer printing odd bytes never stalls the
/// reader.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.buf.extend_from_slice(&rest[..pos]);
            lines.push(self.take());
            rest = &rest[pos + 1..];
        }
        self.buf.extend_from_slice(rest);
        lines
    }

    /// Flush the partial line left at EOF
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
