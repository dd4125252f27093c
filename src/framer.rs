//! Byte-stream framing into delimiter-terminated lines.
//!
//! The modem UART delivers bytes in arbitrary chunks; [`LineFramer`]
//! accumulates them into complete `\r\n`-terminated lines and reports when a
//! line had to be cut short because it outgrew the line buffer. The same
//! framer drives the GPS stream with its own delimiter.

/// Accumulates bytes into delimiter-terminated lines.
///
/// Not thread-safe; owned by the task that drains the corresponding stream.
pub struct LineFramer {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    capacity: usize,
    matched: usize,
    overflowed: bool,
}

impl LineFramer {
    /// Create a framer with a fixed line-buffer capacity. Bytes beyond
    /// `capacity` in a single line are discarded and the line is flagged.
    pub fn new(capacity: usize, delimiter: &[u8]) -> Self {
        assert!(!delimiter.is_empty(), "delimiter must be non-empty");
        Self {
            delimiter: delimiter.to_vec(),
            buffer: Vec::with_capacity(capacity.min(256)),
            capacity,
            matched: 0,
            overflowed: false,
        }
    }

    /// Feed a chunk of bytes, invoking `sink(line, overflowed)` for every
    /// completed line. The delimiter is not part of `line`.
    pub fn feed(&mut self, bytes: &[u8], mut sink: impl FnMut(&[u8], bool)) {
        for &b in bytes {
            self.push(b, &mut sink);
        }
    }

    fn push(&mut self, byte: u8, sink: &mut impl FnMut(&[u8], bool)) {
        if self.delimiter[self.matched] == byte {
            self.matched += 1;
            if self.matched == self.delimiter.len() {
                sink(&self.buffer, self.overflowed);
                self.buffer.clear();
                self.matched = 0;
                self.overflowed = false;
            }
            return;
        }

        // Mismatch mid-delimiter: the matched prefix turned out to be payload.
        let matched = self.matched;
        self.matched = 0;
        for i in 0..matched {
            let b = self.delimiter[i];
            self.store(b);
        }

        // The current byte may itself start a fresh delimiter match.
        if self.delimiter[0] == byte {
            self.matched = 1;
        } else {
            self.store(byte);
        }
    }

    fn store(&mut self, byte: u8) {
        if self.buffer.len() >= self.capacity {
            self.overflowed = true;
            return;
        }
        self.buffer.push(byte);
    }
}
