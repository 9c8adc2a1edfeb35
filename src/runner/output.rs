//! Downloader output line splitting
//!
//! yt-dlp style downloaders overwrite their progress line in place using a
//! bare `\r`, so waiting for `\n` would hold progress updates back until the
//! end of the line. The splitter therefore treats `\n`, `\r`, and `\r\n` all
//! as line terminators and emits each segment as soon as it is complete.

/// Incremental byte-stream splitter over `\n`, `\r`, and `\r\n`
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every segment completed by it.
    ///
    /// A chunk ending in `\r` keeps that byte buffered: only the next chunk
    /// can tell whether it terminates the segment alone or as part of a
    /// `\r\n` pair.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut segments = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\n' => {
                    segments.push(lossy(&self.buf[start..i]));
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    if i + 1 < self.buf.len() {
                        segments.push(lossy(&self.buf[start..i]));
                        i += if self.buf[i + 1] == b'\n' { 2 } else { 1 };
                        start = i;
                    } else {
                        // Trailing CR: wait for the next chunk
                        break;
                    }
                }
                _ => i += 1,
            }
        }
        self.buf.drain(..start);
        segments
    }

    /// Emit the unterminated tail at end of stream, if any
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if self.buf.is_empty() {
            return None;
        }
        let tail = lossy(&self.buf);
        self.buf.clear();
        Some(tail)
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
