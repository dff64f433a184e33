//! Bounded capture of child process output streams.
//!
//! stdout and stderr are captured in full up to a configured ceiling. Beyond
//! the cap a one-line sentinel is appended and the remainder is discarded
//! (but still drained, so the child never blocks on a full pipe).

use tokio::io::{AsyncRead, AsyncReadExt};

/// A byte buffer that stops retaining data past `cap` while continuing to
/// count how much arrived.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    cap: usize,
    total: usize,
}

impl BoundedBuffer {
    /// Create a buffer that retains at most `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            total: 0,
        }
    }

    /// Append bytes, retaining only up to the cap.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        if self.buf.len() < self.cap {
            let room = self.cap - self.buf.len();
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    /// Whether any bytes were discarded.
    pub fn truncated(&self) -> bool {
        self.total > self.cap
    }

    /// Consume the buffer into a lossy UTF-8 string, appending the
    /// truncation sentinel when bytes were discarded.
    pub fn into_string(self) -> String {
        let mut s = String::from_utf8_lossy(&self.buf).into_owned();
        if self.total > self.cap {
            if !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&format!("[truncated at {} bytes]", self.cap));
        }
        s
    }
}

/// Read a stream to EOF into a [`BoundedBuffer`].
///
/// Bytes past the cap are drained and discarded so the writing end never
/// stalls on a full pipe.
pub async fn capture_stream<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> BoundedBuffer {
    let mut out = BoundedBuffer::new(cap);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.push(&chunk[..n]),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_is_untouched() {
        let mut buf = BoundedBuffer::new(64);
        buf.push(b"hello\n");
        assert!(!buf.truncated());
        assert_eq!(buf.into_string(), "hello\n");
    }

    #[test]
    fn over_cap_appends_sentinel() {
        let mut buf = BoundedBuffer::new(8);
        buf.push(b"0123456789abcdef");
        assert!(buf.truncated());
        let s = buf.into_string();
        assert!(s.starts_with("01234567"));
        assert!(s.ends_with("[truncated at 8 bytes]"), "got: {s}");
    }

    #[test]
    fn exact_cap_is_not_truncated() {
        let mut buf = BoundedBuffer::new(4);
        buf.push(b"abcd");
        assert!(!buf.truncated());
        assert_eq!(buf.into_string(), "abcd");
    }

    #[test]
    fn multiple_pushes_accumulate() {
        let mut buf = BoundedBuffer::new(6);
        buf.push(b"abc");
        buf.push(b"def");
        buf.push(b"ghi");
        assert!(buf.truncated());
        let s = buf.into_string();
        assert!(s.starts_with("abcdef"));
    }

    #[tokio::test]
    async fn capture_stream_reads_to_eof() {
        let data: &[u8] = b"line one\nline two\n";
        let buf = capture_stream(data, 1024).await;
        assert_eq!(buf.into_string(), "line one\nline two\n");
    }

    #[tokio::test]
    async fn capture_stream_truncates_large_input() {
        let data = vec![b'x'; 100_000];
        let buf = capture_stream(&data[..], 1000).await;
        assert!(buf.truncated());
        let s = buf.into_string();
        assert!(s.contains("[truncated at 1000 bytes]"));
    }
}
