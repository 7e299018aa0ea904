//! Line framing for the client protocol, without tokio-util codecs:
//! `BytesMut::split_to(..).freeze()` keeps the hot path copy-free.

use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

// Map payload rows (base64 image data, LS blocks) can be long; protect the
// server from a client that never sends a newline at all.
const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, stripping the trailing `\n` and optional `\r`.
    ///
    /// Returns:
    /// - `Ok(Some(line))` for a line (may be empty after trimming),
    /// - `Ok(None)` on clean EOF with no buffered data.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; the protocol layer
    /// decides what to do with garbage lines.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(i) = memchr(b'\n', &self.buf) {
                let raw = self.buf.split_to(i + 1).freeze();
                let mut end = raw.len() - 1;
                if end > 0 && raw[end - 1] == b'\r' {
                    end -= 1;
                }
                return Ok(Some(String::from_utf8_lossy(&raw[..end]).into_owned()));
            }

            if self.buf.len() > MAX_LINE_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading line",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_crlf_and_lf() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"OK 332\r\nPOLO\n\nlast\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "OK 332");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "POLO");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "last");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn errors_on_mid_line_eof() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"no newline here").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        assert!(lr.read_line().await.is_err());
    }
}
