use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr2;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

const DEFAULT_MAX_LINE: usize = 8 * 1024;

#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line_len: usize,
    // The previous line ended on a bare `\r` at the buffer edge; the paired
    // `\n` (or telnet's `\0`) may arrive in the next read and must be eaten.
    pending_pair: bool,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(DEFAULT_MAX_LINE),
            max_line_len: DEFAULT_MAX_LINE,
            pending_pair: false,
        }
    }

    pub fn max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max.max(1);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, accepting `\n`, `\r\n`, bare `\r` and `\r\0` endings.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` for a line with the terminator stripped (may be empty),
    /// - `Ok(None)` on clean EOF with no buffered partial line.
    pub async fn read_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if self.pending_pair && !self.buf.is_empty() {
                if self.buf[0] == b'\n' || self.buf[0] == 0 {
                    let _ = self.buf.split_to(1);
                }
                self.pending_pair = false;
            }

            if let Some(i) = memchr2(b'\n', b'\r', &self.buf) {
                let line = self.buf.split_to(i).freeze();
                let delim = self.buf.split_to(1)[0];
                if delim == b'\r' {
                    if self.buf.is_empty() {
                        self.pending_pair = true;
                    } else if self.buf[0] == b'\n' || self.buf[0] == 0 {
                        let _ = self.buf.split_to(1);
                    }
                }
                return Ok(Some(line));
            }

            if self.buf.len() > self.max_line_len {
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
