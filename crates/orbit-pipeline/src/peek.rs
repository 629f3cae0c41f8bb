//! Threshold peeking for inline/remote classification.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Buffers the head of a stream to decide whether the payload exceeds a
/// threshold, then replays the buffered bytes ahead of the rest.
pub struct PeekThresholdReader<R> {
    inner: R,
    buffer: Vec<u8>,
    pos: usize,
    source_done: bool,
}

impl<R: AsyncRead + Unpin> PeekThresholdReader<R> {
    /// Wraps a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
            source_done: false,
        }
    }

    /// Returns true when the stream holds more than `threshold` bytes.
    ///
    /// Reads and buffers at most `threshold + 1` bytes; must be called
    /// before any reads.
    pub async fn is_larger_than(&mut self, threshold: usize) -> io::Result<bool> {
        assert_eq!(self.pos, 0, "peek must happen before reading");

        let goal = threshold + 1;
        while self.buffer.len() < goal {
            let mut chunk = vec![0u8; goal - self.buffer.len()];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.source_done = true;
                break;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(self.buffer.len() > threshold)
    }

    /// The bytes buffered by the peek.
    pub fn peeked(&self) -> &[u8] {
        &self.buffer
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekThresholdReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buffer.len() {
            let n = (this.buffer.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.buffer[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        if this.source_done {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}
