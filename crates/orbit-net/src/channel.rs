//! Bidirectional frame channels and channel-backed readers.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use orbit_core::{CanonicalDecode, CanonicalEncode};

use crate::NetError;

/// Frames a session may carry; anything larger is rejected.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default number of in-flight frames per direction.
pub const DEFAULT_SESSION_DEPTH: usize = 64;

/// One endpoint of a bidirectional frame stream.
///
/// Dropping a channel closes its send direction; the peer observes EOF.
#[derive(Debug)]
pub struct Channel {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl Channel {
    /// Creates a connected pair of endpoints.
    pub fn pair(depth: usize) -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::channel(depth);
        let (b_tx, b_rx) = mpsc::channel(depth);
        (
            Channel { tx: a_tx, rx: b_rx },
            Channel { tx: b_tx, rx: a_rx },
        )
    }

    /// Builds an endpoint from raw halves (used by the TCP pump).
    pub fn from_halves(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self { tx, rx }
    }

    /// Sends one frame.
    pub async fn send(&self, frame: Bytes) -> Result<(), NetError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(NetError::BadFrame(format!(
                "frame of {} bytes exceeds limit",
                frame.len()
            )));
        }
        self.tx.send(frame).await.map_err(|_| NetError::Closed)
    }

    /// Receives the next frame, or `None` once the peer closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Sends a canonically encoded message as one frame.
    pub async fn send_msg<T: CanonicalEncode>(&self, msg: &T) -> Result<(), NetError> {
        self.send(msg.to_bytes()).await
    }

    /// Receives and decodes the next message.
    pub async fn recv_msg<T: CanonicalDecode>(&mut self) -> Result<Option<T>, NetError> {
        match self.recv().await {
            Some(frame) => Ok(Some(T::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }

    /// Splits the endpoint so sending and receiving can run on separate
    /// tasks. Dropping both halves closes the session.
    pub fn split(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.tx, self.rx)
    }
}

/// Sending half handed to producer tasks.
pub type ChannelWriter = mpsc::Sender<io::Result<Bytes>>;

/// An `AsyncRead` fed by a byte channel.
///
/// EOF when every sender is dropped; an `Err` item surfaces as a read error.
#[derive(Debug)]
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    /// Creates a reader and its feeding writer.
    pub fn pipe(depth: usize) -> (ChannelWriter, ChannelReader) {
        let (tx, rx) = mpsc::channel(depth);
        (
            tx,
            ChannelReader {
                rx,
                current: Bytes::new(),
            },
        )
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.current = bytes;
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
