//! Multipart upload serializer.
//!
//! Parts may arrive from any task in any order; a single serializer task
//! emits their bytes in ascending part id order, waiting whenever the next
//! expected id has not arrived yet. `close` ends the stream once the queue
//! drains; `abort` fails the stream and every waiting part.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use orbit_net::ChannelReader;

/// Chunk size used when feeding part bytes into the stream.
const PART_CHUNK: usize = 32 * 1024;

/// Errors surfaced to part submitters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MultipartError {
    /// The upload was aborted.
    #[error("upload aborted: {0}")]
    Aborted(String),

    /// A part with this id was already submitted.
    #[error("part {0} already exists")]
    DuplicatePart(u64),

    /// The upload closed while this part was still unreachable.
    #[error("upload closed before part {0} was reachable")]
    ClosedWithGap(u64),
}

enum Command {
    AddPart {
        id: u64,
        data: Bytes,
        done: oneshot::Sender<Result<(), MultipartError>>,
    },
    Close,
    Abort(String),
}

/// Handle for submitting parts to a multipart stream.
#[derive(Clone)]
pub struct MultipartWriter {
    commands: mpsc::UnboundedSender<Command>,
}

impl MultipartWriter {
    /// Submits a part; the returned channel resolves once the part's bytes
    /// were fully consumed by the serializer (or the upload failed).
    pub fn add_part(
        &self,
        id: u64,
        data: impl Into<Bytes>,
    ) -> oneshot::Receiver<Result<(), MultipartError>> {
        let (done, receiver) = oneshot::channel();
        let command = Command::AddPart {
            id,
            data: data.into(),
            done,
        };
        if let Err(mpsc::error::SendError(returned)) = self.commands.send(command) {
            if let Command::AddPart { done, .. } = returned {
                let _ = done.send(Err(MultipartError::Aborted("serializer gone".into())));
            }
        }
        receiver
    }

    /// Signals that no more parts are coming.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Aborts the upload; every waiting part resolves with the error.
    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Abort(reason.into()));
    }
}

struct PendingPart {
    data: Bytes,
    done: oneshot::Sender<Result<(), MultipartError>>,
}

/// Creates a multipart serializer.
///
/// Returns the writer handle and the ordered byte stream. Part ids start at
/// 1 and must be contiguous for the stream to complete.
pub fn multipart_stream() -> (MultipartWriter, ChannelReader) {
    let (commands, mut command_rx) = mpsc::unbounded_channel::<Command>();
    let (out, reader) = ChannelReader::pipe(8);

    tokio::spawn(async move {
        let mut pending: BTreeMap<u64, PendingPart> = BTreeMap::new();
        let mut next_id = 1u64;
        let mut closed = false;

        loop {
            // Emit every part reachable in order.
            while let Some(part) = pending.remove(&next_id) {
                let mut failed = false;
                for chunk in part.data.chunks(PART_CHUNK) {
                    if out.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    // Downstream is gone; fail everything still waiting.
                    let reason = "stream consumer dropped".to_string();
                    let _ = part.done.send(Err(MultipartError::Aborted(reason.clone())));
                    for (_, waiting) in std::mem::take(&mut pending) {
                        let _ = waiting
                            .done
                            .send(Err(MultipartError::Aborted(reason.clone())));
                    }
                    return;
                }
                debug!(part = next_id, "part serialized");
                let _ = part.done.send(Ok(()));
                next_id += 1;
            }

            if closed && pending.is_empty() {
                // EOF once the sender side drops.
                return;
            }

            match command_rx.recv().await {
                Some(Command::AddPart { id, data, done }) => {
                    if id < next_id || pending.contains_key(&id) {
                        let _ = done.send(Err(MultipartError::DuplicatePart(id)));
                        continue;
                    }
                    pending.insert(id, PendingPart { data, done });
                }
                Some(Command::Close) => {
                    closed = true;
                    // Parts beyond a gap can never be reached once closed.
                    if pending.keys().next().copied() != Some(next_id) {
                        for (id, waiting) in std::mem::take(&mut pending) {
                            let _ = waiting.done.send(Err(MultipartError::ClosedWithGap(id)));
                        }
                    }
                }
                Some(Command::Abort(reason)) => {
                    let _ = out
                        .send(Err(std::io::Error::other(format!(
                            "upload aborted: {reason}"
                        ))))
                        .await;
                    for (_, waiting) in std::mem::take(&mut pending) {
                        let _ = waiting
                            .done
                            .send(Err(MultipartError::Aborted(reason.clone())));
                    }
                    return;
                }
                None => {
                    // Every writer handle dropped; treat as close.
                    closed = true;
                    if pending.keys().next().copied() != Some(next_id) {
                        for (id, waiting) in std::mem::take(&mut pending) {
                            let _ = waiting.done.send(Err(MultipartError::ClosedWithGap(id)));
                        }
                    }
                    if pending.is_empty() {
                        return;
                    }
                }
            }
        }
    });

    (MultipartWriter { commands }, reader)
}
