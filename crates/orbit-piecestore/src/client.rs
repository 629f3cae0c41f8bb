//! Piece session client.
//!
//! Uplinks, the audit verifier, and the repair worker all talk to storage
//! nodes through this client. Each operation opens its own session.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use orbit_core::ranger::{check_range, RangeReader, Ranger, RangerError};
use orbit_core::{Keypair, PieceId, Timestamp};
use orbit_net::{Channel, ChannelReader, Transport};
use orbit_proto::{
    ErrorKind, NodeDescriptor, PayerBandwidthAllocation, PieceRequest, PieceResponse,
    RenterBandwidthAllocation, SignedMessage,
};

use crate::{PieceStoreError, MESSAGE_SIZE};

/// Client for piece sessions against storage nodes.
#[derive(Clone)]
pub struct PieceStoreClient {
    transport: Arc<dyn Transport>,
    keypair: Arc<Keypair>,
}

impl PieceStoreClient {
    /// Creates a client countersigning with the given uplink key.
    pub fn new(transport: Arc<dyn Transport>, keypair: Arc<Keypair>) -> Self {
        Self { transport, keypair }
    }

    /// Uploads a piece, streaming `reader` until EOF.
    ///
    /// Every chunk carries a fresh countersigned cumulative total. Returns
    /// the byte count the node acknowledged.
    pub async fn put(
        &self,
        node: &NodeDescriptor,
        piece_id: PieceId,
        expiration: Timestamp,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        payer: &PayerBandwidthAllocation,
        authorization: &SignedMessage,
    ) -> Result<i64, PieceStoreError> {
        let mut channel = self.transport.dial(node).await?;
        channel
            .send_msg(&PieceRequest::StoreHeader {
                piece_id,
                expiration,
                namespace: Vec::new(),
                authorization: authorization.clone(),
                payer: payer.clone(),
            })
            .await?;

        let mut total = 0i64;
        let mut buf = vec![0u8; MESSAGE_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as i64;
            let allocation =
                RenterBandwidthAllocation::sign_with(&self.keypair, payer.clone(), total);
            let chunk = PieceRequest::StoreChunk {
                content: buf[..n].to_vec(),
                allocation: Some(allocation),
            };
            // A send failure means the server already closed the session;
            // fall through to read its terminal response.
            if channel.send_msg(&chunk).await.is_err() {
                break;
            }
        }
        let _ = channel.send_msg(&PieceRequest::StoreDone).await;

        match channel.recv_msg::<PieceResponse>().await? {
            Some(PieceResponse::StoreSummary { total_received, .. }) => {
                debug!(node = %node.id, total_received, "stored piece");
                Ok(total_received)
            }
            Some(PieceResponse::Error { kind, message }) => Err(remote_error(kind, message)),
            Some(other) => Err(PieceStoreError::Validation(format!(
                "unexpected store response: {other:?}"
            ))),
            None => Err(PieceStoreError::UnexpectedEof),
        }
    }

    /// Returns a ranger over a remote piece of known size.
    ///
    /// No connection is made until the first range request.
    pub fn get(
        &self,
        node: NodeDescriptor,
        piece_id: PieceId,
        size: i64,
        payer: PayerBandwidthAllocation,
        authorization: SignedMessage,
    ) -> PieceRanger {
        PieceRanger {
            client: self.clone(),
            node,
            piece_id,
            size,
            payer,
            authorization,
        }
    }

    /// Deletes a piece from a node.
    pub async fn delete(
        &self,
        node: &NodeDescriptor,
        piece_id: PieceId,
        authorization: &SignedMessage,
    ) -> Result<(), PieceStoreError> {
        let mut channel = self.transport.dial(node).await?;
        channel
            .send_msg(&PieceRequest::Delete {
                piece_id,
                authorization: authorization.clone(),
            })
            .await?;

        match channel.recv_msg::<PieceResponse>().await? {
            Some(PieceResponse::DeleteSummary) => Ok(()),
            Some(PieceResponse::Error { kind, message }) => Err(remote_error(kind, message)),
            Some(other) => Err(PieceStoreError::Validation(format!(
                "unexpected delete response: {other:?}"
            ))),
            None => Err(PieceStoreError::UnexpectedEof),
        }
    }

    /// Fetches piece metadata from a node.
    pub async fn stat(
        &self,
        node: &NodeDescriptor,
        piece_id: PieceId,
    ) -> Result<(i64, Timestamp), PieceStoreError> {
        let mut channel = self.transport.dial(node).await?;
        channel.send_msg(&PieceRequest::Stat { piece_id }).await?;

        match channel.recv_msg::<PieceResponse>().await? {
            Some(PieceResponse::StatSummary { size, expiration }) => Ok((size, expiration)),
            Some(PieceResponse::Error { kind, message }) => Err(remote_error(kind, message)),
            Some(other) => Err(PieceStoreError::Validation(format!(
                "unexpected stat response: {other:?}"
            ))),
            None => Err(PieceStoreError::UnexpectedEof),
        }
    }

    async fn open_range(
        &self,
        node: &NodeDescriptor,
        piece_id: PieceId,
        offset: i64,
        length: i64,
        payer: &PayerBandwidthAllocation,
        authorization: &SignedMessage,
    ) -> Result<RangeReader, PieceStoreError> {
        let mut channel = self.transport.dial(node).await?;
        channel
            .send_msg(&PieceRequest::RetrieveHeader {
                piece_id,
                offset,
                length,
                authorization: authorization.clone(),
                payer: payer.clone(),
            })
            .await?;

        // Allocate the whole range up front; the server's throttle admits
        // bytes against it.
        let allocation = RenterBandwidthAllocation::sign_with(&self.keypair, payer.clone(), length);
        channel
            .send_msg(&PieceRequest::RetrieveAllocation { allocation })
            .await?;

        let (writer, reader) = ChannelReader::pipe(16);
        tokio::spawn(pump_retrieve(channel, writer));
        Ok(Box::new(reader))
    }
}

async fn pump_retrieve(mut channel: Channel, writer: orbit_net::ChannelWriter) {
    loop {
        match channel.recv_msg::<PieceResponse>().await {
            Ok(Some(PieceResponse::RetrieveChunk { content })) => {
                if writer.send(Ok(Bytes::from(content))).await.is_err() {
                    return;
                }
            }
            Ok(Some(PieceResponse::RetrieveEnd { .. })) | Ok(None) => return,
            Ok(Some(PieceResponse::Error { kind, message })) => {
                let _ = writer
                    .send(Err(std::io::Error::other(format!("{kind:?}: {message}"))))
                    .await;
                return;
            }
            Ok(Some(_)) => {
                let _ = writer
                    .send(Err(std::io::Error::other("unexpected retrieve frame")))
                    .await;
                return;
            }
            Err(err) => {
                let _ = writer.send(Err(std::io::Error::other(err.to_string()))).await;
                return;
            }
        }
    }
}

/// Ranger over a remote piece; each range opens one Retrieve session.
pub struct PieceRanger {
    client: PieceStoreClient,
    node: NodeDescriptor,
    piece_id: PieceId,
    size: i64,
    payer: PayerBandwidthAllocation,
    authorization: SignedMessage,
}

#[async_trait::async_trait]
impl Ranger for PieceRanger {
    fn size(&self) -> i64 {
        self.size
    }

    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError> {
        check_range(offset, length, self.size)?;
        self.client
            .open_range(
                &self.node,
                self.piece_id,
                offset,
                length,
                &self.payer,
                &self.authorization,
            )
            .await
            .map_err(|e| RangerError::Other(e.to_string()))
    }
}

fn remote_error(kind: ErrorKind, message: String) -> PieceStoreError {
    match kind {
        ErrorKind::NotFound => PieceStoreError::NotFound,
        ErrorKind::OutOfSpace => PieceStoreError::OutOfSpace,
        ErrorKind::OutOfBandwidth => PieceStoreError::OutOfBandwidth,
        ErrorKind::Unauthenticated => PieceStoreError::Unauthenticated(message),
        ErrorKind::Integrity => PieceStoreError::Integrity(message),
        ErrorKind::Canceled => PieceStoreError::Canceled,
        _ => PieceStoreError::Remote { kind, message },
    }
}
