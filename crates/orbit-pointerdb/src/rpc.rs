//! Pointer RPC: the satellite's network surface for uplinks.
//!
//! One request frame, one response frame per exchange; sessions stay open
//! for further exchanges. The [`Pointers`] trait abstracts the service so
//! the pipeline runs identically in-process and over the network.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use orbit_core::{ApiKey, CanonicalDecode, CanonicalEncode, DecodeError, NodeId};
use orbit_net::{Channel, Transport};
use orbit_proto::{
    BandwidthAction, NodeDescriptor, PayerBandwidthAllocation, Pointer, SignedMessage,
};

use crate::service::{GetResult, ListRequest, PointerDb, PointerItem};
use crate::PointerDbError;

/// Capability interface over the pointer service.
#[async_trait]
pub trait Pointers: Send + Sync {
    /// Stores a pointer.
    async fn put(&self, path: &str, pointer: Pointer) -> Result<(), PointerDbError>;

    /// Fetches a pointer with resolved nodes and a GET allocation.
    async fn get(&self, path: &str) -> Result<GetResult, PointerDbError>;

    /// Removes a pointer, returning it.
    async fn delete(&self, path: &str) -> Result<Pointer, PointerDbError>;

    /// Lists pointers under a prefix.
    async fn list(&self, request: &ListRequest)
        -> Result<(Vec<PointerItem>, bool), PointerDbError>;

    /// Issues a payer allocation.
    async fn payer_allocation(
        &self,
        action: BandwidthAction,
        uplink_id: NodeId,
        uplink_key: [u8; 32],
    ) -> Result<PayerBandwidthAllocation, PointerDbError>;

    /// Returns the satellite authorization for piece requests.
    async fn authorization(&self) -> Result<SignedMessage, PointerDbError>;
}

/// In-process implementation binding a [`PointerDb`] to one API key.
pub struct AuthedPointers {
    db: Arc<PointerDb>,
    api_key: ApiKey,
}

impl AuthedPointers {
    /// Wraps a pointer service.
    pub fn new(db: Arc<PointerDb>, api_key: ApiKey) -> Self {
        Self { db, api_key }
    }
}

#[async_trait]
impl Pointers for AuthedPointers {
    async fn put(&self, path: &str, pointer: Pointer) -> Result<(), PointerDbError> {
        self.db.put(&self.api_key, path, pointer)
    }

    async fn get(&self, path: &str) -> Result<GetResult, PointerDbError> {
        self.db.get(&self.api_key, path)
    }

    async fn delete(&self, path: &str) -> Result<Pointer, PointerDbError> {
        self.db.delete(&self.api_key, path)
    }

    async fn list(
        &self,
        request: &ListRequest,
    ) -> Result<(Vec<PointerItem>, bool), PointerDbError> {
        self.db.list(&self.api_key, request)
    }

    async fn payer_allocation(
        &self,
        action: BandwidthAction,
        uplink_id: NodeId,
        uplink_key: [u8; 32],
    ) -> Result<PayerBandwidthAllocation, PointerDbError> {
        self.db
            .payer_allocation(&self.api_key, action, uplink_id, uplink_key)
    }

    async fn authorization(&self) -> Result<SignedMessage, PointerDbError> {
        Ok(self.db.authorization())
    }
}

/// Wire requests. The API key rides in every request, mirroring a
/// per-request credential header.
#[derive(Debug, Clone)]
pub enum PointerRequest {
    /// Store a pointer.
    Put {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Pointer path.
        path: String,
        /// The pointer.
        pointer: Pointer,
    },
    /// Fetch a pointer.
    Get {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Pointer path.
        path: String,
    },
    /// Remove a pointer.
    Delete {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Pointer path.
        path: String,
    },
    /// List pointers.
    List {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Path prefix.
        prefix: String,
        /// Exclusive lower bound.
        start_after: String,
        /// Exclusive upper bound.
        end_before: String,
        /// Disable directory collapsing.
        recursive: bool,
        /// Page size.
        limit: u32,
        /// Pointer field selection.
        meta_flags: u32,
    },
    /// Issue a payer allocation.
    PayerAllocation {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Paid action.
        action: BandwidthAction,
        /// Uplink identity.
        uplink_id: NodeId,
        /// Uplink public key for countersignatures.
        uplink_key: [u8; 32],
    },
    /// Fetch the satellite authorization.
    Authorization {
        /// Caller credential.
        api_key: Vec<u8>,
    },
    /// Select storage nodes for an upload.
    ChooseNodes {
        /// Caller credential.
        api_key: Vec<u8>,
        /// How many nodes.
        amount: u32,
        /// Required free space.
        space: i64,
        /// Ids that must not be selected.
        excluded: Vec<NodeId>,
    },
    /// Resolve node ids to descriptors.
    BulkLookup {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Node ids to resolve.
        ids: Vec<NodeId>,
    },
    /// Create a bucket record.
    CreateBucket {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Bucket name.
        name: String,
    },
    /// Delete an empty bucket.
    DeleteBucket {
        /// Caller credential.
        api_key: Vec<u8>,
        /// Bucket name.
        name: String,
    },
    /// List every bucket.
    ListBuckets {
        /// Caller credential.
        api_key: Vec<u8>,
    },
}

impl PointerRequest {
    const PUT: u32 = 0;
    const GET: u32 = 1;
    const DELETE: u32 = 2;
    const LIST: u32 = 3;
    const PAYER: u32 = 4;
    const AUTHORIZATION: u32 = 5;
    const CHOOSE: u32 = 6;
    const BULK_LOOKUP: u32 = 7;
    const CREATE_BUCKET: u32 = 8;
    const DELETE_BUCKET: u32 = 9;
    const LIST_BUCKETS: u32 = 10;
}

impl CanonicalEncode for PointerRequest {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            PointerRequest::Put {
                api_key,
                path,
                pointer,
            } => {
                Self::PUT.encode(buf);
                api_key.encode(buf);
                path.encode(buf);
                pointer.encode(buf);
            }
            PointerRequest::Get { api_key, path } => {
                Self::GET.encode(buf);
                api_key.encode(buf);
                path.encode(buf);
            }
            PointerRequest::Delete { api_key, path } => {
                Self::DELETE.encode(buf);
                api_key.encode(buf);
                path.encode(buf);
            }
            PointerRequest::List {
                api_key,
                prefix,
                start_after,
                end_before,
                recursive,
                limit,
                meta_flags,
            } => {
                Self::LIST.encode(buf);
                api_key.encode(buf);
                prefix.encode(buf);
                start_after.encode(buf);
                end_before.encode(buf);
                recursive.encode(buf);
                limit.encode(buf);
                meta_flags.encode(buf);
            }
            PointerRequest::PayerAllocation {
                api_key,
                action,
                uplink_id,
                uplink_key,
            } => {
                Self::PAYER.encode(buf);
                api_key.encode(buf);
                action.encode(buf);
                uplink_id.encode(buf);
                uplink_key.encode(buf);
            }
            PointerRequest::Authorization { api_key } => {
                Self::AUTHORIZATION.encode(buf);
                api_key.encode(buf);
            }
            PointerRequest::ChooseNodes {
                api_key,
                amount,
                space,
                excluded,
            } => {
                Self::CHOOSE.encode(buf);
                api_key.encode(buf);
                amount.encode(buf);
                space.encode(buf);
                excluded.encode(buf);
            }
            PointerRequest::BulkLookup { api_key, ids } => {
                Self::BULK_LOOKUP.encode(buf);
                api_key.encode(buf);
                ids.encode(buf);
            }
            PointerRequest::CreateBucket { api_key, name } => {
                Self::CREATE_BUCKET.encode(buf);
                api_key.encode(buf);
                name.encode(buf);
            }
            PointerRequest::DeleteBucket { api_key, name } => {
                Self::DELETE_BUCKET.encode(buf);
                api_key.encode(buf);
                name.encode(buf);
            }
            PointerRequest::ListBuckets { api_key } => {
                Self::LIST_BUCKETS.encode(buf);
                api_key.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for PointerRequest {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            Self::PUT => Ok(PointerRequest::Put {
                api_key: Vec::<u8>::decode(buf)?,
                path: String::decode(buf)?,
                pointer: Pointer::decode(buf)?,
            }),
            Self::GET => Ok(PointerRequest::Get {
                api_key: Vec::<u8>::decode(buf)?,
                path: String::decode(buf)?,
            }),
            Self::DELETE => Ok(PointerRequest::Delete {
                api_key: Vec::<u8>::decode(buf)?,
                path: String::decode(buf)?,
            }),
            Self::LIST => Ok(PointerRequest::List {
                api_key: Vec::<u8>::decode(buf)?,
                prefix: String::decode(buf)?,
                start_after: String::decode(buf)?,
                end_before: String::decode(buf)?,
                recursive: bool::decode(buf)?,
                limit: u32::decode(buf)?,
                meta_flags: u32::decode(buf)?,
            }),
            Self::PAYER => Ok(PointerRequest::PayerAllocation {
                api_key: Vec::<u8>::decode(buf)?,
                action: BandwidthAction::decode(buf)?,
                uplink_id: NodeId::decode(buf)?,
                uplink_key: <[u8; 32]>::decode(buf)?,
            }),
            Self::AUTHORIZATION => Ok(PointerRequest::Authorization {
                api_key: Vec::<u8>::decode(buf)?,
            }),
            Self::CHOOSE => Ok(PointerRequest::ChooseNodes {
                api_key: Vec::<u8>::decode(buf)?,
                amount: u32::decode(buf)?,
                space: i64::decode(buf)?,
                excluded: Vec::<NodeId>::decode(buf)?,
            }),
            Self::BULK_LOOKUP => Ok(PointerRequest::BulkLookup {
                api_key: Vec::<u8>::decode(buf)?,
                ids: Vec::<NodeId>::decode(buf)?,
            }),
            Self::CREATE_BUCKET => Ok(PointerRequest::CreateBucket {
                api_key: Vec::<u8>::decode(buf)?,
                name: String::decode(buf)?,
            }),
            Self::DELETE_BUCKET => Ok(PointerRequest::DeleteBucket {
                api_key: Vec::<u8>::decode(buf)?,
                name: String::decode(buf)?,
            }),
            Self::LIST_BUCKETS => Ok(PointerRequest::ListBuckets {
                api_key: Vec::<u8>::decode(buf)?,
            }),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// One listing entry on the wire.
#[derive(Debug, Clone)]
pub struct WireListItem {
    /// Path relative to the prefix.
    pub path: String,
    /// Pointer projection.
    pub pointer: Option<Pointer>,
    /// True for collapsed entries.
    pub is_prefix: bool,
}

impl CanonicalEncode for WireListItem {
    fn encode(&self, buf: &mut BytesMut) {
        self.path.encode(buf);
        self.pointer.encode(buf);
        self.is_prefix.encode(buf);
    }
}

impl CanonicalDecode for WireListItem {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            path: String::decode(buf)?,
            pointer: Option::<Pointer>::decode(buf)?,
            is_prefix: bool::decode(buf)?,
        })
    }
}

/// Wire error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    /// Bad credential.
    Unauthenticated,
    /// Missing pointer.
    NotFound,
    /// Validation failure.
    Validation,
    /// Anything else.
    Internal,
}

impl WireErrorKind {
    fn tag(&self) -> u32 {
        match self {
            WireErrorKind::Unauthenticated => 0,
            WireErrorKind::NotFound => 1,
            WireErrorKind::Validation => 2,
            WireErrorKind::Internal => 3,
        }
    }

    fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(WireErrorKind::Unauthenticated),
            1 => Ok(WireErrorKind::NotFound),
            2 => Ok(WireErrorKind::Validation),
            3 => Ok(WireErrorKind::Internal),
            other => Err(DecodeError::InvalidEnumTag(other)),
        }
    }
}

/// Wire responses.
#[derive(Debug, Clone)]
pub enum PointerResponse {
    /// Put acknowledged.
    PutOk,
    /// Get result.
    Got {
        /// The pointer.
        pointer: Pointer,
        /// Resolved nodes, when attached.
        nodes: Option<Vec<Option<NodeDescriptor>>>,
        /// GET allocation.
        payer: PayerBandwidthAllocation,
        /// Piece authorization.
        authorization: SignedMessage,
    },
    /// Delete result.
    Deleted {
        /// The removed pointer.
        pointer: Pointer,
    },
    /// Listing page.
    Listed {
        /// Items in byte order.
        items: Vec<WireListItem>,
        /// Truncated by the limit.
        more: bool,
    },
    /// Issued allocation.
    Allocation {
        /// The signed allocation.
        payer: PayerBandwidthAllocation,
    },
    /// The satellite authorization.
    Authorized {
        /// Signed authorization.
        authorization: SignedMessage,
    },
    /// Selected nodes.
    Chosen {
        /// The selection.
        nodes: Vec<NodeDescriptor>,
    },
    /// Resolved descriptors, position-preserved.
    Resolved {
        /// `None` slots for unknown nodes.
        nodes: Vec<Option<NodeDescriptor>>,
    },
    /// Bucket operation result.
    Buckets {
        /// Bucket records.
        buckets: Vec<orbit_proto::Bucket>,
    },
    /// Failure.
    Error {
        /// Classification.
        kind: WireErrorKind,
        /// Details.
        message: String,
    },
}

impl PointerResponse {
    const PUT_OK: u32 = 0;
    const GOT: u32 = 1;
    const DELETED: u32 = 2;
    const LISTED: u32 = 3;
    const ALLOCATION: u32 = 4;
    const AUTHORIZED: u32 = 5;
    const CHOSEN: u32 = 6;
    const RESOLVED: u32 = 7;
    const BUCKETS: u32 = 8;
    const ERROR: u32 = 9;
}

impl CanonicalEncode for PointerResponse {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            PointerResponse::PutOk => Self::PUT_OK.encode(buf),
            PointerResponse::Got {
                pointer,
                nodes,
                payer,
                authorization,
            } => {
                Self::GOT.encode(buf);
                pointer.encode(buf);
                nodes.encode(buf);
                payer.encode(buf);
                authorization.encode(buf);
            }
            PointerResponse::Deleted { pointer } => {
                Self::DELETED.encode(buf);
                pointer.encode(buf);
            }
            PointerResponse::Listed { items, more } => {
                Self::LISTED.encode(buf);
                items.encode(buf);
                more.encode(buf);
            }
            PointerResponse::Allocation { payer } => {
                Self::ALLOCATION.encode(buf);
                payer.encode(buf);
            }
            PointerResponse::Authorized { authorization } => {
                Self::AUTHORIZED.encode(buf);
                authorization.encode(buf);
            }
            PointerResponse::Chosen { nodes } => {
                Self::CHOSEN.encode(buf);
                nodes.encode(buf);
            }
            PointerResponse::Resolved { nodes } => {
                Self::RESOLVED.encode(buf);
                nodes.encode(buf);
            }
            PointerResponse::Buckets { buckets } => {
                Self::BUCKETS.encode(buf);
                buckets.encode(buf);
            }
            PointerResponse::Error { kind, message } => {
                Self::ERROR.encode(buf);
                kind.tag().encode(buf);
                message.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for PointerResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            Self::PUT_OK => Ok(PointerResponse::PutOk),
            Self::GOT => Ok(PointerResponse::Got {
                pointer: Pointer::decode(buf)?,
                nodes: Option::<Vec<Option<NodeDescriptor>>>::decode(buf)?,
                payer: PayerBandwidthAllocation::decode(buf)?,
                authorization: SignedMessage::decode(buf)?,
            }),
            Self::DELETED => Ok(PointerResponse::Deleted {
                pointer: Pointer::decode(buf)?,
            }),
            Self::LISTED => Ok(PointerResponse::Listed {
                items: Vec::<WireListItem>::decode(buf)?,
                more: bool::decode(buf)?,
            }),
            Self::ALLOCATION => Ok(PointerResponse::Allocation {
                payer: PayerBandwidthAllocation::decode(buf)?,
            }),
            Self::AUTHORIZED => Ok(PointerResponse::Authorized {
                authorization: SignedMessage::decode(buf)?,
            }),
            Self::CHOSEN => Ok(PointerResponse::Chosen {
                nodes: Vec::<NodeDescriptor>::decode(buf)?,
            }),
            Self::RESOLVED => Ok(PointerResponse::Resolved {
                nodes: Vec::<Option<NodeDescriptor>>::decode(buf)?,
            }),
            Self::BUCKETS => Ok(PointerResponse::Buckets {
                buckets: Vec::<orbit_proto::Bucket>::decode(buf)?,
            }),
            Self::ERROR => Ok(PointerResponse::Error {
                kind: WireErrorKind::from_tag(u32::decode(buf)?)?,
                message: String::decode(buf)?,
            }),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

fn error_response(err: &PointerDbError) -> PointerResponse {
    let kind = match err {
        PointerDbError::Unauthenticated => WireErrorKind::Unauthenticated,
        PointerDbError::NotFound => WireErrorKind::NotFound,
        PointerDbError::Validation(_) | PointerDbError::Proto(_) => WireErrorKind::Validation,
        _ => WireErrorKind::Internal,
    };
    PointerResponse::Error {
        kind,
        message: err.to_string(),
    }
}

fn error_from_wire(kind: WireErrorKind, message: String) -> PointerDbError {
    match kind {
        WireErrorKind::Unauthenticated => PointerDbError::Unauthenticated,
        WireErrorKind::NotFound => PointerDbError::NotFound,
        WireErrorKind::Validation | WireErrorKind::Internal => {
            PointerDbError::Validation(message)
        }
    }
}

/// Serves pointer RPC sessions over a [`PointerDb`].
pub struct PointerRpcServer {
    db: Arc<PointerDb>,
}

impl PointerRpcServer {
    /// Creates a server.
    pub fn new(db: Arc<PointerDb>) -> Self {
        Self { db }
    }

    /// Accepts sessions until the acceptor closes.
    pub async fn run(self: Arc<Self>, mut acceptor: mpsc::Receiver<Channel>) {
        while let Some(channel) = acceptor.recv().await {
            let server = self.clone();
            tokio::spawn(async move { server.handle_session(channel).await });
        }
    }

    /// Handles one session of request/response exchanges.
    pub async fn handle_session(&self, mut channel: Channel) {
        loop {
            let request = match channel.recv_msg::<PointerRequest>().await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "undecodable pointer request");
                    return;
                }
            };
            let response = self.dispatch(request);
            if channel.send_msg(&response).await.is_err() {
                return;
            }
        }
    }

    fn dispatch(&self, request: PointerRequest) -> PointerResponse {
        match request {
            PointerRequest::Put {
                api_key,
                path,
                pointer,
            } => match self.db.put(&ApiKey::new(api_key), &path, pointer) {
                Ok(()) => PointerResponse::PutOk,
                Err(err) => error_response(&err),
            },
            PointerRequest::Get { api_key, path } => {
                match self.db.get(&ApiKey::new(api_key), &path) {
                    Ok(result) => PointerResponse::Got {
                        pointer: result.pointer,
                        nodes: result.nodes,
                        payer: result.payer,
                        authorization: result.authorization,
                    },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::Delete { api_key, path } => {
                match self.db.delete(&ApiKey::new(api_key), &path) {
                    Ok(pointer) => PointerResponse::Deleted { pointer },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::List {
                api_key,
                prefix,
                start_after,
                end_before,
                recursive,
                limit,
                meta_flags,
            } => {
                let request = ListRequest {
                    prefix,
                    start_after,
                    end_before,
                    recursive,
                    limit: limit as usize,
                    meta_flags,
                };
                match self.db.list(&ApiKey::new(api_key), &request) {
                    Ok((items, more)) => PointerResponse::Listed {
                        items: items
                            .into_iter()
                            .map(|item| WireListItem {
                                path: item.path,
                                pointer: item.pointer,
                                is_prefix: item.is_prefix,
                            })
                            .collect(),
                        more,
                    },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::PayerAllocation {
                api_key,
                action,
                uplink_id,
                uplink_key,
            } => {
                match self
                    .db
                    .payer_allocation(&ApiKey::new(api_key), action, uplink_id, uplink_key)
                {
                    Ok(payer) => PointerResponse::Allocation { payer },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::Authorization { api_key } => {
                match self.db.check_api_key(&ApiKey::new(api_key)) {
                    Ok(()) => PointerResponse::Authorized {
                        authorization: self.db.authorization(),
                    },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::ChooseNodes {
                api_key,
                amount,
                space,
                excluded,
            } => {
                if let Err(err) = self.db.check_api_key(&ApiKey::new(api_key)) {
                    return error_response(&err);
                }
                let options = orbit_overlay::ChooseOptions {
                    amount: amount as usize,
                    space,
                    excluded,
                    min_reputation: None,
                };
                match self.db.cache().choose(&options) {
                    Ok(nodes) => PointerResponse::Chosen { nodes },
                    Err(err) => error_response(&PointerDbError::Overlay(err)),
                }
            }
            PointerRequest::BulkLookup { api_key, ids } => {
                if let Err(err) = self.db.check_api_key(&ApiKey::new(api_key)) {
                    return error_response(&err);
                }
                match self.db.cache().bulk_lookup(&ids) {
                    Ok(nodes) => PointerResponse::Resolved { nodes },
                    Err(err) => error_response(&PointerDbError::Overlay(err)),
                }
            }
            PointerRequest::CreateBucket { api_key, name } => {
                match self.db.create_bucket(&ApiKey::new(api_key), &name) {
                    Ok(bucket) => PointerResponse::Buckets {
                        buckets: vec![bucket],
                    },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::DeleteBucket { api_key, name } => {
                match self.db.delete_bucket(&ApiKey::new(api_key), &name) {
                    Ok(()) => PointerResponse::Buckets {
                        buckets: Vec::new(),
                    },
                    Err(err) => error_response(&err),
                }
            }
            PointerRequest::ListBuckets { api_key } => {
                match self.db.list_buckets(&ApiKey::new(api_key)) {
                    Ok(buckets) => PointerResponse::Buckets { buckets },
                    Err(err) => error_response(&err),
                }
            }
        }
    }
}

/// Pointer service client over a transport session.
pub struct RemotePointers {
    transport: Arc<dyn Transport>,
    satellite: NodeDescriptor,
    api_key: ApiKey,
    session: Mutex<Option<Channel>>,
}

impl RemotePointers {
    /// Creates a client; the session dials lazily and is reused.
    pub fn new(transport: Arc<dyn Transport>, satellite: NodeDescriptor, api_key: ApiKey) -> Self {
        Self {
            transport,
            satellite,
            api_key,
            session: Mutex::new(None),
        }
    }

    async fn exchange(&self, request: &PointerRequest) -> Result<PointerResponse, PointerDbError> {
        let mut guard = self.session.lock().await;

        // One reconnect attempt on a stale session.
        for attempt in 0..2 {
            if guard.is_none() {
                let channel = self
                    .transport
                    .dial(&self.satellite)
                    .await
                    .map_err(|e| PointerDbError::Validation(format!("satellite dial: {e}")))?;
                *guard = Some(channel);
            }
            let channel = guard.as_mut().expect("session just ensured");

            let sent = channel.send_msg(request).await.is_ok();
            if sent {
                match channel.recv_msg::<PointerResponse>().await {
                    Ok(Some(response)) => return Ok(response),
                    Ok(None) | Err(_) => {}
                }
            }

            *guard = None;
            if attempt == 1 {
                break;
            }
        }
        Err(PointerDbError::Validation("satellite session failed".into()))
    }

    fn key(&self) -> Vec<u8> {
        self.api_key.as_slice().to_vec()
    }
}

#[async_trait]
impl Pointers for RemotePointers {
    async fn put(&self, path: &str, pointer: Pointer) -> Result<(), PointerDbError> {
        match self
            .exchange(&PointerRequest::Put {
                api_key: self.key(),
                path: path.to_string(),
                pointer,
            })
            .await?
        {
            PointerResponse::PutOk => Ok(()),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected put response: {other:?}"
            ))),
        }
    }

    async fn get(&self, path: &str) -> Result<GetResult, PointerDbError> {
        match self
            .exchange(&PointerRequest::Get {
                api_key: self.key(),
                path: path.to_string(),
            })
            .await?
        {
            PointerResponse::Got {
                pointer,
                nodes,
                payer,
                authorization,
            } => Ok(GetResult {
                pointer,
                nodes,
                payer,
                authorization,
            }),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected get response: {other:?}"
            ))),
        }
    }

    async fn delete(&self, path: &str) -> Result<Pointer, PointerDbError> {
        match self
            .exchange(&PointerRequest::Delete {
                api_key: self.key(),
                path: path.to_string(),
            })
            .await?
        {
            PointerResponse::Deleted { pointer } => Ok(pointer),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected delete response: {other:?}"
            ))),
        }
    }

    async fn list(
        &self,
        request: &ListRequest,
    ) -> Result<(Vec<PointerItem>, bool), PointerDbError> {
        match self
            .exchange(&PointerRequest::List {
                api_key: self.key(),
                prefix: request.prefix.clone(),
                start_after: request.start_after.clone(),
                end_before: request.end_before.clone(),
                recursive: request.recursive,
                limit: request.limit as u32,
                meta_flags: request.meta_flags,
            })
            .await?
        {
            PointerResponse::Listed { items, more } => Ok((
                items
                    .into_iter()
                    .map(|item| PointerItem {
                        path: item.path,
                        pointer: item.pointer,
                        is_prefix: item.is_prefix,
                    })
                    .collect(),
                more,
            )),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected list response: {other:?}"
            ))),
        }
    }

    async fn payer_allocation(
        &self,
        action: BandwidthAction,
        uplink_id: NodeId,
        uplink_key: [u8; 32],
    ) -> Result<PayerBandwidthAllocation, PointerDbError> {
        match self
            .exchange(&PointerRequest::PayerAllocation {
                api_key: self.key(),
                action,
                uplink_id,
                uplink_key,
            })
            .await?
        {
            PointerResponse::Allocation { payer } => Ok(payer),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected allocation response: {other:?}"
            ))),
        }
    }

    async fn authorization(&self) -> Result<SignedMessage, PointerDbError> {
        match self
            .exchange(&PointerRequest::Authorization { api_key: self.key() })
            .await?
        {
            PointerResponse::Authorized { authorization } => Ok(authorization),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected authorization response: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl orbit_overlay::NodeSelector for RemotePointers {
    async fn choose_nodes(
        &self,
        options: &orbit_overlay::ChooseOptions,
    ) -> Result<Vec<NodeDescriptor>, orbit_overlay::OverlayError> {
        let response = self
            .exchange(&PointerRequest::ChooseNodes {
                api_key: self.key(),
                amount: options.amount as u32,
                space: options.space,
                excluded: options.excluded.clone(),
            })
            .await
            .map_err(|e| orbit_overlay::OverlayError::Discovery(e.to_string()))?;
        match response {
            PointerResponse::Chosen { nodes } => Ok(nodes),
            PointerResponse::Error { message, .. } => {
                Err(orbit_overlay::OverlayError::Discovery(message))
            }
            other => Err(orbit_overlay::OverlayError::Discovery(format!(
                "unexpected choose response: {other:?}"
            ))),
        }
    }

    async fn lookup_nodes(
        &self,
        ids: &[NodeId],
    ) -> Result<Vec<Option<NodeDescriptor>>, orbit_overlay::OverlayError> {
        let response = self
            .exchange(&PointerRequest::BulkLookup {
                api_key: self.key(),
                ids: ids.to_vec(),
            })
            .await
            .map_err(|e| orbit_overlay::OverlayError::Discovery(e.to_string()))?;
        match response {
            PointerResponse::Resolved { nodes } => Ok(nodes),
            PointerResponse::Error { message, .. } => {
                Err(orbit_overlay::OverlayError::Discovery(message))
            }
            other => Err(orbit_overlay::OverlayError::Discovery(format!(
                "unexpected lookup response: {other:?}"
            ))),
        }
    }
}

impl RemotePointers {
    /// Creates a bucket on the satellite.
    pub async fn create_bucket(&self, name: &str) -> Result<(), PointerDbError> {
        match self
            .exchange(&PointerRequest::CreateBucket {
                api_key: self.key(),
                name: name.to_string(),
            })
            .await?
        {
            PointerResponse::Buckets { .. } => Ok(()),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected bucket response: {other:?}"
            ))),
        }
    }

    /// Deletes an empty bucket.
    pub async fn delete_bucket(&self, name: &str) -> Result<(), PointerDbError> {
        match self
            .exchange(&PointerRequest::DeleteBucket {
                api_key: self.key(),
                name: name.to_string(),
            })
            .await?
        {
            PointerResponse::Buckets { .. } => Ok(()),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected bucket response: {other:?}"
            ))),
        }
    }

    /// Lists buckets.
    pub async fn list_buckets(&self) -> Result<Vec<orbit_proto::Bucket>, PointerDbError> {
        match self
            .exchange(&PointerRequest::ListBuckets { api_key: self.key() })
            .await?
        {
            PointerResponse::Buckets { buckets } => Ok(buckets),
            PointerResponse::Error { kind, message } => Err(error_from_wire(kind, message)),
            other => Err(PointerDbError::Validation(format!(
                "unexpected bucket response: {other:?}"
            ))),
        }
    }
}
