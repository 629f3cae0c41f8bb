//! The pointer service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use orbit_core::{
    ApiKey, CanonicalDecode, CanonicalEncode, Keypair, NodeId, SerialNumber, Timestamp,
};
use orbit_kv::{list_v2, KeyValueStore, KvError, ListOptions};
use orbit_overlay::OverlayCache;
use orbit_proto::{
    meta_flags, BandwidthAction, Bucket, NodeDescriptor, PayerAllocationData,
    PayerBandwidthAllocation, Pointer, SignedMessage,
};

use crate::PointerDbError;

const POINTER_PREFIX: &str = "pointers/";
const BUCKET_PREFIX: &str = "buckets/";
const RECLAIM_PREFIX: &str = "reclaim/";

/// Pointer service configuration.
#[derive(Debug, Clone)]
pub struct PointerDbConfig {
    /// Key uplinks must present.
    pub api_key: ApiKey,
    /// Remote segments below this size are rejected.
    pub min_remote_segment_size: i64,
    /// Inline segments above this size are rejected.
    pub max_inline_segment_size: usize,
    /// Resolve referenced nodes through the overlay on Get.
    pub attach_nodes: bool,
    /// Lifetime of issued bandwidth allocations.
    pub bandwidth_expiration: Duration,
    /// Byte cap written into issued allocations.
    pub allocation_max_size: i64,
}

impl Default for PointerDbConfig {
    fn default() -> Self {
        Self {
            api_key: ApiKey::random(),
            min_remote_segment_size: 1,
            max_inline_segment_size: 4096,
            attach_nodes: true,
            bandwidth_expiration: Duration::from_secs(24 * 3600),
            allocation_max_size: 64 << 30,
        }
    }
}

/// A pointer returned by Get, with resolved nodes and a GET allocation.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// The stored pointer.
    pub pointer: Pointer,
    /// Referenced nodes, position-preserved (`None` for unknown nodes).
    /// Present only for remote pointers when node attachment is on.
    pub nodes: Option<Vec<Option<NodeDescriptor>>>,
    /// Freshly signed GET allocation.
    pub payer: PayerBandwidthAllocation,
    /// Authorization for piece requests.
    pub authorization: SignedMessage,
}

/// A listing request.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Path prefix; a trailing delimiter is implied.
    pub prefix: String,
    /// Exclusive lower bound relative to the prefix.
    pub start_after: String,
    /// Exclusive upper bound relative to the prefix.
    pub end_before: String,
    /// Return every path instead of collapsing directories.
    pub recursive: bool,
    /// Page size; 0 means the service maximum.
    pub limit: usize,
    /// Which pointer fields to include (see [`meta_flags`]).
    pub meta_flags: u32,
}

/// One listing result.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerItem {
    /// Path relative to the requested prefix.
    pub path: String,
    /// Pointer projection per the requested meta flags.
    pub pointer: Option<Pointer>,
    /// True for collapsed directory entries.
    pub is_prefix: bool,
}

/// The pointer metadata service.
pub struct PointerDb {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<OverlayCache>,
    config: PointerDbConfig,
    keypair: Arc<Keypair>,
    satellite_id: NodeId,
    reclaim_seq: AtomicU64,
}

impl PointerDb {
    /// Creates the service.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        cache: Arc<OverlayCache>,
        config: PointerDbConfig,
        keypair: Arc<Keypair>,
        satellite_id: NodeId,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            keypair,
            satellite_id,
            reclaim_seq: AtomicU64::new(Timestamp::now().as_millis() as u64),
        }
    }

    /// This satellite's identity.
    pub fn satellite_id(&self) -> NodeId {
        self.satellite_id
    }

    /// The overlay cache this service resolves nodes through.
    pub fn cache(&self) -> &Arc<OverlayCache> {
        &self.cache
    }

    /// The satellite signing key's public half.
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    fn check_auth(&self, api_key: &ApiKey) -> Result<(), PointerDbError> {
        if !self.config.api_key.matches(api_key) {
            warn!("unauthorized pointer request");
            return Err(PointerDbError::Unauthenticated);
        }
        Ok(())
    }

    /// Validates a caller credential.
    pub fn check_api_key(&self, api_key: &ApiKey) -> Result<(), PointerDbError> {
        self.check_auth(api_key)
    }

    fn pointer_key(path: &str) -> Vec<u8> {
        let mut key = POINTER_PREFIX.as_bytes().to_vec();
        key.extend_from_slice(path.as_bytes());
        key
    }

    fn validate_segment(&self, pointer: &Pointer) -> Result<(), PointerDbError> {
        pointer.validate()?;
        if pointer.remote_segment().is_some()
            && pointer.segment_size < self.config.min_remote_segment_size
        {
            return Err(PointerDbError::Validation(format!(
                "remote segment size {} less than minimum allowed {}",
                pointer.segment_size, self.config.min_remote_segment_size
            )));
        }
        if let Some(inline) = pointer.inline_segment() {
            if inline.len() > self.config.max_inline_segment_size {
                return Err(PointerDbError::Validation(format!(
                    "inline segment size {} greater than maximum allowed {}",
                    inline.len(),
                    self.config.max_inline_segment_size
                )));
            }
        }
        Ok(())
    }

    /// Stores a pointer at `path`, stamping its creation time.
    ///
    /// Overwriting a remote pointer queues its pieces for reclamation
    /// instead of leaking them.
    pub fn put(
        &self,
        api_key: &ApiKey,
        path: &str,
        mut pointer: Pointer,
    ) -> Result<(), PointerDbError> {
        self.validate_segment(&pointer)?;
        self.check_auth(api_key)?;

        pointer.creation = Timestamp::now();

        let key = Self::pointer_key(path);
        if let Ok(raw) = self.store.get(&key) {
            if let Ok(replaced) = Pointer::from_bytes(&raw) {
                if replaced.remote_segment().is_some() {
                    self.queue_reclamation(&replaced)?;
                }
            }
        }

        self.store.put(&key, &pointer.to_vec())?;
        debug!(path, "stored pointer");
        Ok(())
    }

    /// Fetches the pointer at `path`, resolving nodes and attaching a fresh
    /// GET allocation.
    pub fn get(&self, api_key: &ApiKey, path: &str) -> Result<GetResult, PointerDbError> {
        self.check_auth(api_key)?;

        let raw = match self.store.get(&Self::pointer_key(path)) {
            Ok(raw) => raw,
            Err(KvError::NotFound) => return Err(PointerDbError::NotFound),
            Err(err) => return Err(err.into()),
        };
        let pointer =
            Pointer::from_bytes(&raw).map_err(|e| PointerDbError::Validation(e.to_string()))?;

        let nodes = match (self.config.attach_nodes, pointer.remote_segment()) {
            (true, Some(segment)) => {
                let ids: Vec<NodeId> = segment.pieces.iter().map(|p| p.node_id).collect();
                Some(self.cache.bulk_lookup(&ids)?)
            }
            _ => None,
        };

        let payer = self.issue_allocation_unchecked(BandwidthAction::Get, None)?;
        Ok(GetResult {
            pointer,
            nodes,
            payer,
            authorization: self.authorization(),
        })
    }

    /// Removes the pointer at `path`, returning it for piece cleanup.
    pub fn delete(&self, api_key: &ApiKey, path: &str) -> Result<Pointer, PointerDbError> {
        self.check_auth(api_key)?;

        let key = Self::pointer_key(path);
        let raw = match self.store.get(&key) {
            Ok(raw) => raw,
            Err(KvError::NotFound) => return Err(PointerDbError::NotFound),
            Err(err) => return Err(err.into()),
        };
        let pointer =
            Pointer::from_bytes(&raw).map_err(|e| PointerDbError::Validation(e.to_string()))?;
        self.store.delete(&key)?;
        debug!(path, "deleted pointer");
        Ok(pointer)
    }

    /// Lists pointers under a prefix.
    pub fn list(
        &self,
        api_key: &ApiKey,
        request: &ListRequest,
    ) -> Result<(Vec<PointerItem>, bool), PointerDbError> {
        self.check_auth(api_key)?;

        let mut prefix = POINTER_PREFIX.as_bytes().to_vec();
        prefix.extend_from_slice(request.prefix.as_bytes());
        if !request.prefix.is_empty() && !request.prefix.ends_with('/') {
            prefix.push(b'/');
        }

        let (raw_items, more) = list_v2(
            self.store.as_ref(),
            ListOptions {
                prefix,
                start_after: request.start_after.as_bytes().to_vec(),
                end_before: request.end_before.as_bytes().to_vec(),
                recursive: request.recursive,
                limit: request.limit,
                include_values: request.meta_flags != meta_flags::NONE,
            },
        )?;

        let mut items = Vec::with_capacity(raw_items.len());
        for raw in raw_items {
            let path = String::from_utf8(raw.key)
                .map_err(|_| PointerDbError::Validation("non-UTF-8 path".into()))?;
            let pointer = match (raw.is_prefix, raw.value) {
                (false, Some(value)) => {
                    let full = Pointer::from_bytes(&value)
                        .map_err(|e| PointerDbError::Validation(e.to_string()))?;
                    Some(full.with_meta_flags(request.meta_flags))
                }
                _ => None,
            };
            items.push(PointerItem {
                path,
                pointer,
                is_prefix: raw.is_prefix,
            });
        }
        Ok((items, more))
    }

    /// Visits raw pointer records in ascending path order.
    ///
    /// The callback receives `(path, pointer)` and returns `false` to stop.
    pub fn iterate(
        &self,
        api_key: &ApiKey,
        first: &str,
        visit: &mut dyn FnMut(&str, &Pointer) -> bool,
    ) -> Result<(), PointerDbError> {
        self.check_auth(api_key)?;

        let mut start = POINTER_PREFIX.as_bytes().to_vec();
        start.extend_from_slice(first.as_bytes());

        self.store.iterate(&start, &mut |key, value| {
            if !key.starts_with(POINTER_PREFIX.as_bytes()) {
                return false;
            }
            let Ok(path) = std::str::from_utf8(&key[POINTER_PREFIX.len()..]) else {
                return true;
            };
            let Ok(pointer) = Pointer::from_bytes(value) else {
                return true;
            };
            visit(path, &pointer)
        })?;
        Ok(())
    }

    /// Issues a signed payer allocation for the given action.
    pub fn payer_allocation(
        &self,
        api_key: &ApiKey,
        action: BandwidthAction,
        uplink_id: NodeId,
        uplink_key: [u8; 32],
    ) -> Result<PayerBandwidthAllocation, PointerDbError> {
        self.check_auth(api_key)?;
        self.issue_allocation_unchecked(action, Some((uplink_id, uplink_key)))
    }

    fn issue_allocation_unchecked(
        &self,
        action: BandwidthAction,
        uplink: Option<(NodeId, [u8; 32])>,
    ) -> Result<PayerBandwidthAllocation, PointerDbError> {
        let created = Timestamp::now();
        let expiration = created.plus(self.config.bandwidth_expiration);
        if expiration <= created {
            return Err(PointerDbError::Validation(
                "allocation expiration must lie in the future".into(),
            ));
        }
        let (uplink_id, pub_key) =
            uplink.unwrap_or((NodeId::zero(), self.keypair.public_key()));
        let data = PayerAllocationData {
            satellite_id: self.satellite_id,
            uplink_id,
            action,
            created,
            expiration,
            serial: SerialNumber::random(),
            max_size: self.config.allocation_max_size,
            pub_key,
        };
        Ok(PayerBandwidthAllocation::sign_with(&self.keypair, &data))
    }

    /// The signed authorization piece requests carry.
    pub fn authorization(&self) -> SignedMessage {
        SignedMessage::sign_with(&self.keypair, self.satellite_id.as_slice().to_vec())
    }

    fn queue_reclamation(&self, pointer: &Pointer) -> Result<(), PointerDbError> {
        let seq = self.reclaim_seq.fetch_add(1, Ordering::SeqCst);
        let key = format!("{RECLAIM_PREFIX}{seq:020}");
        self.store.put(key.as_bytes(), &pointer.to_vec())?;
        debug!("queued replaced pointer for piece reclamation");
        Ok(())
    }

    /// Pops up to `limit` replaced pointers whose pieces await deletion.
    pub fn take_reclaimable(&self, limit: usize) -> Result<Vec<Pointer>, PointerDbError> {
        let mut keys = Vec::new();
        self.store
            .iterate(RECLAIM_PREFIX.as_bytes(), &mut |key, _| {
                if !key.starts_with(RECLAIM_PREFIX.as_bytes()) || keys.len() >= limit {
                    return false;
                }
                keys.push(key.to_vec());
                true
            })?;

        let mut pointers = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(raw) = self.store.get(&key) {
                if let Ok(pointer) = Pointer::from_bytes(&raw) {
                    pointers.push(pointer);
                }
            }
            self.store.delete(&key)?;
        }
        Ok(pointers)
    }

    // Bucket records live in the same store under their own prefix.

    fn bucket_key(name: &str) -> Vec<u8> {
        format!("{BUCKET_PREFIX}{name}").into_bytes()
    }

    /// Creates a bucket record.
    pub fn create_bucket(&self, api_key: &ApiKey, name: &str) -> Result<Bucket, PointerDbError> {
        self.check_auth(api_key)?;
        if !Bucket::valid_name(name) {
            return Err(PointerDbError::Validation(format!(
                "invalid bucket name {name:?}"
            )));
        }
        if self.store.get(&Self::bucket_key(name)).is_ok() {
            return Err(PointerDbError::Validation(format!(
                "bucket {name:?} already exists"
            )));
        }
        let bucket = Bucket::new(name, Timestamp::now());
        self.store.put(&Self::bucket_key(name), &bucket.to_vec())?;
        Ok(bucket)
    }

    /// Returns a bucket record.
    pub fn get_bucket(&self, api_key: &ApiKey, name: &str) -> Result<Bucket, PointerDbError> {
        self.check_auth(api_key)?;
        match self.store.get(&Self::bucket_key(name)) {
            Ok(raw) => {
                Bucket::from_bytes(&raw).map_err(|e| PointerDbError::Validation(e.to_string()))
            }
            Err(KvError::NotFound) => Err(PointerDbError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Lists every bucket.
    pub fn list_buckets(&self, api_key: &ApiKey) -> Result<Vec<Bucket>, PointerDbError> {
        self.check_auth(api_key)?;
        let mut buckets = Vec::new();
        self.store
            .iterate(BUCKET_PREFIX.as_bytes(), &mut |key, value| {
                if !key.starts_with(BUCKET_PREFIX.as_bytes()) {
                    return false;
                }
                if let Ok(bucket) = Bucket::from_bytes(value) {
                    buckets.push(bucket);
                }
                true
            })?;
        Ok(buckets)
    }

    /// Deletes a bucket record; the bucket must hold no objects.
    pub fn delete_bucket(&self, api_key: &ApiKey, name: &str) -> Result<(), PointerDbError> {
        self.check_auth(api_key)?;
        let (items, _) = self.list(
            api_key,
            &ListRequest {
                prefix: format!("{name}/"),
                limit: 1,
                ..Default::default()
            },
        )?;
        if !items.is_empty() {
            return Err(PointerDbError::Validation(format!(
                "bucket {name:?} is not empty"
            )));
        }
        self.store.delete(&Self::bucket_key(name))?;
        Ok(())
    }
}
