//! Object store: path and content encryption over the segment pipeline.
//!
//! Objects live at `bucket/encrypted-components`; the bucket name stays in
//! plaintext so the satellite can group by namespace, while every path
//! component below it is encrypted deterministically and the content is
//! encrypted client-side before segmentation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio::sync::watch;

use orbit_core::crypto::{
    decrypt_path, derive_path_key, derive_segment_key, encrypt_path, TAG_SIZE,
};
use orbit_core::ranger::Ranger;
use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, RootKey, Timestamp};
use orbit_pointerdb::ListRequest;
use orbit_proto::meta_flags;

use crate::encryption::DecryptedRanger;
use crate::segments::{SegmentStore, SizeReader};
use crate::PipelineError;

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Plaintext object size in bytes.
    pub size: i64,
    /// Caller-supplied metadata.
    pub user_defined: Vec<u8>,
    /// Last modification time.
    pub modified: Timestamp,
    /// Expiration; unset means never.
    pub expiration: Timestamp,
}

/// The record serialized into the pointer metadata blob.
struct ObjectRecord {
    plaintext_size: i64,
    user_defined: Vec<u8>,
}

impl CanonicalEncode for ObjectRecord {
    fn encode(&self, buf: &mut BytesMut) {
        self.plaintext_size.encode(buf);
        self.user_defined.encode(buf);
    }
}

impl CanonicalDecode for ObjectRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            plaintext_size: i64::decode(buf)?,
            user_defined: Vec::<u8>::decode(buf)?,
        })
    }
}

/// One object listing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectItem {
    /// Decrypted object path relative to the bucket.
    pub path: String,
    /// Metadata, absent for prefix entries.
    pub meta: Option<ObjectMeta>,
    /// True for collapsed directory entries.
    pub is_prefix: bool,
}

/// Client-side encrypted object store.
pub struct ObjectStore {
    segments: SegmentStore,
    root: Arc<RootKey>,
    in_block: usize,
}

impl ObjectStore {
    /// Creates an object store over a segment pipeline.
    ///
    /// The encryption block size is derived from the erasure share size so
    /// ciphertext blocks tile shares.
    pub fn new(segments: SegmentStore, root: Arc<RootKey>) -> Result<Self, PipelineError> {
        let share_size = segments.strategy().share_size();
        if share_size <= TAG_SIZE {
            return Err(PipelineError::Validation(format!(
                "share size {share_size} leaves no room for the {TAG_SIZE}-byte tag"
            )));
        }
        Ok(Self {
            segments,
            root,
            in_block: share_size - TAG_SIZE,
        })
    }

    /// The underlying segment store.
    pub fn segments(&self) -> &SegmentStore {
        &self.segments
    }

    fn full_path(bucket: &str, path: &str) -> String {
        format!("{bucket}/{path}")
    }

    fn bucket_key(&self, bucket: &str, path: &str) -> Result<RootKey, PipelineError> {
        Ok(derive_path_key(
            &Self::full_path(bucket, path),
            &self.root,
            1,
        )?)
    }

    fn encrypted_path(&self, bucket: &str, path: &str) -> Result<String, PipelineError> {
        let bucket_key = self.bucket_key(bucket, path)?;
        Ok(format!("{bucket}/{}", encrypt_path(path, &bucket_key)?))
    }

    /// Uploads an object.
    pub async fn put(
        &self,
        bucket: &str,
        path: &str,
        data: impl AsyncRead + Send + Unpin + 'static,
        user_defined: Vec<u8>,
        expiration: Timestamp,
        cancel: watch::Receiver<bool>,
    ) -> Result<ObjectMeta, PipelineError> {
        let full = Self::full_path(bucket, path);
        let (key, first_nonce) = derive_segment_key(&full, &self.root, 0)?;
        let encrypted_path = self.encrypted_path(bucket, path)?;

        let (sized, counter) = SizeReader::new(data);
        let ciphertext = crate::encryption::encrypt_stream(sized, key, first_nonce, self.in_block);

        let info_counter = counter.clone();
        let meta = self
            .segments
            .put(ciphertext, expiration, cancel, move || {
                let record = ObjectRecord {
                    plaintext_size: info_counter.load(Ordering::SeqCst),
                    user_defined,
                };
                (encrypted_path, record.to_vec())
            })
            .await?;

        Ok(ObjectMeta {
            size: counter.load(Ordering::SeqCst),
            user_defined: decode_record(&meta.metadata)?.user_defined,
            modified: meta.modified,
            expiration: meta.expiration,
        })
    }

    /// Opens an object for reading.
    pub async fn get(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<(Arc<dyn Ranger>, ObjectMeta), PipelineError> {
        let full = Self::full_path(bucket, path);
        let (key, first_nonce) = derive_segment_key(&full, &self.root, 0)?;
        let encrypted_path = self.encrypted_path(bucket, path)?;

        let (ciphertext, meta) = self.segments.get(&encrypted_path).await?;
        let record = decode_record(&meta.metadata)?;

        let plaintext = DecryptedRanger::new(
            ciphertext,
            key,
            first_nonce,
            self.in_block,
            record.plaintext_size,
        );
        Ok((
            Arc::new(plaintext),
            ObjectMeta {
                size: record.plaintext_size,
                user_defined: record.user_defined,
                modified: meta.modified,
                expiration: meta.expiration,
            },
        ))
    }

    /// Returns object metadata without opening the content.
    pub async fn meta(&self, bucket: &str, path: &str) -> Result<ObjectMeta, PipelineError> {
        let encrypted_path = self.encrypted_path(bucket, path)?;
        let meta = self.segments.meta(&encrypted_path).await?;
        let record = decode_record(&meta.metadata)?;
        Ok(ObjectMeta {
            size: record.plaintext_size,
            user_defined: record.user_defined,
            modified: meta.modified,
            expiration: meta.expiration,
        })
    }

    /// Deletes an object.
    pub async fn delete(&self, bucket: &str, path: &str) -> Result<(), PipelineError> {
        let encrypted_path = self.encrypted_path(bucket, path)?;
        self.segments.delete(&encrypted_path).await
    }

    /// Lists objects in a bucket, decrypting their paths.
    pub async fn list(
        &self,
        bucket: &str,
        recursive: bool,
        limit: usize,
    ) -> Result<(Vec<ObjectItem>, bool), PipelineError> {
        // Any path below the bucket derives the same bucket key.
        let bucket_key = self.bucket_key(bucket, "")?;

        let (items, more) = self
            .segments
            .list(&ListRequest {
                prefix: bucket.to_string(),
                recursive,
                limit,
                meta_flags: meta_flags::ALL,
                ..Default::default()
            })
            .await?;

        let mut objects = Vec::with_capacity(items.len());
        for item in items {
            let path = if item.is_prefix {
                let stripped = item.path.trim_end_matches('/');
                format!("{}/", decrypt_path(stripped, &bucket_key)?)
            } else {
                decrypt_path(&item.path, &bucket_key)?
            };

            let meta = match item.meta {
                Some(meta) if !item.is_prefix => {
                    let record = decode_record(&meta.metadata)?;
                    Some(ObjectMeta {
                        size: record.plaintext_size,
                        user_defined: record.user_defined,
                        modified: meta.modified,
                        expiration: meta.expiration,
                    })
                }
                _ => None,
            };

            objects.push(ObjectItem {
                path,
                meta,
                is_prefix: item.is_prefix,
            });
        }
        Ok((objects, more))
    }
}

fn decode_record(metadata: &[u8]) -> Result<ObjectRecord, PipelineError> {
    ObjectRecord::from_bytes(metadata)
        .map_err(|e| PipelineError::Validation(format!("corrupt object record: {e}")))
}
