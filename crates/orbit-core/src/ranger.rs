//! Random-access byte sources.
//!
//! A `Ranger` exposes a total size plus range reads, which lets the download
//! path dial piece readers lazily and read single stripes for audits without
//! fetching whole pieces.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

/// Errors from range reads.
#[derive(Debug, Error)]
pub enum RangerError {
    /// Offset or length fall outside the source.
    #[error("invalid range: offset {offset}, length {length}, size {size}")]
    InvalidRange {
        /// Requested offset.
        offset: i64,
        /// Requested length.
        length: i64,
        /// Source size.
        size: i64,
    },

    /// IO error from the underlying source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Source-specific failure.
    #[error("{0}")]
    Other(String),
}

/// A reader produced by a range request.
pub type RangeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Random-access byte source with a known size.
#[async_trait]
pub trait Ranger: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> i64;

    /// Opens a reader over `[offset, offset + length)`.
    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError>;
}

/// Validates a `[offset, offset + length)` window against a source size.
pub fn check_range(offset: i64, length: i64, size: i64) -> Result<(), RangerError> {
    if offset < 0 || length < 0 || offset + length > size {
        return Err(RangerError::InvalidRange { offset, length, size });
    }
    Ok(())
}

/// Reads an entire ranger into memory.
pub async fn read_all(ranger: &dyn Ranger) -> Result<Vec<u8>, RangerError> {
    let mut reader = ranger.range(0, ranger.size()).await?;
    let mut data = Vec::with_capacity(ranger.size().max(0) as usize);
    reader.read_to_end(&mut data).await?;
    Ok(data)
}

/// In-memory ranger over immutable bytes.
#[derive(Debug, Clone)]
pub struct ByteRanger {
    data: Bytes,
}

impl ByteRanger {
    /// Creates a ranger over the given bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl Ranger for ByteRanger {
    fn size(&self) -> i64 {
        self.data.len() as i64
    }

    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError> {
        check_range(offset, length, self.size())?;
        let slice = self.data.slice(offset as usize..(offset + length) as usize);
        Ok(Box::new(std::io::Cursor::new(slice)))
    }
}

/// Ranger over a file on disk; each range opens an independent handle so
/// concurrent readers never share a cursor.
#[derive(Debug, Clone)]
pub struct FileRanger {
    path: PathBuf,
    size: i64,
}

impl FileRanger {
    /// Opens a file ranger, recording the current file size.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RangerError> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        Ok(Self {
            path,
            size: meta.len() as i64,
        })
    }
}

#[async_trait]
impl Ranger for FileRanger {
    fn size(&self) -> i64 {
        self.size
    }

    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError> {
        check_range(offset, length, self.size)?;
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset as u64)).await?;
        Ok(Box::new(file.take(length as u64)))
    }
}
