//! On-disk piece layout.
//!
//! Pieces live under a two-level sharded directory derived from their id:
//! `dir/id[0..2]/id[2..4]/id[4..]`, keeping directory fan-out bounded.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use orbit_core::ranger::{FileRanger, RangeReader, Ranger};
use orbit_core::MIN_PIECE_ID_LENGTH;

use crate::PieceStoreError;

/// Content-addressed piece directory.
#[derive(Debug, Clone)]
pub struct PieceStorage {
    dir: PathBuf,
}

impl PieceStorage {
    /// Creates storage rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolves the on-disk path of a rendered piece id.
    pub fn path_for(&self, id: &str) -> Result<PathBuf, PieceStoreError> {
        if id.len() < MIN_PIECE_ID_LENGTH {
            return Err(PieceStoreError::Validation(format!(
                "piece id of {} chars is shorter than {}",
                id.len(),
                MIN_PIECE_ID_LENGTH
            )));
        }
        if id.contains(['/', '\\', '.']) {
            return Err(PieceStoreError::Validation("piece id contains path separators".into()));
        }
        Ok(self.dir.join(&id[0..2]).join(&id[2..4]).join(&id[4..]))
    }

    /// Creates the file for a new piece; fails if the piece already exists.
    pub async fn writer(&self, id: &str) -> Result<fs::File, PieceStoreError> {
        let path = self.path_for(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await?;
        Ok(file)
    }

    /// Writes a whole piece in one call (used by tests and repair fixtures).
    pub async fn store(&self, id: &str, data: &[u8]) -> Result<(), PieceStoreError> {
        let mut file = self.writer(id).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Opens a section reader over `[offset, offset + length)`.
    ///
    /// A negative `length` reads to the end of the piece; reads past the end
    /// are clamped.
    pub async fn reader(
        &self,
        id: &str,
        offset: i64,
        length: i64,
    ) -> Result<(RangeReader, i64), PieceStoreError> {
        let path = self.path_for(id)?;
        let ranger = match FileRanger::open(&path).await {
            Ok(ranger) => ranger,
            Err(_) => return Err(PieceStoreError::NotFound),
        };

        let size = ranger.size();
        if offset < 0 || offset >= size {
            return Err(PieceStoreError::Validation(format!(
                "invalid offset {offset} for piece of {size} bytes"
            )));
        }

        let mut to_read = if length < 0 { size - offset } else { length };
        if offset + to_read > size {
            to_read = size - offset;
        }

        let reader = ranger
            .range(offset, to_read)
            .await
            .map_err(|e| PieceStoreError::Io(std::io::Error::other(e.to_string())))?;
        Ok((reader, to_read))
    }

    /// Returns the stored size of a piece.
    pub async fn size(&self, id: &str) -> Result<i64, PieceStoreError> {
        let path = self.path_for(id)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len() as i64),
            Err(_) => Err(PieceStoreError::NotFound),
        }
    }

    /// Deletes a piece; deleting an absent piece is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), PieceStoreError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(piece = %&id[..8.min(id.len())], "deleted piece");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const ID: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[tokio::test]
    async fn test_sharded_path_layout() {
        let storage = PieceStorage::new("/data/pieces");
        let path = storage.path_for(ID).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/pieces/00/11/2233445566778899aabbccddeeff00112233445566778899aabbccddeeff")
        );
    }

    #[tokio::test]
    async fn test_short_id_rejected() {
        let storage = PieceStorage::new("/data/pieces");
        assert!(matches!(
            storage.path_for("shortid"),
            Err(PieceStoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let storage = PieceStorage::new("/data/pieces");
        assert!(storage.path_for("..%2f..%2f..%2fetc%2fpasswd00").is_err());
    }

    #[tokio::test]
    async fn test_store_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PieceStorage::new(dir.path());

        storage.store(ID, b"piece content").await.unwrap();
        assert_eq!(storage.size(ID).await.unwrap(), 13);

        let (mut reader, len) = storage.reader(ID, 6, 7).await.unwrap();
        assert_eq!(len, 7);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"content");

        storage.delete(ID).await.unwrap();
        assert!(matches!(storage.size(ID).await, Err(PieceStoreError::NotFound)));
        storage.delete(ID).await.unwrap();
    }

    #[tokio::test]
    async fn test_double_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PieceStorage::new(dir.path());
        storage.store(ID, b"one").await.unwrap();
        assert!(storage.store(ID, b"two").await.is_err());
    }

    #[tokio::test]
    async fn test_read_clamped_and_negative_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PieceStorage::new(dir.path());
        storage.store(ID, b"0123456789").await.unwrap();

        let (_, len) = storage.reader(ID, 8, 100).await.unwrap();
        assert_eq!(len, 2);

        let (mut reader, len) = storage.reader(ID, 4, -1).await.unwrap();
        assert_eq!(len, 6);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"456789");

        assert!(storage.reader(ID, 10, 1).await.is_err());
        assert!(storage.reader(ID, -1, 1).await.is_err());
    }
}
