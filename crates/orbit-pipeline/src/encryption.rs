//! Streaming segment encryption.
//!
//! Plaintext is encrypted in fixed-size AES-GCM blocks before erasure
//! encoding; each output block carries its 16-byte tag, and the block nonce
//! is the segment's first nonce XORed with the block counter, so the read
//! path can decrypt any block independently.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use orbit_core::crypto::{block_nonce, decrypt_aes_gcm, encrypt_aes_gcm, NONCE_SIZE, TAG_SIZE};
use orbit_core::ranger::{check_range, RangeReader, Ranger, RangerError};
use orbit_net::ChannelReader;

/// Returns the ciphertext size for `plaintext_size` with the given input
/// block size.
pub fn ciphertext_size(plaintext_size: i64, in_block: usize) -> i64 {
    if plaintext_size == 0 {
        return 0;
    }
    let blocks = (plaintext_size + in_block as i64 - 1) / in_block as i64;
    plaintext_size + blocks * TAG_SIZE as i64
}

/// Spawns a block-wise encryptor over `source`, returning the ciphertext
/// stream.
///
/// Blocks are `in_block` plaintext bytes (the final block may be shorter);
/// each emits `len + 16` ciphertext bytes.
pub fn encrypt_stream(
    mut source: impl AsyncRead + Send + Unpin + 'static,
    key: [u8; 32],
    first_nonce: [u8; NONCE_SIZE],
    in_block: usize,
) -> ChannelReader {
    let (writer, reader) = ChannelReader::pipe(8);

    tokio::spawn(async move {
        let mut counter = 0u64;
        let mut block = vec![0u8; in_block];

        loop {
            let mut filled = 0usize;
            let eof = loop {
                match source.read(&mut block[filled..]).await {
                    Ok(0) => break true,
                    Ok(n) => {
                        filled += n;
                        if filled == in_block {
                            break false;
                        }
                    }
                    Err(err) => {
                        let _ = writer.send(Err(err)).await;
                        return;
                    }
                }
            };

            if filled > 0 {
                let nonce = block_nonce(&first_nonce, counter);
                counter += 1;
                match encrypt_aes_gcm(&key, &nonce, &block[..filled], &[]) {
                    Ok(ciphertext) => {
                        if writer.send(Ok(Bytes::from(ciphertext))).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = writer
                            .send(Err(std::io::Error::other(err.to_string())))
                            .await;
                        return;
                    }
                }
            }

            if eof {
                return;
            }
        }
    });

    reader
}

/// Ranger decrypting block-encrypted ciphertext back to plaintext.
pub struct DecryptedRanger {
    inner: Arc<dyn Ranger>,
    key: [u8; 32],
    first_nonce: [u8; NONCE_SIZE],
    in_block: usize,
    plaintext_size: i64,
}

impl DecryptedRanger {
    /// Wraps a ciphertext ranger.
    pub fn new(
        inner: Arc<dyn Ranger>,
        key: [u8; 32],
        first_nonce: [u8; NONCE_SIZE],
        in_block: usize,
        plaintext_size: i64,
    ) -> Self {
        Self {
            inner,
            key,
            first_nonce,
            in_block,
            plaintext_size,
        }
    }

    fn out_block(&self) -> i64 {
        (self.in_block + TAG_SIZE) as i64
    }
}

#[async_trait]
impl Ranger for DecryptedRanger {
    fn size(&self) -> i64 {
        self.plaintext_size
    }

    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError> {
        check_range(offset, length, self.plaintext_size)?;
        if length == 0 {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }

        let in_block = self.in_block as i64;
        let first_block = offset / in_block;
        let last_block = (offset + length - 1) / in_block;

        let ct_total = ciphertext_size(self.plaintext_size, self.in_block);
        let ct_offset = first_block * self.out_block();
        let ct_end = ((last_block + 1) * self.out_block()).min(ct_total);

        let mut reader = self.inner.range(ct_offset, ct_end - ct_offset).await?;
        let mut ciphertext = Vec::with_capacity((ct_end - ct_offset) as usize);
        reader
            .read_to_end(&mut ciphertext)
            .await
            .map_err(RangerError::Io)?;

        let mut plaintext = Vec::with_capacity((length + 2 * in_block) as usize);
        let mut counter = first_block as u64;
        for chunk in ciphertext.chunks(self.out_block() as usize) {
            let nonce = block_nonce(&self.first_nonce, counter);
            counter += 1;
            let block = decrypt_aes_gcm(&self.key, &nonce, chunk, &[])
                .map_err(|e| RangerError::Other(e.to_string()))?;
            plaintext.extend(block);
        }

        let skip = (offset - first_block * in_block) as usize;
        let window = plaintext[skip..skip + length as usize].to_vec();
        Ok(Box::new(std::io::Cursor::new(window)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::ranger::{read_all, ByteRanger};

    const IN_BLOCK: usize = 64;

    async fn encrypt_all(data: &[u8], key: [u8; 32], nonce: [u8; NONCE_SIZE]) -> Vec<u8> {
        let mut reader = encrypt_stream(std::io::Cursor::new(data.to_vec()), key, nonce, IN_BLOCK);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let key = [7u8; 32];
        let nonce = [3u8; NONCE_SIZE];
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

        let ciphertext = encrypt_all(&data, key, nonce).await;
        assert_eq!(ciphertext.len() as i64, ciphertext_size(data.len() as i64, IN_BLOCK));

        let ranger = DecryptedRanger::new(
            Arc::new(ByteRanger::new(ciphertext)),
            key,
            nonce,
            IN_BLOCK,
            data.len() as i64,
        );
        assert_eq!(read_all(&ranger).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_subrange_decryption() {
        let key = [9u8; 32];
        let nonce = [1u8; NONCE_SIZE];
        let data: Vec<u8> = (0..500).map(|i| (i % 256) as u8).collect();

        let ciphertext = encrypt_all(&data, key, nonce).await;
        let ranger = DecryptedRanger::new(
            Arc::new(ByteRanger::new(ciphertext)),
            key,
            nonce,
            IN_BLOCK,
            data.len() as i64,
        );

        // A window straddling block boundaries.
        let mut reader = ranger.range(60, 100).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[60..160]);
    }

    #[tokio::test]
    async fn test_ciphertext_size_arithmetic() {
        assert_eq!(ciphertext_size(0, 64), 0);
        assert_eq!(ciphertext_size(1, 64), 1 + 16);
        assert_eq!(ciphertext_size(64, 64), 64 + 16);
        assert_eq!(ciphertext_size(65, 64), 65 + 32);
        assert_eq!(ciphertext_size(128, 64), 128 + 32);
    }

    #[tokio::test]
    async fn test_tampered_block_fails() {
        let key = [5u8; 32];
        let nonce = [2u8; NONCE_SIZE];
        let data = vec![0x11u8; 200];

        let mut ciphertext = encrypt_all(&data, key, nonce).await;
        ciphertext[70] ^= 0xFF;

        let ranger = DecryptedRanger::new(
            Arc::new(ByteRanger::new(ciphertext)),
            key,
            nonce,
            IN_BLOCK,
            data.len() as i64,
        );
        assert!(read_all(&ranger).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let data = vec![0x22u8; 100];
        let nonce = [4u8; NONCE_SIZE];
        let ciphertext = encrypt_all(&data, [1u8; 32], nonce).await;

        let ranger = DecryptedRanger::new(
            Arc::new(ByteRanger::new(ciphertext)),
            [2u8; 32],
            nonce,
            IN_BLOCK,
            data.len() as i64,
        );
        assert!(read_all(&ranger).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let ciphertext = encrypt_all(&[], [0u8; 32], [0u8; NONCE_SIZE]).await;
        assert!(ciphertext.is_empty());
    }
}
