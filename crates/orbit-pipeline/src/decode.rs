//! Erasure fan-in: a ranger over the decoded segment.
//!
//! A range request maps to a stripe window, fetches that window's share
//! ranges from the available piece rangers concurrently, and decodes with
//! the first k that answer. Stalled or failed readers beyond k are
//! abandoned.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::debug;

use orbit_core::ranger::{check_range, RangeReader, Ranger, RangerError};
use orbit_erasure::ErasureScheme;

/// Ranger decoding a segment from its piece rangers.
pub struct DecodedRanger {
    rangers: HashMap<usize, Arc<dyn Ranger>>,
    scheme: Arc<dyn ErasureScheme>,
    /// Segment ciphertext size padded to the stripe boundary.
    padded_size: i64,
}

impl DecodedRanger {
    /// Builds a decoder over the available piece rangers.
    ///
    /// Fails when fewer than k rangers are supplied or `padded_size` does
    /// not tile into whole stripes.
    pub fn new(
        rangers: HashMap<usize, Arc<dyn Ranger>>,
        scheme: Arc<dyn ErasureScheme>,
        padded_size: i64,
    ) -> Result<Self, RangerError> {
        if rangers.len() < scheme.required_count() {
            return Err(RangerError::Other(format!(
                "{} piece rangers for a scheme requiring {}",
                rangers.len(),
                scheme.required_count()
            )));
        }
        if padded_size % scheme.stripe_size() as i64 != 0 {
            return Err(RangerError::Other(format!(
                "padded size {padded_size} does not align to stripes of {}",
                scheme.stripe_size()
            )));
        }
        Ok(Self {
            rangers,
            scheme,
            padded_size,
        })
    }

    /// Reads the share window for `stripe..stripe + count` from the first k
    /// pieces that answer.
    async fn fetch_shares(
        &self,
        first_stripe: i64,
        stripe_count: i64,
    ) -> Result<HashMap<usize, Vec<u8>>, RangerError> {
        let share_size = self.scheme.share_size() as i64;
        let offset = first_stripe * share_size;
        let length = stripe_count * share_size;
        let required = self.scheme.required_count();

        let mut tasks = JoinSet::new();
        for (&index, ranger) in &self.rangers {
            let ranger = ranger.clone();
            tasks.spawn(async move {
                let mut reader = ranger.range(offset, length).await?;
                let mut data = Vec::with_capacity(length as usize);
                reader
                    .read_to_end(&mut data)
                    .await
                    .map_err(RangerError::Io)?;
                if data.len() != length as usize {
                    return Err(RangerError::Other(format!(
                        "piece {index} returned {} of {} bytes",
                        data.len(),
                        length
                    )));
                }
                Ok::<_, RangerError>((index, data))
            });
        }

        let mut shares = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, data))) => {
                    shares.insert(index, data);
                    if shares.len() >= required {
                        // Enough shares; cancel the stragglers.
                        tasks.abort_all();
                        return Ok(shares);
                    }
                }
                Ok(Err(err)) => {
                    debug!(error = %err, "piece read failed");
                }
                Err(_) => {}
            }
        }

        Err(RangerError::Other(format!(
            "only {} of {} required shares were readable",
            shares.len(),
            required
        )))
    }
}

#[async_trait]
impl Ranger for DecodedRanger {
    fn size(&self) -> i64 {
        self.padded_size
    }

    async fn range(&self, offset: i64, length: i64) -> Result<RangeReader, RangerError> {
        check_range(offset, length, self.padded_size)?;
        if length == 0 {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }

        let stripe_size = self.scheme.stripe_size() as i64;
        let share_size = self.scheme.share_size();
        let first_stripe = offset / stripe_size;
        let last_stripe = (offset + length - 1) / stripe_size;
        let stripe_count = last_stripe - first_stripe + 1;

        let shares = self.fetch_shares(first_stripe, stripe_count).await?;

        let mut decoded = Vec::with_capacity((stripe_count * stripe_size) as usize);
        for stripe_index in 0..stripe_count as usize {
            let from = stripe_index * share_size;
            let to = from + share_size;
            let subset: HashMap<usize, Vec<u8>> = shares
                .iter()
                .map(|(&idx, data)| (idx, data[from..to].to_vec()))
                .collect();
            let stripe = self
                .scheme
                .decode(&subset)
                .map_err(|e| RangerError::Other(e.to_string()))?;
            decoded.extend(stripe);
        }

        let skip = (offset - first_stripe * stripe_size) as usize;
        let window = decoded[skip..skip + length as usize].to_vec();
        Ok(Box::new(std::io::Cursor::new(window)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_core::ranger::{read_all, ByteRanger};
    use orbit_core::pad;
    use orbit_erasure::RsScheme;

    fn build(
        data: &[u8],
        k: usize,
        n: usize,
        share: usize,
        keep: &[usize],
    ) -> (DecodedRanger, Vec<u8>) {
        let scheme: Arc<dyn ErasureScheme> = Arc::new(RsScheme::new(k, n, share).unwrap());
        let mut padded = data.to_vec();
        pad::pad(&mut padded, scheme.stripe_size());

        let mut piece_data: Vec<Vec<u8>> = vec![Vec::new(); n];
        for stripe in padded.chunks(scheme.stripe_size()) {
            let shares = scheme.encode(stripe).unwrap();
            for (i, share) in shares.into_iter().enumerate() {
                piece_data[i].extend(share);
            }
        }

        let mut rangers: HashMap<usize, Arc<dyn Ranger>> = HashMap::new();
        for &i in keep {
            rangers.insert(i, Arc::new(ByteRanger::new(piece_data[i].clone())));
        }
        let padded_len = padded.len() as i64;
        (
            DecodedRanger::new(rangers, scheme, padded_len).unwrap(),
            padded,
        )
    }

    #[tokio::test]
    async fn test_full_read_from_all_pieces() {
        let data: Vec<u8> = (0..200u8).collect();
        let (ranger, padded) = build(&data, 2, 4, 8, &[0, 1, 2, 3]);
        assert_eq!(read_all(&ranger).await.unwrap(), padded);
    }

    #[tokio::test]
    async fn test_read_from_parity_only() {
        let data: Vec<u8> = (0..100u8).collect();
        let (ranger, padded) = build(&data, 2, 4, 8, &[2, 3]);
        assert_eq!(read_all(&ranger).await.unwrap(), padded);
    }

    #[tokio::test]
    async fn test_subrange_mid_stripe() {
        let data: Vec<u8> = (0..=255u8).collect();
        let (ranger, padded) = build(&data, 2, 4, 8, &[0, 2]);

        let mut reader = ranger.range(5, 30).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &padded[5..35]);
    }

    #[tokio::test]
    async fn test_too_few_rangers_rejected() {
        let data = vec![1u8; 64];
        let scheme: Arc<dyn ErasureScheme> = Arc::new(RsScheme::new(3, 5, 8).unwrap());
        let mut rangers: HashMap<usize, Arc<dyn Ranger>> = HashMap::new();
        rangers.insert(0, Arc::new(ByteRanger::new(data)));

        assert!(DecodedRanger::new(rangers, scheme, 24).is_err());
    }

    #[tokio::test]
    async fn test_failing_reader_tolerated() {
        struct FailingRanger {
            size: i64,
        }

        #[async_trait]
        impl Ranger for FailingRanger {
            fn size(&self) -> i64 {
                self.size
            }
            async fn range(&self, _o: i64, _l: i64) -> Result<RangeReader, RangerError> {
                Err(RangerError::Other("node is gone".into()))
            }
        }

        let data: Vec<u8> = (0..200u8).collect();
        let scheme: Arc<dyn ErasureScheme> = Arc::new(RsScheme::new(2, 4, 8).unwrap());
        let mut padded = data.clone();
        pad::pad(&mut padded, scheme.stripe_size());

        let mut piece_data: Vec<Vec<u8>> = vec![Vec::new(); 4];
        for stripe in padded.chunks(scheme.stripe_size()) {
            for (i, share) in scheme.encode(stripe).unwrap().into_iter().enumerate() {
                piece_data[i].extend(share);
            }
        }

        let piece_size = piece_data[0].len() as i64;
        let mut rangers: HashMap<usize, Arc<dyn Ranger>> = HashMap::new();
        rangers.insert(0, Arc::new(FailingRanger { size: piece_size }));
        rangers.insert(1, Arc::new(ByteRanger::new(piece_data[1].clone())));
        rangers.insert(3, Arc::new(ByteRanger::new(piece_data[3].clone())));

        let ranger = DecodedRanger::new(rangers, scheme, padded.len() as i64).unwrap();
        assert_eq!(read_all(&ranger).await.unwrap(), padded);
    }

    #[tokio::test]
    async fn test_all_failing_reports_error() {
        struct FailingRanger;

        #[async_trait]
        impl Ranger for FailingRanger {
            fn size(&self) -> i64 {
                16
            }
            async fn range(&self, _o: i64, _l: i64) -> Result<RangeReader, RangerError> {
                Err(RangerError::Other("offline".into()))
            }
        }

        let scheme: Arc<dyn ErasureScheme> = Arc::new(RsScheme::new(2, 4, 8).unwrap());
        let mut rangers: HashMap<usize, Arc<dyn Ranger>> = HashMap::new();
        for i in 0..4 {
            rangers.insert(i, Arc::new(FailingRanger));
        }

        let ranger = DecodedRanger::new(rangers, scheme, 16).unwrap();
        assert!(ranger.range(0, 16).await.is_err());
    }
}
