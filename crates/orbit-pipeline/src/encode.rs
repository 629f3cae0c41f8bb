//! Stripe encoder fan-out.
//!
//! One driver task reads the source stripe by stripe, encodes each into n
//! shares, and feeds one bounded channel per share. Backpressure from the
//! slowest attached reader bounds buffered memory; a dropped reader marks
//! its share abandoned and the driver stops feeding it. All shares of
//! stripe i are emitted before any share of stripe i+1. A short final
//! stripe is zero-padded to the stripe boundary.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use orbit_erasure::RedundancyStrategy;
use orbit_net::{ChannelReader, ChannelWriter};

/// Default encoder buffer budget in bytes.
pub const DEFAULT_MAX_BUFFER_MEMORY: usize = 4 * 1024 * 1024;

/// Spawns the stripe encoder over `source`, returning one reader per share.
pub fn encode_shares(
    mut source: impl AsyncRead + Send + Unpin + 'static,
    strategy: &RedundancyStrategy,
    max_buffer_memory: usize,
) -> Vec<ChannelReader> {
    let total = strategy.total_count();
    let stripe_size = strategy.stripe_size();
    let share_size = strategy.share_size();
    let scheme = strategy.scheme().clone();

    let depth = (max_buffer_memory / (total * share_size)).max(1);
    let mut writers: Vec<ChannelWriter> = Vec::with_capacity(total);
    let mut readers = Vec::with_capacity(total);
    for _ in 0..total {
        let (writer, reader) = ChannelReader::pipe(depth);
        writers.push(writer);
        readers.push(reader);
    }

    tokio::spawn(async move {
        let mut abandoned = vec![false; total];
        let mut stripe = vec![0u8; stripe_size];

        loop {
            // Fill one stripe, zero-padding a short tail.
            let mut filled = 0usize;
            let eof = loop {
                match source.read(&mut stripe[filled..]).await {
                    Ok(0) => break true,
                    Ok(n) => {
                        filled += n;
                        if filled == stripe_size {
                            break false;
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        for (writer, skip) in writers.iter().zip(&abandoned) {
                            if !skip {
                                let _ = writer
                                    .send(Err(std::io::Error::other(message.clone())))
                                    .await;
                            }
                        }
                        return;
                    }
                }
            };

            if filled > 0 {
                stripe[filled..].fill(0);
                let shares = match scheme.encode(&stripe) {
                    Ok(shares) => shares,
                    Err(err) => {
                        let message = err.to_string();
                        for (writer, skip) in writers.iter().zip(&abandoned) {
                            if !skip {
                                let _ = writer
                                    .send(Err(std::io::Error::other(message.clone())))
                                    .await;
                            }
                        }
                        return;
                    }
                };

                for (index, share) in shares.into_iter().enumerate() {
                    if abandoned[index] {
                        continue;
                    }
                    if writers[index].send(Ok(Bytes::from(share))).await.is_err() {
                        // Reader dropped; its remaining shares go nowhere.
                        abandoned[index] = true;
                        debug!(share = index, "share reader abandoned");
                    }
                }
            }

            if eof {
                return;
            }
        }
    });

    readers
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_erasure::RsScheme;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn strategy(k: usize, n: usize, share: usize) -> RedundancyStrategy {
        RedundancyStrategy::new(Arc::new(RsScheme::new(k, n, share).unwrap()), k, n).unwrap()
    }

    #[tokio::test]
    async fn test_shares_recover_source() {
        let strategy = strategy(2, 4, 8);
        let data: Vec<u8> = (0..64u8).collect();

        let readers = encode_shares(std::io::Cursor::new(data.clone()), &strategy, 1 << 20);
        let mut shares = Vec::new();
        for mut reader in readers {
            let mut share = Vec::new();
            reader.read_to_end(&mut share).await.unwrap();
            shares.push(share);
        }

        // 64 bytes = 4 stripes of 16; every share stream is 4 * 8 bytes.
        for share in &shares {
            assert_eq!(share.len(), 32);
        }

        // Decode stripe by stripe from shares 1 and 3.
        let scheme = strategy.scheme();
        let mut recovered = Vec::new();
        for stripe_index in 0..4 {
            let mut subset = HashMap::new();
            for idx in [1usize, 3] {
                subset.insert(
                    idx,
                    shares[idx][stripe_index * 8..(stripe_index + 1) * 8].to_vec(),
                );
            }
            recovered.extend(scheme.decode(&subset).unwrap());
        }
        assert_eq!(recovered, data);
    }

    #[tokio::test]
    async fn test_short_tail_is_zero_padded() {
        let strategy = strategy(2, 3, 4);
        // 10 bytes over a stripe size of 8: two stripes, second half-empty.
        let data: Vec<u8> = (1..=10u8).collect();

        let readers = encode_shares(std::io::Cursor::new(data), &strategy, 1 << 20);
        let mut first = Vec::new();
        let mut iter = readers.into_iter();
        iter.next().unwrap().read_to_end(&mut first).await.unwrap();

        // Share 0 carries stripe bytes 0..4 and 8..12 (the padded tail).
        assert_eq!(first, vec![1, 2, 3, 4, 9, 10, 0, 0]);
    }

    #[tokio::test]
    async fn test_empty_source_closes_streams() {
        let strategy = strategy(2, 4, 8);
        let readers = encode_shares(std::io::Cursor::new(Vec::new()), &strategy, 1 << 20);
        for mut reader in readers {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert!(out.is_empty());
        }
    }

    #[tokio::test]
    async fn test_dropped_reader_does_not_stall_the_rest() {
        let strategy = strategy(2, 4, 8);
        let data = vec![0xABu8; 16 * 100];

        // A tiny buffer budget forces backpressure within a few stripes.
        let mut readers = encode_shares(std::io::Cursor::new(data), &strategy, 64);
        // Abandon two readers immediately; the driver must still finish.
        readers.remove(3);
        readers.remove(2);

        // The surviving readers must drain concurrently, like upload tasks.
        let mut tasks = Vec::new();
        for mut reader in readers {
            tasks.push(tokio::spawn(async move {
                let mut out = Vec::new();
                reader.read_to_end(&mut out).await.unwrap();
                out.len()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 8 * 100);
        }
    }

    #[tokio::test]
    async fn test_stripe_ordering_within_shares() {
        let strategy = strategy(1, 2, 4);
        let data: Vec<u8> = (0..16u8).collect();

        let readers = encode_shares(std::io::Cursor::new(data.clone()), &strategy, 1 << 20);
        let mut outputs = Vec::new();
        for mut reader in readers {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            outputs.push(out);
        }

        // k = 1: share 0 is the source itself, in stripe order.
        assert_eq!(outputs[0], data);
    }
}
