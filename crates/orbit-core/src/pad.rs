//! Stripe-boundary padding arithmetic.
//!
//! Erasure encoding consumes whole stripes, so segment ciphertext is padded
//! with zeros up to the next stripe boundary before encoding. The pointer
//! records the exact unpadded size, so the read path recovers the pad amount
//! arithmetically.

/// Returns `size` rounded up to the next multiple of `block_size`.
pub fn padded_size(size: i64, block_size: usize) -> i64 {
    let block = block_size as i64;
    let rem = size % block;
    if rem == 0 {
        size
    } else {
        size + block - rem
    }
}

/// Returns how many zero bytes padding added for `size`.
pub fn pad_amount(size: i64, block_size: usize) -> i64 {
    padded_size(size, block_size) - size
}

/// Extends `data` with zeros up to the next multiple of `block_size`.
pub fn pad(data: &mut Vec<u8>, block_size: usize) {
    let amount = pad_amount(data.len() as i64, block_size) as usize;
    data.resize(data.len() + amount, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_size_unchanged() {
        assert_eq!(padded_size(1024, 256), 1024);
        assert_eq!(pad_amount(1024, 256), 0);
    }

    #[test]
    fn test_unaligned_size_rounds_up() {
        assert_eq!(padded_size(1000, 256), 1024);
        assert_eq!(pad_amount(1000, 256), 24);
        assert_eq!(padded_size(1, 4096), 4096);
    }

    #[test]
    fn test_zero_size() {
        assert_eq!(padded_size(0, 512), 0);
        assert_eq!(pad_amount(0, 512), 0);
    }

    #[test]
    fn test_pad_in_place() {
        let mut data = vec![0xAA; 10];
        pad(&mut data, 8);
        assert_eq!(data.len(), 16);
        assert_eq!(&data[10..], &[0u8; 6]);
    }
}
