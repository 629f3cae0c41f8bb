//! Reed-Solomon scheme implementation.
//!
//! Systematic layout: share `i < k` is the i-th chunk of the stripe, shares
//! `k..n` are parity. Correction locates mutated shares by a minimum-erasure
//! search: growing sets of suspects are treated as erasures until the
//! reconstructed codeword verifies, which finds the closest codeword whenever
//! at least `k` provided shares are uncorrupted.

use std::collections::HashMap;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{AuditShare, ErasureError, ErasureScheme};

/// Reed-Solomon erasure scheme over GF(2^8).
pub struct RsScheme {
    required: usize,
    total: usize,
    share_size: usize,
    /// None when the scheme carries no parity (k == n).
    codec: Option<ReedSolomon>,
}

impl RsScheme {
    /// Creates a scheme with `required` data shares out of `total`, each
    /// `share_size` bytes.
    pub fn new(required: usize, total: usize, share_size: usize) -> Result<Self, ErasureError> {
        if required == 0 || required > total {
            return Err(ErasureError::InvalidParameters(format!(
                "required {required} must be in 1..={total}"
            )));
        }
        if total > 256 {
            return Err(ErasureError::InvalidParameters(format!(
                "total {total} exceeds the GF(2^8) limit of 256"
            )));
        }
        if share_size == 0 {
            return Err(ErasureError::InvalidParameters(
                "share size must be positive".into(),
            ));
        }

        let codec = if total > required {
            Some(
                ReedSolomon::new(required, total - required)
                    .map_err(|e| ErasureError::Codec(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(Self {
            required,
            total,
            share_size,
            codec,
        })
    }

    fn check_share_size(&self, data: &[u8]) -> Result<(), ErasureError> {
        if data.len() != self.share_size {
            return Err(ErasureError::WrongShareSize {
                expected: self.share_size,
                got: data.len(),
            });
        }
        Ok(())
    }

    /// Tries to reconstruct a full codeword treating `erased` (plus blanks)
    /// as missing, returning it when it verifies.
    fn try_codeword(
        &self,
        shares: &[AuditShare],
        erased: &[usize],
    ) -> Result<Option<Vec<Vec<u8>>>, ErasureError> {
        let codec = self.codec.as_ref().expect("parity required for correction");

        let mut slots: Vec<Option<Vec<u8>>> = shares
            .iter()
            .map(|s| (!s.blank).then(|| s.data.clone()))
            .collect();
        for &idx in erased {
            slots[idx] = None;
        }

        if slots.iter().flatten().count() < self.required {
            return Ok(None);
        }

        if codec.reconstruct(&mut slots).is_err() {
            return Ok(None);
        }

        let codeword: Vec<Vec<u8>> = slots.into_iter().map(|s| s.expect("reconstructed")).collect();
        let consistent = codec
            .verify(&codeword)
            .map_err(|e| ErasureError::Codec(e.to_string()))?;
        Ok(consistent.then_some(codeword))
    }
}

impl ErasureScheme for RsScheme {
    fn required_count(&self) -> usize {
        self.required
    }

    fn total_count(&self) -> usize {
        self.total
    }

    fn share_size(&self) -> usize {
        self.share_size
    }

    fn encode(&self, stripe: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        if stripe.len() != self.stripe_size() {
            return Err(ErasureError::WrongStripeSize {
                expected: self.stripe_size(),
                got: stripe.len(),
            });
        }

        let mut shards: Vec<Vec<u8>> = stripe
            .chunks(self.share_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        if let Some(codec) = &self.codec {
            shards.extend(std::iter::repeat_with(|| vec![0u8; self.share_size]).take(self.total - self.required));
            codec
                .encode(&mut shards)
                .map_err(|e| ErasureError::Codec(e.to_string()))?;
        }

        Ok(shards)
    }

    fn decode(&self, shares: &HashMap<usize, Vec<u8>>) -> Result<Vec<u8>, ErasureError> {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.total];
        let mut have = 0usize;
        for (&idx, data) in shares {
            if idx >= self.total {
                return Err(ErasureError::InvalidParameters(format!(
                    "share index {idx} out of range 0..{}",
                    self.total
                )));
            }
            self.check_share_size(data)?;
            if slots[idx].is_none() {
                have += 1;
            }
            slots[idx] = Some(data.clone());
        }

        if have < self.required {
            return Err(ErasureError::InsufficientShares {
                have,
                required: self.required,
            });
        }

        let data_complete = slots[..self.required].iter().all(|s| s.is_some());
        if !data_complete {
            let codec = self
                .codec
                .as_ref()
                .expect("data shares can only be absent when parity exists");
            codec
                .reconstruct_data(&mut slots)
                .map_err(|e| ErasureError::Codec(e.to_string()))?;
        }

        let mut stripe = Vec::with_capacity(self.stripe_size());
        for slot in slots.into_iter().take(self.required) {
            stripe.extend_from_slice(&slot.expect("data share present after reconstruction"));
        }
        Ok(stripe)
    }

    fn correct(&self, shares: &mut [AuditShare]) -> Result<Vec<usize>, ErasureError> {
        if shares.len() != self.total {
            return Err(ErasureError::InvalidParameters(format!(
                "expected {} ordered shares, got {}",
                self.total,
                shares.len()
            )));
        }
        for (idx, share) in shares.iter().enumerate() {
            if share.number != idx {
                return Err(ErasureError::InvalidParameters(format!(
                    "share at position {idx} carries number {}",
                    share.number
                )));
            }
            if !share.blank {
                self.check_share_size(&share.data)?;
            }
        }

        let present: Vec<usize> = shares
            .iter()
            .filter(|s| !s.blank)
            .map(|s| s.number)
            .collect();
        if present.len() < self.required {
            return Err(ErasureError::InsufficientShares {
                have: present.len(),
                required: self.required,
            });
        }

        // Without parity there is nothing to cross-check against.
        if self.codec.is_none() {
            return Ok(Vec::new());
        }

        let max_suspects = present.len() - self.required;
        for suspects in 0..=max_suspects {
            let mut combo = Combinations::new(&present, suspects);
            while let Some(erased) = combo.next() {
                if let Some(codeword) = self.try_codeword(shares, erased)? {
                    let mut mutated = Vec::new();
                    for share in shares.iter_mut() {
                        let corrected = &codeword[share.number];
                        if !share.blank && share.data != *corrected {
                            mutated.push(share.number);
                        }
                        share.data = corrected.clone();
                        share.blank = false;
                    }
                    return Ok(mutated);
                }
            }
        }

        Err(ErasureError::TooManyCorrupted)
    }
}

/// Iterator over k-combinations of a candidate slice.
struct Combinations<'a> {
    candidates: &'a [usize],
    indices: Vec<usize>,
    scratch: Vec<usize>,
    started: bool,
    done: bool,
}

impl<'a> Combinations<'a> {
    fn new(candidates: &'a [usize], choose: usize) -> Self {
        Self {
            candidates,
            indices: (0..choose).collect(),
            scratch: vec![0; choose],
            started: false,
            done: choose > candidates.len(),
        }
    }

    fn next(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        if self.started {
            // Advance to the next lexicographic combination.
            let k = self.indices.len();
            let n = self.candidates.len();
            let mut i = k;
            loop {
                if i == 0 {
                    self.done = true;
                    return None;
                }
                i -= 1;
                if self.indices[i] + (k - i) < n {
                    self.indices[i] += 1;
                    for j in i + 1..k {
                        self.indices[j] = self.indices[j - 1] + 1;
                    }
                    break;
                }
            }
        }
        self.started = true;
        for (slot, &idx) in self.scratch.iter_mut().zip(&self.indices) {
            *slot = self.candidates[idx];
        }
        Some(&self.scratch)
    }
}
