//! Orbit Erasure - Reed-Solomon coding over GF(2^8).
//!
//! A stripe of `k * s` bytes encodes to `n` shares of `s` bytes each; any
//! `k` distinct shares recover the stripe. The audit path additionally uses
//! [`ErasureScheme::correct`] to locate shares whose content was mutated.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod rs;

pub use rs::RsScheme;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Errors from erasure operations.
#[derive(Debug, Error)]
pub enum ErasureError {
    /// Fewer distinct shares than the required count.
    #[error("insufficient shares: have {have}, need {required}")]
    InsufficientShares {
        /// Usable shares provided.
        have: usize,
        /// Minimum required (k).
        required: usize,
    },

    /// Scheme parameters out of range.
    #[error("invalid erasure parameters: {0}")]
    InvalidParameters(String),

    /// A share had the wrong length.
    #[error("wrong share size: expected {expected}, got {got}")]
    WrongShareSize {
        /// Configured share size.
        expected: usize,
        /// Provided length.
        got: usize,
    },

    /// Input to encode was not a whole stripe.
    #[error("wrong stripe size: expected {expected}, got {got}")]
    WrongStripeSize {
        /// Stripe size (k * s).
        expected: usize,
        /// Provided length.
        got: usize,
    },

    /// Too many mutated shares to identify a consistent codeword.
    #[error("corrupted shares could not be localized")]
    TooManyCorrupted,

    /// Underlying codec failure.
    #[error("codec error: {0}")]
    Codec(String),
}

/// One share presented for audit correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditShare {
    /// Share index within the codeword.
    pub number: usize,
    /// Share content; ignored when `blank`.
    pub data: Vec<u8>,
    /// True when the share could not be downloaded.
    pub blank: bool,
}

impl AuditShare {
    /// A downloaded share.
    pub fn present(number: usize, data: Vec<u8>) -> Self {
        Self {
            number,
            data,
            blank: false,
        }
    }

    /// A placeholder for a share that could not be fetched.
    pub fn missing(number: usize) -> Self {
        Self {
            number,
            data: Vec::new(),
            blank: true,
        }
    }
}

/// Erasure coding capability.
pub trait ErasureScheme: Send + Sync {
    /// Minimum shares needed to recover a stripe (k).
    fn required_count(&self) -> usize;

    /// Total shares produced per stripe (n).
    fn total_count(&self) -> usize;

    /// Size of each share in bytes (s).
    fn share_size(&self) -> usize;

    /// Bytes consumed per encoded stripe (k * s).
    fn stripe_size(&self) -> usize {
        self.required_count() * self.share_size()
    }

    /// Encodes a stripe into `n` shares, indexed 0..n-1.
    fn encode(&self, stripe: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError>;

    /// Recovers a stripe from at least `k` distinct shares.
    fn decode(&self, shares: &HashMap<usize, Vec<u8>>) -> Result<Vec<u8>, ErasureError>;

    /// Repairs blanks and mutated shares in place.
    ///
    /// Succeeds iff at least `k` of the provided shares are uncorrupted, and
    /// returns the numbers of shares whose provided content disagreed with
    /// the reconstructed codeword.
    fn correct(&self, shares: &mut [AuditShare]) -> Result<Vec<usize>, ErasureError>;
}

/// An erasure scheme plus the repair and optimal thresholds used by the
/// upload and repair paths.
#[derive(Clone)]
pub struct RedundancyStrategy {
    scheme: Arc<dyn ErasureScheme>,
    repair_threshold: usize,
    optimal_threshold: usize,
}

impl RedundancyStrategy {
    /// Builds a strategy, validating `k <= r <= o <= n`.
    pub fn new(
        scheme: Arc<dyn ErasureScheme>,
        repair_threshold: usize,
        optimal_threshold: usize,
    ) -> Result<Self, ErasureError> {
        let k = scheme.required_count();
        let n = scheme.total_count();
        if repair_threshold < k || optimal_threshold < repair_threshold || n < optimal_threshold {
            return Err(ErasureError::InvalidParameters(format!(
                "thresholds must satisfy {k} <= {repair_threshold} <= {optimal_threshold} <= {n}"
            )));
        }
        Ok(Self {
            scheme,
            repair_threshold,
            optimal_threshold,
        })
    }

    /// The wrapped scheme.
    pub fn scheme(&self) -> &Arc<dyn ErasureScheme> {
        &self.scheme
    }

    /// Minimum shares for recovery (k).
    pub fn required_count(&self) -> usize {
        self.scheme.required_count()
    }

    /// Total shares per stripe (n).
    pub fn total_count(&self) -> usize {
        self.scheme.total_count()
    }

    /// Share size in bytes (s).
    pub fn share_size(&self) -> usize {
        self.scheme.share_size()
    }

    /// Stripe size in bytes (k * s).
    pub fn stripe_size(&self) -> usize {
        self.scheme.stripe_size()
    }

    /// Healthy-piece count below which a segment needs repair (r).
    pub fn repair_threshold(&self) -> usize {
        self.repair_threshold
    }

    /// Successful puts needed for an upload to finish early (o).
    pub fn optimal_threshold(&self) -> usize {
        self.optimal_threshold
    }
}

impl std::fmt::Debug for RedundancyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundancyStrategy")
            .field("required", &self.required_count())
            .field("repair", &self.repair_threshold)
            .field("optimal", &self.optimal_threshold)
            .field("total", &self.total_count())
            .field("share_size", &self.share_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_validates_thresholds() {
        let scheme: Arc<dyn ErasureScheme> = Arc::new(RsScheme::new(2, 4, 16).unwrap());

        assert!(RedundancyStrategy::new(scheme.clone(), 3, 3).is_ok());
        assert!(RedundancyStrategy::new(scheme.clone(), 1, 3).is_err());
        assert!(RedundancyStrategy::new(scheme.clone(), 3, 2).is_err());
        assert!(RedundancyStrategy::new(scheme.clone(), 3, 5).is_err());
    }

    #[test]
    fn test_strategy_accessors() {
        let scheme: Arc<dyn ErasureScheme> = Arc::new(RsScheme::new(2, 4, 16).unwrap());
        let strategy = RedundancyStrategy::new(scheme, 3, 4).unwrap();

        assert_eq!(strategy.required_count(), 2);
        assert_eq!(strategy.repair_threshold(), 3);
        assert_eq!(strategy.optimal_threshold(), 4);
        assert_eq!(strategy.total_count(), 4);
        assert_eq!(strategy.stripe_size(), 32);
    }
}
