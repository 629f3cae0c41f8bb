//! Timestamps for pointers, TTLs, and bandwidth allocations.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};

/// Milliseconds since the Unix epoch.
///
/// Zero means "unset" (e.g. a pointer that never expires).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(duration.as_millis() as i64)
    }

    /// The unset timestamp.
    pub const fn unset() -> Self {
        Self(0)
    }

    /// Returns true when the timestamp is unset.
    pub const fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// Milliseconds since the Unix epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Seconds since the Unix epoch (truncated).
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1000
    }

    /// Creates a timestamp from seconds since the Unix epoch.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1000)
    }

    /// Returns this timestamp advanced by a duration.
    pub fn plus(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as i64))
    }

    /// Returns true if the timestamp is set and lies in the past.
    pub fn is_expired(&self) -> bool {
        !self.is_unset() && *self <= Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl CanonicalEncode for Timestamp {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl CanonicalDecode for Timestamp {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(i64::decode(buf)?))
    }
}
