//! Storage node descriptors and reputation statistics.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, NodeId, Timestamp};

/// Network address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    /// host:port the node listens on.
    pub address: String,
}

impl NodeAddress {
    /// Creates an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl CanonicalEncode for NodeAddress {
    fn encode(&self, buf: &mut BytesMut) {
        self.address.encode(buf);
    }
}

impl CanonicalDecode for NodeAddress {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            address: String::decode(buf)?,
        })
    }
}

/// Capacity a node is willing to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRestrictions {
    /// Free disk in bytes; negative means unknown.
    pub free_disk: i64,
    /// Free bandwidth in bytes; negative means unknown.
    pub free_bandwidth: i64,
}

impl Default for NodeRestrictions {
    fn default() -> Self {
        Self {
            free_disk: -1,
            free_bandwidth: -1,
        }
    }
}

impl CanonicalEncode for NodeRestrictions {
    fn encode(&self, buf: &mut BytesMut) {
        self.free_disk.encode(buf);
        self.free_bandwidth.encode(buf);
    }
}

impl CanonicalDecode for NodeRestrictions {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            free_disk: i64::decode(buf)?,
            free_bandwidth: i64::decode(buf)?,
        })
    }
}

/// Audit and uptime reputation counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeStats {
    /// Audits this node passed.
    pub audit_success_count: i64,
    /// Audits this node was subject to.
    pub audit_count: i64,
    /// audit_success_count / audit_count.
    pub audit_ratio: f64,
    /// Uptime checks this node passed.
    pub uptime_success_count: i64,
    /// Uptime checks this node was subject to.
    pub uptime_count: i64,
    /// uptime_success_count / uptime_count.
    pub uptime_ratio: f64,
    /// 90th-percentile response latency in milliseconds.
    pub latency_90: i64,
}

impl NodeStats {
    /// Applies one audit outcome and recomputes the ratio.
    pub fn record_audit(&mut self, success: bool) {
        self.audit_count += 1;
        if success {
            self.audit_success_count += 1;
        }
        self.audit_ratio = ratio(self.audit_success_count, self.audit_count);
    }

    /// Applies one uptime check outcome and recomputes the ratio.
    pub fn record_uptime(&mut self, online: bool) {
        self.uptime_count += 1;
        if online {
            self.uptime_success_count += 1;
        }
        self.uptime_ratio = ratio(self.uptime_success_count, self.uptime_count);
    }

    /// Returns true when this record meets every threshold in `min`.
    ///
    /// An undefined ratio (no observations yet) compares as failing.
    pub fn meets(&self, min: &NodeStats) -> bool {
        if self.audit_count < min.audit_count {
            return false;
        }
        if min.audit_ratio > 0.0 && (self.audit_count == 0 || self.audit_ratio < min.audit_ratio) {
            return false;
        }
        if min.uptime_ratio > 0.0
            && (self.uptime_count == 0 || self.uptime_ratio < min.uptime_ratio)
        {
            return false;
        }
        true
    }
}

fn ratio(success: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        success as f64 / total as f64
    }
}

impl CanonicalEncode for NodeStats {
    fn encode(&self, buf: &mut BytesMut) {
        self.audit_success_count.encode(buf);
        self.audit_count.encode(buf);
        self.audit_ratio.encode(buf);
        self.uptime_success_count.encode(buf);
        self.uptime_count.encode(buf);
        self.uptime_ratio.encode(buf);
        self.latency_90.encode(buf);
    }
}

impl CanonicalDecode for NodeStats {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            audit_success_count: i64::decode(buf)?,
            audit_count: i64::decode(buf)?,
            audit_ratio: f64::decode(buf)?,
            uptime_success_count: i64::decode(buf)?,
            uptime_count: i64::decode(buf)?,
            uptime_ratio: f64::decode(buf)?,
            latency_90: i64::decode(buf)?,
        })
    }
}

/// Operator contact details.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Operator email.
    pub email: String,
    /// Operator payout wallet.
    pub wallet: String,
}

impl CanonicalEncode for NodeMetadata {
    fn encode(&self, buf: &mut BytesMut) {
        self.email.encode(buf);
        self.wallet.encode(buf);
    }
}

impl CanonicalDecode for NodeMetadata {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            email: String::decode(buf)?,
            wallet: String::decode(buf)?,
        })
    }
}

/// Everything the overlay knows about a storage node.
///
/// Created on first discovery, updated by DHT refresh and audits, never
/// deleted; unreachable nodes are only marked as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Stable node identity.
    pub id: NodeId,
    /// Transport address.
    pub address: NodeAddress,
    /// Capacity restrictions.
    pub restrictions: NodeRestrictions,
    /// Reputation counters.
    pub reputation: NodeStats,
    /// Operator metadata.
    pub metadata: NodeMetadata,
    /// Last time the node was seen by discovery or an audit.
    pub last_seen: Timestamp,
    /// Set when the node failed its most recent contact attempt.
    pub unreachable: bool,
}

impl NodeDescriptor {
    /// Creates a descriptor with default restrictions and reputation.
    pub fn new(id: NodeId, address: NodeAddress) -> Self {
        Self {
            id,
            address,
            restrictions: NodeRestrictions::default(),
            reputation: NodeStats::default(),
            metadata: NodeMetadata::default(),
            last_seen: Timestamp::unset(),
            unreachable: false,
        }
    }
}

impl CanonicalEncode for NodeDescriptor {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.address.encode(buf);
        self.restrictions.encode(buf);
        self.reputation.encode(buf);
        self.metadata.encode(buf);
        self.last_seen.encode(buf);
        self.unreachable.encode(buf);
    }
}

impl CanonicalDecode for NodeDescriptor {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            id: NodeId::decode(buf)?,
            address: NodeAddress::decode(buf)?,
            restrictions: NodeRestrictions::decode(buf)?,
            reputation: NodeStats::decode(buf)?,
            metadata: NodeMetadata::decode(buf)?,
            last_seen: Timestamp::decode(buf)?,
            unreachable: bool::decode(buf)?,
        })
    }
}
