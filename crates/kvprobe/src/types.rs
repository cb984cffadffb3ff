//! Shared data model for probe runs.
//!
//! Everything here is created and owned by a single run. Reports reference
//! these types and serialize them into the run record, so all of them carry
//! serde derives (or hand-written impls where the wire shape is a string).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// One store endpoint. Equality is structural (host plus port) and is what
/// primary-change detection relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    /// Parses `host:port`. Hosts may be names or IPv4 literals; bracketed
    /// IPv6 is not supported by the deployments this harness targets.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid node address {input:?} (expected host:port)"))?;
        if host.is_empty() {
            return Err(format!("invalid node address {input:?} (empty host)"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in node address {input:?}"))?;
        Ok(Self::new(host, port))
    }
}

// Addresses serialize as `host:port` strings so run records read the way
// operators write them on the command line.
impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddrVisitor;

        impl Visitor<'_> for AddrVisitor {
            type Value = NodeAddress;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a host:port string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<NodeAddress, E> {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(AddrVisitor)
    }
}

/// One observation of the deployment's replication topology.
///
/// `primary == None` means the topology was reachable but the primary is
/// currently unresolvable (election in progress). That is an expected
/// transient state, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTopologySample {
    pub primary: Option<NodeAddress>,
    pub replicas: Vec<NodeAddress>,
    pub sampled_at_ms: u64,
}

/// Per-replica tally over a fixed universe of probed keys.
///
/// The three buckets are mutually exclusive and exhaustive, so
/// `total()` always equals the probed key count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencySnapshot {
    pub synced: u64,
    pub missing: u64,
    pub mismatched: u64,
}

impl ConsistencySnapshot {
    pub fn total(&self) -> u64 {
        self.synced + self.missing + self.mismatched
    }
}

/// One entry in a run's ordered, append-only failover event sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FailoverEvent {
    MasterDownDetected {
        at_ms: u64,
        previous_primary: NodeAddress,
    },
    FailoverCompleted {
        at_ms: u64,
        previous_primary: NodeAddress,
        new_primary: NodeAddress,
        duration_ms: u64,
    },
    WriteProbeResult {
        at_ms: u64,
        succeeded: bool,
        detail: String,
    },
}

/// Key counts per partition id, derived from successful writes only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDistribution {
    counts: BTreeMap<u16, u64>,
}

impl SlotDistribution {
    pub fn record(&mut self, slot: u16) {
        *self.counts.entry(slot).or_insert(0) += 1;
    }

    /// Total keys tallied; matches the number of successful writes.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn unique_slots(&self) -> usize {
        self.counts.len()
    }

    pub fn count(&self, slot: u16) -> u64 {
        self.counts.get(&slot).copied().unwrap_or(0)
    }

    /// Keys landing in the inclusive slot range `start..=end`.
    pub fn count_in_range(&self, start: u16, end: u16) -> u64 {
        self.counts.range(start..=end).map(|(_, c)| c).sum()
    }

    /// Distinct slots touched in the inclusive range `start..=end`.
    pub fn slots_in_range(&self, start: u16, end: u16) -> u64 {
        self.counts.range(start..=end).count() as u64
    }

    /// The `n` busiest slots, highest count first.
    pub fn top(&self, n: usize) -> Vec<(u16, u64)> {
        let mut all: Vec<(u16, u64)> = self.counts.iter().map(|(s, c)| (*s, *c)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }
}

/// A per-key failure accumulated during a bulk phase. These are data, not
/// control flow: a failed key is excluded from throughput and tallies but
/// never aborts the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<u16>,
    pub cause: String,
}

/// An inclusive slot range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// Authoritative slot ownership reported by the deployment itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOwner {
    pub range: SlotRange,
    pub owner: NodeAddress,
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Microseconds since the Unix epoch. Used to derive unique write payloads.
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
