//! Key-to-partition distribution analysis.
//!
//! The partition function mirrors the target store's own assignment rule:
//! CRC-16/XMODEM over the key's hash tag (or the whole key when no tag is
//! present), reduced modulo the partition count. Matching the store exactly
//! is the point; computed placements are cross-checked against the
//! deployment's own slot-ownership metadata.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::client::ClusterClient;
use crate::error::ProbeError;
use crate::types::{
    unix_micros, KeyFailure, NodeAddress, SlotDistribution, SlotOwner, SlotRange,
};

/// Partition count used by the deployments this harness targets.
pub const DEFAULT_PARTITIONS: u16 = 16384;

/// Bounded number of failure records carried verbatim in the report.
const FAILURE_SAMPLE_LIMIT: usize = 10;
/// Busiest slots listed in the distribution summary.
const TOP_SLOT_LIMIT: usize = 10;
/// Bulk progress is logged every this many keys.
const PROGRESS_EVERY: u32 = 1000;

/// CRC-16/XMODEM (poly 0x1021, init 0), the checksum the target store uses
/// for slot assignment. Compatibility requires this polynomial exactly.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// The substring between the first `{` and the next `}` after it, when
/// non-empty. Keys sharing a tag are forced into the same partition.
pub fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let rest = &key[open + 1..];
    let close = rest.find('}')?;
    if close == 0 {
        None
    } else {
        Some(&rest[..close])
    }
}

/// Deterministic key-to-partition assignment.
///
/// `total_partitions` must be non-zero.
pub fn partition_of(key: &str, total_partitions: u16) -> u16 {
    let routed = hash_tag(key).unwrap_or(key);
    crc16(routed.as_bytes()) % total_partitions
}

/// Tallies `partition_of` over a key sequence. Pure; identical input yields
/// an identical distribution.
pub fn analyze_distribution<I, K>(keys: I, total_partitions: u16) -> SlotDistribution
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut distribution = SlotDistribution::default();
    for key in keys {
        distribution.record(partition_of(key.as_ref(), total_partitions));
    }
    distribution
}

/// Apportions the partition space into `node_count` contiguous ranges whose
/// widths differ by at most one, remainder going to the lower ranges.
///
/// This approximates per-node load for reporting only. True ownership comes
/// from the deployment's topology metadata, which may assign non-contiguous
/// or unequal ranges.
pub fn node_ranges(total_partitions: u16, node_count: u16) -> Vec<SlotRange> {
    if node_count == 0 || total_partitions == 0 {
        return Vec::new();
    }
    let node_count = node_count.min(total_partitions);
    let base = total_partitions / node_count;
    let remainder = total_partitions % node_count;

    let mut ranges = Vec::with_capacity(node_count as usize);
    let mut start: u32 = 0;
    for i in 0..node_count {
        let width = u32::from(base) + u32::from(i < remainder);
        let end = start + width - 1;
        ranges.push(SlotRange {
            start: start as u16,
            end: end as u16,
        });
        start = end + 1;
    }
    ranges
}

fn owner_of<'a>(slot: u16, owners: &'a [SlotOwner]) -> Option<&'a NodeAddress> {
    owners
        .iter()
        .find(|o| o.range.contains(slot))
        .map(|o| &o.owner)
}

#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Number of distinct keys written through the deployment.
    pub key_count: u32,
    /// Keys are generated as `{key_prefix}{index}`.
    pub key_prefix: String,
    pub total_partitions: u16,
    /// Width of the reporting-only range approximation.
    pub node_count: u16,
    /// How many of the written keys to read back as a spot check.
    pub read_sample: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            key_count: 10_000,
            key_prefix: "key".to_string(),
            total_partitions: DEFAULT_PARTITIONS,
            node_count: 3,
            read_sample: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteStats {
    pub duration_ms: u64,
    pub ok: u64,
    pub failed: u64,
    pub per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadStats {
    pub sample: u32,
    pub duration_ms: u64,
    pub missing: u64,
    pub failed: u64,
    pub per_sec: f64,
}

/// Keys and distinct slots that fell into one approximate node range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeLoad {
    pub range: SlotRange,
    pub keys: u64,
    pub unique_slots: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub total_partitions: u16,
    pub unique_slots: usize,
    /// Fraction of the partition space touched by at least one key.
    pub utilization: f64,
    pub top_slots: Vec<(u16, u64)>,
    /// Range-math approximation of per-node load; not authoritative.
    pub approximate_node_load: Vec<RangeLoad>,
}

/// Outcome of one sharding run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingReport {
    pub key_count: u32,
    pub key_prefix: String,
    pub total_partitions: u16,
    pub write: WriteStats,
    pub read: ReadStats,
    pub distribution: DistributionSummary,
    pub slot_distribution: SlotDistribution,
    /// Authoritative ownership as reported by the deployment, when the
    /// topology query succeeded.
    pub ownership: Vec<SlotOwner>,
    /// Successful writes whose serving node did not own the computed slot
    /// per the deployment's own metadata. `None` when ownership was
    /// unavailable.
    pub ownership_mismatches: Option<u64>,
    pub write_failures_total: u64,
    /// First few failures, kept verbatim for diagnosis.
    pub write_failures: Vec<KeyFailure>,
}

pub struct ShardDistributionAnalyzer {
    config: ShardingConfig,
}

impl ShardDistributionAnalyzer {
    pub fn new(config: ShardingConfig) -> Self {
        Self { config }
    }

    /// Writes the key universe through the deployment, tallies computed
    /// placements for every acknowledged write, and cross-checks them
    /// against the deployment's own slot ownership.
    pub async fn run(&self, cluster: &mut ClusterClient) -> Result<ShardingReport, ProbeError> {
        let config = &self.config;
        tracing::info!(
            keys = config.key_count,
            partitions = config.total_partitions,
            "starting shard distribution analysis"
        );

        // Ownership is fetched up front so every acknowledged write can be
        // checked against it. Its absence degrades the run, not fails it.
        let ownership = match cluster.slot_owners().await {
            Ok(owners) => owners,
            Err(err) => {
                tracing::warn!(error = %err, "slot ownership unavailable, skipping cross-check");
                Vec::new()
            }
        };

        let mut distribution = SlotDistribution::default();
        let mut write_failures: Vec<KeyFailure> = Vec::new();
        let mut writes_ok = 0u64;
        let mut mismatches = 0u64;
        let write_started = Instant::now();

        for i in 0..config.key_count {
            let key = format!("{}{i}", config.key_prefix);
            let value = format!("value_{i}_{}", unix_micros());
            let slot = partition_of(&key, config.total_partitions);

            match cluster.set(&key, &value).await {
                Ok(served_by) => {
                    writes_ok += 1;
                    distribution.record(slot);
                    if let Some(owner) = owner_of(slot, &ownership) {
                        if *owner != served_by {
                            tracing::debug!(
                                key = %key,
                                slot,
                                owner = %owner,
                                served_by = %served_by,
                                "computed owner disagrees with serving node"
                            );
                            mismatches += 1;
                        }
                    }
                }
                Err(err) => write_failures.push(KeyFailure {
                    key,
                    partition: Some(slot),
                    cause: err.to_string(),
                }),
            }
            if (i + 1) % PROGRESS_EVERY == 0 {
                tracing::debug!(written = i + 1, total = config.key_count, "write progress");
            }
        }
        let write_duration = write_started.elapsed();
        let write = WriteStats {
            duration_ms: write_duration.as_millis() as u64,
            ok: writes_ok,
            failed: write_failures.len() as u64,
            per_sec: rate(writes_ok, write_duration.as_secs_f64()),
        };
        tracing::info!(
            ok = write.ok,
            failed = write.failed,
            elapsed_ms = write.duration_ms,
            "write phase done"
        );

        let read = self.read_back(cluster).await?;
        tracing::info!(
            sample = read.sample,
            missing = read.missing,
            failed = read.failed,
            "read-back done"
        );

        let ranges = node_ranges(config.total_partitions, config.node_count);
        let approximate_node_load = ranges
            .into_iter()
            .map(|range| RangeLoad {
                keys: distribution.count_in_range(range.start, range.end),
                unique_slots: distribution.slots_in_range(range.start, range.end),
                range,
            })
            .collect();

        let distribution_summary = DistributionSummary {
            total_partitions: config.total_partitions,
            unique_slots: distribution.unique_slots(),
            utilization: distribution.unique_slots() as f64 / f64::from(config.total_partitions),
            top_slots: distribution.top(TOP_SLOT_LIMIT),
            approximate_node_load,
        };

        let write_failures_total = write_failures.len() as u64;
        write_failures.truncate(FAILURE_SAMPLE_LIMIT);

        Ok(ShardingReport {
            key_count: config.key_count,
            key_prefix: config.key_prefix.clone(),
            total_partitions: config.total_partitions,
            write,
            read,
            distribution: distribution_summary,
            slot_distribution: distribution,
            ownership_mismatches: if ownership.is_empty() {
                None
            } else {
                Some(mismatches)
            },
            ownership,
            write_failures_total,
            write_failures,
        })
    }

    /// Spot-checks that a prefix of the written keys reads back at all.
    async fn read_back(&self, cluster: &mut ClusterClient) -> Result<ReadStats, ProbeError> {
        let sample = self.config.read_sample.min(self.config.key_count);
        let mut missing = 0u64;
        let mut failed = 0u64;
        let started = Instant::now();
        for i in 0..sample {
            let key = format!("{}{i}", self.config.key_prefix);
            match cluster.get(&key).await {
                Ok(Some(_)) => {}
                Ok(None) => missing += 1,
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "read-back failed");
                    failed += 1;
                }
            }
        }
        let duration = started.elapsed();
        Ok(ReadStats {
            sample,
            duration_ms: duration.as_millis() as u64,
            missing,
            failed,
            per_sec: rate(u64::from(sample), duration.as_secs_f64()),
        })
    }
}

fn rate(count: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        count as f64 / seconds
    } else {
        0.0
    }
}
