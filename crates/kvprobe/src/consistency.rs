//! Replica consistency checking under asynchronous replication.
//!
//! The checker writes a fixed key universe to the primary, then reads every
//! key back from the primary and from each replica twice: once immediately
//! and once after a settle delay. The primary is re-read on every pass
//! rather than cached, so the ground truth is whatever the primary holds at
//! comparison time.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::client::StoreClient;
use crate::error::ProbeError;
use crate::types::{unix_micros, ConsistencySnapshot, KeyFailure, NodeAddress};

/// Bounded sample of missing keys kept per replica for diagnosis.
const MISSING_SAMPLE_LIMIT: usize = 10;
/// Bulk progress is logged every this many keys.
const PROGRESS_EVERY: u32 = 100;

#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    /// Number of distinct keys written to the primary.
    pub key_count: u32,
    /// Keys are generated as `{key_prefix}:{index}`.
    pub key_prefix: String,
    /// Wait between the immediate and repeated read passes.
    pub settle_delay: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            key_count: 1000,
            key_prefix: "test_key".to_string(),
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// How one replica saw one key relative to the primary's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyClass {
    Synced,
    Missing,
    Mismatched,
}

/// Exhaustive, mutually exclusive classification of a replica's view.
///
/// A key absent from the primary itself counts as missing everywhere; under
/// the exclusive-write precondition that should not happen, but it is a
/// comparison outcome, not an error.
pub(crate) fn classify(primary_value: Option<&str>, replica_value: Option<&str>) -> KeyClass {
    match (primary_value, replica_value) {
        (_, None) => KeyClass::Missing,
        (None, Some(_)) => KeyClass::Missing,
        (Some(p), Some(r)) if p == r => KeyClass::Synced,
        _ => KeyClass::Mismatched,
    }
}

/// One replica's view over the probed key universe during one read pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaView {
    pub replica: NodeAddress,
    pub snapshot: ConsistencySnapshot,
    /// First few keys the replica was missing, for diagnosis.
    pub missing_sample: Vec<String>,
}

/// One full read pass: every key re-read from the primary and all replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadPass {
    pub duration_ms: u64,
    pub replicas: Vec<ReplicaView>,
    /// Per-key read failures (classified as missing, and recorded here so
    /// they are never silently folded into a success bucket).
    pub read_errors: Vec<KeyFailure>,
}

/// Outcome of one consistency run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub primary: NodeAddress,
    pub key_count: u32,
    pub key_prefix: String,
    pub settle_delay_ms: u64,
    pub write_duration_ms: u64,
    pub writes_ok: u64,
    pub writes_per_sec: f64,
    pub write_errors: Vec<KeyFailure>,
    pub immediate: ReadPass,
    pub after_wait: ReadPass,
}

pub struct ConsistencyChecker {
    config: ConsistencyConfig,
}

impl ConsistencyChecker {
    pub fn new(config: ConsistencyConfig) -> Self {
        Self { config }
    }

    /// Runs the full write/read/settle/read sequence.
    ///
    /// Precondition: the probe key namespace is exclusively owned by this
    /// run; the primary is flushed before writing. Connectivity failures
    /// abort the run, per-key failures accumulate.
    pub async fn run(
        &self,
        primary: &mut StoreClient,
        replicas: &mut [StoreClient],
    ) -> Result<ConsistencyReport, ProbeError> {
        let config = &self.config;
        tracing::info!(
            primary = %primary.addr(),
            replicas = replicas.len(),
            keys = config.key_count,
            "starting consistency check"
        );

        primary.flush_all().await?;

        let mut write_errors = Vec::new();
        let mut writes_ok = 0u64;
        let write_started = Instant::now();
        for i in 0..config.key_count {
            let key = self.key(i);
            let value = format!("value_{i}_{}", unix_micros());
            match primary.set(&key, &value).await {
                Ok(()) => writes_ok += 1,
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => write_errors.push(KeyFailure {
                    key,
                    partition: None,
                    cause: err.to_string(),
                }),
            }
            if (i + 1) % PROGRESS_EVERY == 0 {
                tracing::debug!(written = i + 1, total = config.key_count, "write progress");
            }
        }
        let write_duration = write_started.elapsed();
        let writes_per_sec = if write_duration.as_secs_f64() > 0.0 {
            writes_ok as f64 / write_duration.as_secs_f64()
        } else {
            0.0
        };
        tracing::info!(
            writes_ok,
            write_errors = write_errors.len(),
            elapsed_ms = write_duration.as_millis() as u64,
            "write phase done"
        );

        let immediate = self.read_pass(primary, replicas).await?;
        log_pass("immediate", &immediate);

        if !config.settle_delay.is_zero() {
            tracing::info!(
                settle_ms = config.settle_delay.as_millis() as u64,
                "waiting for replication to settle"
            );
            tokio::time::sleep(config.settle_delay).await;
        }

        let after_wait = self.read_pass(primary, replicas).await?;
        log_pass("after_wait", &after_wait);

        Ok(ConsistencyReport {
            primary: primary.addr().clone(),
            key_count: config.key_count,
            key_prefix: config.key_prefix.clone(),
            settle_delay_ms: config.settle_delay.as_millis() as u64,
            write_duration_ms: write_duration.as_millis() as u64,
            writes_ok,
            writes_per_sec,
            write_errors,
            immediate,
            after_wait,
        })
    }

    /// Reads the whole key universe once, classifying every replica's view
    /// against the primary value fetched in the same iteration.
    async fn read_pass(
        &self,
        primary: &mut StoreClient,
        replicas: &mut [StoreClient],
    ) -> Result<ReadPass, ProbeError> {
        let mut views: Vec<ReplicaView> = replicas
            .iter()
            .map(|replica| ReplicaView {
                replica: replica.addr().clone(),
                snapshot: ConsistencySnapshot::default(),
                missing_sample: Vec::new(),
            })
            .collect();
        let mut read_errors = Vec::new();
        let started = Instant::now();

        for i in 0..self.config.key_count {
            let key = self.key(i);
            let primary_value = match primary.get(&key).await {
                Ok(value) => value,
                Err(err) if err.is_connectivity() => return Err(err),
                Err(err) => {
                    read_errors.push(KeyFailure {
                        key: key.clone(),
                        partition: None,
                        cause: err.to_string(),
                    });
                    None
                }
            };

            for (replica, view) in replicas.iter_mut().zip(views.iter_mut()) {
                let replica_value = match replica.get(&key).await {
                    Ok(value) => value,
                    Err(err) if err.is_connectivity() => return Err(err),
                    Err(err) => {
                        read_errors.push(KeyFailure {
                            key: key.clone(),
                            partition: None,
                            cause: err.to_string(),
                        });
                        None
                    }
                };
                match classify(primary_value.as_deref(), replica_value.as_deref()) {
                    KeyClass::Synced => view.snapshot.synced += 1,
                    KeyClass::Mismatched => view.snapshot.mismatched += 1,
                    KeyClass::Missing => {
                        view.snapshot.missing += 1;
                        if view.missing_sample.len() < MISSING_SAMPLE_LIMIT {
                            view.missing_sample.push(key.clone());
                        }
                    }
                }
            }
        }

        Ok(ReadPass {
            duration_ms: started.elapsed().as_millis() as u64,
            replicas: views,
            read_errors,
        })
    }

    fn key(&self, index: u32) -> String {
        format!("{}:{index}", self.config.key_prefix)
    }
}

fn log_pass(pass: &str, result: &ReadPass) {
    for view in &result.replicas {
        tracing::info!(
            pass,
            replica = %view.replica,
            synced = view.snapshot.synced,
            missing = view.snapshot.missing,
            mismatched = view.snapshot.mismatched,
            "replica snapshot"
        );
    }
}
