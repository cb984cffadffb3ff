//! Run records and result persistence.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;

use crate::consistency::ConsistencyReport;
use crate::failover::FailoverReport;
use crate::sharding::ShardingReport;

/// Component-specific outcome of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RunOutcome {
    Consistency(ConsistencyReport),
    Failover(FailoverReport),
    Sharding(ShardingReport),
}

/// One structured record per harness run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// Sink for finished run records.
pub trait ResultRecorder {
    fn record(&mut self, record: &RunRecord) -> anyhow::Result<()>;
}

/// Writes each record as pretty-printed JSON to a fixed path, creating
/// parent directories as needed.
pub struct JsonFileRecorder {
    path: PathBuf,
}

impl JsonFileRecorder {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ResultRecorder for JsonFileRecorder {
    fn record(&mut self, record: &RunRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
        }
        let data = serde_json::to_vec_pretty(record).context("serialize run record")?;
        fs::write(&self.path, data).with_context(|| format!("write {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "run record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{unix_millis, FailoverEvent, NodeAddress};

    #[test]
    fn json_recorder_writes_a_parseable_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("failover.json");
        let mut recorder = JsonFileRecorder::new(path.clone());

        let record = RunRecord {
            started_at_ms: unix_millis(),
            finished_at_ms: unix_millis(),
            outcome: RunOutcome::Failover(FailoverReport {
                polls: 3,
                poll_interval_ms: 2000,
                events: vec![FailoverEvent::MasterDownDetected {
                    at_ms: unix_millis(),
                    previous_primary: NodeAddress::new("10.0.0.1", 6379),
                }],
                initial_topology: None,
                final_topology: None,
            }),
        };
        recorder.record(&record).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["check"], "failover");
        assert_eq!(parsed["polls"], 3);
        assert_eq!(parsed["events"][0]["event"], "master_down_detected");
        assert_eq!(parsed["events"][0]["previous_primary"], "10.0.0.1:6379");
    }
}
