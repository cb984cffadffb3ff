//! Failover monitoring.
//!
//! The monitor polls a [`TopologyProbe`] on a fixed interval and runs a
//! transition-detecting state machine over the observed primary identity.
//! Episodes are timed from the poll that first saw the primary become
//! unresolvable to the poll that saw a primary resolve again. Completing an
//! episode triggers a single liveness write probe against the new primary;
//! probe failures are recorded but never change state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::StoreClient;
use crate::error::ProbeError;
use crate::topology::TopologyProbe;
use crate::types::{unix_millis, ClusterTopologySample, FailoverEvent, NodeAddress};

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Fixed delay between topology polls.
    pub poll_interval: Duration,
    /// Optional poll budget; `None` runs until cancellation.
    pub max_polls: Option<u64>,
    /// A steady-state status line is logged every this many polls.
    pub status_every: u64,
    /// Timeout for each leg of the post-failover write probe.
    pub op_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_polls: Some(300),
            status_every: 10,
            op_timeout: Duration::from_secs(10),
        }
    }
}

/// Monitor state over the primary identity.
///
/// `Unknown` lasts until the first successful resolution; a monitor that
/// starts during an outage has no previous primary to report, so the
/// baseline is established silently.
enum PrimaryState {
    Unknown,
    Stable(NodeAddress),
    Unresolvable {
        since: Instant,
        last_known: Option<NodeAddress>,
    },
}

/// Outcome of one monitoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverReport {
    pub polls: u64,
    pub poll_interval_ms: u64,
    pub events: Vec<FailoverEvent>,
    /// First successfully observed topology, when any poll succeeded.
    pub initial_topology: Option<ClusterTopologySample>,
    /// Most recently observed topology.
    pub final_topology: Option<ClusterTopologySample>,
}

pub struct FailoverMonitor<P> {
    probe: P,
    config: FailoverConfig,
}

impl<P: TopologyProbe> FailoverMonitor<P> {
    pub fn new(probe: P, config: FailoverConfig) -> Self {
        Self { probe, config }
    }

    /// Polls until cancellation or until the poll budget is exhausted.
    ///
    /// Cancellation is honored at every poll boundary; events recorded up to
    /// that point are always returned. Total discovery outages surface as
    /// unresolvable observations, never as run failures; an unmapped node
    /// identifier is a configuration error and aborts.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<FailoverReport, ProbeError> {
        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = PrimaryState::Unknown;
        let mut events: Vec<FailoverEvent> = Vec::new();
        let mut initial_topology = None;
        let mut final_topology = None;
        let mut polls = 0u64;

        loop {
            if let Some(budget) = self.config.max_polls {
                if polls >= budget {
                    tracing::info!(polls, "poll budget exhausted");
                    break;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(polls, "monitor cancelled");
                    break;
                }
                _ = interval.tick() => {}
            }
            polls += 1;

            let observed = match self.probe.current_topology().await {
                Ok(sample) => {
                    if initial_topology.is_none() {
                        initial_topology = Some(sample.clone());
                    }
                    let primary = sample.primary.clone();
                    final_topology = Some(sample);
                    primary
                }
                Err(ProbeError::Unavailable { attempted }) => {
                    tracing::warn!(attempted, "all discovery endpoints unreachable");
                    None
                }
                Err(err @ ProbeError::UnmappedNode { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "topology poll failed");
                    None
                }
            };

            state = self.transition(state, observed, &mut events).await;

            if let PrimaryState::Stable(primary) = &state {
                if polls % self.config.status_every == 0 {
                    let replicas = final_topology
                        .as_ref()
                        .map(|t| t.replicas.len())
                        .unwrap_or(0);
                    tracing::info!(polls, primary = %primary, replicas, "cluster status");
                }
            }
        }

        Ok(FailoverReport {
            polls,
            poll_interval_ms: self.config.poll_interval.as_millis() as u64,
            events,
            initial_topology,
            final_topology,
        })
    }

    /// Applies one observation to the state machine, appending any events it
    /// produces. The returned state is the input for the next poll.
    async fn transition(
        &mut self,
        state: PrimaryState,
        observed: Option<NodeAddress>,
        events: &mut Vec<FailoverEvent>,
    ) -> PrimaryState {
        match (state, observed) {
            (PrimaryState::Unknown, Some(primary)) => {
                tracing::info!(primary = %primary, "baseline primary resolved");
                PrimaryState::Stable(primary)
            }
            (PrimaryState::Unknown, None) => PrimaryState::Unresolvable {
                since: Instant::now(),
                last_known: None,
            },
            (PrimaryState::Stable(current), Some(next)) if current == next => {
                PrimaryState::Stable(current)
            }
            // The primary moved without an observed down period: the polling
            // interval outran the election. Duration is unmeasurable, not
            // unreportable.
            (PrimaryState::Stable(current), Some(next)) => {
                tracing::info!(
                    previous = %current,
                    new = %next,
                    "primary changed without observed outage"
                );
                events.push(FailoverEvent::FailoverCompleted {
                    at_ms: unix_millis(),
                    previous_primary: current,
                    new_primary: next.clone(),
                    duration_ms: 0,
                });
                events.push(self.write_probe(&next).await);
                PrimaryState::Stable(next)
            }
            (PrimaryState::Stable(current), None) => {
                tracing::warn!(previous = %current, "primary unresolvable, possible failover in progress");
                events.push(FailoverEvent::MasterDownDetected {
                    at_ms: unix_millis(),
                    previous_primary: current.clone(),
                });
                PrimaryState::Unresolvable {
                    since: Instant::now(),
                    last_known: Some(current),
                }
            }
            (state @ PrimaryState::Unresolvable { .. }, None) => state,
            (PrimaryState::Unresolvable { since, last_known }, Some(next)) => {
                if let Some(previous) = last_known {
                    let duration = since.elapsed();
                    tracing::info!(
                        previous = %previous,
                        new = %next,
                        duration_ms = duration.as_millis() as u64,
                        "failover completed"
                    );
                    events.push(FailoverEvent::FailoverCompleted {
                        at_ms: unix_millis(),
                        previous_primary: previous,
                        new_primary: next.clone(),
                        duration_ms: duration.as_millis() as u64,
                    });
                    events.push(self.write_probe(&next).await);
                } else {
                    tracing::info!(primary = %next, "baseline primary resolved after outage");
                }
                PrimaryState::Stable(next)
            }
        }
    }

    /// One liveness write against the new primary. Informational only.
    async fn write_probe(&self, primary: &NodeAddress) -> FailoverEvent {
        let at_ms = unix_millis();
        match Self::try_write(primary, self.config.op_timeout).await {
            Ok(key) => {
                tracing::info!(primary = %primary, key = %key, "write probe succeeded");
                FailoverEvent::WriteProbeResult {
                    at_ms,
                    succeeded: true,
                    detail: key,
                }
            }
            Err(err) => {
                tracing::warn!(primary = %primary, error = %err, "write probe failed");
                FailoverEvent::WriteProbeResult {
                    at_ms,
                    succeeded: false,
                    detail: err.to_string(),
                }
            }
        }
    }

    async fn try_write(primary: &NodeAddress, op_timeout: Duration) -> Result<String, ProbeError> {
        let mut client = StoreClient::connect(primary.clone(), op_timeout).await?;
        client.ping().await?;
        let key = format!("failover_probe_{}", unix_millis());
        client.set(&key, "probe").await?;
        Ok(key)
    }
}
