//! Topology discovery.
//!
//! [`DiscoveryProbe`] asks sentinel-style discovery endpoints for the
//! current primary and replica set of a named replication group. The probe
//! holds no connections between calls, so it is safe to drive on a fixed
//! interval indefinitely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis_protocol::resp2::types::BytesFrame;

use crate::client::StoreClient;
use crate::error::ProbeError;
use crate::resolver::AddressResolver;
use crate::types::{unix_millis, ClusterTopologySample, NodeAddress};

#[async_trait]
pub trait TopologyProbe {
    /// One observation of the deployment's replication roles.
    ///
    /// Fails with [`ProbeError::Unavailable`] only when every discovery
    /// endpoint is unreachable. A reachable deployment whose primary is
    /// mid-election yields `primary: None` instead.
    async fn current_topology(&mut self) -> Result<ClusterTopologySample, ProbeError>;
}

/// Sentinel-style discovery over RESP.
pub struct DiscoveryProbe {
    endpoints: Vec<NodeAddress>,
    group: String,
    resolver: Arc<dyn AddressResolver + Send + Sync>,
    op_timeout: Duration,
}

impl DiscoveryProbe {
    pub fn new(
        endpoints: Vec<NodeAddress>,
        group: impl Into<String>,
        resolver: Arc<dyn AddressResolver + Send + Sync>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            group: group.into(),
            resolver,
            op_timeout,
        }
    }

    /// Queries one discovery endpoint. `Ok(None)` means this endpoint could
    /// not be used and the next one should be tried; configuration errors
    /// propagate immediately.
    async fn query_endpoint(
        &self,
        endpoint: &NodeAddress,
    ) -> Result<Option<ClusterTopologySample>, ProbeError> {
        let mut client = match StoreClient::connect(endpoint.clone(), self.op_timeout).await {
            Ok(client) => client,
            Err(err) => {
                tracing::debug!(endpoint = %endpoint, error = %err, "discovery endpoint unreachable");
                return Ok(None);
            }
        };

        let master_reply = match client
            .command(&[b"SENTINEL", b"GET-MASTER-ADDR-BY-NAME", self.group.as_bytes()])
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(endpoint = %endpoint, error = %err, "discovery query failed");
                return Ok(None);
            }
        };

        let primary = match parse_master_addr(&master_reply) {
            MasterReply::Known(reported) => Some(self.resolver.resolve(&reported)?),
            MasterReply::Unknown => None,
            MasterReply::Unusable => {
                tracing::debug!(
                    endpoint = %endpoint,
                    reply = ?master_reply,
                    "discovery endpoint gave an unusable master reply"
                );
                return Ok(None);
            }
        };

        // Replica discovery is best-effort: a primary-only answer is still a
        // valid topology sample.
        let mut replicas = Vec::new();
        match client
            .command(&[b"SENTINEL", b"REPLICAS", self.group.as_bytes()])
            .await
        {
            Ok(BytesFrame::Array(entries)) => {
                for entry in &entries {
                    if let Some(reported) = parse_replica_entry(entry) {
                        replicas.push(self.resolver.resolve(&reported)?);
                    }
                }
            }
            Ok(other) => {
                tracing::warn!(endpoint = %endpoint, reply = ?other, "unusable replica listing");
            }
            Err(err) => {
                tracing::warn!(endpoint = %endpoint, error = %err, "replica listing failed");
            }
        }

        Ok(Some(ClusterTopologySample {
            primary,
            replicas,
            sampled_at_ms: unix_millis(),
        }))
    }
}

#[async_trait]
impl TopologyProbe for DiscoveryProbe {
    async fn current_topology(&mut self) -> Result<ClusterTopologySample, ProbeError> {
        for endpoint in self.endpoints.clone() {
            if let Some(sample) = self.query_endpoint(&endpoint).await? {
                return Ok(sample);
            }
        }
        Err(ProbeError::Unavailable {
            attempted: self.endpoints.len(),
        })
    }
}

enum MasterReply {
    Known(NodeAddress),
    Unknown,
    Unusable,
}

/// `SENTINEL GET-MASTER-ADDR-BY-NAME` answers `[host, port]`, or null while
/// no primary is resolvable.
fn parse_master_addr(reply: &BytesFrame) -> MasterReply {
    match reply {
        BytesFrame::Null => MasterReply::Unknown,
        BytesFrame::Array(parts) if parts.len() == 2 => {
            let Some(host) = frame_text(&parts[0]) else {
                return MasterReply::Unusable;
            };
            let Some(port) = frame_text(&parts[1]).and_then(|p| p.parse::<u16>().ok()) else {
                return MasterReply::Unusable;
            };
            MasterReply::Known(NodeAddress::new(host, port))
        }
        _ => MasterReply::Unusable,
    }
}

/// Each `SENTINEL REPLICAS` entry is a flat field/value array; only the
/// `ip` and `port` fields matter here.
fn parse_replica_entry(entry: &BytesFrame) -> Option<NodeAddress> {
    let BytesFrame::Array(fields) = entry else {
        return None;
    };
    let mut host = None;
    let mut port = None;
    for pair in fields.chunks_exact(2) {
        match frame_text(&pair[0])?.as_str() {
            "ip" => host = frame_text(&pair[1]),
            "port" => port = frame_text(&pair[1]).and_then(|p| p.parse::<u16>().ok()),
            _ => {}
        }
    }
    Some(NodeAddress::new(host?, port?))
}

fn frame_text(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
            Some(String::from_utf8_lossy(bytes).to_string())
        }
        _ => None,
    }
}
