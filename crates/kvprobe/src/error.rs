//! Error taxonomy for probe operations.
//!
//! Per-key write/read failures are not here: those are accumulated as
//! [`KeyFailure`](crate::types::KeyFailure) lists in reports. This enum
//! covers the failures that either abort an operation (connection,
//! configuration) or describe a whole-probe outcome (no discovery endpoint
//! reachable).

use std::time::Duration;

use thiserror::Error;

use crate::types::NodeAddress;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The endpoint could not be reached or the connection broke mid-call.
    #[error("connection to {addr} failed: {reason}")]
    Connection { addr: NodeAddress, reason: String },

    /// A single store operation exceeded its bounded timeout. Handled by
    /// callers exactly like an explicit error response.
    #[error("operation against {addr} timed out after {timeout:?}")]
    Timeout { addr: NodeAddress, timeout: Duration },

    /// The endpoint answered with something the harness cannot interpret,
    /// including explicit error replies.
    #[error("unexpected response from {addr}: {detail}")]
    Protocol { addr: NodeAddress, detail: String },

    /// Every configured discovery endpoint was unreachable. Distinct from a
    /// reachable deployment whose primary is mid-election.
    #[error("no discovery endpoint reachable ({attempted} tried)")]
    Unavailable { attempted: usize },

    /// A store-reported node identifier has no entry in the address map.
    /// This is a configuration error and is never silently defaulted.
    #[error("no address mapping for store-reported node {reported}")]
    UnmappedNode { reported: NodeAddress },
}

impl ProbeError {
    /// True for failures that mean the peer could not be talked to at all,
    /// as opposed to answering with something unexpected.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ProbeError::Connection { .. } | ProbeError::Timeout { .. }
        )
    }
}
