//! Active correctness probes for replicated and sharded key-value
//! deployments.
//!
//! Three checkers cover the properties a deployment is expected to hold:
//! replica convergence under asynchronous replication
//! ([`consistency::ConsistencyChecker`]), automatic failover of the
//! writable primary ([`failover::FailoverMonitor`]), and key-to-partition
//! placement under sharding ([`sharding::ShardDistributionAnalyzer`]).
//! Each run drives live store endpoints over the store's own wire protocol
//! and emits one structured [`report::RunRecord`].

pub mod client;
pub mod consistency;
pub mod error;
pub mod failover;
pub mod report;
pub mod resolver;
pub mod sharding;
pub mod topology;
pub mod types;

pub use client::{ClusterClient, StoreClient};
pub use error::ProbeError;
pub use resolver::{AddressResolver, IdentityResolver, StaticAddressResolver};
pub use topology::{DiscoveryProbe, TopologyProbe};
pub use types::{ClusterTopologySample, FailoverEvent, NodeAddress};
