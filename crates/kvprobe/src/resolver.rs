//! Address resolution for store-reported node identifiers.
//!
//! Deployments frequently advertise internal addresses (container IPs,
//! overlay networks) that the harness cannot dial directly. Discovery
//! results are therefore mapped through an [`AddressResolver`] before any
//! connection is attempted. A missing mapping is a configuration error and
//! is reported as such, never silently passed through.

use std::collections::BTreeMap;

use crate::error::ProbeError;
use crate::types::NodeAddress;

pub trait AddressResolver {
    /// Maps a store-reported address to one the harness can reach.
    fn resolve(&self, reported: &NodeAddress) -> Result<NodeAddress, ProbeError>;
}

/// Explicit reported-to-reachable address table.
#[derive(Debug, Default, Clone)]
pub struct StaticAddressResolver {
    mapping: BTreeMap<NodeAddress, NodeAddress>,
}

impl StaticAddressResolver {
    pub fn new(pairs: impl IntoIterator<Item = (NodeAddress, NodeAddress)>) -> Self {
        Self {
            mapping: pairs.into_iter().collect(),
        }
    }
}

impl AddressResolver for StaticAddressResolver {
    fn resolve(&self, reported: &NodeAddress) -> Result<NodeAddress, ProbeError> {
        self.mapping
            .get(reported)
            .cloned()
            .ok_or_else(|| ProbeError::UnmappedNode {
                reported: reported.clone(),
            })
    }
}

/// Pass-through resolver for deployments reachable at their advertised
/// addresses. Choosing it is an explicit caller decision, not a fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl AddressResolver for IdentityResolver {
    fn resolve(&self, reported: &NodeAddress) -> Result<NodeAddress, ProbeError> {
        Ok(reported.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_maps_known_addresses() {
        let resolver = StaticAddressResolver::new([(
            NodeAddress::new("172.18.0.2", 6379),
            NodeAddress::new("203.0.113.9", 6379),
        )]);
        let mapped = resolver
            .resolve(&NodeAddress::new("172.18.0.2", 6379))
            .unwrap();
        assert_eq!(mapped, NodeAddress::new("203.0.113.9", 6379));
    }

    #[test]
    fn static_resolver_reports_misses() {
        let resolver = StaticAddressResolver::default();
        let err = resolver
            .resolve(&NodeAddress::new("172.18.0.5", 6379))
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnmappedNode { .. }));
    }

    #[test]
    fn identity_resolver_passes_through() {
        let addr = NodeAddress::new("10.1.2.3", 7000);
        assert_eq!(IdentityResolver.resolve(&addr).unwrap(), addr);
    }
}
