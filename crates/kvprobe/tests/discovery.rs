//! Discovery probe and failover monitor integration tests against an
//! in-process mock sentinel and mock store nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{dead_endpoint, MockNode};
use kvprobe::error::ProbeError;
use kvprobe::failover::{FailoverConfig, FailoverMonitor};
use kvprobe::resolver::{IdentityResolver, StaticAddressResolver};
use kvprobe::topology::{DiscoveryProbe, TopologyProbe};
use kvprobe::types::{FailoverEvent, NodeAddress};
use tokio_util::sync::CancellationToken;

const OP_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn probe_resolves_master_and_replicas() {
    let sentinel = MockNode::spawn().await;
    let master = NodeAddress::new("127.0.0.1", 6379);
    let replica = NodeAddress::new("127.0.0.1", 6380);
    sentinel.set_master(Some(master.clone()));
    sentinel.set_replicas(vec![replica.clone()]);

    let mut probe = DiscoveryProbe::new(
        vec![sentinel.addr.clone()],
        "mymaster",
        Arc::new(IdentityResolver),
        OP_TIMEOUT,
    );
    let sample = probe.current_topology().await.unwrap();
    assert_eq!(sample.primary, Some(master));
    assert_eq!(sample.replicas, vec![replica]);
}

#[tokio::test]
async fn probe_reports_unknown_primary_as_none() {
    let sentinel = MockNode::spawn().await;
    sentinel.set_master(None);

    let mut probe = DiscoveryProbe::new(
        vec![sentinel.addr.clone()],
        "mymaster",
        Arc::new(IdentityResolver),
        OP_TIMEOUT,
    );
    let sample = probe.current_topology().await.unwrap();
    assert_eq!(sample.primary, None);
}

#[tokio::test]
async fn probe_fails_only_when_every_endpoint_is_down() {
    let dead_one = dead_endpoint().await;
    let dead_two = dead_endpoint().await;
    let mut probe = DiscoveryProbe::new(
        vec![dead_one, dead_two],
        "mymaster",
        Arc::new(IdentityResolver),
        Duration::from_millis(300),
    );
    let err = probe.current_topology().await.unwrap_err();
    assert!(matches!(err, ProbeError::Unavailable { attempted: 2 }));

    // A reachable endpoint behind a dead one still yields a sample.
    let sentinel = MockNode::spawn().await;
    sentinel.set_master(Some(NodeAddress::new("127.0.0.1", 6379)));
    let dead = dead_endpoint().await;
    let mut probe = DiscoveryProbe::new(
        vec![dead, sentinel.addr.clone()],
        "mymaster",
        Arc::new(IdentityResolver),
        Duration::from_millis(300),
    );
    assert!(probe.current_topology().await.unwrap().primary.is_some());
}

#[tokio::test]
async fn probe_maps_reported_addresses() {
    let sentinel = MockNode::spawn().await;
    let internal = NodeAddress::new("172.18.0.2", 6379);
    let external = NodeAddress::new("127.0.0.1", 16379);
    sentinel.set_master(Some(internal.clone()));

    let resolver = StaticAddressResolver::new([(internal, external.clone())]);
    let mut probe = DiscoveryProbe::new(
        vec![sentinel.addr.clone()],
        "mymaster",
        Arc::new(resolver),
        OP_TIMEOUT,
    );
    let sample = probe.current_topology().await.unwrap();
    assert_eq!(sample.primary, Some(external));
}

#[tokio::test]
async fn unmapped_reported_address_is_fatal() {
    let sentinel = MockNode::spawn().await;
    sentinel.set_master(Some(NodeAddress::new("172.18.0.9", 6379)));

    let mut probe = DiscoveryProbe::new(
        vec![sentinel.addr.clone()],
        "mymaster",
        Arc::new(StaticAddressResolver::default()),
        OP_TIMEOUT,
    );
    let err = probe.current_topology().await.unwrap_err();
    assert!(matches!(err, ProbeError::UnmappedNode { .. }));
}

#[tokio::test]
async fn monitor_records_a_full_failover_episode() {
    let sentinel = MockNode::spawn().await;
    let node_a = MockNode::spawn().await;
    let node_b = MockNode::spawn().await;
    sentinel.set_master(Some(node_a.addr.clone()));

    let probe = DiscoveryProbe::new(
        vec![sentinel.addr.clone()],
        "mymaster",
        Arc::new(IdentityResolver),
        OP_TIMEOUT,
    );
    let mut monitor = FailoverMonitor::new(
        probe,
        FailoverConfig {
            poll_interval: Duration::from_millis(50),
            max_polls: None,
            status_every: 1000,
            op_timeout: OP_TIMEOUT,
        },
    );

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    let sentinel_state = sentinel.state.clone();
    let new_primary = node_b.addr.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        sentinel_state.lock().unwrap().master = None;
        tokio::time::sleep(Duration::from_millis(150)).await;
        sentinel_state.lock().unwrap().master = Some(new_primary);
        tokio::time::sleep(Duration::from_millis(250)).await;
        canceller.cancel();
    });

    let report = monitor.run(cancel).await.unwrap();

    let down = report
        .events
        .iter()
        .find(|e| matches!(e, FailoverEvent::MasterDownDetected { .. }))
        .expect("down detection event");
    assert!(matches!(
        down,
        FailoverEvent::MasterDownDetected { previous_primary, .. }
            if *previous_primary == node_a.addr
    ));

    let completed: Vec<_> = report
        .events
        .iter()
        .filter(|e| matches!(e, FailoverEvent::FailoverCompleted { .. }))
        .collect();
    assert_eq!(completed.len(), 1);
    let FailoverEvent::FailoverCompleted {
        previous_primary,
        new_primary,
        duration_ms,
        ..
    } = completed[0]
    else {
        unreachable!()
    };
    assert_eq!(*previous_primary, node_a.addr);
    assert_eq!(*new_primary, node_b.addr);
    assert!(*duration_ms >= 50, "duration was {duration_ms}ms");

    // The liveness probe must have landed on the new primary.
    assert!(matches!(
        report.events.last(),
        Some(FailoverEvent::WriteProbeResult { succeeded: true, .. })
    ));
    assert!(node_b
        .data_snapshot()
        .keys()
        .any(|key| key.starts_with("failover_probe_")));

    assert!(report.initial_topology.is_some());
    assert_eq!(
        report.final_topology.unwrap().primary,
        Some(node_b.addr.clone())
    );
}
