//! CLI entry point for the verification harness.
//!
//! Each subcommand drives one checker against a live deployment and
//! persists the structured run record as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kvprobe::client::{ClusterClient, StoreClient};
use kvprobe::consistency::{ConsistencyChecker, ConsistencyConfig};
use kvprobe::failover::{FailoverConfig, FailoverMonitor};
use kvprobe::report::{JsonFileRecorder, ResultRecorder, RunOutcome, RunRecord};
use kvprobe::resolver::{AddressResolver, IdentityResolver, StaticAddressResolver};
use kvprobe::sharding::{ShardDistributionAnalyzer, ShardingConfig};
use kvprobe::topology::DiscoveryProbe;
use kvprobe::types::{unix_millis, NodeAddress};

#[derive(Parser, Debug)]
#[command(name = "kvprobe", about = "Correctness harness for replicated and sharded key-value deployments")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a key universe to the primary and compare every replica's
    /// view, immediately and again after a settle delay.
    Consistency(ConsistencyArgs),
    /// Poll discovery endpoints for the primary and record failover
    /// episodes as they happen.
    Failover(FailoverArgs),
    /// Drive keys through a sharded deployment and analyze slot placement.
    Sharding(ShardingArgs),
}

#[derive(Parser, Debug)]
struct ConsistencyArgs {
    /// Writable primary endpoint, `host:port`.
    #[arg(long)]
    primary: String,

    /// Comma-separated replica endpoints, e.g. `10.0.0.2:6380,10.0.0.2:6381`.
    #[arg(long)]
    replicas: String,

    /// Number of distinct keys written to the primary.
    #[arg(long, default_value_t = 1000)]
    keys: u32,

    /// Probe keys are generated as `{key-prefix}:{index}`.
    #[arg(long, default_value = "test_key")]
    key_prefix: String,

    /// Wait between the immediate and repeated read passes.
    #[arg(long, default_value = "5s")]
    settle: humantime::Duration,

    /// Per-operation timeout (network + server response).
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Write the run record to this path.
    #[arg(long, default_value = "results/consistency.json")]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct FailoverArgs {
    /// Comma-separated discovery endpoints, e.g. `10.0.0.2:26379,10.0.0.2:26380`.
    #[arg(long)]
    discovery: String,

    /// Logical replication group name known to the discovery endpoints.
    #[arg(long, default_value = "mymaster")]
    group: String,

    /// Fixed delay between topology polls.
    #[arg(long, default_value = "2s")]
    interval: humantime::Duration,

    /// Poll budget; 0 runs until ctrl-c.
    #[arg(long, default_value_t = 300)]
    max_polls: u64,

    /// Per-operation timeout (network + server response).
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Reported-to-reachable address mapping, `internal:port=external:port`.
    /// Repeatable. Without any mapping, reported addresses are dialed as-is.
    #[arg(long = "addr-map")]
    addr_map: Vec<String>,

    /// Write the run record to this path.
    #[arg(long, default_value = "results/failover.json")]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct ShardingArgs {
    /// Comma-separated seed endpoints of the sharded deployment.
    #[arg(long)]
    nodes: String,

    /// Number of distinct keys written through the deployment.
    #[arg(long, default_value_t = 10_000)]
    keys: u32,

    /// Total partition count of the deployment's hash space.
    #[arg(long, default_value_t = 16384)]
    partitions: u16,

    /// Width of the reporting-only per-node range approximation.
    #[arg(long, default_value_t = 3)]
    node_count: u16,

    /// How many written keys to read back as a spot check.
    #[arg(long, default_value_t = 1000)]
    read_sample: u32,

    /// Probe keys are generated as `{key-prefix}{index}`.
    #[arg(long, default_value = "key")]
    key_prefix: String,

    /// Per-operation timeout (network + server response).
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Reported-to-reachable address mapping for redirect targets and slot
    /// ownership, `internal:port=external:port`. Repeatable.
    #[arg(long = "addr-map")]
    addr_map: Vec<String>,

    /// Write the run record to this path.
    #[arg(long, default_value = "results/sharding.json")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvprobe=info,warn")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Consistency(args) => run_consistency(args).await,
        Command::Failover(args) => run_failover(args).await,
        Command::Sharding(args) => run_sharding(args).await,
    }
}

async fn run_consistency(args: ConsistencyArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    let primary_addr: NodeAddress = args
        .primary
        .parse()
        .map_err(anyhow::Error::msg)
        .context("--primary")?;
    let replica_addrs = parse_nodes(&args.replicas).context("--replicas")?;
    anyhow::ensure!(!replica_addrs.is_empty(), "--replicas must not be empty");

    let started_at_ms = unix_millis();
    let op_timeout = args.op_timeout.into();

    // A one-shot run needs every endpoint up front; any connect failure is
    // fatal before the first write.
    let mut primary = StoreClient::connect(primary_addr.clone(), op_timeout)
        .await
        .context("connect to primary")?;
    primary.ping().await.context("ping primary")?;
    tracing::info!(node = %primary_addr, role = "primary", "connected");

    let mut replicas = Vec::with_capacity(replica_addrs.len());
    for addr in replica_addrs {
        let mut replica = StoreClient::connect(addr.clone(), op_timeout)
            .await
            .with_context(|| format!("connect to replica {addr}"))?;
        replica.ping().await.with_context(|| format!("ping replica {addr}"))?;
        tracing::info!(node = %addr, role = "replica", "connected");
        replicas.push(replica);
    }

    let checker = ConsistencyChecker::new(ConsistencyConfig {
        key_count: args.keys,
        key_prefix: args.key_prefix,
        settle_delay: args.settle.into(),
    });
    let report = checker
        .run(&mut primary, &mut replicas)
        .await
        .context("consistency check")?;

    persist(args.out, started_at_ms, RunOutcome::Consistency(report))
}

async fn run_failover(args: FailoverArgs) -> anyhow::Result<()> {
    let discovery = parse_nodes(&args.discovery).context("--discovery")?;
    anyhow::ensure!(!discovery.is_empty(), "--discovery must not be empty");
    let resolver = build_resolver(&args.addr_map)?;

    let started_at_ms = unix_millis();
    let probe = DiscoveryProbe::new(discovery, args.group, resolver, args.op_timeout.into());
    let mut monitor = FailoverMonitor::new(
        probe,
        FailoverConfig {
            poll_interval: args.interval.into(),
            max_polls: (args.max_polls > 0).then_some(args.max_polls),
            op_timeout: args.op_timeout.into(),
            ..FailoverConfig::default()
        },
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, stopping after the current poll");
            signal_cancel.cancel();
        }
    });

    let report = monitor.run(cancel).await.context("failover monitoring")?;
    tracing::info!(
        polls = report.polls,
        events = report.events.len(),
        "monitoring finished"
    );

    persist(args.out, started_at_ms, RunOutcome::Failover(report))
}

async fn run_sharding(args: ShardingArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.partitions > 0, "--partitions must be > 0");
    let seeds = parse_nodes(&args.nodes).context("--nodes")?;
    anyhow::ensure!(!seeds.is_empty(), "--nodes must not be empty");

    let resolver = build_resolver(&args.addr_map)?;

    let started_at_ms = unix_millis();
    let mut cluster = ClusterClient::new(seeds, resolver, args.op_timeout.into());
    let analyzer = ShardDistributionAnalyzer::new(ShardingConfig {
        key_count: args.keys,
        key_prefix: args.key_prefix,
        total_partitions: args.partitions,
        node_count: args.node_count,
        read_sample: args.read_sample,
    });
    let report = analyzer
        .run(&mut cluster)
        .await
        .context("shard distribution analysis")?;
    tracing::info!(
        unique_slots = report.distribution.unique_slots,
        write_failures = report.write_failures_total,
        "analysis finished"
    );

    persist(args.out, started_at_ms, RunOutcome::Sharding(report))
}

fn persist(out: PathBuf, started_at_ms: u64, outcome: RunOutcome) -> anyhow::Result<()> {
    let record = RunRecord {
        started_at_ms,
        finished_at_ms: unix_millis(),
        outcome,
    };
    JsonFileRecorder::new(out).record(&record)
}

/// Parses a comma-separated list of `host:port` addresses.
fn parse_nodes(input: &str) -> anyhow::Result<Vec<NodeAddress>> {
    let mut out = Vec::new();
    for part in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        out.push(part.parse::<NodeAddress>().map_err(anyhow::Error::msg)?);
    }
    Ok(out)
}

/// Builds the resolver from repeated `internal=external` pairs; without any
/// pairs, reported addresses are used verbatim.
fn build_resolver(pairs: &[String]) -> anyhow::Result<Arc<dyn AddressResolver + Send + Sync>> {
    if pairs.is_empty() {
        return Ok(Arc::new(IdentityResolver));
    }
    let mut mapping = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (internal, external) = pair
            .split_once('=')
            .with_context(|| format!("invalid --addr-map entry {pair:?} (expected inner=outer)"))?;
        let internal: NodeAddress = internal.trim().parse().map_err(anyhow::Error::msg)?;
        let external: NodeAddress = external.trim().parse().map_err(anyhow::Error::msg)?;
        mapping.push((internal, external));
    }
    Ok(Arc::new(StaticAddressResolver::new(mapping)))
}
