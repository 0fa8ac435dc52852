// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use benchmarks::{
    BenchResult, ReplicationConfig, Topology, print_replication_report, run_replication,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "replication",
    about = "primary plus in-process replicas: sequencing throughput and replica convergence",
    version,
    after_help = "Examples:\n  cargo run -p benchmarks --bin replication -- --replicas 3 --count 1000\n  cargo run -p benchmarks --bin replication --release -- --replicas 8 --count 20000 --topology chain --concurrency 32"
)]
struct Args {
    #[arg(long, default_value_t = 3_usize)]
    replicas: usize,
    #[arg(long, default_value_t = 1_000_usize)]
    count: usize,
    /// Parallel submitters against the primary.
    #[arg(long, default_value_t = 8_usize)]
    concurrency: usize,
    #[arg(long, default_value_t = 64_usize)]
    payload_len: usize,
    #[arg(long, value_enum, default_value_t = Topology::Star)]
    topology: Topology,
    #[arg(long, default_value_t = 8_192_usize)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 256_usize)]
    max_items_per_turn: usize,
    /// Per-subscriber buffer; a replica that falls this far behind is dropped from the feed.
    #[arg(long, default_value_t = 65_536_usize)]
    feed_buffer_capacity: usize,
    #[arg(long, default_value_t = 30_000_u64)]
    convergence_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> BenchResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    println!(
        "replication config: replicas={}, count={}, concurrency={}, topology={:?}, payload_len={}",
        args.replicas, args.count, args.concurrency, args.topology, args.payload_len
    );

    let report = run_replication(&ReplicationConfig {
        replicas: args.replicas,
        count: args.count,
        concurrency: args.concurrency,
        payload_len: args.payload_len,
        topology: args.topology,
        queue_capacity: args.queue_capacity,
        max_items_per_turn: args.max_items_per_turn,
        feed_buffer_capacity: args.feed_buffer_capacity,
        convergence_timeout: Duration::from_millis(args.convergence_timeout_ms),
    })
    .await?;

    print_replication_report(&report);
    if !report.all_converged() {
        return Err("not every replica reached the primary tip".into());
    }
    Ok(())
}
