// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::error::Error;
use std::time::{Duration, Instant};

use chain_core::{KeySigner, SequenceTx, Signer, TrustRoot};
use futures_util::future::join_all;
use sequencer::gossip::{BlockFeed, spawn_local_ingest};
use sequencer::sequencer_core::{
    Role, SequencerCore, SequencerCoreConfig, SequencerCoreError, SequencerCoreStop,
    SequencerHandle, SequencerInfo,
};
use sequencer::storage::Storage;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub type BenchResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const CLIENT_POOL_SIZE: usize = 16;
const TX_TTL: Duration = Duration::from_secs(300);
const SQLITE_SYNCHRONOUS: &str = "NORMAL";
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct Stats {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
}

/// How replicas receive blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Topology {
    /// Every replica subscribes to the primary's feed.
    Star,
    /// Each replica subscribes to the feed of the node before it.
    Chain,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub replicas: usize,
    pub count: usize,
    pub concurrency: usize,
    pub payload_len: usize,
    pub topology: Topology,
    pub queue_capacity: usize,
    pub max_items_per_turn: usize,
    pub feed_buffer_capacity: usize,
    pub convergence_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReplicaReport {
    pub index: usize,
    /// Measured from the first submission; `None` when the timeout elapsed first.
    pub converged_after: Option<Duration>,
    pub info: SequencerInfo,
}

#[derive(Debug, Clone)]
pub struct ReplicationReport {
    pub sequenced: usize,
    pub submit_wall: Duration,
    pub ack: Stats,
    pub primary: SequencerInfo,
    pub replicas: Vec<ReplicaReport>,
}

impl ReplicationReport {
    pub fn all_converged(&self) -> bool {
        self.replicas
            .iter()
            .all(|replica| replica.converged_after.is_some())
    }
}

struct BenchNode {
    handle: SequencerHandle,
    feed: BlockFeed,
    stop: SequencerCoreStop,
    join: JoinHandle<SequencerCoreError>,
}

impl BenchNode {
    fn start(
        dir: &TempDir,
        name: &str,
        role: Role,
        trust_root: TrustRoot,
        config: &ReplicationConfig,
    ) -> BenchResult<Self> {
        let path = dir.path().join(format!("{name}.sqlite"));
        let storage = Storage::open(path.to_string_lossy().as_ref(), SQLITE_SYNCHRONOUS)
            .map_err(|e| err(format!("open storage for {name} failed: {e}")))?;
        let (core, handle) = SequencerCore::new(
            role,
            trust_root,
            storage,
            SequencerCoreConfig {
                queue_capacity: config.queue_capacity.max(1),
                max_items_per_turn: config.max_items_per_turn.max(1),
                idle_poll_interval: Duration::from_micros(200),
                metrics_enabled: false,
                metrics_log_interval: Duration::from_secs(60),
            },
        )
        .map_err(|e| err(format!("build sequencer core for {name} failed: {e}")))?;
        let feed = BlockFeed::new(config.feed_buffer_capacity);
        feed.attach(&handle);
        let (join, stop) = core.spawn();
        Ok(Self {
            handle,
            feed,
            stop,
            join,
        })
    }

    async fn shutdown(self) {
        self.stop.request_shutdown();
        let _ = self.join.await;
    }
}

/// Signs `count` transactions up front so signing cost stays out of the measurement.
pub fn make_signed_txs(count: usize, payload_len: usize) -> BenchResult<Vec<Vec<u8>>> {
    let clients: Vec<KeySigner> = (0..CLIENT_POOL_SIZE).map(|_| KeySigner::random()).collect();
    let mut txs = Vec::with_capacity(count);
    for i in 0..count {
        let client = &clients[i % clients.len()];
        let mut data = vec![0_u8; payload_len.max(8)];
        data[..8].copy_from_slice(&(i as u64).to_be_bytes());
        let tx = SequenceTx::new(data, TX_TTL)
            .with_from(&client.public_key())
            .signed(client)
            .map_err(|e| err(format!("sign tx {i} failed: {e}")))?;
        txs.push(tx.encode());
    }
    Ok(txs)
}

/// Runs one primary and `config.replicas` in-process replicas fed through
/// block feeds, submits `config.count` transactions to the primary and waits
/// for every replica to reach the primary tip.
pub async fn run_replication(config: &ReplicationConfig) -> BenchResult<ReplicationReport> {
    if config.count == 0 {
        return Err(err("count must be greater than zero"));
    }
    let dir = tempfile::Builder::new()
        .prefix("sequencer-bench-")
        .tempdir()?;
    let operator = KeySigner::random();
    let trust_root = TrustRoot::single(operator.public_key());

    let primary = BenchNode::start(
        &dir,
        "primary",
        Role::Primary(operator),
        trust_root.clone(),
        config,
    )?;
    let mut replicas = Vec::with_capacity(config.replicas);
    let mut ingests = Vec::with_capacity(config.replicas);
    for index in 0..config.replicas {
        let replica = BenchNode::start(
            &dir,
            format!("replica-{index}").as_str(),
            Role::Replica,
            trust_root.clone(),
            config,
        )?;
        let upstream = match (config.topology, replicas.last()) {
            (Topology::Chain, Some(previous)) => previous,
            _ => &primary,
        };
        ingests.push(spawn_local_ingest(
            upstream.feed.subscribe(),
            replica.handle.clone(),
        ));
        replicas.push(replica);
    }

    let txs = make_signed_txs(config.count, config.payload_len)?;
    let started = now();
    let submitted = submit_all(&primary.handle, txs, config.concurrency).await;
    let submit_wall = started.elapsed();

    let outcome = match submitted {
        Ok(ack_samples) => {
            let primary_info = primary.handle.info();
            let converged = wait_for_convergence(
                primary_info.tip_height,
                &replicas,
                started,
                config.convergence_timeout,
            )
            .await;
            summarize(ack_samples.as_slice()).map(|ack| ReplicationReport {
                sequenced: ack_samples.len(),
                submit_wall,
                ack,
                primary: primary_info,
                replicas: converged,
            })
        }
        Err(e) => Err(e),
    };

    for ingest in ingests {
        ingest.abort();
    }
    primary.shutdown().await;
    for replica in replicas {
        replica.shutdown().await;
    }
    outcome
}

async fn submit_all(
    handle: &SequencerHandle,
    txs: Vec<Vec<u8>>,
    concurrency: usize,
) -> BenchResult<Vec<Duration>> {
    let workers = concurrency.clamp(1, txs.len().max(1));
    let mut lanes: Vec<Vec<Vec<u8>>> = vec![Vec::new(); workers];
    for (i, tx) in txs.into_iter().enumerate() {
        lanes[i % workers].push(tx);
    }

    let tasks = lanes.into_iter().map(|lane| {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut samples = Vec::with_capacity(lane.len());
            for raw in lane {
                let sent = now();
                handle.sequence(raw).await?.wait().await?;
                samples.push(sent.elapsed());
            }
            Ok::<_, Box<dyn Error + Send + Sync>>(samples)
        })
    });

    let mut samples = Vec::new();
    for joined in join_all(tasks).await {
        samples.extend(joined??);
    }
    Ok(samples)
}

async fn wait_for_convergence(
    target_height: u64,
    replicas: &[BenchNode],
    started: Instant,
    timeout: Duration,
) -> Vec<ReplicaReport> {
    let deadline = now() + timeout;
    let mut converged_after: Vec<Option<Duration>> = vec![None; replicas.len()];
    loop {
        for (slot, replica) in converged_after.iter_mut().zip(replicas) {
            if slot.is_none() && replica.handle.info().tip_height >= target_height {
                *slot = Some(started.elapsed());
            }
        }
        if converged_after.iter().all(Option::is_some) || now() >= deadline {
            break;
        }
        tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
    }

    converged_after
        .into_iter()
        .zip(replicas)
        .enumerate()
        .map(|(index, (converged_after, replica))| ReplicaReport {
            index,
            converged_after,
            info: replica.handle.info(),
        })
        .collect()
}

pub fn print_replication_report(report: &ReplicationReport) {
    println!(
        "replication benchmark completed: sequenced={}, replicas={}",
        report.sequenced,
        report.replicas.len()
    );
    println!(
        "primary_tx_per_s: {:.2}",
        throughput_tx_per_s(report.sequenced, report.submit_wall)
    );
    println!("submit_wall: {}", format_ms(report.submit_wall));
    print_stats("sequence_ack (admit + block persisted)", &report.ack);
    println!(
        "primary: tip={} total={}",
        report.primary.tip_height, report.primary.total
    );
    for replica in &report.replicas {
        let converged = match replica.converged_after {
            Some(elapsed) => format!(
                "{} (lag {})",
                format_ms(elapsed),
                format_ms(elapsed.saturating_sub(report.submit_wall))
            ),
            None => "timed out".to_string(),
        };
        println!(
            "replica {}: tip={} pending={} total={} converged={}",
            replica.index,
            replica.info.tip_height,
            replica.info.pending_blocks,
            replica.info.total,
            converged
        );
    }
}

pub fn summarize(samples: &[Duration]) -> BenchResult<Stats> {
    if samples.is_empty() {
        return Err(err("cannot summarize empty sample set"));
    }

    let mut nanos: Vec<u128> = samples.iter().map(Duration::as_nanos).collect();
    nanos.sort_unstable();
    let sum: u128 = nanos.iter().copied().sum();
    let count = nanos.len();

    Ok(Stats {
        count,
        min: duration_from_nanos(nanos[0]),
        max: duration_from_nanos(nanos[count - 1]),
        mean: duration_from_nanos(sum / count as u128),
        p50: duration_from_nanos(percentile(&nanos, 0.50)),
        p95: duration_from_nanos(percentile(&nanos, 0.95)),
        p99: duration_from_nanos(percentile(&nanos, 0.99)),
        p999: duration_from_nanos(percentile(&nanos, 0.999)),
    })
}

pub fn print_stats(name: &str, stats: &Stats) {
    println!("{name}:");
    println!("  count: {}", stats.count);
    println!("  min:   {}", format_ms(stats.min));
    println!("  p50:   {}", format_ms(stats.p50));
    println!("  p95:   {}", format_ms(stats.p95));
    println!("  p99:   {}", format_ms(stats.p99));
    println!("  p99.9: {}", format_ms(stats.p999));
    println!("  max:   {}", format_ms(stats.max));
    println!("  mean:  {}", format_ms(stats.mean));
}

pub fn throughput_tx_per_s(accepted_count: usize, total_wall: Duration) -> f64 {
    if total_wall.is_zero() {
        0.0
    } else {
        accepted_count as f64 / total_wall.as_secs_f64()
    }
}

pub fn now() -> Instant {
    Instant::now()
}

fn percentile(sorted_nanos: &[u128], p: f64) -> u128 {
    let last = sorted_nanos.len() - 1;
    let rank = (p * last as f64).ceil() as usize;
    sorted_nanos[rank.min(last)]
}

fn duration_from_nanos(value: u128) -> Duration {
    let nanos = u64::try_from(value).unwrap_or(u64::MAX);
    Duration::from_nanos(nanos)
}

fn format_ms(value: Duration) -> String {
    format!("{:.3} ms", value.as_secs_f64() * 1000.0)
}

fn err(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(std::io::Error::other(message.into()))
}
