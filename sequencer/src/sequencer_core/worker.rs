// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use alloy_primitives::Bytes;
use chain_core::{Block, ExpiryPolicy, SequenceTx, Signer, TrustRoot};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::{SequencerHandle, SharedState};
use super::profiling::SequencerCoreMetrics;
use super::types::{
    BlockOutcome, PendingBlock, PendingSequenceTx, Role, SequenceReceipt, SequencerError,
};
use super::SequencerCoreError;
use crate::storage::{AppendedBlock, Storage};

#[derive(Debug, Clone, Copy)]
pub struct SequencerCoreConfig {
    pub queue_capacity: usize,
    /// Upper bound on items taken from each queue per loop turn.
    pub max_items_per_turn: usize,
    pub idle_poll_interval: Duration,
    pub metrics_enabled: bool,
    pub metrics_log_interval: Duration,
}

impl Default for SequencerCoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_items_per_turn: 64,
            idle_poll_interval: Duration::from_millis(2),
            metrics_enabled: false,
            metrics_log_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequencerCoreStop {
    shutdown: Arc<AtomicBool>,
}

impl SequencerCoreStop {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// The single owner of chain state.
///
/// `last_block` and the out-of-order buffer are only touched from the
/// blocking thread started by [`SequencerCore::spawn`]; everything else talks
/// to it through [`SequencerHandle`].
pub struct SequencerCore {
    sequence_rx: mpsc::Receiver<PendingSequenceTx>,
    block_rx: mpsc::Receiver<PendingBlock>,
    stop: SequencerCoreStop,
    role: Role,
    trust_root: TrustRoot,
    storage: Storage,
    config: SequencerCoreConfig,
    last_block: Block,
    pending_by_height: BTreeMap<u64, Block>,
    shared: Arc<SharedState>,
    metrics: SequencerCoreMetrics,
}

impl SequencerCore {
    /// Resumes from the highest persisted block, or genesis on an empty database.
    pub fn new(
        role: Role,
        trust_root: TrustRoot,
        mut storage: Storage,
        config: SequencerCoreConfig,
    ) -> Result<(Self, SequencerHandle), SequencerCoreError> {
        let last_block = storage
            .load_chain_tip()
            .map_err(|source| SequencerCoreError::LoadTip { source })?
            .unwrap_or_else(Block::genesis);

        if let Role::Primary(signer) = &role {
            let height = last_block.height.saturating_add(1);
            let operator = *trust_root.operator_at(height);
            let key = signer.public_key();
            if key != operator {
                return Err(SequencerCoreError::OperatorKeyMismatch {
                    height,
                    signer: key,
                    operator,
                });
            }
        }

        let stats = storage
            .sequence_stats()
            .map_err(|source| SequencerCoreError::LoadStats { source })?;
        let shared = Arc::new(SharedState::new(
            role.mode(),
            stats.total,
            stats.last_received_at_ms.unwrap_or(0),
            last_block.height,
        ));

        let capacity = config.queue_capacity.max(1);
        let (sequence_tx, sequence_rx) = mpsc::channel(capacity);
        let (block_tx, block_rx) = mpsc::channel(capacity);
        let handle = SequencerHandle::new(sequence_tx, block_tx, Arc::clone(&shared));

        info!(
            mode = ?role.mode(),
            tip_height = last_block.height,
            tip = %last_block.short_hash(),
            total = stats.total,
            "sequencer core resumed"
        );

        let core = Self {
            sequence_rx,
            block_rx,
            stop: SequencerCoreStop::default(),
            role,
            trust_root,
            storage,
            config,
            last_block,
            pending_by_height: BTreeMap::new(),
            shared,
            metrics: SequencerCoreMetrics::new(config.metrics_enabled, config.metrics_log_interval),
        };
        Ok((core, handle))
    }

    pub fn spawn(self) -> (JoinHandle<SequencerCoreError>, SequencerCoreStop) {
        let stop = self.stop.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut core = self;
            let result = core.run_forever();
            core.metrics
                .log_final(core.last_block.height, core.pending_by_height.len());
            match result {
                Err(err) => err,
                Ok(()) => unreachable!("sequencer core run loop is expected to be non-terminating"),
            }
        });
        (handle, stop)
    }

    fn run_forever(&mut self) -> Result<(), SequencerCoreError> {
        let max_per_turn = self.config.max_items_per_turn.max(1);
        let mut sequence_batch = Vec::with_capacity(max_per_turn);
        let mut block_batch = Vec::with_capacity(max_per_turn);

        while !self.stop.is_shutdown_requested() {
            let queue_depth = self.sequence_rx.len().saturating_add(self.block_rx.len());
            self.metrics.on_loop_start(queue_depth);

            let started_at = self.metrics.phase_started_at();
            let sequence_closed = take_batch(&mut self.sequence_rx, max_per_turn, &mut sequence_batch);
            let sequenced = sequence_batch.len();
            for item in sequence_batch.drain(..) {
                self.handle_sequence(item);
            }
            self.metrics.on_sequence_phase_end(started_at);

            let started_at = self.metrics.phase_started_at();
            let block_closed = take_batch(&mut self.block_rx, max_per_turn, &mut block_batch);
            let processed = block_batch.len();
            for item in block_batch.drain(..) {
                self.handle_block(item);
            }
            self.metrics.on_block_phase_end(started_at);

            if sequenced == 0 && processed == 0 {
                if sequence_closed && block_closed {
                    return Err(SequencerCoreError::ChannelClosed);
                }
                let started_at = self.metrics.phase_started_at();
                thread::sleep(self.config.idle_poll_interval);
                self.metrics.on_idle_sleep_end(started_at);
            }

            self.metrics
                .maybe_log_window(self.last_block.height, self.pending_by_height.len());
        }

        Err(SequencerCoreError::ShutdownRequested)
    }

    fn handle_sequence(&mut self, item: PendingSequenceTx) {
        let PendingSequenceTx {
            tx,
            raw,
            received_at_ms,
            respond_to,
        } = item;
        let result = self.produce_block(tx, raw.as_slice(), received_at_ms);
        if let Err(err) = &result {
            self.metrics.on_rejected();
            warn!(error = %err, "sequencing failed");
        }
        let _ = respond_to.send(result);
    }

    fn handle_block(&mut self, item: PendingBlock) {
        let height = item.block.height;
        let result = self.ingest_block(item.block);
        if let Err(err) = &result {
            self.metrics.on_rejected();
            warn!(height, error = %err, "block rejected");
        }
        let _ = item.respond_to.send(result);
    }

    fn produce_block(
        &mut self,
        tx: SequenceTx,
        raw: &[u8],
        received_at_ms: u64,
    ) -> Result<SequenceReceipt, SequencerError> {
        let Role::Primary(signer) = &self.role else {
            return Err(SequencerError::NotAuthorized);
        };
        let height = self.last_block.height.saturating_add(1);
        if &signer.public_key() != self.trust_root.operator_at(height) {
            return Err(SequencerError::NotAuthorized);
        }

        let block = Block::next(&self.last_block, tx)
            .signed(signer)
            .map_err(|err| SequencerError::Signing(err.to_string()))?;
        let appended = self.persist(&block, raw, received_at_ms)?;
        self.metrics.on_sequenced();
        self.advance(block, received_at_ms);
        self.cascade();

        Ok(SequenceReceipt {
            sequence: appended.sequence,
            height: appended.height,
            block_hash: appended.block_hash,
        })
    }

    fn ingest_block(&mut self, block: Block) -> Result<BlockOutcome, SequencerError> {
        self.trust_root.verify_block(&block)?;

        let height = block.height;
        let tip_height = self.last_block.height;
        if height <= tip_height {
            self.metrics.on_duplicate_block();
            debug!(height, tip_height, "ignoring already known block");
            return Ok(BlockOutcome::AlreadyKnown { height });
        }
        if height > tip_height.saturating_add(1) {
            if let Some(buffered) = self.pending_by_height.get(&height) {
                self.metrics.on_duplicate_block();
                let buffered_hash = buffered.sighash();
                let incoming_hash = block.sighash();
                if buffered_hash == incoming_hash {
                    debug!(height, "block already buffered");
                } else {
                    // First signed block buffered at a height is kept.
                    warn!(
                        height,
                        buffered = %buffered_hash,
                        incoming = %incoming_hash,
                        "conflicting block for buffered height ignored"
                    );
                }
                return Ok(BlockOutcome::AlreadyKnown { height });
            }
            self.pending_by_height.insert(height, block);
            self.shared.set_pending_blocks(self.pending_by_height.len());
            self.metrics.on_block_buffered();
            debug!(height, tip_height, "buffered out-of-order block");
            return Ok(BlockOutcome::Buffered { height });
        }

        self.accept_contiguous(block)?;
        self.cascade();
        Ok(BlockOutcome::Accepted {
            height,
            tip_height: self.last_block.height,
        })
    }

    /// `block` must sit at `last_block.height + 1` and carry a verified operator signature.
    fn accept_contiguous(&mut self, block: Block) -> Result<(), SequencerError> {
        let expected = self.last_block.sighash();
        if block.prev_block_hash.as_slice() != expected.as_slice() {
            return Err(SequencerError::ChainMismatch {
                height: block.height,
                expected,
                actual: Bytes::from(block.prev_block_hash.clone()),
            });
        }
        // Expiry was the primary's call at admission time.
        block.body.verify(ExpiryPolicy::Skip)?;

        let received_at_ms = chain_core::now_unix_ms();
        let raw = block.body.encode();
        self.persist(&block, raw.as_slice(), received_at_ms)?;
        self.metrics.on_block_ingested();
        self.advance(block, received_at_ms);
        Ok(())
    }

    /// Applies buffered blocks that became contiguous with the tip.
    fn cascade(&mut self) {
        loop {
            let next_height = self.last_block.height.saturating_add(1);
            self.pending_by_height = self.pending_by_height.split_off(&next_height);
            let Some(block) = self.pending_by_height.remove(&next_height) else {
                break;
            };
            if let Err(err) = self.accept_contiguous(block) {
                self.metrics.on_rejected();
                warn!(height = next_height, error = %err, "dropping buffered block");
            }
        }
        self.shared.set_pending_blocks(self.pending_by_height.len());
    }

    fn persist(
        &mut self,
        block: &Block,
        raw: &[u8],
        received_at_ms: u64,
    ) -> Result<AppendedBlock, SequencerError> {
        self.storage
            .append_block(block, raw, received_at_ms)
            .map_err(|err| {
                self.metrics.on_storage_failure();
                error!(height = block.height, error = %err, "append block failed");
                SequencerError::storage(err.to_string())
            })
    }

    fn advance(&mut self, block: Block, received_at_ms: u64) {
        self.shared.record_block(block.height, received_at_ms);
        self.shared.listeners.notify(&block);
        debug!(height = block.height, hash = %block.short_hash(), "chain advanced");
        self.last_block = block;
    }
}

/// Moves up to `max` queued items into `out`. Returns true once the queue is
/// closed and empty.
fn take_batch<T>(rx: &mut mpsc::Receiver<T>, max: usize, out: &mut Vec<T>) -> bool {
    while out.len() < max {
        match rx.try_recv() {
            Ok(item) => out.push(item),
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::{SequencerCore, SequencerCoreConfig, SequencerCoreStop, take_batch};
    use crate::sequencer_core::{
        BlockOutcome, Role, SequencerCoreError, SequencerError, SequencerHandle,
    };
    use crate::storage::Storage;
    use chain_core::{
        Block, ExpiryCondition, KeySigner, MessageError, SequenceTx, Signer, TrustRoot,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct TestDb {
        _dir: tempfile::TempDir,
        path: String,
    }

    fn temp_db(name: &str) -> TestDb {
        let dir = tempfile::Builder::new()
            .prefix(format!("sequencer-core-{name}-").as_str())
            .tempdir()
            .expect("create temp dir");
        let path = dir.path().join("sequencer.sqlite");
        TestDb {
            path: path.to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    fn operator() -> KeySigner {
        KeySigner::from_bytes(&[0x42; 32]).expect("operator key")
    }

    fn trust_root() -> TrustRoot {
        TrustRoot::single(operator().public_key())
    }

    fn test_config() -> SequencerCoreConfig {
        SequencerCoreConfig {
            queue_capacity: 64,
            max_items_per_turn: 8,
            idle_poll_interval: Duration::from_millis(1),
            metrics_enabled: false,
            metrics_log_interval: Duration::from_secs(60),
        }
    }

    fn signed_tx(seed: u8) -> SequenceTx {
        let client = KeySigner::from_bytes(&[seed; 32]).expect("client key");
        SequenceTx::new(vec![seed; 8], Duration::from_secs(60))
            .with_from(&client.public_key())
            .signed(&client)
            .expect("sign tx")
    }

    fn expired_tx(seed: u8) -> SequenceTx {
        let client = KeySigner::from_bytes(&[seed; 32]).expect("client key");
        SequenceTx::new(vec![seed; 8], Duration::from_secs(60))
            .with_expires(vec![ExpiryCondition::unix_millis(1)])
            .with_from(&client.public_key())
            .signed(&client)
            .expect("sign tx")
    }

    /// Operator-signed chain of `len` blocks on top of genesis.
    fn build_chain(len: u8) -> Vec<Block> {
        let operator = operator();
        let mut parent = Block::genesis();
        let mut blocks = Vec::new();
        for seed in 1..=len {
            let block = Block::next(&parent, signed_tx(seed))
                .signed(&operator)
                .expect("sign block");
            parent = block.clone();
            blocks.push(block);
        }
        blocks
    }

    fn start_core(
        db_path: &str,
        role: Role,
    ) -> (
        SequencerHandle,
        SequencerCoreStop,
        tokio::task::JoinHandle<SequencerCoreError>,
    ) {
        let storage = Storage::open(db_path, "NORMAL").expect("open storage");
        let (core, handle) =
            SequencerCore::new(role, trust_root(), storage, test_config()).expect("build core");
        let (join, stop) = core.spawn();
        (handle, stop, join)
    }

    async fn shutdown_core(
        stop: &SequencerCoreStop,
        join: tokio::task::JoinHandle<SequencerCoreError>,
    ) {
        stop.request_shutdown();
        let joined = tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .expect("wait for core shutdown");
        let err = joined.expect("join core task");
        assert!(matches!(err, SequencerCoreError::ShutdownRequested));
    }

    async fn process(handle: &SequencerHandle, block: Block) -> Result<BlockOutcome, SequencerError> {
        let ticket = handle.process_block(block).await.expect("enqueue block");
        tokio::time::timeout(Duration::from_secs(2), ticket.wait())
            .await
            .expect("wait for block outcome")
    }

    fn read_count(db_path: &str, table: &str) -> i64 {
        let conn = Storage::open_connection(db_path, "NORMAL").expect("open sqlite reader");
        let sql = format!("SELECT COUNT(*) FROM {table}");
        conn.query_row(sql.as_str(), [], |row| row.get(0))
            .expect("count rows")
    }

    fn persisted_tip(db_path: &str) -> Option<Block> {
        let mut storage = Storage::open(db_path, "NORMAL").expect("open storage");
        storage.load_chain_tip().expect("load tip")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn primary_sequences_into_signed_block_on_genesis() {
        let db = temp_db("primary-sequence");
        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));
        let tx = signed_tx(0x11);

        let receipt = handle
            .sequence(tx.encode())
            .await
            .expect("admit tx")
            .wait()
            .await
            .expect("sequence tx");
        let info = handle.info();
        shutdown_core(&stop, join).await;

        assert_eq!(receipt.sequence, 1);
        assert_eq!(receipt.height, 1);
        let tip = persisted_tip(&db.path).expect("persisted block");
        assert_eq!(tip.sighash(), receipt.block_hash);
        assert_eq!(tip.prev_block_hash, Block::genesis().sighash().to_vec());
        assert_eq!(tip.body, tx);
        assert_eq!(
            trust_root().verify_block(&tip).expect("operator signature"),
            operator().public_key()
        );
        assert_eq!(info.total, 1);
        assert_eq!(info.tip_height, 1);
        assert!(info.last_sequence_time_ms > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replica_refuses_to_sequence() {
        let db = temp_db("replica-sequence");
        let (handle, stop, join) = start_core(&db.path, Role::Replica);

        let err = handle
            .sequence(signed_tx(0x12).encode())
            .await
            .expect_err("replica must refuse");
        shutdown_core(&stop, join).await;

        assert_eq!(err, SequencerError::NotAuthorized);
        assert!(!handle.is_primary());
        assert_eq!(read_count(&db.path, "sequence"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_tx_is_rejected_before_persistence() {
        let db = temp_db("malformed");
        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));

        let client = KeySigner::from_bytes(&[0x13; 32]).expect("client key");
        let no_from = SequenceTx::new(vec![1, 2, 3], Duration::from_secs(60))
            .signed(&client)
            .expect("sign tx");
        let missing_from = handle.sequence(no_from.encode()).await.expect_err("no from");
        let garbage = handle
            .sequence(vec![0xff, 0x00, 0x01])
            .await
            .expect_err("undecodable");
        shutdown_core(&stop, join).await;

        assert!(matches!(
            missing_from,
            SequencerError::Message(MessageError::Malformed(_))
        ));
        assert!(matches!(
            garbage,
            SequencerError::Message(MessageError::Malformed(_))
        ));
        assert_eq!(read_count(&db.path, "sequence"), 0);
        assert_eq!(read_count(&db.path, "blocks"), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .expect("captured logs mutex poisoned")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejected_submission_is_logged() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let db = temp_db("rejection-log");
        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));
        let err = handle
            .sequence(expired_tx(0x19).encode())
            .await
            .expect_err("expired tx");
        shutdown_core(&stop, join).await;

        assert_eq!(err, SequencerError::Message(MessageError::MessageExpired));
        let output = String::from_utf8(
            logs.0
                .lock()
                .expect("captured logs mutex poisoned")
                .clone(),
        )
        .expect("utf8 logs");
        assert!(output.contains("submitted tx rejected"), "logs: {output}");
        assert!(output.contains("expired"), "logs: {output}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expiry_is_enforced_on_sequence_but_not_on_blocks() {
        let primary_db = temp_db("expiry-primary");
        let replica_db = temp_db("expiry-replica");
        let (primary, primary_stop, primary_join) =
            start_core(&primary_db.path, Role::Primary(operator()));
        let (replica, replica_stop, replica_join) = start_core(&replica_db.path, Role::Replica);

        let tx = expired_tx(0x14);
        let rejected = primary.sequence(tx.encode()).await.expect_err("expired");
        let block = Block::next(&Block::genesis(), tx)
            .signed(&operator())
            .expect("sign block");
        let outcome = process(&replica, block).await;

        shutdown_core(&primary_stop, primary_join).await;
        shutdown_core(&replica_stop, replica_join).await;

        assert_eq!(
            rejected,
            SequencerError::Message(MessageError::MessageExpired)
        );
        assert_eq!(
            outcome,
            Ok(BlockOutcome::Accepted {
                height: 1,
                tip_height: 1
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn out_of_order_block_is_buffered_then_cascaded() {
        let db = temp_db("cascade");
        let (replica, stop, join) = start_core(&db.path, Role::Replica);
        let chain = build_chain(2);

        let second = process(&replica, chain[1].clone()).await;
        let info_after_second = replica.info();
        let first = process(&replica, chain[0].clone()).await;
        let info_after_first = replica.info();
        shutdown_core(&stop, join).await;

        assert_eq!(second, Ok(BlockOutcome::Buffered { height: 2 }));
        assert_eq!(info_after_second.tip_height, 0);
        assert_eq!(info_after_second.pending_blocks, 1);
        assert_eq!(
            first,
            Ok(BlockOutcome::Accepted {
                height: 1,
                tip_height: 2
            })
        );
        assert_eq!(info_after_first.tip_height, 2);
        assert_eq!(info_after_first.pending_blocks, 0);
        assert_eq!(persisted_tip(&db.path), Some(chain[1].clone()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_block_for_a_buffered_height_is_not_buffered_again() {
        let db = temp_db("buffered-duplicate");
        let (replica, stop, join) = start_core(&db.path, Role::Replica);
        let chain = build_chain(2);
        let conflicting = Block::next(&chain[0], signed_tx(0x78))
            .signed(&operator())
            .expect("sign conflicting block");

        let buffered = process(&replica, chain[1].clone()).await;
        let repeated = process(&replica, chain[1].clone()).await;
        let conflict = process(&replica, conflicting).await;
        let pending_before_gap_closes = replica.info().pending_blocks;
        let accepted = process(&replica, chain[0].clone()).await;
        shutdown_core(&stop, join).await;

        assert_eq!(buffered, Ok(BlockOutcome::Buffered { height: 2 }));
        assert_eq!(repeated, Ok(BlockOutcome::AlreadyKnown { height: 2 }));
        assert_eq!(conflict, Ok(BlockOutcome::AlreadyKnown { height: 2 }));
        assert_eq!(pending_before_gap_closes, 1);
        assert_eq!(
            accepted,
            Ok(BlockOutcome::Accepted {
                height: 1,
                tip_height: 2
            })
        );
        assert_eq!(persisted_tip(&db.path), Some(chain[1].clone()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn any_delivery_order_converges_to_the_same_tip() {
        let chain = build_chain(5);
        let orders: [[usize; 5]; 4] = [
            [0, 1, 2, 3, 4],
            [4, 3, 2, 1, 0],
            [2, 4, 0, 3, 1],
            [1, 0, 3, 2, 4],
        ];

        for (index, order) in orders.iter().enumerate() {
            let db = temp_db(format!("permutation-{index}").as_str());
            let (replica, stop, join) = start_core(&db.path, Role::Replica);
            for position in order {
                process(&replica, chain[*position].clone())
                    .await
                    .expect("block accepted or buffered");
            }
            let info = replica.info();
            shutdown_core(&stop, join).await;

            assert_eq!(info.tip_height, 5, "order {order:?}");
            assert_eq!(info.pending_blocks, 0, "order {order:?}");
            let tip = persisted_tip(&db.path).expect("tip");
            assert_eq!(tip.sighash(), chain[4].sighash(), "order {order:?}");
            assert_eq!(read_count(&db.path, "blocks"), 5);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replayed_block_is_a_no_op() {
        let db = temp_db("idempotent");
        let (replica, stop, join) = start_core(&db.path, Role::Replica);
        let chain = build_chain(1);

        let first = process(&replica, chain[0].clone()).await;
        let replay = process(&replica, chain[0].clone()).await;
        shutdown_core(&stop, join).await;

        assert!(matches!(first, Ok(BlockOutcome::Accepted { .. })));
        assert_eq!(replay, Ok(BlockOutcome::AlreadyKnown { height: 1 }));
        assert_eq!(read_count(&db.path, "blocks"), 1);
        assert_eq!(read_count(&db.path, "sequence"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn block_from_non_operator_is_rejected() {
        let db = temp_db("non-operator");
        let (replica, stop, join) = start_core(&db.path, Role::Replica);
        let intruder = KeySigner::from_bytes(&[0x66; 32]).expect("intruder key");
        let forged = Block::next(&Block::genesis(), signed_tx(0x15))
            .signed(&intruder)
            .expect("sign block");
        let mut unsigned = build_chain(1).remove(0);
        unsigned.sig.clear();

        let forged_outcome = process(&replica, forged).await;
        let unsigned_outcome = process(&replica, unsigned).await;
        let info = replica.info();
        shutdown_core(&stop, join).await;

        assert_eq!(
            forged_outcome,
            Err(SequencerError::Message(MessageError::InvalidSignature))
        );
        assert_eq!(
            unsigned_outcome,
            Err(SequencerError::Message(MessageError::MissingSignature))
        );
        assert_eq!(info.tip_height, 0);
        assert_eq!(read_count(&db.path, "blocks"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broken_hash_link_is_a_chain_mismatch() {
        let db = temp_db("mismatch");
        let (replica, stop, join) = start_core(&db.path, Role::Replica);
        let mut block = Block::next(&Block::genesis(), signed_tx(0x16));
        block.prev_block_hash = vec![0xab; 32];
        let block = block.signed(&operator()).expect("sign block");

        let outcome = process(&replica, block).await;
        let info = replica.info();
        shutdown_core(&stop, join).await;

        assert!(matches!(
            outcome,
            Err(SequencerError::ChainMismatch { height: 1, .. })
        ));
        assert_eq!(info.tip_height, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn buffered_block_from_another_fork_is_dropped_during_cascade() {
        let db = temp_db("fork-drop");
        let (replica, stop, join) = start_core(&db.path, Role::Replica);
        let chain = build_chain(2);
        let fork_first = Block::next(&Block::genesis(), signed_tx(0x77))
            .signed(&operator())
            .expect("sign fork block");

        let buffered = process(&replica, chain[1].clone()).await;
        let accepted = process(&replica, fork_first.clone()).await;
        let info = replica.info();
        shutdown_core(&stop, join).await;

        assert_eq!(buffered, Ok(BlockOutcome::Buffered { height: 2 }));
        assert_eq!(
            accepted,
            Ok(BlockOutcome::Accepted {
                height: 1,
                tip_height: 1
            })
        );
        assert_eq!(info.pending_blocks, 0);
        assert_eq!(persisted_tip(&db.path), Some(fork_first));
    }

    fn fail_block_inserts_at(db_path: &str, height: u64) {
        let conn = Storage::open_connection(db_path, "NORMAL").expect("open sqlite writer");
        conn.execute_batch(
            format!(
                "CREATE TRIGGER fail_block_insert BEFORE INSERT ON blocks \
                 WHEN NEW.height = {height} \
                 BEGIN SELECT RAISE(ABORT, 'block insert disabled'); END;"
            )
            .as_str(),
        )
        .expect("create failing trigger");
    }

    fn restore_block_inserts(db_path: &str) {
        let conn = Storage::open_connection(db_path, "NORMAL").expect("open sqlite writer");
        conn.execute_batch("DROP TRIGGER fail_block_insert;")
            .expect("drop failing trigger");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn storage_failure_rolls_back_and_core_keeps_serving() {
        let db = temp_db("storage-failure");
        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));

        let first = handle
            .sequence(signed_tx(0x31).encode())
            .await
            .expect("admit tx")
            .wait()
            .await
            .expect("sequence first tx");

        fail_block_inserts_at(&db.path, 2);
        let failed = handle
            .sequence(signed_tx(0x32).encode())
            .await
            .expect("admit tx")
            .wait()
            .await;
        let info_after_failure = handle.info();
        restore_block_inserts(&db.path);

        let third = handle
            .sequence(signed_tx(0x33).encode())
            .await
            .expect("admit tx")
            .wait()
            .await
            .expect("sequence after recovery");
        shutdown_core(&stop, join).await;

        assert_eq!(first.height, 1);
        assert!(matches!(failed, Err(SequencerError::Storage(_))));
        assert_eq!(info_after_failure.tip_height, 1);
        assert_eq!(info_after_failure.total, 1);
        assert_eq!(third.height, 2);
        assert_eq!(third.sequence, 2);
        assert_eq!(read_count(&db.path, "sequence"), 2);
        let tip = persisted_tip(&db.path).expect("tip");
        assert_eq!(tip.sighash(), third.block_hash);
        assert_eq!(tip.body.data, vec![0x33; 8]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listeners_see_every_committed_block() {
        let db = temp_db("listeners");
        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        handle.on_new_block(move |block| {
            let _ = seen_tx.send(block);
        });

        let receipt = handle
            .sequence(signed_tx(0x17).encode())
            .await
            .expect("admit tx")
            .wait()
            .await
            .expect("sequence tx");
        let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("listener called")
            .expect("listener channel open");
        shutdown_core(&stop, join).await;

        assert_eq!(seen.height, 1);
        assert_eq!(seen.sighash(), receipt.block_hash);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_resumes_from_persisted_tip() {
        let db = temp_db("restart");
        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));
        for seed in [0x21_u8, 0x22] {
            handle
                .sequence(signed_tx(seed).encode())
                .await
                .expect("admit tx")
                .wait()
                .await
                .expect("sequence tx");
        }
        shutdown_core(&stop, join).await;
        let before_restart = persisted_tip(&db.path).expect("tip before restart");

        let (handle, stop, join) = start_core(&db.path, Role::Primary(operator()));
        let resumed = handle.info();
        let receipt = handle
            .sequence(signed_tx(0x23).encode())
            .await
            .expect("admit tx")
            .wait()
            .await
            .expect("sequence tx");
        shutdown_core(&stop, join).await;

        assert_eq!(resumed.tip_height, 2);
        assert_eq!(resumed.total, 2);
        assert_eq!(receipt.height, 3);
        assert_eq!(receipt.sequence, 3);
        let tip = persisted_tip(&db.path).expect("tip after restart");
        assert!(tip.extends(&before_restart));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn primary_with_foreign_key_is_refused() {
        let db = temp_db("wrong-operator");
        let storage = Storage::open(&db.path, "NORMAL").expect("open storage");
        let other = KeySigner::from_bytes(&[0x99; 32]).expect("other key");

        let result = SequencerCore::new(Role::Primary(other), trust_root(), storage, test_config());

        assert!(matches!(
            result,
            Err(SequencerCoreError::OperatorKeyMismatch { height: 1, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_every_handle_stops_the_worker() {
        let db = temp_db("channel-closed");
        let (handle, _stop, join) = start_core(&db.path, Role::Replica);
        drop(handle);

        let err = tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .expect("wait for core exit")
            .expect("join core task");
        assert!(matches!(err, SequencerCoreError::ChannelClosed));
    }

    #[test]
    fn take_batch_respects_limit_and_reports_disconnect() {
        let (tx, mut rx) = mpsc::channel::<u8>(8);
        for value in 0..3 {
            tx.try_send(value).expect("enqueue");
        }
        let mut out = Vec::new();
        assert!(!take_batch(&mut rx, 2, &mut out));
        assert_eq!(out, vec![0, 1]);

        drop(tx);
        out.clear();
        assert!(take_batch(&mut rx, 8, &mut out));
        assert_eq!(out, vec![2]);
    }
}
