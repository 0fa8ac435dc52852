// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chain_core::{Block, ExpiryPolicy, SequenceTx};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::listeners::{BlockListener, Listeners};
use super::types::{
    BlockOutcome, Mode, PendingBlock, PendingSequenceTx, SequenceReceipt, SequencerError,
    SequencerInfo, Ticket,
};

/// Counters the worker publishes for readers outside it.
pub(super) struct SharedState {
    pub(super) mode: Mode,
    pub(super) total: AtomicU64,
    pub(super) last_sequence_time_ms: AtomicU64,
    pub(super) tip_height: AtomicU64,
    pub(super) pending_blocks: AtomicU64,
    pub(super) listeners: Listeners,
}

impl SharedState {
    pub(super) fn new(mode: Mode, total: u64, last_sequence_time_ms: u64, tip_height: u64) -> Self {
        Self {
            mode,
            total: AtomicU64::new(total),
            last_sequence_time_ms: AtomicU64::new(last_sequence_time_ms),
            tip_height: AtomicU64::new(tip_height),
            pending_blocks: AtomicU64::new(0),
            listeners: Listeners::new(),
        }
    }

    pub(super) fn record_block(&self, height: u64, received_at_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.last_sequence_time_ms
            .fetch_max(received_at_ms, Ordering::Relaxed);
        self.tip_height.store(height, Ordering::Release);
    }

    pub(super) fn set_pending_blocks(&self, count: usize) {
        self.pending_blocks.store(count as u64, Ordering::Relaxed);
    }
}

/// Cloneable front door to the worker. Every chain mutation goes through the
/// worker's queues; this type never touches chain state itself.
#[derive(Clone)]
pub struct SequencerHandle {
    sequence_tx: mpsc::Sender<PendingSequenceTx>,
    block_tx: mpsc::Sender<PendingBlock>,
    shared: Arc<SharedState>,
}

impl SequencerHandle {
    pub(super) fn new(
        sequence_tx: mpsc::Sender<PendingSequenceTx>,
        block_tx: mpsc::Sender<PendingBlock>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            sequence_tx,
            block_tx,
            shared,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.shared.mode == Mode::Primary
    }

    /// Decodes and verifies `raw` here, then queues it for the worker.
    ///
    /// Suspends while the sequencing queue is full. Rejections from decoding
    /// or verification come back before anything is queued.
    pub async fn sequence(&self, raw: Vec<u8>) -> Result<Ticket<SequenceReceipt>, SequencerError> {
        if !self.is_primary() {
            return Err(SequencerError::NotAuthorized);
        }
        let now_ms = chain_core::now_unix_ms();
        let tx = SequenceTx::decode(raw.as_slice())
            .and_then(|tx| tx.verify(ExpiryPolicy::Enforce { now_ms }).map(|()| tx))
            .map_err(|err| {
                debug!(error = %err, raw_len = raw.len(), "submitted tx rejected");
                err
            })?;

        let (respond_to, recv) = oneshot::channel();
        self.sequence_tx
            .send(PendingSequenceTx {
                tx,
                raw,
                received_at_ms: now_ms,
                respond_to,
            })
            .await
            .map_err(|_| SequencerError::Unavailable)?;
        Ok(Ticket::new(recv))
    }

    /// Queues a candidate block. Verification happens on the worker so it is
    /// ordered with sequencing work.
    pub async fn process_block(&self, block: Block) -> Result<Ticket<BlockOutcome>, SequencerError> {
        let (respond_to, recv) = oneshot::channel();
        self.block_tx
            .send(PendingBlock { block, respond_to })
            .await
            .map_err(|_| SequencerError::Unavailable)?;
        Ok(Ticket::new(recv))
    }

    pub fn on_new_block<F>(&self, handler: F)
    where
        F: Fn(Block) + Send + Sync + 'static,
    {
        let handler: BlockListener = Arc::new(handler);
        self.shared.listeners.register(handler);
    }

    pub fn info(&self) -> SequencerInfo {
        SequencerInfo {
            mode: self.shared.mode,
            total: self.shared.total.load(Ordering::Relaxed),
            last_sequence_time_ms: self.shared.last_sequence_time_ms.load(Ordering::Relaxed),
            tip_height: self.shared.tip_height.load(Ordering::Acquire),
            pending_blocks: self.shared.pending_blocks.load(Ordering::Relaxed),
        }
    }
}
