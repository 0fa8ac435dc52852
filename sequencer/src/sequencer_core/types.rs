// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{B256, Bytes};
use chain_core::{Block, KeySigner, MessageError, SequenceTx};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

/// Who this node is in the replication topology.
#[derive(Debug, Clone)]
pub enum Role {
    /// Holds the operator key and extends the chain.
    Primary(KeySigner),
    /// Only ingests blocks produced elsewhere.
    Replica,
}

impl Role {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Primary(_) => Mode::Primary,
            Self::Replica => Mode::Replica,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Primary,
    Replica,
}

#[derive(Debug)]
pub struct PendingSequenceTx {
    pub tx: SequenceTx,
    /// Bytes exactly as submitted; persisted as the transaction record.
    pub raw: Vec<u8>,
    pub received_at_ms: u64,
    pub respond_to: oneshot::Sender<Result<SequenceReceipt, SequencerError>>,
}

#[derive(Debug)]
pub struct PendingBlock {
    pub block: Block,
    pub respond_to: oneshot::Sender<Result<BlockOutcome, SequencerError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceReceipt {
    pub sequence: u64,
    pub height: u64,
    pub block_hash: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block extended the chain; `tip_height` includes any buffered blocks it unlocked.
    Accepted { height: u64, tip_height: u64 },
    AlreadyKnown { height: u64 },
    /// Parent not seen yet; held until the gap closes.
    Buffered { height: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequencerInfo {
    pub mode: Mode,
    pub total: u64,
    pub last_sequence_time_ms: u64,
    pub tip_height: u64,
    pub pending_blocks: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequencerError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("only the primary may sequence transactions")]
    NotAuthorized,
    #[error("block {height} does not extend the tip: expected parent {expected}, got {actual}")]
    ChainMismatch {
        height: u64,
        expected: B256,
        actual: Bytes,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("sequencer core is not running")]
    Unavailable,
}

impl SequencerError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

/// Resolves once the worker has finished with the submitted item.
#[derive(Debug)]
pub struct Ticket<T> {
    recv: oneshot::Receiver<Result<T, SequencerError>>,
}

impl<T> Ticket<T> {
    pub(super) fn new(recv: oneshot::Receiver<Result<T, SequencerError>>) -> Self {
        Self { recv }
    }

    pub async fn wait(self) -> Result<T, SequencerError> {
        self.recv.await.unwrap_or(Err(SequencerError::Unavailable))
    }
}
