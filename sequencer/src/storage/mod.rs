// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod db;
mod sql;

use alloy_primitives::B256;
use chain_core::Block;
use thiserror::Error;

pub use db::Storage;

#[derive(Debug, Error)]
pub enum StorageOpenError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
}

/// Result of committing one block together with its transaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedBlock {
    pub sequence: u64,
    pub height: u64,
    pub block_hash: B256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceStats {
    pub total: u64,
    pub last_received_at_ms: Option<u64>,
}

/// One row of the transaction log. `tx` holds the bytes as they were admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedTxRecord {
    pub sequence: u64,
    pub tx: Vec<u8>,
    pub tx_hash: B256,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub height: u64,
    pub block_hash: B256,
    pub sequence: u64,
    pub block: Block,
    pub created_at_ms: u64,
}
