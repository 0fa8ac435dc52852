// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::B256;
use chain_core::Block;
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Result, TransactionBehavior};
use rusqlite_migration::{M, Migrations};

use super::sql::{
    BlockRow, SequenceRow, sql_insert_block, sql_insert_sequence, sql_select_blocks_range,
    sql_select_latest_block, sql_select_sequence_range, sql_select_sequence_stats,
};
use super::{AppendedBlock, BlockRecord, SequenceStats, SequencedTxRecord, StorageOpenError};

const MIGRATION_0001_SCHEMA: &str = include_str!("migrations/0001_schema.sql");

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: &str, synchronous: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = Self::open_connection_with_migrations(path, synchronous)?;
        Ok(Self { conn })
    }

    /// Reader handle for the HTTP and WebSocket surfaces. The database must
    /// already exist and be migrated.
    pub fn open_read_only(path: &str) -> std::result::Result<Self, StorageOpenError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(Self { conn })
    }

    pub fn open_connection(
        path: &str,
        synchronous: &str,
    ) -> std::result::Result<Connection, StorageOpenError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    pub fn open_connection_with_migrations(
        path: &str,
        synchronous: &str,
    ) -> std::result::Result<Connection, StorageOpenError> {
        let mut conn = Self::open_connection(path, synchronous)?;
        Self::run_migrations(&mut conn)?;
        Ok(conn)
    }

    pub fn run_migrations(conn: &mut Connection) -> std::result::Result<(), StorageOpenError> {
        Migrations::new(vec![M::up(MIGRATION_0001_SCHEMA)]).to_latest(conn)?;
        Ok(())
    }

    /// Persists the transaction row and the block row in one write transaction.
    /// Nothing is written when either insert fails.
    pub fn append_block(
        &mut self,
        block: &Block,
        raw_tx: &[u8],
        received_at_ms: u64,
    ) -> Result<AppendedBlock> {
        let block_hash = block.sighash();
        let tx_hash = block.body.sighash();
        let encoded_block = block.encode();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sequence = sql_insert_sequence(
            &tx,
            raw_tx,
            tx_hash.as_slice(),
            block.body.from.as_slice(),
            u64_to_i64(received_at_ms),
        )?;
        sql_insert_block(
            &tx,
            u64_to_i64(block.height),
            block_hash.as_slice(),
            block.prev_block_hash.as_slice(),
            sequence,
            encoded_block.as_slice(),
            u64_to_i64(chain_core::now_unix_ms()),
        )?;
        tx.commit()?;

        Ok(AppendedBlock {
            sequence: i64_to_u64(sequence),
            height: block.height,
            block_hash,
        })
    }

    /// Highest persisted block, or `None` when only genesis is known.
    pub fn load_chain_tip(&mut self) -> Result<Option<Block>> {
        match sql_select_latest_block(&self.conn)? {
            Some(bytes) => decode_block(bytes.as_slice()).map(Some),
            None => Ok(None),
        }
    }

    pub fn sequence_stats(&mut self) -> Result<SequenceStats> {
        let (total, last_received_at_ms) = sql_select_sequence_stats(&self.conn)?;
        Ok(SequenceStats {
            total: i64_to_u64(total),
            last_received_at_ms: last_received_at_ms.map(i64_to_u64),
        })
    }

    pub fn load_sequence_range(
        &mut self,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> Result<Vec<SequencedTxRecord>> {
        if from_inclusive >= to_exclusive {
            return Ok(Vec::new());
        }
        let rows = sql_select_sequence_range(
            &self.conn,
            u64_to_i64(from_inclusive),
            u64_to_i64(to_exclusive),
        )?;
        rows.into_iter().map(convert_sequence_row).collect()
    }

    pub fn load_blocks_range(
        &mut self,
        from_inclusive: u64,
        to_exclusive: u64,
    ) -> Result<Vec<BlockRecord>> {
        if from_inclusive >= to_exclusive {
            return Ok(Vec::new());
        }
        let rows = sql_select_blocks_range(
            &self.conn,
            u64_to_i64(from_inclusive),
            u64_to_i64(to_exclusive),
        )?;
        rows.into_iter().map(convert_block_row).collect()
    }
}

fn convert_sequence_row(row: SequenceRow) -> Result<SequencedTxRecord> {
    Ok(SequencedTxRecord {
        sequence: i64_to_u64(row.sequence),
        tx: row.tx,
        tx_hash: decode_hash(row.tx_hash.as_slice(), 2)?,
        received_at_ms: i64_to_u64(row.received_at_ms),
    })
}

fn convert_block_row(row: BlockRow) -> Result<BlockRecord> {
    Ok(BlockRecord {
        height: i64_to_u64(row.height),
        block_hash: decode_hash(row.block_hash.as_slice(), 1)?,
        sequence: i64_to_u64(row.sequence),
        block: decode_block(row.block.as_slice())?,
        created_at_ms: i64_to_u64(row.created_at_ms),
    })
}

fn decode_block(bytes: &[u8]) -> Result<Block> {
    Block::decode(bytes)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Blob, Box::new(err)))
}

fn decode_hash(bytes: &[u8], column: usize) -> Result<B256> {
    B256::try_from(bytes).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(column, Type::Blob, Box::new(err))
    })
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    value.max(0) as u64
}
