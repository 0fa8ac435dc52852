// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use rusqlite::{Connection, OptionalExtension, Result, Row, Transaction, params};

const SQL_INSERT_BLOCK: &str = include_str!("queries/insert_block.sql");
const SQL_SELECT_SEQUENCE_RANGE: &str = include_str!("queries/select_sequence_range.sql");
const SQL_SELECT_BLOCKS_RANGE: &str = include_str!("queries/select_blocks_range.sql");
const SQL_SELECT_SEQUENCE_STATS: &str = include_str!("queries/select_sequence_stats.sql");
const SQL_INSERT_SEQUENCE: &str =
    "INSERT INTO sequence (tx, tx_hash, sender, received_at_ms) VALUES (?1, ?2, ?3, ?4)";
const SQL_SELECT_LATEST_BLOCK: &str = "SELECT block FROM blocks ORDER BY height DESC LIMIT 1";

#[derive(Debug, Clone)]
pub(super) struct SequenceRow {
    pub sequence: i64,
    pub tx: Vec<u8>,
    pub tx_hash: Vec<u8>,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(super) struct BlockRow {
    pub height: i64,
    pub block_hash: Vec<u8>,
    pub sequence: i64,
    pub block: Vec<u8>,
    pub created_at_ms: i64,
}

pub(super) fn sql_insert_sequence(
    tx: &Transaction<'_>,
    raw_tx: &[u8],
    tx_hash: &[u8],
    sender: &[u8],
    received_at_ms: i64,
) -> Result<i64> {
    let mut stmt = tx.prepare_cached(SQL_INSERT_SEQUENCE)?;
    stmt.execute(params![raw_tx, tx_hash, sender, received_at_ms])?;
    Ok(tx.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
pub(super) fn sql_insert_block(
    tx: &Transaction<'_>,
    height: i64,
    block_hash: &[u8],
    prev_block_hash: &[u8],
    sequence: i64,
    block: &[u8],
    created_at_ms: i64,
) -> Result<()> {
    let mut stmt = tx.prepare_cached(SQL_INSERT_BLOCK)?;
    stmt.execute(params![
        height,
        block_hash,
        prev_block_hash,
        sequence,
        block,
        created_at_ms
    ])?;
    Ok(())
}

pub(super) fn sql_select_latest_block(conn: &Connection) -> Result<Option<Vec<u8>>> {
    conn.query_row(SQL_SELECT_LATEST_BLOCK, [], |row| row.get(0))
        .optional()
}

pub(super) fn sql_select_sequence_stats(conn: &Connection) -> Result<(i64, Option<i64>)> {
    conn.query_row(SQL_SELECT_SEQUENCE_STATS, [], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })
}

pub(super) fn sql_select_sequence_range(
    conn: &Connection,
    from_inclusive: i64,
    to_exclusive: i64,
) -> Result<Vec<SequenceRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_SEQUENCE_RANGE)?;
    let mapped = stmt.query_map(
        params![from_inclusive, to_exclusive],
        convert_row_to_sequence_row,
    )?;
    mapped.collect()
}

pub(super) fn sql_select_blocks_range(
    conn: &Connection,
    from_inclusive: i64,
    to_exclusive: i64,
) -> Result<Vec<BlockRow>> {
    let mut stmt = conn.prepare_cached(SQL_SELECT_BLOCKS_RANGE)?;
    let mapped = stmt.query_map(
        params![from_inclusive, to_exclusive],
        convert_row_to_block_row,
    )?;
    mapped.collect()
}

fn convert_row_to_sequence_row(row: &Row<'_>) -> Result<SequenceRow> {
    Ok(SequenceRow {
        sequence: row.get(0)?,
        tx: row.get(1)?,
        tx_hash: row.get(2)?,
        received_at_ms: row.get(3)?,
    })
}

fn convert_row_to_block_row(row: &Row<'_>) -> Result<BlockRow> {
    Ok(BlockRow {
        height: row.get(0)?,
        block_hash: row.get(1)?,
        sequence: row.get(2)?,
        block: row.get(3)?,
        created_at_ms: row.get(4)?,
    })
}
