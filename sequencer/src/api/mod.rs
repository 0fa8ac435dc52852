// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod error;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Json, Query, State};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::gossip::BlockFeed;
use crate::sequencer_core::{SequencerHandle, SequencerInfo};
use crate::storage::{BlockRecord, SequencedTxRecord, Storage};

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub sequencer: SequencerHandle,
    pub feed: BlockFeed,
    /// Read-only connections for range queries are opened against this path.
    pub db_path: String,
    pub queue_timeout: Duration,
    pub max_range_len: u64,
}

#[derive(Debug, Deserialize)]
struct SequenceRequest {
    tx: String,
}

#[derive(Debug, Serialize)]
struct SequenceResponse {
    ok: bool,
    sequence: u64,
    height: u64,
    block_hash: String,
}

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    from: Option<u64>,
    to: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TxRecordView {
    sequence: u64,
    tx: String,
    tx_hash: String,
    received_at_ms: u64,
}

#[derive(Debug, Serialize)]
struct BlockRecordView {
    height: u64,
    hash: String,
    sequence: u64,
    block: String,
    created_at_ms: u64,
}

#[derive(Debug, Serialize)]
struct RangeResponse<T> {
    ok: bool,
    from: u64,
    to: u64,
    records: Vec<T>,
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/sequence", get(get_sequence).post(submit_sequence))
        .route("/blocks", get(get_blocks))
        .route("/info", get(get_info))
        .route("/ws/blocks", get(ws::subscribe_blocks))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn submit_sequence(
    State(state): State<Arc<AppState>>,
    req: Result<Json<SequenceRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<SequenceResponse>, ApiError> {
    let Json(req) = req.map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?;
    let raw = alloy_primitives::hex::decode(req.tx.trim())
        .map_err(|err| ApiError::malformed(format!("invalid tx hex: {err}")))?;

    // Admission can suspend on a full queue; bound how long a request waits.
    let ticket = tokio::time::timeout(state.queue_timeout, state.sequencer.sequence(raw))
        .await
        .map_err(|_| ApiError::overloaded("queue full"))??;
    let receipt = ticket.wait().await?;

    info!(
        sequence = receipt.sequence,
        height = receipt.height,
        block_hash = %receipt.block_hash,
        "tx sequenced"
    );

    Ok(Json(SequenceResponse {
        ok: true,
        sequence: receipt.sequence,
        height: receipt.height,
        block_hash: receipt.block_hash.to_string(),
    }))
}

async fn get_sequence(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RangeQuery>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<RangeResponse<TxRecordView>>, ApiError> {
    let Query(query) =
        query.map_err(|err| ApiError::bad_request(format!("invalid query: {err}")))?;
    let (from, to) = clamp_range(query, state.max_range_len)?;
    let records = read_sequence(state.db_path.clone(), from, to).await?;
    Ok(Json(RangeResponse {
        ok: true,
        from,
        to,
        records: records.into_iter().map(TxRecordView::from).collect(),
    }))
}

async fn get_blocks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RangeQuery>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<RangeResponse<BlockRecordView>>, ApiError> {
    let Query(query) =
        query.map_err(|err| ApiError::bad_request(format!("invalid query: {err}")))?;
    let (from, to) = clamp_range(query, state.max_range_len)?;
    let records = read_blocks(state.db_path.clone(), from, to).await?;
    Ok(Json(RangeResponse {
        ok: true,
        from,
        to,
        records: records.into_iter().map(BlockRecordView::from).collect(),
    }))
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<SequencerInfo> {
    Json(state.sequencer.info())
}

/// Half-open `[from, to)`. Both sequence numbers and persisted heights start at 1.
fn clamp_range(query: RangeQuery, max_range_len: u64) -> Result<(u64, u64), ApiError> {
    let max_range_len = max_range_len.max(1);
    let from = query.from.unwrap_or(1).max(1);
    let limit = from.saturating_add(max_range_len);
    let to = query.to.unwrap_or(limit).min(limit);
    if to < from {
        return Err(ApiError::bad_request(format!(
            "invalid range: to ({to}) is below from ({from})"
        )));
    }
    Ok((from, to))
}

pub(crate) async fn read_blocks(
    db_path: String,
    from: u64,
    to: u64,
) -> Result<Vec<BlockRecord>, ApiError> {
    tokio::task::spawn_blocking(move || {
        let mut storage = Storage::open_read_only(db_path.as_str())
            .map_err(|err| ApiError::internal_error(format!("open storage: {err}")))?;
        storage
            .load_blocks_range(from, to)
            .map_err(|err| ApiError::internal_error(format!("read blocks: {err}")))
    })
    .await
    .map_err(|err| ApiError::internal_error(format!("read task failed: {err}")))?
}

async fn read_sequence(
    db_path: String,
    from: u64,
    to: u64,
) -> Result<Vec<SequencedTxRecord>, ApiError> {
    tokio::task::spawn_blocking(move || {
        let mut storage = Storage::open_read_only(db_path.as_str())
            .map_err(|err| ApiError::internal_error(format!("open storage: {err}")))?;
        storage
            .load_sequence_range(from, to)
            .map_err(|err| ApiError::internal_error(format!("read sequence: {err}")))
    })
    .await
    .map_err(|err| ApiError::internal_error(format!("read task failed: {err}")))?
}

impl From<SequencedTxRecord> for TxRecordView {
    fn from(record: SequencedTxRecord) -> Self {
        Self {
            sequence: record.sequence,
            tx: alloy_primitives::hex::encode_prefixed(record.tx.as_slice()),
            tx_hash: record.tx_hash.to_string(),
            received_at_ms: record.received_at_ms,
        }
    }
}

impl From<BlockRecord> for BlockRecordView {
    fn from(record: BlockRecord) -> Self {
        Self {
            height: record.height,
            hash: record.block_hash.to_string(),
            sequence: record.sequence,
            block: record.block.to_hex(),
            created_at_ms: record.created_at_ms,
        }
    }
}
