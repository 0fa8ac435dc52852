// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::{Duration, Instant};

use chain_core::MessageError;
use futures_util::StreamExt;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::BlockMessage;
use crate::sequencer_core::{BlockOutcome, SequencerError, SequencerHandle, SequencerInfo};

#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Base WebSocket URL of the primary, e.g. `ws://10.0.0.1:3000`.
    pub primary_ws_url: String,
    pub reconnect_delay: Duration,
    /// How long buffered blocks may sit without the tip moving before the
    /// follower reconnects from its tip.
    pub stall_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum FollowerError {
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid block frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("invalid block in frame: {0}")]
    Block(#[from] MessageError),
}

enum StreamEnd {
    Closed,
    /// A block was lost locally; the stream must restart at `tip + 1`.
    Resync,
    CoreUnavailable,
}

/// Streams blocks from the primary into `handle` until the local core stops.
///
/// Each connection asks for blocks above the local tip, so reconnecting
/// after a drop resumes without replaying the whole chain. Reconnecting is
/// also how a block that failed to apply locally gets delivered again.
pub async fn follow_primary(config: FollowerConfig, handle: SequencerHandle) {
    loop {
        let from_height = handle.info().tip_height.saturating_add(1);
        let url = blocks_url(config.primary_ws_url.as_str(), from_height);
        match follow_once(url.as_str(), &handle, config.stall_timeout).await {
            Ok(StreamEnd::CoreUnavailable) => {
                warn!("sequencer core unavailable; follower stopping");
                return;
            }
            Ok(StreamEnd::Resync) => info!(url, "resyncing block stream from local tip"),
            Ok(StreamEnd::Closed) => info!(url, "primary closed block stream"),
            Err(err) => warn!(url, error = %err, "block stream failed"),
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

fn blocks_url(base: &str, from_height: u64) -> String {
    format!(
        "{}/ws/blocks?from_height={from_height}",
        base.trim_end_matches('/')
    )
}

async fn follow_once(
    url: &str,
    handle: &SequencerHandle,
    stall_timeout: Duration,
) -> Result<StreamEnd, FollowerError> {
    let (mut ws, _) = connect_async(url).await?;
    info!(url, "following primary");
    let mut progress = TipProgress::new(handle.info().tip_height);

    loop {
        let frame = match tokio::time::timeout(stall_timeout, ws.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Ok(StreamEnd::Closed),
            Err(_) => {
                if progress.is_stalled(&handle.info(), stall_timeout) {
                    return Ok(StreamEnd::Resync);
                }
                continue;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(StreamEnd::Closed),
            _ => continue,
        };
        let message: BlockMessage = serde_json::from_str(text.as_str())?;
        let block = message.decode_block()?;
        let height = block.height;

        let ticket = match handle.process_block(block).await {
            Ok(ticket) => ticket,
            Err(_) => return Ok(StreamEnd::CoreUnavailable),
        };
        match ticket.wait().await {
            Ok(BlockOutcome::Accepted { height, tip_height }) => {
                debug!(height, tip_height, "followed block accepted");
            }
            Ok(outcome) => debug!(height, ?outcome, "followed block"),
            Err(SequencerError::Unavailable) => return Ok(StreamEnd::CoreUnavailable),
            Err(err @ SequencerError::ChainMismatch { .. }) => {
                error!(height, error = %err, "primary block does not extend local chain");
                return Ok(StreamEnd::Resync);
            }
            Err(err @ SequencerError::Storage(_)) => {
                warn!(height, error = %err, "followed block not stored");
                return Ok(StreamEnd::Resync);
            }
            Err(err) => warn!(height, error = %err, "followed block rejected"),
        }

        if progress.is_stalled(&handle.info(), stall_timeout) {
            return Ok(StreamEnd::Resync);
        }
    }
}

/// Tracks how long the tip has stood still while blocks wait in the buffer.
struct TipProgress {
    tip_height: u64,
    since: Instant,
}

impl TipProgress {
    fn new(tip_height: u64) -> Self {
        Self {
            tip_height,
            since: Instant::now(),
        }
    }

    fn is_stalled(&mut self, info: &SequencerInfo, stall_timeout: Duration) -> bool {
        if info.tip_height != self.tip_height || info.pending_blocks == 0 {
            self.tip_height = info.tip_height;
            self.since = Instant::now();
            return false;
        }
        self.since.elapsed() >= stall_timeout
    }
}
