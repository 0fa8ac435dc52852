// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Block propagation between nodes.
//!
//! [`BlockFeed`] fans committed blocks out to in-process subscribers (the
//! WebSocket endpoint, local replicas). [`follow_primary`] is the remote
//! side: it pulls a primary's feed over WebSocket into a local core.

mod follower;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chain_core::{Block, MessageError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sequencer_core::{SequencerError, SequencerHandle};

pub use follower::{FollowerConfig, FollowerError, follow_primary};

#[derive(Clone)]
pub struct BlockFeed {
    inner: Arc<BlockFeedInner>,
}

struct BlockFeedInner {
    subscriber_buffer_capacity: usize,
    next_subscriber_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Block>>>,
}

pub struct BlockSubscription {
    pub subscriber_id: u64,
    pub receiver: mpsc::Receiver<Block>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub delivered: u64,
    pub dropped_closed: u64,
    pub dropped_full: u64,
}

/// Text frame carried on `/ws/blocks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub height: u64,
    pub hash: String,
    /// SSZ-encoded block, `0x`-prefixed hex.
    pub block: String,
}

impl BlockFeed {
    pub fn new(subscriber_buffer_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BlockFeedInner {
                subscriber_buffer_capacity: subscriber_buffer_capacity.max(1),
                next_subscriber_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> BlockSubscription {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer_capacity);
        let subscriber_id = self
            .inner
            .next_subscriber_id
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("block feed subscribers mutex poisoned")
            .insert(subscriber_id, tx);
        BlockSubscription {
            subscriber_id,
            receiver: rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("block feed subscribers mutex poisoned")
            .len()
    }

    /// Delivers `block` to every subscriber without waiting. Subscribers that
    /// are gone or cannot keep up are removed.
    pub fn publish(&self, block: Block) -> FanoutOutcome {
        let mut outcome = FanoutOutcome::default();
        let mut to_remove = Vec::new();
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("block feed subscribers mutex poisoned");

        for (subscriber_id, sender) in subscribers.iter() {
            match sender.try_send(block.clone()) {
                Ok(()) => outcome.delivered = outcome.delivered.saturating_add(1),
                Err(TrySendError::Closed(_)) => {
                    to_remove.push(*subscriber_id);
                    outcome.dropped_closed = outcome.dropped_closed.saturating_add(1);
                    debug!(subscriber_id, "block feed removed closed subscriber");
                }
                Err(TrySendError::Full(_)) => {
                    to_remove.push(*subscriber_id);
                    outcome.dropped_full = outcome.dropped_full.saturating_add(1);
                    warn!(
                        subscriber_id,
                        height = block.height,
                        "block feed dropped slow subscriber due to full channel"
                    );
                }
            }
        }

        for subscriber_id in to_remove {
            subscribers.remove(&subscriber_id);
        }
        outcome
    }

    /// Publishes every block `handle` commits from now on.
    pub fn attach(&self, handle: &SequencerHandle) {
        let feed = self.clone();
        handle.on_new_block(move |block| {
            feed.publish(block);
        });
    }
}

impl BlockMessage {
    pub fn from_block(block: &Block) -> Self {
        Self {
            height: block.height,
            hash: block.sighash().to_string(),
            block: block.to_hex(),
        }
    }

    /// Decodes the carried block and checks it against the envelope fields.
    pub fn decode_block(&self) -> Result<Block, MessageError> {
        let block = Block::from_hex(self.block.as_str())?;
        if block.height != self.height {
            return Err(MessageError::malformed(format!(
                "envelope height {} does not match block height {}",
                self.height, block.height
            )));
        }
        if block.sighash().to_string() != self.hash.to_ascii_lowercase() {
            return Err(MessageError::malformed("envelope hash does not match block"));
        }
        Ok(block)
    }
}

/// Feeds every block from `subscription` into `handle`. Ends when the
/// subscription closes or the core stops.
pub fn spawn_local_ingest(
    mut subscription: BlockSubscription,
    handle: SequencerHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(block) = subscription.receiver.recv().await {
            let height = block.height;
            let ticket = match handle.process_block(block).await {
                Ok(ticket) => ticket,
                Err(err) => {
                    warn!(height, error = %err, "local ingest stopped");
                    return;
                }
            };
            match ticket.wait().await {
                Ok(outcome) => debug!(height, ?outcome, "local ingest processed block"),
                Err(SequencerError::Unavailable) => {
                    warn!(height, "local ingest stopped: sequencer core unavailable");
                    return;
                }
                Err(err) => warn!(height, error = %err, "local ingest rejected block"),
            }
        }
        info!(
            subscriber_id = subscription.subscriber_id,
            "local ingest subscription closed"
        );
    })
}
