// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chain_core::Block;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AppState, read_blocks};
use crate::gossip::BlockMessage;

#[derive(Debug, Deserialize)]
pub(super) struct BlocksQuery {
    from_height: Option<u64>,
}

pub(super) async fn subscribe_blocks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BlocksQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let from_height = query.from_height.unwrap_or(1).max(1);
    ws.on_upgrade(move |socket| stream_blocks(socket, state, from_height))
}

/// Replays persisted blocks from `from_height`, then forwards live blocks.
async fn stream_blocks(mut socket: WebSocket, state: Arc<AppState>, from_height: u64) {
    // Subscribe first: anything committed while the replay runs is either
    // read from storage or delivered live.
    let mut subscription = state.feed.subscribe();
    let page_len = state.max_range_len.max(1);

    let mut replayed_until = from_height;
    loop {
        let to = replayed_until.saturating_add(page_len);
        let page = match read_blocks(state.db_path.clone(), replayed_until, to).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, from_height = replayed_until, "block replay failed");
                return;
            }
        };
        if page.is_empty() {
            break;
        }
        for record in page {
            if send_block(&mut socket, &record.block).await.is_err() {
                return;
            }
            replayed_until = record.height.saturating_add(1);
        }
    }
    debug!(from_height, replayed_until, "block replay finished; streaming live");

    loop {
        tokio::select! {
            live = subscription.receiver.recv() => {
                let Some(block) = live else {
                    warn!(
                        subscriber_id = subscription.subscriber_id,
                        "block feed dropped websocket subscriber"
                    );
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                };
                // Live delivery is not ordered, so only skip what replay already sent.
                if block.height < replayed_until {
                    continue;
                }
                if send_block(&mut socket, &block).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_block(socket: &mut WebSocket, block: &Block) -> Result<(), axum::Error> {
    let message = BlockMessage::from_block(block);
    let text = serde_json::to_string(&message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
