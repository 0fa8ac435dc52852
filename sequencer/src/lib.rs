// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Single-authority sequencer node.
//!
//! Flow on the primary: API -> sequencer core -> SQLite -> block feed.
//! Flow on a replica: block feed (local or over WebSocket) -> sequencer core
//! -> SQLite. The sequencer core is the single writer that defines order.
pub mod api;
pub mod gossip;
pub mod sequencer_core;
pub mod storage;
