// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! The ordering state machine.
//!
//! One blocking worker owns the chain tip and the out-of-order buffer and
//! drains two bounded queues: transactions to sequence (primary) and
//! candidate blocks to ingest (replica, or any node relaying). Callers hold a
//! [`SequencerHandle`] and get a [`Ticket`] back for each submitted item.

mod error;
mod handle;
mod listeners;
mod profiling;
mod types;
mod worker;

pub use error::SequencerCoreError;
pub use handle::SequencerHandle;
pub use listeners::BlockListener;
pub use types::{
    BlockOutcome, Mode, PendingBlock, PendingSequenceTx, Role, SequenceReceipt, SequencerError,
    SequencerInfo, Ticket,
};
pub use worker::{SequencerCore, SequencerCoreConfig, SequencerCoreStop};
