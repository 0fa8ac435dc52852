// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use chain_core::PublicKey;
use thiserror::Error;

/// Why the worker stopped, or could not start.
#[derive(Debug, Error)]
pub enum SequencerCoreError {
    #[error("sequencer core input channels closed")]
    ChannelClosed,
    #[error("sequencer core shutdown requested")]
    ShutdownRequested,
    #[error("cannot load persisted chain tip")]
    LoadTip {
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot load sequence stats")]
    LoadStats {
        #[source]
        source: rusqlite::Error,
    },
    #[error("signing key {signer} is not the operator key {operator} for height {height}")]
    OperatorKeyMismatch {
        height: u64,
        signer: PublicKey,
        operator: PublicKey,
    },
}
