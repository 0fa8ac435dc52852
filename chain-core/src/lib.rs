// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Wire types shared by every sequencer node.
//!
//! `SequenceTx` is what clients sign and submit, `Block` is what the primary
//! signs and replicas verify. Both are SSZ-encoded and hashed with keccak256
//! with their signature field cleared.
pub mod block;
pub mod crypto;
pub mod error;
pub mod sequence_tx;
pub mod trust;

pub use block::Block;
pub use crypto::{KeySigner, PublicKey, Signer, now_unix_ms};
pub use error::{CryptoError, MessageError};
pub use sequence_tx::{Expiry, ExpiryCondition, ExpiryPolicy, SequenceTx};
pub use trust::{OperatorChange, TrustRoot, TrustRootError};

pub(crate) fn decode_hex(value: &str) -> Result<Vec<u8>, MessageError> {
    alloy_primitives::hex::decode(value)
        .map_err(|err| MessageError::malformed(format!("invalid hex: {err}")))
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    alloy_primitives::hex::encode_prefixed(bytes)
}
