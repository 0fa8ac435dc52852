// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use thiserror::Error;

use crate::block::Block;
use crate::crypto::PublicKey;
use crate::error::MessageError;

/// Operator key that signs blocks from `activation_height` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorChange {
    pub activation_height: u64,
    pub key: PublicKey,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrustRootError {
    #[error("trust root needs at least one operator key")]
    Empty,
    #[error("first operator key must activate at height 0, got {0}")]
    LateFirstActivation(u64),
    #[error("operator activations must strictly increase: {previous} then {next}")]
    UnorderedActivation { previous: u64, next: u64 },
}

/// The set of keys replicas accept block signatures from.
///
/// Today this always holds a single key; the list shape leaves room for
/// rotating the operator at a known height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRoot {
    changes: Vec<OperatorChange>,
}

impl TrustRoot {
    pub fn single(key: PublicKey) -> Self {
        Self {
            changes: vec![OperatorChange {
                activation_height: 0,
                key,
            }],
        }
    }

    pub fn new(changes: Vec<OperatorChange>) -> Result<Self, TrustRootError> {
        let first = changes.first().ok_or(TrustRootError::Empty)?;
        if first.activation_height != 0 {
            return Err(TrustRootError::LateFirstActivation(first.activation_height));
        }
        for pair in changes.windows(2) {
            if pair[1].activation_height <= pair[0].activation_height {
                return Err(TrustRootError::UnorderedActivation {
                    previous: pair[0].activation_height,
                    next: pair[1].activation_height,
                });
            }
        }
        Ok(Self { changes })
    }

    pub fn operator_at(&self, height: u64) -> &PublicKey {
        let active = self
            .changes
            .iter()
            .take_while(|change| change.activation_height <= height)
            .last()
            .unwrap_or(&self.changes[0]);
        &active.key
    }

    pub fn changes(&self) -> &[OperatorChange] {
        &self.changes
    }

    /// Recovers the block signer and checks it is the operator for that height.
    pub fn verify_block(&self, block: &Block) -> Result<PublicKey, MessageError> {
        let signer = block.recover_signer()?;
        if &signer != self.operator_at(block.height) {
            return Err(MessageError::InvalidSignature);
        }
        Ok(signer)
    }
}
