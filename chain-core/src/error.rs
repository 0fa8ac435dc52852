// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use thiserror::Error;

/// Why a transaction or block was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is malformed: {0}")]
    Malformed(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("message expired")]
    MessageExpired,
    #[error("unknown expiry condition '{0}'")]
    UnknownExpiryCondition(u8),
    #[error("block is missing a signature")]
    MissingSignature,
}

impl MessageError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signing failed: {0}")]
    Signing(String),
}
