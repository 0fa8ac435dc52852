// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{B256, keccak256};
use ssz::{Decode, Encode};

use crate::crypto::{self, PublicKey, Signer};
use crate::error::{CryptoError, MessageError};
use crate::sequence_tx::SequenceTx;

/// One link of the sequenced log. Each block carries exactly one transaction.
#[derive(Debug, Clone, PartialEq, Eq, ssz_derive::Encode, ssz_derive::Decode)]
pub struct Block {
    pub height: u64,
    pub prev_block_hash: Vec<u8>,
    pub body: SequenceTx,
    pub sig: Vec<u8>,
}

impl Block {
    /// Stands in for the parent hash of the genesis block.
    pub const GENESIS_PREV_HASH: [u8; 1] = [0x00];

    pub fn genesis() -> Self {
        Self {
            height: 0,
            prev_block_hash: Self::GENESIS_PREV_HASH.to_vec(),
            body: SequenceTx::default(),
            sig: Vec::new(),
        }
    }

    /// Unsigned child of `parent` carrying `body`.
    pub fn next(parent: &Block, body: SequenceTx) -> Self {
        Self {
            height: parent.height.saturating_add(1),
            prev_block_hash: parent.sighash().to_vec(),
            body,
            sig: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_block_hash == Self::GENESIS_PREV_HASH
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Self::from_ssz_bytes(bytes)
            .map_err(|err| MessageError::malformed(format!("cannot decode block: {err:?}")))
    }

    pub fn to_hex(&self) -> String {
        crate::encode_hex(&self.encode())
    }

    pub fn from_hex(value: &str) -> Result<Self, MessageError> {
        Self::decode(&crate::decode_hex(value)?)
    }

    pub fn sighash(&self) -> B256 {
        let mut unsigned = self.clone();
        unsigned.sig.clear();
        keccak256(unsigned.as_ssz_bytes())
    }

    pub fn short_hash(&self) -> String {
        let hash = self.sighash();
        crate::encode_hex(&hash.as_slice()[..6])
    }

    pub fn signed(&self, signer: &impl Signer) -> Result<Self, CryptoError> {
        let signature = signer.sign_digest(&self.sighash())?;
        let mut signed = self.clone();
        signed.sig = crypto::signature_bytes(&signature);
        Ok(signed)
    }

    pub fn recover_signer(&self) -> Result<PublicKey, MessageError> {
        if self.sig.is_empty() {
            return Err(MessageError::MissingSignature);
        }
        crypto::recover_public_key(&self.sighash(), &self.sig)
    }

    /// Height and hash link to `parent`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.height == parent.height.saturating_add(1)
            && self.prev_block_hash.as_slice() == parent.sighash().as_slice()
    }
}
