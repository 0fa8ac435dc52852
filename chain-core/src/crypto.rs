// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{B256, Signature};
use k256::ecdsa::{SigningKey, VerifyingKey};

use crate::error::{CryptoError, MessageError};

pub const SIGNATURE_BYTES: usize = 65;
pub const COMPRESSED_PUBLIC_KEY_BYTES: usize = 33;

/// A secp256k1 public key. Its identity string is the `0x`-prefixed
/// compressed SEC1 encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_compressed(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != COMPRESSED_PUBLIC_KEY_BYTES {
            return Err(CryptoError::InvalidPublicKey);
        }
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let bytes =
            alloy_primitives::hex::decode(value).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_compressed(&bytes)
    }

    pub fn to_compressed(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn identity(&self) -> String {
        crate::encode_hex(&self.to_compressed())
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(value: VerifyingKey) -> Self {
        Self(value)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.identity())
    }
}

pub trait Signer {
    fn sign_digest(&self, digest: &B256) -> Result<Signature, CryptoError>;

    fn public_key(&self) -> PublicKey;
}

/// Signs with an in-memory secp256k1 secret key.
#[derive(Clone)]
pub struct KeySigner {
    key: SigningKey,
}

impl KeySigner {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|err| CryptoError::InvalidSecretKey(err.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let bytes = alloy_primitives::hex::decode(value.trim())
            .map_err(|err| CryptoError::InvalidSecretKey(err.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }
}

impl Signer for KeySigner {
    fn sign_digest(&self, digest: &B256) -> Result<Signature, CryptoError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|err| CryptoError::Signing(err.to_string()))?;
        Ok(Signature::from_signature_and_parity(
            signature,
            recovery_id.is_y_odd(),
        ))
    }

    fn public_key(&self) -> PublicKey {
        PublicKey(*self.key.verifying_key())
    }
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySigner")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Recovers the signer of `digest` from a 65-byte r||s||v signature.
/// `v` may be 0/1 or 27/28.
pub fn recover_public_key(digest: &B256, signature: &[u8]) -> Result<PublicKey, MessageError> {
    if signature.len() != SIGNATURE_BYTES {
        return Err(MessageError::InvalidSignature);
    }
    let signature = Signature::from_raw(signature).map_err(|_| MessageError::InvalidSignature)?;
    signature
        .recover_from_prehash(digest)
        .map(PublicKey)
        .map_err(|_| MessageError::InvalidSignature)
}

pub fn signature_bytes(signature: &Signature) -> Vec<u8> {
    signature.as_bytes().to_vec()
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
