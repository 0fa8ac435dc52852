// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use alloy_primitives::{B256, keccak256};
use rand::RngCore;
use ssz::{Decode, Encode};

use crate::crypto::{self, PublicKey, Signer};
use crate::error::{CryptoError, MessageError};

pub const NONCE_BYTES: usize = 32;

/// A client-signed request to be ordered.
///
/// Field order is the wire schema: fields may be appended, never reordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, ssz_derive::Encode, ssz_derive::Decode)]
pub struct SequenceTx {
    pub data: Vec<u8>,
    /// Compressed public key of the submitter, set before signing.
    pub from: Vec<u8>,
    pub nonce: Vec<u8>,
    pub expires: Vec<ExpiryCondition>,
    /// r||s||v over `sighash()`.
    pub sig: Vec<u8>,
}

/// Tagged expiry condition: `kind` selects how `payload` is read.
#[derive(Debug, Clone, PartialEq, Eq, ssz_derive::Encode, ssz_derive::Decode)]
pub struct ExpiryCondition {
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Deadline in milliseconds since the unix epoch.
    UnixMillis(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    Enforce { now_ms: u64 },
    Skip,
}

impl ExpiryCondition {
    pub const UNIX_KIND: u8 = 0;

    pub fn unix_millis(deadline_ms: u64) -> Self {
        Self {
            kind: Self::UNIX_KIND,
            payload: deadline_ms.to_be_bytes().to_vec(),
        }
    }

    pub fn expires_in(ttl: Duration) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self::unix_millis(crypto::now_unix_ms().saturating_add(ttl_ms))
    }

    pub fn interpret(&self) -> Result<Expiry, MessageError> {
        match self.kind {
            Self::UNIX_KIND => {
                let bytes: [u8; 8] = self.payload.as_slice().try_into().map_err(|_| {
                    MessageError::malformed("unix expiry payload must be 8 bytes")
                })?;
                Ok(Expiry::UnixMillis(u64::from_be_bytes(bytes)))
            }
            other => Err(MessageError::UnknownExpiryCondition(other)),
        }
    }
}

impl SequenceTx {
    /// Unsigned transaction with a fresh random nonce, expiring after `ttl`.
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        let mut nonce = vec![0_u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            data,
            from: Vec::new(),
            nonce,
            expires: vec![ExpiryCondition::expires_in(ttl)],
            sig: Vec::new(),
        }
    }

    pub fn with_nonce(mut self, nonce: Vec<u8>) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_expires(mut self, expires: Vec<ExpiryCondition>) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_from(mut self, key: &PublicKey) -> Self {
        self.from = key.to_compressed();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Self::from_ssz_bytes(bytes)
            .map_err(|err| MessageError::malformed(format!("cannot decode transaction: {err:?}")))
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

    /// Returns a signed copy; `self` is left untouched.
    pub fn signed(&self, signer: &impl Signer) -> Result<Self, CryptoError> {
        let signature = signer.sign_digest(&self.sighash())?;
        let mut signed = self.clone();
        signed.sig = crypto::signature_bytes(&signature);
        Ok(signed)
    }

    pub fn verify(&self, policy: ExpiryPolicy) -> Result<(), MessageError> {
        if self.data.is_empty() {
            return Err(MessageError::malformed("data is empty"));
        }
        if self.from.is_empty() {
            return Err(MessageError::malformed("from is empty"));
        }
        if self.sig.is_empty() {
            return Err(MessageError::malformed("sig is empty"));
        }

        let claimed =
            PublicKey::from_compressed(&self.from).map_err(|_| MessageError::InvalidSignature)?;
        let recovered = crypto::recover_public_key(&self.sighash(), &self.sig)?;
        if recovered != claimed {
            return Err(MessageError::InvalidSignature);
        }

        if let ExpiryPolicy::Enforce { now_ms } = policy {
            self.check_expiry(now_ms)?;
        }
        Ok(())
    }

    pub fn check_expiry(&self, now_ms: u64) -> Result<(), MessageError> {
        for condition in &self.expires {
            match condition.interpret()? {
                Expiry::UnixMillis(deadline_ms) if deadline_ms < now_ms => {
                    return Err(MessageError::MessageExpired);
                }
                Expiry::UnixMillis(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpiryCondition, ExpiryPolicy, SequenceTx};
    use crate::crypto::{KeySigner, Signer, now_unix_ms};
    use crate::error::MessageError;
    use std::time::Duration;

    fn signer(seed: u8) -> KeySigner {
        KeySigner::from_bytes(&[seed; 32]).expect("valid secret key")
    }

    fn signed_tx(signer: &KeySigner, ttl: Duration) -> SequenceTx {
        SequenceTx::new(vec![0xc4, 0xa6, 0xab], ttl)
            .with_from(&signer.public_key())
            .signed(signer)
            .expect("sign tx")
    }

    fn enforce_now() -> ExpiryPolicy {
        ExpiryPolicy::Enforce {
            now_ms: now_unix_ms(),
        }
    }

    #[test]
    fn sighash_ignores_the_signature_field() {
        let signer = signer(1);
        let unsigned = SequenceTx::new(vec![1, 2, 3], Duration::from_secs(5))
            .with_from(&signer.public_key());
        let signed = unsigned.signed(&signer).expect("sign");

        assert!(unsigned.sig.is_empty(), "signing must not mutate the input");
        assert_eq!(signed.sighash(), unsigned.sighash());
        assert_ne!(signed.encode(), unsigned.encode());
    }

    #[test]
    fn valid_transaction_passes_verification() {
        let tx = signed_tx(&signer(2), Duration::from_secs(5));
        tx.verify(enforce_now()).expect("valid tx");

        let decoded = SequenceTx::from_hex(&tx.to_hex()).expect("decode hex");
        assert_eq!(decoded, tx);
        decoded.verify(enforce_now()).expect("decoded tx stays valid");
    }

    #[test]
    fn missing_fields_are_malformed() {
        let signer = signer(3);
        let mut no_data = signed_tx(&signer, Duration::from_secs(5));
        no_data.data.clear();
        assert!(matches!(
            no_data.verify(enforce_now()),
            Err(MessageError::Malformed(_))
        ));

        let no_from = SequenceTx::new(vec![1], Duration::from_secs(5))
            .signed(&signer)
            .expect("sign");
        assert!(matches!(
            no_from.verify(enforce_now()),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_bytes_do_not_decode() {
        assert!(matches!(
            SequenceTx::decode(&[0x01, 0x02]),
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(
            SequenceTx::from_hex("0xzz"),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn junk_signature_is_invalid() {
        let signer = signer(4);
        let mut tx = signed_tx(&signer, Duration::from_secs(5));
        tx.sig = vec![0x12, 0x34];
        assert_eq!(
            tx.verify(enforce_now()),
            Err(MessageError::InvalidSignature)
        );
    }

    #[test]
    fn signature_from_another_key_is_invalid() {
        let claimed = signer(5);
        let actual = signer(6);
        let tx = SequenceTx::new(vec![0xaa, 0xaa], Duration::from_secs(5))
            .with_from(&claimed.public_key())
            .signed(&actual)
            .expect("sign");

        assert_eq!(
            tx.verify(enforce_now()),
            Err(MessageError::InvalidSignature)
        );
    }

    #[test]
    fn signature_over_different_payload_is_invalid() {
        let signer = signer(7);
        let mut tx = signed_tx(&signer, Duration::from_secs(5));
        tx.data = vec![0xde, 0xad];
        assert_eq!(
            tx.verify(enforce_now()),
            Err(MessageError::InvalidSignature)
        );
    }

    #[test]
    fn expiry_is_enforced_only_when_requested() {
        let signer = signer(8);
        let past = now_unix_ms() - 60_000;
        let tx = SequenceTx::new(vec![1], Duration::ZERO)
            .with_expires(vec![ExpiryCondition::unix_millis(past)])
            .with_from(&signer.public_key())
            .signed(&signer)
            .expect("sign");

        assert_eq!(
            tx.verify(enforce_now()),
            Err(MessageError::MessageExpired)
        );
        tx.verify(ExpiryPolicy::Skip)
            .expect("expiry is not checked when skipped");
    }

    #[test]
    fn unknown_expiry_kind_is_a_hard_error() {
        let signer = signer(9);
        let tx = SequenceTx::new(vec![1], Duration::from_secs(5))
            .with_expires(vec![ExpiryCondition {
                kind: 7,
                payload: vec![0; 8],
            }])
            .with_from(&signer.public_key())
            .signed(&signer)
            .expect("sign");

        assert_eq!(
            tx.verify(enforce_now()),
            Err(MessageError::UnknownExpiryCondition(7))
        );
    }

    #[test]
    fn short_unix_payload_is_malformed() {
        let condition = ExpiryCondition {
            kind: ExpiryCondition::UNIX_KIND,
            payload: vec![1, 2, 3],
        };
        assert!(matches!(
            condition.interpret(),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn fresh_transactions_get_distinct_nonces() {
        let a = SequenceTx::new(vec![1], Duration::from_secs(1));
        let b = SequenceTx::new(vec![1], Duration::from_secs(1));
        assert_eq!(a.nonce.len(), 32);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn explicit_nonce_is_covered_by_the_sighash() {
        let base = SequenceTx::new(vec![1], Duration::from_secs(1));
        let first = base.clone().with_nonce(vec![0x01; 32]);
        let again = base.clone().with_nonce(vec![0x01; 32]);
        let other = base.with_nonce(vec![0x02; 32]);

        assert_eq!(first.nonce, vec![0x01; 32]);
        assert_eq!(first.sighash(), again.sighash());
        assert_ne!(first.sighash(), other.sighash());
    }
}
