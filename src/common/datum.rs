//! Arbitrary data items stored in the DHT (BEP-44).

use bytes::Bytes;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha1_smol::Sha1;

use crate::common::Id;

/// Size of an Ed25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// An arbitrary non-peer data item stored in the DHT.
///
/// A datum without a key is immutable and addressed by the hash of its
/// value. A datum with a key is mutable: key-addressed, Ed25519-signed and
/// sequence-numbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datum {
    /// The datum value.
    pub value: Bytes,

    /// Ed25519 public key. If set, this is a mutable datum.
    pub key: Option<[u8; PUBLIC_KEY_SIZE]>,

    /// Salt. Only used for mutable data.
    pub salt: Option<Bytes>,

    /// Value signature. Only used for mutable data.
    pub signature: Option<[u8; SIGNATURE_SIZE]>,

    /// Sequence number. Only used for mutable data.
    pub seq: u64,
}

impl Datum {
    /// A content-addressed immutable datum.
    pub fn immutable(value: Bytes) -> Datum {
        Datum {
            value,
            key: None,
            salt: None,
            signature: None,
            seq: 0,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.key.is_some()
    }

    /// The storage target this datum lives under.
    pub fn target(&self) -> Id {
        match &self.key {
            Some(key) => mutable_target(key, self.salt.as_deref()),
            None => immutable_target(&self.value),
        }
    }

    /// Check the Ed25519 signature of a mutable datum over the byte-literal
    /// signable form. Immutable data carries no signature and never verifies.
    pub fn verify(&self) -> bool {
        let (Some(key), Some(signature)) = (&self.key, &self.signature) else {
            return false;
        };

        let Ok(key) = VerifyingKey::from_bytes(key) else {
            return false;
        };

        let signable = encode_signable(self.seq, &self.value, self.salt.as_deref());
        key.verify(&signable, &Signature::from_bytes(signature))
            .is_ok()
    }
}

/// The exact byte string a mutable datum signs, per BEP-44:
/// `4:salt<len>:<salt>` when salt is present, then `3:seqi<seq>e1:v<len>:<value>`.
///
/// This is literal bencode text. It must be built byte for byte, never by
/// re-serialising a structure.
pub fn encode_signable(seq: u64, value: &[u8], salt: Option<&[u8]>) -> Vec<u8> {
    let mut signable = Vec::with_capacity(value.len() + 32);

    if let Some(salt) = salt {
        if !salt.is_empty() {
            signable.extend_from_slice(format!("4:salt{}:", salt.len()).as_bytes());
            signable.extend_from_slice(salt);
        }
    }

    signable.extend_from_slice(format!("3:seqi{}e1:v{}:", seq, value.len()).as_bytes());
    signable.extend_from_slice(value);

    signable
}

/// Storage target of an immutable value: SHA-1 over the value in bencoded
/// string form (`<len>:<value>`).
pub fn immutable_target(value: &[u8]) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:", value.len()).as_bytes());
    hasher.update(value);

    Id(hasher.digest().bytes())
}

/// Storage target of a mutable value: SHA-1 over the raw public key followed
/// by the salt, if any.
pub fn mutable_target(key: &[u8; PUBLIC_KEY_SIZE], salt: Option<&[u8]>) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(key);
    if let Some(salt) = salt {
        hasher.update(salt);
    }

    Id(hasher.digest().bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn signable_without_salt() {
        let signable = encode_signable(4, b"Hello world!", None);
        assert_eq!(&signable, b"3:seqi4e1:v12:Hello world!");
    }

    #[test]
    fn signable_with_salt() {
        let signable = encode_signable(4, b"Hello world!", Some(b"foobar"));
        assert_eq!(&signable, b"4:salt6:foobar3:seqi4e1:v12:Hello world!");
    }

    #[test]
    fn signable_treats_empty_salt_as_absent() {
        assert_eq!(
            encode_signable(1, b"v", Some(b"")),
            encode_signable(1, b"v", None)
        );
    }

    #[test]
    fn immutable_target_is_hash_of_bencoded_value() {
        let v = [
            171u8, 118, 111, 111, 174, 109, 195, 32, 138, 140, 113, 176, 76, 135, 116, 132, 156,
            126, 75, 173,
        ];
        let target = Id([
            2, 23, 113, 43, 67, 11, 185, 26, 26, 30, 204, 238, 204, 1, 13, 84, 52, 40, 86, 231,
        ]);

        assert_eq!(immutable_target(&v), target);
        assert_ne!(immutable_target(&v[1..]), target);
    }

    #[test]
    fn mutable_roundtrip_verifies() {
        let signer = SigningKey::from_bytes(&[7u8; 32]);
        let value = Bytes::from_static(b"any value at all");
        let salt = Some(Bytes::from_static(b"pepper"));

        let signable = encode_signable(3, &value, salt.as_deref());
        let signature = signer.sign(&signable);

        let datum = Datum {
            value,
            key: Some(signer.verifying_key().to_bytes()),
            salt,
            signature: Some(signature.to_bytes()),
            seq: 3,
        };

        assert!(datum.is_mutable());
        assert!(datum.verify());

        // Any disturbance of the signed fields breaks the signature.
        let mut tampered = datum.clone();
        tampered.seq = 4;
        assert!(!tampered.verify());

        let mut tampered = datum.clone();
        tampered.salt = None;
        assert!(!tampered.verify());
    }

    #[test]
    fn mutable_and_immutable_targets_differ_by_addressing() {
        let signer = SigningKey::from_bytes(&[9u8; 32]);
        let key = signer.verifying_key().to_bytes();

        // Same value, two different salts: different targets.
        let a = mutable_target(&key, Some(b"salt-a"));
        let b = mutable_target(&key, Some(b"salt-b"));
        assert_ne!(a, b);

        // The immutable target depends only on the value.
        assert_eq!(immutable_target(b"x"), immutable_target(b"x"));
    }
}
