//! 160-bit identifiers for nodes and lookup targets.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The size of node IDs and infohashes in bytes.
pub const ID_SIZE: usize = 20;

/// The size of node IDs and infohashes in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

/// A 20-byte identifier: a node ID or a lookup target such as an infohash.
///
/// Distances between identifiers are measured with the XOR metric,
/// compared lexicographically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        Id(rand::thread_rng().gen())
    }

    /// Create an Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp = [0u8; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// XOR distance to `other`, ordered lexicographically.
    pub fn distance(&self, other: &Id) -> [u8; ID_SIZE] {
        let mut d = [0u8; ID_SIZE];
        for (i, b) in d.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        d
    }

    /// Length of the shared leading bit prefix with `other`, in `[0, 160]`.
    pub fn common_bits(&self, other: &Id) -> u32 {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];
            if xor != 0 {
                return i as u32 * 8 + xor.leading_zeros();
            }
        }

        ID_BITS as u32
    }

    /// The `i`-th bit, counted from the most significant bit of the first byte.
    pub(crate) fn bit(&self, i: usize) -> bool {
        self.0[i / 8] << (i % 8) & 0x80 != 0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Id, ParseIdError> {
        if s.len() != ID_SIZE * 2 {
            return Err(ParseIdError::InvalidLength(s.len()));
        }

        let mut bytes = [0u8; ID_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseIdError::InvalidHex)?;
        }

        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Id::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Raw bytes were not exactly [ID_SIZE] long.
#[error("expected {ID_SIZE} id bytes, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// A hexadecimal Id string failed to parse.
pub enum ParseIdError {
    #[error("expected {} hex characters, got {0}", ID_SIZE * 2)]
    InvalidLength(usize),

    #[error("invalid hex character")]
    InvalidHex,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn common_bits_bounds() {
        let a = Id::random();
        let b = Id::random();

        assert!(a.common_bits(&b) <= ID_BITS as u32);
        assert_eq!(a.common_bits(&a), ID_BITS as u32);
        assert_eq!(a.common_bits(&b), b.common_bits(&a));
    }

    #[test]
    fn common_bits_exact() {
        let zero = Id([0; ID_SIZE]);

        let mut one = [0u8; ID_SIZE];
        one[19] = 1;
        assert_eq!(zero.common_bits(&Id(one)), 159);

        let mut high = [0u8; ID_SIZE];
        high[0] = 0x80;
        assert_eq!(zero.common_bits(&Id(high)), 0);

        let mut mid = [0u8; ID_SIZE];
        mid[10] = 0x10;
        assert_eq!(zero.common_bits(&Id(mid)), 83);
    }

    #[test]
    fn bit_addressing() {
        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = 0b1010_0000;
        bytes[1] = 0b0000_0001;
        let id = Id(bytes);

        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(id.bit(15));
        assert!(!id.bit(16));
    }

    #[test]
    fn hex_roundtrip() {
        let hex = "393de2e25380e5c7d48dde8acd2732c6592342cb";
        let id = Id::from_str(hex).unwrap();
        assert_eq!(id.to_string(), hex);

        // Upper case parses, formats lower case.
        let upper = Id::from_str("393DE2E25380E5C7D48DDE8ACD2732C6592342CB").unwrap();
        assert_eq!(upper, id);
    }

    #[test]
    fn hex_rejects_malformed() {
        assert!(Id::from_str("").is_err());
        assert!(Id::from_str("ab").is_err());
        assert!(Id::from_str("393de2e25380e5c7d48dde8acd2732c6592342c").is_err());
        assert!(Id::from_str("393de2e25380e5c7d48dde8acd2732c659234 cb").is_err());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(Id::random(), Id::random());
    }
}
