//! Checksum values with explicit unknown / known-zero / known-value states.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

pub const CRC_SIZE: usize = 4;
pub const MD5_SIZE: usize = 16;
pub const SHA1_SIZE: usize = 20;
pub const SHA256_SIZE: usize = 32;
pub const SHA384_SIZE: usize = 48;
pub const SHA512_SIZE: usize = 64;

/// A fixed-width digest that may be unknown, explicitly zero, or a real value.
///
/// `Unknown` acts as a wildcard when matching: it matches anything. `Zero` is the
/// explicit "known absent" marker some DATs carry (written as `null` or all zeroes)
/// and only matches another `Zero`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Checksum<const N: usize> {
    #[default]
    Unknown,
    Zero,
    Value([u8; N]),
}

pub type Crc = Checksum<CRC_SIZE>;
pub type Md5 = Checksum<MD5_SIZE>;
pub type Sha1 = Checksum<SHA1_SIZE>;
pub type Sha256 = Checksum<SHA256_SIZE>;
pub type Sha384 = Checksum<SHA384_SIZE>;
pub type Sha512 = Checksum<SHA512_SIZE>;

impl<const N: usize> Checksum<N> {
    /// Create a checksum from raw bytes. All-zero input becomes `Zero`.
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        if bytes.iter().all(|b| *b == 0) {
            Checksum::Zero
        } else {
            Checksum::Value(bytes)
        }
    }

    /// Create a checksum from a slice that must be exactly `N` bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; N] = bytes.try_into().map_err(|_| {
            Error::invalid_hash(format!("Expected {} bytes, got {}", N, bytes.len()))
        })?;
        Ok(Self::from_bytes(array))
    }

    /// Parse from hex. An empty string is `Unknown`, the literal `null` is `Zero`.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.trim();
        if hex_str.is_empty() {
            return Ok(Checksum::Unknown);
        }
        if hex_str.eq_ignore_ascii_case("null") {
            return Ok(Checksum::Zero);
        }
        if hex_str.len() != N * 2 {
            return Err(Error::invalid_hash(format!(
                "Expected {} hex characters, got {}",
                N * 2,
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_hash(format!("Invalid hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Lowercase hex, or `None` when unknown.
    pub fn to_hex(&self) -> Option<String> {
        self.bytes().map(hex::encode)
    }

    /// Raw bytes, or `None` when unknown. `Zero` yields all zero bytes.
    pub fn bytes(&self) -> Option<[u8; N]> {
        match self {
            Checksum::Unknown => None,
            Checksum::Zero => Some([0u8; N]),
            Checksum::Value(bytes) => Some(*bytes),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Checksum::Unknown)
    }

    pub fn is_known(&self) -> bool {
        !self.is_unknown()
    }

    /// Wildcard match: unknown on either side matches, otherwise both must be equal.
    pub fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Checksum::Unknown, _) | (_, Checksum::Unknown) => true,
            (a, b) => a == b,
        }
    }

    /// Equality of two known values; `None` if either side is unknown.
    pub fn known_eq(&self, other: &Self) -> Option<bool> {
        if self.is_unknown() || other.is_unknown() {
            None
        } else {
            Some(self == other)
        }
    }

    /// Fill an unknown value from `other`.
    pub fn fill_from(&mut self, other: &Self) {
        if self.is_unknown() {
            *self = *other;
        }
    }

    /// The all-zero hex string used as the bucket key for items without this hash.
    pub fn zero_hex() -> String {
        "0".repeat(N * 2)
    }

    /// Bucket key for this checksum; unknown values produce an empty key.
    pub fn key(&self) -> String {
        self.to_hex().unwrap_or_default()
    }

    /// Byte-wise ordering where unknown sorts before any known value.
    pub fn cmp_bytes(&self, other: &Self) -> Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl<const N: usize> fmt::Display for Checksum<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_hex() {
            Some(hex) => write!(f, "{}", hex),
            None => write!(f, "-"),
        }
    }
}

impl<const N: usize> fmt::Debug for Checksum<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::Unknown => write!(f, "Checksum(unknown)"),
            Checksum::Zero => write!(f, "Checksum(zero)"),
            Checksum::Value(bytes) => write!(f, "Checksum({})", hex::encode(bytes)),
        }
    }
}

impl<const N: usize> Serialize for Checksum<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.to_hex() {
            Some(hex) => serializer.serialize_some(&hex),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de, const N: usize> Deserialize<'de> for Checksum<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(Checksum::Unknown),
            Some(hex) => Checksum::from_hex(&hex).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hex_states() {
        assert_eq!(Crc::from_hex("").unwrap(), Checksum::Unknown);
        assert_eq!(Crc::from_hex("null").unwrap(), Checksum::Zero);
        assert_eq!(Crc::from_hex("00000000").unwrap(), Checksum::Zero);
        assert_eq!(
            Crc::from_hex("deadbeef").unwrap(),
            Checksum::Value([0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_from_hex_invalid() {
        assert!(Crc::from_hex("abc").is_err());
        assert!(Crc::from_hex("zzzzzzzz").is_err());
        assert!(Sha1::from_hex("deadbeef").is_err());
    }

    #[test]
    fn test_matches_wildcard() {
        let unknown = Crc::Unknown;
        let zero = Crc::Zero;
        let value = Crc::from_hex("12345678").unwrap();
        let other = Crc::from_hex("87654321").unwrap();

        assert!(unknown.matches(&value));
        assert!(value.matches(&unknown));
        assert!(unknown.matches(&zero));
        assert!(zero.matches(&zero));
        assert!(!zero.matches(&value));
        assert!(!value.matches(&other));
        assert!(value.matches(&value));
    }

    #[test]
    fn test_known_eq() {
        let value = Md5::from_bytes([7u8; MD5_SIZE]);
        assert_eq!(value.known_eq(&Md5::Unknown), None);
        assert_eq!(value.known_eq(&value), Some(true));
        assert_eq!(value.known_eq(&Md5::Zero), Some(false));
    }

    #[test]
    fn test_key_and_zero_hex() {
        assert_eq!(Crc::Unknown.key(), "");
        assert_eq!(Crc::Zero.key(), "00000000");
        assert_eq!(Crc::zero_hex(), "00000000");
        assert_eq!(Sha1::zero_hex().len(), 40);
    }

    #[test]
    fn test_fill_from() {
        let mut crc = Crc::Unknown;
        let value = Crc::from_hex("cafebabe").unwrap();
        crc.fill_from(&value);
        assert_eq!(crc, value);

        let mut kept = Crc::Zero;
        kept.fill_from(&value);
        assert_eq!(kept, Crc::Zero);
    }

    #[test]
    fn test_serde_json() {
        let value = Crc::from_hex("cafebabe").unwrap();
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "\"cafebabe\"");

        let unknown: Crc = serde_json::from_str("null").unwrap();
        assert_eq!(unknown, Crc::Unknown);
        let zero: Crc = serde_json::from_str("\"null\"").unwrap();
        assert_eq!(zero, Crc::Zero);
    }

    #[test]
    fn test_cmp_bytes_unknown_first() {
        let value = Crc::from_hex("00000001").unwrap();
        assert_eq!(Crc::Unknown.cmp_bytes(&Crc::Zero), Ordering::Less);
        assert_eq!(Crc::Zero.cmp_bytes(&value), Ordering::Less);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Hex round-trip preserves the checksum, including the zero state.
        #[test]
        fn prop_hex_roundtrip(bytes in prop::array::uniform20(any::<u8>())) {
            let sha1 = Sha1::from_bytes(bytes);
            let hex = sha1.to_hex().unwrap();
            prop_assert_eq!(Sha1::from_hex(&hex)?, sha1);
        }

        /// Wildcard matching is symmetric.
        #[test]
        fn prop_matches_symmetric(
            a in prop::option::of(prop::array::uniform4(0u8..3)),
            b in prop::option::of(prop::array::uniform4(0u8..3)),
        ) {
            let a = a.map(Crc::from_bytes).unwrap_or_default();
            let b = b.map(Crc::from_bytes).unwrap_or_default();
            prop_assert_eq!(a.matches(&b), b.matches(&a));
        }
    }
}
