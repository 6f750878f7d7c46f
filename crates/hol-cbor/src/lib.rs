//! Canonical CBOR encoding and the SHA-256 content hash shared by every ledger
//! crate.
//!
//! Values are lowered to a `serde_cbor::Value` first, whose maps are ordered,
//! so two encodings of the same logical record are byte-identical no matter
//! how the source struct or JSON object was built.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

const PREFIX: &str = "sha256:";

/// Deterministic CBOR for `value`: sorted map keys, self-describe tag first.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let lowered = serde_cbor::value::to_value(value)?;
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_cbor::ser::Serializer::new(&mut out);
    serializer.self_describe()?;
    lowered.serialize(&mut serializer)?;
    Ok(out)
}

/// 32-byte SHA-256 digest: content addresses, delta chaining, Merkle leaves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Hash(Sha256::digest(bytes).into())
    }

    /// Hash of a value's canonical CBOR encoding.
    pub fn of_cbor<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        to_canonical_cbor(value).map(|bytes| Self::of_bytes(&bytes))
    }

    /// Hash a sequence of fields, each prefixed by its little-endian u64 length
    /// so bytes cannot move across a field boundary.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        <[u8; 32]>::try_from(bytes)
            .map(Hash)
            .map_err(|_| HashError::Length(bytes.len()))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix(PREFIX).ok_or(HashError::Prefix)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(digits, &mut out)?;
        Ok(Hash(out))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("hash string must start with '{PREFIX}'")]
    Prefix,
    #[error("hash must be 32 bytes, got {0}")]
    Length(usize),
    #[error("invalid hash hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

// Human-readable serializers (the JSON recipe export) get `sha256:` strings,
// binary ones the raw 32 bytes. Deserialization accepts either.
impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(HashVisitor)
    }
}

struct HashVisitor;

impl<'de> serde::de::Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a sha256: string or 32 raw bytes")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Hash, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Hash, E> {
        Hash::from_slice(v).map_err(E::custom)
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Hash, A::Error> {
        let mut bytes = Vec::with_capacity(32);
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Hash::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_encoding_ignores_map_insertion_order() {
        let a = json!({"tick": 4, "chain": "alpha", "op": {"name": "translate", "kind": "pure"}});
        let b = json!({"op": {"kind": "pure", "name": "translate"}, "chain": "alpha", "tick": 4});
        assert_eq!(to_canonical_cbor(&a).unwrap(), to_canonical_cbor(&b).unwrap());
        assert_eq!(Hash::of_cbor(&a).unwrap(), Hash::of_cbor(&b).unwrap());
    }

    #[test]
    fn parts_hash_is_boundary_sensitive() {
        let left = Hash::of_parts(&[b"ab", b"c"]);
        let right = Hash::of_parts(&[b"a", b"bc"]);
        assert_ne!(left, right);
        assert_eq!(left, Hash::of_parts(&[b"ab", b"c"]));
    }

    #[test]
    fn display_parses_back() {
        let text = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let hash: Hash = text.parse().unwrap();
        assert_eq!(hash.to_string(), text);
        assert_eq!(hash.short(), "01234567");
        assert!(matches!("0123".parse::<Hash>(), Err(HashError::Prefix)));
        assert!(matches!("sha256:0123".parse::<Hash>(), Err(HashError::Hex(_))));
        assert!(matches!(Hash::from_slice(&[0u8; 31]), Err(HashError::Length(31))));
    }

    #[test]
    fn serde_uses_hex_for_json_and_bytes_for_cbor() {
        let hash = Hash::of_bytes(b"anchor");
        let text = serde_json::to_string(&hash).unwrap();
        assert_eq!(text, format!("\"{hash}\""));
        assert_eq!(serde_json::from_str::<Hash>(&text).unwrap(), hash);

        let cbor = to_canonical_cbor(&hash).unwrap();
        assert_eq!(serde_cbor::from_slice::<Hash>(&cbor).unwrap(), hash);
    }
}
