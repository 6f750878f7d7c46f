//! Canonical receipt hashing and the append-only receipt log.
//!
//! Canonical form: every map is keyed by text and emitted in lexicographic key
//! order; floats are quantized with round-half-to-even at `10^-quantum_decimals`;
//! wall-clock fields are dropped at any depth. Two records that differ only in
//! key order or float notation therefore hash identically.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hol_cbor::Hash;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_cbor::Value as CborValue;
use thiserror::Error;

use crate::config::LedgerConfig;
use crate::ledger::ChainId;
use crate::tick::Tick;

const EXACT_STEPS: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("non-finite float at {0}")]
    NonFinite(String),
    #[error("map key at {0} is not text")]
    NonTextKey(String),
    #[error("unsupported value at {0}")]
    Unsupported(String),
}

/// Canonical value tree. Maps are `BTreeMap<String, _>` so iteration order is
/// the lexicographic key order the encoding requires.
#[derive(Debug, Clone, PartialEq)]
enum Canonical {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Canonical>),
    Map(BTreeMap<String, Canonical>),
}

impl Serialize for Canonical {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Canonical::Null => serializer.serialize_unit(),
            Canonical::Bool(b) => serializer.serialize_bool(*b),
            Canonical::Int(i) => {
                if let Ok(v) = i64::try_from(*i) {
                    serializer.serialize_i64(v)
                } else if let Ok(v) = u64::try_from(*i) {
                    serializer.serialize_u64(v)
                } else {
                    serializer.serialize_i128(*i)
                }
            }
            Canonical::Float(f) => serializer.serialize_f64(*f),
            Canonical::Bytes(b) => serializer.serialize_bytes(b),
            Canonical::Text(t) => serializer.serialize_str(t),
            Canonical::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Canonical::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiptCodec {
    quantum_decimals: u32,
    scale: f64,
    wall_clock_fields: BTreeSet<String>,
}

impl Default for ReceiptCodec {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

impl ReceiptCodec {
    pub fn new(quantum_decimals: u32, wall_clock_fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            quantum_decimals,
            scale: 10f64.powi(quantum_decimals as i32),
            wall_clock_fields: wall_clock_fields.into_iter().collect(),
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.quantum_decimals, config.wall_clock_fields.iter().cloned())
    }

    pub fn quantum_decimals(&self) -> u32 {
        self.quantum_decimals
    }

    /// Canonical CBOR bytes of `record`.
    pub fn canonicalize<T: Serialize + ?Sized>(&self, record: &T) -> Result<Vec<u8>, CodecError> {
        let value = serde_cbor::value::to_value(record)?;
        let canonical = self.lower(value, "$")?;
        Ok(serde_cbor::to_vec(&canonical)?)
    }

    pub fn hash(bytes: &[u8]) -> Hash {
        Hash::of_bytes(bytes)
    }

    pub fn canonical_hash<T: Serialize + ?Sized>(&self, record: &T) -> Result<Hash, CodecError> {
        Ok(Self::hash(&self.canonicalize(record)?))
    }

    pub fn dedupe_key(tenant: &str, id: &str, state_version: u64, op_kind: &str) -> Hash {
        Hash::of_parts(&[
            b"hol/dedupe",
            tenant.as_bytes(),
            id.as_bytes(),
            &state_version.to_le_bytes(),
            op_kind.as_bytes(),
        ])
    }

    /// Round half to even on the quantization grid. Past 2^53 grid steps an
    /// f64 cannot hold a value between grid points, so the value is kept as is.
    pub fn quantize(&self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            return None;
        }
        let scaled = value * self.scale;
        let q = if scaled.is_finite() && scaled.abs() < EXACT_STEPS {
            scaled.round_ties_even() / self.scale
        } else {
            value
        };
        // -0.0 and 0.0 are the same logical value.
        Some(if q == 0.0 { 0.0 } else { q })
    }

    fn lower(&self, value: CborValue, path: &str) -> Result<Canonical, CodecError> {
        Ok(match value {
            CborValue::Null => Canonical::Null,
            CborValue::Bool(b) => Canonical::Bool(b),
            CborValue::Integer(i) => Canonical::Int(i),
            CborValue::Float(f) => {
                if !f.is_finite() {
                    return Err(CodecError::NonFinite(path.to_string()));
                }
                Canonical::Float(self.quantize(f).ok_or_else(|| CodecError::NonFinite(path.to_string()))?)
            }
            CborValue::Bytes(b) => Canonical::Bytes(b),
            CborValue::Text(t) => Canonical::Text(t),
            CborValue::Array(items) => Canonical::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| self.lower(v, &format!("{path}[{i}]")))
                    .collect::<Result<_, _>>()?,
            ),
            CborValue::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    let key = match k {
                        CborValue::Text(t) => t,
                        CborValue::Integer(i) => i.to_string(),
                        _ => return Err(CodecError::NonTextKey(path.to_string())),
                    };
                    if self.wall_clock_fields.contains(&key) {
                        continue;
                    }
                    let child = self.lower(v, &format!("{path}.{key}"))?;
                    out.insert(key, child);
                }
                Canonical::Map(out)
            }
            CborValue::Tag(_, inner) => self.lower(*inner, path)?,
            _ => return Err(CodecError::Unsupported(path.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Ok,
    Rejected { code: String, message: String },
}

impl ReceiptStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ReceiptStatus::Ok)
    }
}

/// External input that crossed into a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundPayload {
    pub source: String,
    pub sequence: u64,
    /// Receiver's head tick when the input was recorded.
    #[serde(default)]
    pub chain_tick: Tick,
    pub payload: serde_json::Value,
}

/// Immutable, hashed record of a ledger operation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub rid: Hash,
    pub op_kind: String,
    pub tenant: String,
    pub chain_id: ChainId,
    pub logical_timestamp: u64,
    pub selectors_hash: Hash,
    pub policy_hash: Hash,
    pub bundle_hash: Hash,
    pub canonical_hash: Hash,
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundPayload>,
}

/// Everything a receipt commits to, before `rid` and `canonical_hash` exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptDraft {
    pub op_kind: String,
    pub tenant: String,
    pub chain_id: ChainId,
    pub logical_timestamp: u64,
    pub selectors_hash: Hash,
    pub policy_hash: Hash,
    pub bundle_hash: Hash,
    pub status: ReceiptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<Hash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundPayload>,
}

impl ReceiptCodec {
    pub fn seal(&self, draft: ReceiptDraft) -> Result<Receipt, CodecError> {
        let canonical_hash = self.canonical_hash(&draft)?;
        Ok(Receipt {
            rid: Hash::of_parts(&[b"hol/rid", canonical_hash.as_bytes()]),
            op_kind: draft.op_kind,
            tenant: draft.tenant,
            chain_id: draft.chain_id,
            logical_timestamp: draft.logical_timestamp,
            selectors_hash: draft.selectors_hash,
            policy_hash: draft.policy_hash,
            bundle_hash: draft.bundle_hash,
            canonical_hash,
            status: draft.status,
            dedupe_key: draft.dedupe_key,
            inbound: draft.inbound,
        })
    }

    /// Recompute `canonical_hash` and `rid` and compare with the stored values.
    pub fn verify(&self, receipt: &Receipt) -> Result<bool, CodecError> {
        let resealed = self.seal(ReceiptDraft {
            op_kind: receipt.op_kind.clone(),
            tenant: receipt.tenant.clone(),
            chain_id: receipt.chain_id.clone(),
            logical_timestamp: receipt.logical_timestamp,
            selectors_hash: receipt.selectors_hash,
            policy_hash: receipt.policy_hash,
            bundle_hash: receipt.bundle_hash,
            status: receipt.status.clone(),
            dedupe_key: receipt.dedupe_key,
            inbound: receipt.inbound.clone(),
        })?;
        Ok(resealed.canonical_hash == receipt.canonical_hash && resealed.rid == receipt.rid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(Receipt),
    /// A receipt with the same dedupe key (or rid) already exists; this is it.
    Duplicate(Receipt),
}

impl AppendOutcome {
    pub fn receipt(&self) -> &Receipt {
        match self {
            AppendOutcome::Appended(r) | AppendOutcome::Duplicate(r) => r,
        }
    }

    pub fn into_receipt(self) -> Receipt {
        match self {
            AppendOutcome::Appended(r) | AppendOutcome::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Append-only receipt store keyed by `rid`, indexed by dedupe key.
#[derive(Debug, Default)]
pub struct ReceiptLog {
    order: Vec<Hash>,
    by_rid: HashMap<Hash, Receipt>,
    by_dedupe: HashMap<Hash, Hash>,
}

impl ReceiptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a receipt that `receipt` would duplicate, without appending.
    pub fn duplicate_of(&self, receipt: &Receipt) -> Option<&Receipt> {
        if let Some(existing) = self.by_rid.get(&receipt.rid) {
            return Some(existing);
        }
        receipt
            .dedupe_key
            .and_then(|key| self.by_dedupe.get(&key))
            .and_then(|rid| self.by_rid.get(rid))
    }

    pub fn append(&mut self, receipt: Receipt) -> AppendOutcome {
        if let Some(existing) = self.duplicate_of(&receipt) {
            return AppendOutcome::Duplicate(existing.clone());
        }
        if let Some(key) = receipt.dedupe_key {
            self.by_dedupe.insert(key, receipt.rid);
        }
        self.order.push(receipt.rid);
        self.by_rid.insert(receipt.rid, receipt.clone());
        AppendOutcome::Appended(receipt)
    }

    pub fn get(&self, rid: &Hash) -> Option<&Receipt> {
        self.by_rid.get(rid)
    }

    pub fn by_dedupe_key(&self, key: &Hash) -> Option<&Receipt> {
        self.by_dedupe.get(key).and_then(|rid| self.by_rid.get(rid))
    }

    /// Receipts in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Receipt> {
        self.order.iter().filter_map(|rid| self.by_rid.get(rid))
    }

    pub fn for_chain<'a>(&'a self, chain: &'a ChainId) -> impl Iterator<Item = &'a Receipt> + 'a {
        self.iter().filter(move |r| &r.chain_id == chain)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
