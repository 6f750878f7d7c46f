//! State vectors and the transform-engine seam. The engine itself (geometry or
//! physics kernel) lives outside the ledger; the ledger only records which
//! transform ran with which parameters and replays it.

use hol_cbor::Hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transform name the ledger applies as the identity when a gate message
/// lands on a receiving chain.
pub const GATE_RECEIVE_OP: &str = "gate.receive";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(pub Vec<f64>);

impl StateVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bit-exact digest over the IEEE-754 representation; `0.0` and `-0.0`
    /// hash differently.
    pub fn state_hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(8 + self.0.len() * 8);
        bytes.extend_from_slice(&(self.0.len() as u64).to_le_bytes());
        for v in &self.0 {
            bytes.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Hash::of_parts(&[b"hol/state", &bytes])
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Snapshot blob encoding: little-endian f64 bits, no framing.
    pub fn to_snapshot_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_bits().to_le_bytes()).collect()
    }

    pub fn from_snapshot_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_bits(u64::from_le_bytes(buf))
            })
            .collect();
        Some(Self(values))
    }

    /// Largest per-component absolute difference; `None` on dimension mismatch.
    pub fn max_abs_diff(&self, other: &StateVector) -> Option<f64> {
        if self.len() != other.len() {
            return None;
        }
        Some(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }
}

/// How an operation's output depends on things outside its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Function of state and parameters only.
    Pure,
    /// Pure given the chain's recorded seed.
    Seeded,
    /// Consumes external inputs, each backed by a receipt.
    External,
    /// Stochastic; reproducible only in distribution.
    Sampled,
    /// Reads ambient state (wall clock, system entropy).
    Ambient,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformOp {
    pub name: String,
    pub kind: OpKind,
}

impl TransformOp {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn pure(name: impl Into<String>) -> Self {
        Self::new(name, OpKind::Pure)
    }

    pub fn gate_receive() -> Self {
        Self::new(GATE_RECEIVE_OP, OpKind::Pure)
    }

    pub fn is_gate_receive(&self) -> bool {
        self.name == GATE_RECEIVE_OP
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Params {
    pub values: Vec<f64>,
    /// Receipt ids of external inputs this transition consumed.
    #[serde(default)]
    pub inputs: Vec<Hash>,
}

impl Params {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<Hash>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct EngineError(pub String);

/// Deterministic executor of transform operations.
pub trait TransformEngine: Send + Sync {
    fn apply(&self, state: &StateVector, op: &TransformOp, params: &Params) -> Result<StateVector, EngineError>;

    /// Worst-case ULP error of `op`'s numeric path on this engine.
    fn ulp_error(&self, _op: &TransformOp) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_hash_is_bit_exact() {
        let a = StateVector::new(vec![0.0, 1.5]);
        let b = StateVector::new(vec![-0.0, 1.5]);
        assert_ne!(a.state_hash(), b.state_hash());
        assert_eq!(a.state_hash(), StateVector::new(vec![0.0, 1.5]).state_hash());
    }

    #[test]
    fn snapshot_bytes_round_trip_and_reject_ragged_input() {
        let s = StateVector::new(vec![0.1, -3.25, f64::MIN_POSITIVE]);
        let back = StateVector::from_snapshot_bytes(&s.to_snapshot_bytes()).unwrap();
        assert_eq!(back.state_hash(), s.state_hash());
        assert!(StateVector::from_snapshot_bytes(&[0u8; 7]).is_none());
    }

    #[test]
    fn max_abs_diff_needs_matching_dimensions() {
        let a = StateVector::new(vec![0.0, 1.0]);
        let b = StateVector::new(vec![0.5, 0.75]);
        assert_eq!(a.max_abs_diff(&b), Some(0.5));
        assert_eq!(a.max_abs_diff(&StateVector::new(vec![0.0])), None);
    }
}
