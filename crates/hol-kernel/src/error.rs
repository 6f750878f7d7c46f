use hol_cbor::Hash;
use thiserror::Error;

use crate::ledger::ChainId;
use crate::tick::Tick;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Ambient entropy or a non-reproducible numeric path where the tier forbids it.
    #[error("determinism violation on {chain}: {reason}")]
    DeterminismViolation { chain: ChainId, reason: String },
    /// Hash-chain or invariant mismatch. The affected chain is quarantined.
    #[error("corrupted history on {chain}: {detail}")]
    CorruptedHistory { chain: ChainId, detail: String },
    #[error("state at tick {tick} of {chain} is unreachable: {reason}")]
    UnreachableState {
        chain: ChainId,
        tick: Tick,
        reason: String,
    },
    #[error("out-of-order delta on {chain}: head is {head_tick} ({head_hash}), got tick {tick} with parent {parent_hash}")]
    OutOfOrderDelta {
        chain: ChainId,
        head_tick: Tick,
        head_hash: Hash,
        tick: Tick,
        parent_hash: Hash,
    },
    #[error("delta {tick} on {chain} references input {rid} with no receipt")]
    IncompleteReceiptChain { chain: ChainId, tick: Tick, rid: Hash },
    #[error("invalid seed namespace '{0}'")]
    InvalidNamespace(String),
    #[error("no root seed recorded for '{0}'")]
    MissingParentSeed(String),
    #[error("unknown chain '{0}'")]
    UnknownChain(ChainId),
    #[error("unknown holon '{0}'")]
    UnknownHolon(String),
    #[error("holon '{0}' already exists")]
    HolonExists(String),
    #[error("chain {chain} is quarantined: {reason}")]
    ChainQuarantined { chain: ChainId, reason: String },
    #[error("policy denied {operation} on {chain}: {reason}")]
    PolicyDenied {
        chain: ChainId,
        operation: String,
        reason: String,
    },
    #[error("trajectory error: {0}")]
    Trajectory(#[from] crate::compaction::TrajectoryError),
    #[error("replay cancelled on {0}")]
    Cancelled(ChainId),
    #[error("transform engine error: {0}")]
    Engine(#[from] crate::state::EngineError),
    #[error("store error: {0}")]
    Store(#[from] hol_store::StoreError),
    #[error("journal error: {0}")]
    Journal(#[from] crate::journal::JournalError),
    #[error("codec error: {0}")]
    Codec(#[from] crate::receipts::CodecError),
    #[error("signature error: {0}")]
    Signature(String),
}

impl LedgerError {
    /// Stable machine-readable code, recorded in rejected receipts.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::DeterminismViolation { .. } => "determinism_violation",
            LedgerError::CorruptedHistory { .. } => "corrupted_history",
            LedgerError::UnreachableState { .. } => "unreachable_state",
            LedgerError::OutOfOrderDelta { .. } => "out_of_order_delta",
            LedgerError::IncompleteReceiptChain { .. } => "incomplete_receipt_chain",
            LedgerError::InvalidNamespace(_) => "invalid_namespace",
            LedgerError::MissingParentSeed(_) => "missing_parent_seed",
            LedgerError::UnknownChain(_) => "unknown_chain",
            LedgerError::UnknownHolon(_) => "unknown_holon",
            LedgerError::HolonExists(_) => "holon_exists",
            LedgerError::ChainQuarantined { .. } => "chain_quarantined",
            LedgerError::PolicyDenied { .. } => "policy_denied",
            LedgerError::Trajectory(_) => "trajectory",
            LedgerError::Cancelled(_) => "cancelled",
            LedgerError::Engine(_) => "engine",
            LedgerError::Store(_) => "store",
            LedgerError::Journal(_) => "journal",
            LedgerError::Codec(_) => "codec",
            LedgerError::Signature(_) => "signature",
        }
    }

    /// Only tick races are retried; everything else needs intervention.
    pub fn retryable(&self) -> bool {
        matches!(self, LedgerError::OutOfOrderDelta { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::CorruptedHistory { .. })
    }

    pub(crate) fn corrupted(chain: &ChainId, detail: impl Into<String>) -> Self {
        LedgerError::CorruptedHistory {
            chain: chain.clone(),
            detail: detail.into(),
        }
    }

    pub(crate) fn unreachable(chain: &ChainId, tick: Tick, reason: impl Into<String>) -> Self {
        LedgerError::UnreachableState {
            chain: chain.clone(),
            tick,
            reason: reason.into(),
        }
    }
}

impl From<serde_cbor::Error> for LedgerError {
    fn from(err: serde_cbor::Error) -> Self {
        LedgerError::Codec(crate::receipts::CodecError::Cbor(err))
    }
}

impl From<crate::seed::SeedError> for LedgerError {
    fn from(err: crate::seed::SeedError) -> Self {
        match err {
            crate::seed::SeedError::InvalidNamespace(ns) => LedgerError::InvalidNamespace(ns),
            crate::seed::SeedError::MissingParentSeed(ctx) => LedgerError::MissingParentSeed(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tick_races_are_retryable() {
        let chain = ChainId::new("run/holon:a");
        let race = LedgerError::OutOfOrderDelta {
            chain: chain.clone(),
            head_tick: 3,
            head_hash: Hash::ZERO,
            tick: 3,
            parent_hash: Hash::ZERO,
        };
        assert!(race.retryable());
        assert_eq!(race.code(), "out_of_order_delta");

        let corrupt = LedgerError::corrupted(&chain, "merkle root mismatch");
        assert!(!corrupt.retryable());
        assert!(corrupt.is_fatal());

        let gone = LedgerError::unreachable(&chain, 500, "no anchor within k_max");
        assert!(!gone.retryable());
        assert_eq!(gone.code(), "unreachable_state");
    }
}
