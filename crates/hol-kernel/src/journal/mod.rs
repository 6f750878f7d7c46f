//! Write-ahead journal of ledger records. Every mutation is journaled before it
//! is applied in memory; opening a ledger replays the journal to rebuild state.

pub mod fs;
pub mod mem;

use hol_cbor::{Hash, to_canonical_cbor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compaction::CompactionRecord;
use crate::ledger::{Anchor, ChainId, Delta};
use crate::policy::DeterminismTier;
use crate::receipts::Receipt;
use crate::seed::{Seed, SeedNode};
use crate::tick::Tick;

/// Monotonic cursor assigned to every persisted journal entry.
pub type JournalSeq = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    ChainOpened,
    Delta,
    Anchor,
    AnchorDemoted,
    TierChanged,
    Quarantined,
    Compaction,
    Receipt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerRecord {
    ChainOpened(ChainOpenedRecord),
    Delta(Delta),
    Anchor(Anchor),
    AnchorDemoted(AnchorDemotedRecord),
    TierChanged(TierChangedRecord),
    Quarantined(QuarantinedRecord),
    Compaction(CompactionRecord),
    Receipt(Receipt),
}

impl LedgerRecord {
    pub fn kind(&self) -> JournalKind {
        match self {
            LedgerRecord::ChainOpened(_) => JournalKind::ChainOpened,
            LedgerRecord::Delta(_) => JournalKind::Delta,
            LedgerRecord::Anchor(_) => JournalKind::Anchor,
            LedgerRecord::AnchorDemoted(_) => JournalKind::AnchorDemoted,
            LedgerRecord::TierChanged(_) => JournalKind::TierChanged,
            LedgerRecord::Quarantined(_) => JournalKind::Quarantined,
            LedgerRecord::Compaction(_) => JournalKind::Compaction,
            LedgerRecord::Receipt(_) => JournalKind::Receipt,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        let bytes = match self {
            LedgerRecord::ChainOpened(r) => to_canonical_cbor(r)?,
            LedgerRecord::Delta(r) => to_canonical_cbor(r)?,
            LedgerRecord::Anchor(r) => to_canonical_cbor(r)?,
            LedgerRecord::AnchorDemoted(r) => to_canonical_cbor(r)?,
            LedgerRecord::TierChanged(r) => to_canonical_cbor(r)?,
            LedgerRecord::Quarantined(r) => to_canonical_cbor(r)?,
            LedgerRecord::Compaction(r) => to_canonical_cbor(r)?,
            LedgerRecord::Receipt(r) => to_canonical_cbor(r)?,
        };
        Ok(bytes)
    }

    pub fn decode(kind: JournalKind, payload: &[u8]) -> Result<Self, JournalError> {
        Ok(match kind {
            JournalKind::ChainOpened => LedgerRecord::ChainOpened(serde_cbor::from_slice(payload)?),
            JournalKind::Delta => LedgerRecord::Delta(serde_cbor::from_slice(payload)?),
            JournalKind::Anchor => LedgerRecord::Anchor(serde_cbor::from_slice(payload)?),
            JournalKind::AnchorDemoted => LedgerRecord::AnchorDemoted(serde_cbor::from_slice(payload)?),
            JournalKind::TierChanged => LedgerRecord::TierChanged(serde_cbor::from_slice(payload)?),
            JournalKind::Quarantined => LedgerRecord::Quarantined(serde_cbor::from_slice(payload)?),
            JournalKind::Compaction => LedgerRecord::Compaction(serde_cbor::from_slice(payload)?),
            JournalKind::Receipt => LedgerRecord::Receipt(serde_cbor::from_slice(payload)?),
        })
    }
}

/// A chain came into existence, with the anchor it starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOpenedRecord {
    pub chain_id: ChainId,
    pub holon_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_holon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chain_id: Option<ChainId>,
    pub ordinal: u64,
    pub tier: DeterminismTier,
    pub seed: Seed,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_node: Option<SeedNode>,
    /// Full derivation from the run root, for chains opened from a replay
    /// recipe without their ancestors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed_path: Vec<SeedNode>,
    pub config_hash: Hash,
    pub config: serde_json::Value,
    #[serde(with = "serde_bytes")]
    pub verifying_key: Vec<u8>,
    pub base: Anchor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorDemotedRecord {
    pub chain_id: ChainId,
    pub tick: Tick,
    pub state_snapshot: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierChangedRecord {
    pub chain_id: ChainId,
    pub from: DeterminismTier,
    pub to: DeterminismTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub chain_id: ChainId,
    pub reason: String,
}

/// Borrowed entry used when appending to the journal.
#[derive(Debug, Clone, Copy)]
pub struct JournalEntry<'a> {
    pub kind: JournalKind,
    pub payload: &'a [u8],
}

impl<'a> JournalEntry<'a> {
    pub fn new(kind: JournalKind, payload: &'a [u8]) -> Self {
        Self { kind, payload }
    }
}

/// Owned entry returned by journal readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnedJournalEntry {
    pub seq: JournalSeq,
    pub kind: JournalKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl OwnedJournalEntry {
    pub fn record(&self) -> Result<LedgerRecord, JournalError> {
        LedgerRecord::decode(self.kind, &self.payload)
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Uniform interface over journal backends.
pub trait Journal: Send {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError>;

    /// Loads entries starting at `from` (inclusive). Passing 0 returns the full log.
    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError>;

    /// Returns the next sequence that will be assigned on append.
    fn next_seq(&self) -> JournalSeq;

    fn append_record(&mut self, record: &LedgerRecord) -> Result<JournalSeq, JournalError> {
        let payload = record.encode()?;
        self.append(JournalEntry::new(record.kind(), &payload))
    }
}

#[derive(Debug, Serialize)]
struct DiskRecord<'a> {
    seq: JournalSeq,
    kind: JournalKind,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}
