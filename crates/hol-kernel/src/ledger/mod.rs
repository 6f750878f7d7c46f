//! The anchor+delta state ledger.
//!
//! A chain is an append-only sequence of signed [`Delta`]s punctuated by
//! [`Anchor`]s (materialized snapshots). Every mutation is journaled first and
//! then applied in memory; [`StateLedger::open`] rebuilds the in-memory view by
//! replaying the journal.

mod append;
mod audit;
mod chain;
mod holon;
mod promotion;
mod recovery;
mod replay;
mod tiers;

pub use audit::Bundled;
pub use holon::{GateMessage, HolonRecord, HolonSpec, InboundInput};
pub(crate) use holon::{NewChain, verify_seed_path};
pub use promotion::{AnchorPolicy, AnchorStats, ChainStats, ThresholdPolicy};
pub use replay::{MaterializeOptions, ReconstructOptions};
pub use tiers::TierChange;

pub(crate) use chain::{ChainCell, ChainState};
pub(crate) use replay::{ReplayFailure, ReplayPlan, apply_transform};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use hol_cbor::{Hash, to_canonical_cbor};
use hol_store::Store;
use serde::{Deserialize, Serialize};

use crate::compaction::CompactionRecord;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::journal::{Journal, LedgerRecord, OwnedJournalEntry};
use crate::policy::{DeterminismPolicy, DeterminismTier};
use crate::receipts::{Receipt, ReceiptCodec, ReceiptLog};
use crate::seed::{Seed, SeedSource};
use crate::signing;
use crate::state::{Params, StateVector, TransformEngine, TransformOp};
use crate::tick::{LogicalClock, Tick, TickSource};

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Chain identifier. Holon chains use the holon id (`run/holon:name`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One deterministic state transition. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub chain_id: ChainId,
    pub tick: Tick,
    pub parent_hash: Hash,
    pub transform_op: TransformOp,
    pub parameters: Params,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct DeltaBody<'a> {
    chain_id: &'a ChainId,
    tick: Tick,
    parent_hash: &'a Hash,
    transform_op: &'a TransformOp,
    parameters: &'a Params,
}

impl Delta {
    /// Content hash over every field except the signature.
    pub fn compute_hash(&self) -> Result<Hash, serde_cbor::Error> {
        Self::hash_parts(&self.chain_id, self.tick, &self.parent_hash, &self.transform_op, &self.parameters)
    }

    pub(crate) fn hash_parts(
        chain_id: &ChainId,
        tick: Tick,
        parent_hash: &Hash,
        transform_op: &TransformOp,
        parameters: &Params,
    ) -> Result<Hash, serde_cbor::Error> {
        Hash::of_cbor(&DeltaBody {
            chain_id,
            tick,
            parent_hash,
            transform_op,
            parameters,
        })
    }

    pub fn verify_signature(&self, verifying_key: &[u8; 32], hash: &Hash) -> Result<(), String> {
        signing::verify_signature(verifying_key, hash, &self.signature)
    }

    /// Same transition, ignoring tick and signature.
    pub(crate) fn same_transition(&self, op: &TransformOp, params: &Params) -> bool {
        &self.transform_op == op && &self.parameters == params
    }
}

/// Materialized snapshot of a chain at `tick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub chain_id: ChainId,
    pub tick: Tick,
    /// Content address of the snapshot blob.
    pub state_snapshot: Hash,
    /// Merkle root over the delta hashes since the previous anchor.
    pub merkle_root: Hash,
    pub checkpoint_id: Hash,
    pub state_hash: Hash,
    /// Chain head hash at `tick`; the parent of the next delta.
    pub head_hash: Hash,
}

impl Anchor {
    pub(crate) fn new(
        chain_id: &ChainId,
        tick: Tick,
        state_snapshot: Hash,
        merkle_root: Hash,
        state_hash: Hash,
        head_hash: Hash,
    ) -> Self {
        Self {
            chain_id: chain_id.clone(),
            tick,
            state_snapshot,
            merkle_root,
            checkpoint_id: checkpoint_id(chain_id, tick, &state_hash, &merkle_root),
            state_hash,
            head_hash,
        }
    }
}

pub fn checkpoint_id(chain_id: &ChainId, tick: Tick, state_hash: &Hash, merkle_root: &Hash) -> Hash {
    Hash::of_parts(&[
        b"hol/checkpoint",
        chain_id.as_str().as_bytes(),
        &tick.to_le_bytes(),
        state_hash.as_bytes(),
        merkle_root.as_bytes(),
    ])
}

pub fn genesis_hash(chain_id: &ChainId, seed: &Seed, config_hash: &Hash, state_hash: &Hash) -> Result<Hash, serde_cbor::Error> {
    #[derive(Serialize)]
    struct Genesis<'a> {
        chain: &'a ChainId,
        seed: &'a Seed,
        config_hash: &'a Hash,
        state_hash: &'a Hash,
    }
    Hash::of_cbor(&Genesis {
        chain: chain_id,
        seed,
        config_hash,
        state_hash,
    })
}

/// Snapshot blob layout. Chain and tick are part of the content so two anchors
/// never share a blob, which keeps demotion local to one anchor.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotBlob {
    pub chain_id: ChainId,
    pub tick: Tick,
    #[serde(with = "serde_bytes")]
    pub state: Vec<u8>,
}

impl SnapshotBlob {
    pub(crate) fn encode(chain_id: &ChainId, tick: Tick, state: &StateVector) -> Result<Vec<u8>, serde_cbor::Error> {
        to_canonical_cbor(&SnapshotBlob {
            chain_id: chain_id.clone(),
            tick,
            state: state.to_snapshot_bytes(),
        })
    }

    pub(crate) fn decode(bytes: &[u8], chain_id: &ChainId, tick: Tick) -> Result<StateVector, String> {
        let blob: SnapshotBlob = serde_cbor::from_slice(bytes).map_err(|e| format!("snapshot decode: {e}"))?;
        if &blob.chain_id != chain_id || blob.tick != tick {
            return Err(format!(
                "snapshot belongs to {}@{}, expected {chain_id}@{tick}",
                blob.chain_id, blob.tick
            ));
        }
        StateVector::from_snapshot_bytes(&blob.state).ok_or_else(|| "ragged snapshot payload".to_string())
    }
}

/// Read-only view of an anchor and whether its snapshot blob is still present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorInfo {
    pub anchor: Anchor,
    pub live: bool,
}

pub struct StateLedger<S: Store> {
    store: Arc<S>,
    journal: Mutex<Box<dyn Journal>>,
    engine: Arc<dyn TransformEngine>,
    policy: DeterminismPolicy,
    anchor_policy: Box<dyn AnchorPolicy>,
    config: LedgerConfig,
    codec: ReceiptCodec,
    clock: LogicalClock,
    seeds: Arc<dyn SeedSource>,
    chains: RwLock<BTreeMap<ChainId, Arc<ChainCell>>>,
    holons: RwLock<BTreeMap<String, HolonRecord>>,
    receipts: Mutex<ReceiptLog>,
    next_ordinal: AtomicU64,
}

impl<S: Store + 'static> fmt::Debug for StateLedger<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLedger")
            .field("chains", &self.chain_ids())
            .field("clock", &self.clock.now())
            .finish()
    }
}

impl<S: Store + 'static> StateLedger<S> {
    pub fn open(
        store: Arc<S>,
        journal: Box<dyn Journal>,
        engine: Arc<dyn TransformEngine>,
        seeds: Arc<dyn SeedSource>,
    ) -> LedgerResult<Self> {
        Self::open_with_config(store, journal, engine, seeds, LedgerConfig::default())
    }

    pub fn open_with_config(
        store: Arc<S>,
        journal: Box<dyn Journal>,
        engine: Arc<dyn TransformEngine>,
        seeds: Arc<dyn SeedSource>,
        config: LedgerConfig,
    ) -> LedgerResult<Self> {
        let ledger = Self {
            store,
            journal: Mutex::new(journal),
            engine,
            policy: DeterminismPolicy::with_ulp_budget(config.ulp_budget),
            anchor_policy: Box::new(ThresholdPolicy::from_config(&config)),
            codec: ReceiptCodec::from_config(&config),
            config,
            clock: LogicalClock::new(),
            seeds,
            chains: RwLock::new(BTreeMap::new()),
            holons: RwLock::new(BTreeMap::new()),
            receipts: Mutex::new(ReceiptLog::new()),
            next_ordinal: AtomicU64::new(0),
        };
        ledger.recover()?;
        Ok(ledger)
    }

    pub fn with_anchor_policy(mut self, policy: Box<dyn AnchorPolicy>) -> Self {
        self.anchor_policy = policy;
        self
    }

    pub fn with_determinism_policy(mut self, policy: DeterminismPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn TransformEngine> {
        &self.engine
    }

    pub fn codec(&self) -> &ReceiptCodec {
        &self.codec
    }

    pub fn policy(&self) -> &DeterminismPolicy {
        &self.policy
    }

    /// Current value of the ledger's logical clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn contains_chain(&self, chain: &ChainId) -> bool {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(chain)
    }

    /// `(tick, hash)` of the chain head.
    pub fn head(&self, chain: &ChainId) -> LedgerResult<(Tick, Hash)> {
        let cell = self.cell(chain)?;
        let state = cell.read();
        Ok((state.head_tick, state.head_hash))
    }

    /// In-memory working state at the head, as maintained by appends.
    pub fn head_state(&self, chain: &ChainId) -> LedgerResult<StateVector> {
        Ok(self.cell(chain)?.read().head_state.clone())
    }

    pub fn tier(&self, chain: &ChainId) -> LedgerResult<DeterminismTier> {
        Ok(self.cell(chain)?.read().tier)
    }

    pub fn quarantine_reason(&self, chain: &ChainId) -> LedgerResult<Option<String>> {
        Ok(self.cell(chain)?.read().quarantined.clone())
    }

    pub fn is_quarantined(&self, chain: &ChainId) -> LedgerResult<bool> {
        Ok(self.quarantine_reason(chain)?.is_some())
    }

    pub fn delta(&self, chain: &ChainId, tick: Tick) -> LedgerResult<Option<Delta>> {
        Ok(self.cell(chain)?.read().delta_at(tick).cloned())
    }

    pub fn delta_count(&self, chain: &ChainId) -> LedgerResult<usize> {
        Ok(self.cell(chain)?.read().deltas.len())
    }

    /// Every anchor record, live or demoted, in tick order.
    pub fn anchors(&self, chain: &ChainId) -> LedgerResult<Vec<AnchorInfo>> {
        let cell = self.cell(chain)?;
        let state = cell.read();
        Ok(state
            .anchors
            .values()
            .map(|entry| AnchorInfo {
                anchor: entry.anchor.clone(),
                live: entry.live,
            })
            .collect())
    }

    pub fn live_anchor_ticks(&self, chain: &ChainId) -> LedgerResult<Vec<Tick>> {
        let cell = self.cell(chain)?;
        let state = cell.read();
        Ok(state.live_anchor_ticks().collect())
    }

    /// Policy notes attached to operations that weakened a chain's guarantee.
    pub fn annotations(&self, chain: &ChainId) -> LedgerResult<Vec<(Tick, String)>> {
        Ok(self.cell(chain)?.read().annotations.clone())
    }

    pub fn compactions(&self, chain: &ChainId) -> LedgerResult<Vec<CompactionRecord>> {
        Ok(self.cell(chain)?.read().compactions.clone())
    }

    pub fn receipt(&self, rid: &Hash) -> Option<Receipt> {
        self.receipt_log().get(rid).cloned()
    }

    pub fn receipts_for(&self, chain: &ChainId) -> Vec<Receipt> {
        self.receipt_log().for_chain(chain).cloned().collect()
    }

    pub fn receipt_count(&self) -> usize {
        self.receipt_log().len()
    }

    /// Every journal entry written so far, for restoring into a fresh ledger.
    pub fn dump_journal(&self) -> LedgerResult<Vec<OwnedJournalEntry>> {
        let journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(journal.load_from(0)?)
    }

    pub(crate) fn root_seed(&self, run_id: &str) -> Option<Seed> {
        self.seeds.root_seed(run_id)
    }

    pub(crate) fn receipt_log(&self) -> MutexGuard<'_, ReceiptLog> {
        self.receipts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cell(&self, chain: &ChainId) -> LedgerResult<Arc<ChainCell>> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownChain(chain.clone()))
    }

    pub(crate) fn journal_record(&self, record: &LedgerRecord) -> LedgerResult<()> {
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        journal.append_record(record)?;
        Ok(())
    }

    /// Mark a chain read-only after a hash mismatch. Idempotent.
    pub(crate) fn quarantine_locked(&self, state: &mut ChainState, reason: &str) {
        if state.quarantined.is_some() {
            return;
        }
        log::warn!("quarantining chain {}: {reason}", state.chain_id);
        let record = LedgerRecord::Quarantined(crate::journal::QuarantinedRecord {
            chain_id: state.chain_id.clone(),
            reason: reason.to_string(),
        });
        if let Err(err) = self.journal_record(&record) {
            log::warn!("failed to journal quarantine of {}: {err}", state.chain_id);
        }
        state.quarantined = Some(reason.to_string());
    }

    pub(crate) fn allocate_ordinal(&self) -> u64 {
        self.next_ordinal.fetch_add(1, Ordering::SeqCst)
    }

    /// Acquire several chain cells in creation order. Callers take the write
    /// locks in the returned order.
    pub(crate) fn cells_in_lock_order(&self, chains: &[ChainId]) -> LedgerResult<Vec<Arc<ChainCell>>> {
        let mut cells = Vec::with_capacity(chains.len());
        for chain in chains {
            cells.push(self.cell(chain)?);
        }
        cells.sort_by_key(|cell| cell.ordinal);
        cells.dedup_by_key(|cell| cell.ordinal);
        Ok(cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_hash_ignores_signature() {
        let mut delta = Delta {
            chain_id: ChainId::new("run-1/holon:a"),
            tick: 1,
            parent_hash: Hash::ZERO,
            transform_op: TransformOp::pure("translate"),
            parameters: Params::new(vec![0.5]),
            signature: vec![1, 2, 3],
        };
        let before = delta.compute_hash().unwrap();
        delta.signature = vec![9; 64];
        assert_eq!(before, delta.compute_hash().unwrap());
        delta.parameters = Params::new(vec![0.25]);
        assert_ne!(before, delta.compute_hash().unwrap());
    }

    #[test]
    fn snapshot_blob_is_bound_to_chain_and_tick() {
        let chain = ChainId::new("run-1/holon:a");
        let state = StateVector::new(vec![0.1, 0.2]);
        let bytes = SnapshotBlob::encode(&chain, 7, &state).unwrap();
        assert_eq!(SnapshotBlob::decode(&bytes, &chain, 7).unwrap(), state);
        assert!(SnapshotBlob::decode(&bytes, &chain, 8).is_err());
        assert_ne!(bytes, SnapshotBlob::encode(&chain, 8, &state).unwrap());
    }
}
