use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hol_cbor::Hash;

use super::{Anchor, ChainId, Delta};
use crate::compaction::CompactionRecord;
use crate::error::LedgerError;
use crate::policy::DeterminismTier;
use crate::seed::Seed;
use crate::signing::ChainSigner;
use crate::state::StateVector;
use crate::tick::{Tick, TickAllocator};

#[derive(Debug, Clone)]
pub(crate) struct AnchorEntry {
    pub anchor: Anchor,
    /// False once the snapshot blob has been demoted.
    pub live: bool,
    /// Logical clock value when the snapshot was (re)written.
    pub created_at: u64,
}

/// Everything the ledger knows about one chain. Guarded by the cell's `RwLock`.
#[derive(Debug)]
pub(crate) struct ChainState {
    pub chain_id: ChainId,
    pub holon_id: String,
    pub tier: DeterminismTier,
    pub seed: Seed,
    /// The seed traces back to a recorded root through a verified derivation.
    pub seed_recorded: bool,
    pub signer: ChainSigner,
    pub verifying_key: [u8; 32],
    pub config_hash: Hash,
    pub base_tick: Tick,
    /// Deltas `base_tick + 1 ..= head_tick`, in tick order.
    pub deltas: Vec<Delta>,
    pub delta_hashes: Vec<Hash>,
    pub anchors: BTreeMap<Tick, AnchorEntry>,
    pub head_tick: Tick,
    pub head_hash: Hash,
    pub head_state: StateVector,
    pub quarantined: Option<String>,
    pub annotations: Vec<(Tick, String)>,
    pub compactions: Vec<CompactionRecord>,
    pub last_compaction_at: u64,
}

impl ChainState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: ChainId,
        holon_id: String,
        tier: DeterminismTier,
        seed: Seed,
        config_hash: Hash,
        base: Anchor,
        base_state: StateVector,
        now: u64,
    ) -> Self {
        let signer = ChainSigner::from_seed(&seed);
        let verifying_key = signer.verifying_key_bytes();
        let mut anchors = BTreeMap::new();
        let base_tick = base.tick;
        let head_hash = base.head_hash;
        anchors.insert(
            base_tick,
            AnchorEntry {
                anchor: base,
                live: true,
                created_at: now,
            },
        );
        Self {
            chain_id,
            holon_id,
            tier,
            seed,
            seed_recorded: true,
            signer,
            verifying_key,
            config_hash,
            base_tick,
            deltas: Vec::new(),
            delta_hashes: Vec::new(),
            anchors,
            head_tick: base_tick,
            head_hash,
            head_state: base_state,
            quarantined: None,
            annotations: Vec::new(),
            compactions: Vec::new(),
            last_compaction_at: now,
        }
    }

    pub fn ensure_writable(&self) -> Result<(), LedgerError> {
        match &self.quarantined {
            Some(reason) => Err(LedgerError::ChainQuarantined {
                chain: self.chain_id.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn index_of(&self, tick: Tick) -> Option<usize> {
        if tick <= self.base_tick || tick > self.head_tick {
            return None;
        }
        Some((tick - self.base_tick - 1) as usize)
    }

    /// Tick whose head hash is `hash`, searching back from the head.
    pub fn tick_of_hash(&self, hash: &Hash) -> Option<Tick> {
        if let Some(i) = self.delta_hashes.iter().rposition(|h| h == hash) {
            return Some(self.base_tick + 1 + i as Tick);
        }
        (self.hash_at(self.base_tick).as_ref() == Some(hash)).then_some(self.base_tick)
    }

    pub fn delta_at(&self, tick: Tick) -> Option<&Delta> {
        self.index_of(tick).and_then(|i| self.deltas.get(i))
    }

    /// Head hash as of `tick`.
    pub fn hash_at(&self, tick: Tick) -> Option<Hash> {
        if tick == self.base_tick {
            return self.anchors.get(&self.base_tick).map(|e| e.anchor.head_hash);
        }
        self.index_of(tick).and_then(|i| self.delta_hashes.get(i).copied())
    }

    /// Deltas in `(from, to]`.
    pub fn deltas_between(&self, from: Tick, to: Tick) -> &[Delta] {
        let start = (from.max(self.base_tick) - self.base_tick) as usize;
        let end = (to.min(self.head_tick).saturating_sub(self.base_tick)) as usize;
        if start >= end {
            return &[];
        }
        &self.deltas[start..end]
    }

    pub fn hashes_between(&self, from: Tick, to: Tick) -> &[Hash] {
        let start = (from.max(self.base_tick) - self.base_tick) as usize;
        let end = (to.min(self.head_tick).saturating_sub(self.base_tick)) as usize;
        if start >= end {
            return &[];
        }
        &self.delta_hashes[start..end]
    }

    /// Most recent anchor record, live or demoted.
    pub fn last_anchor_tick(&self) -> Tick {
        self.anchors.keys().next_back().copied().unwrap_or(self.base_tick)
    }

    /// Anchor record strictly before `tick`; the start of that anchor's Merkle segment.
    pub fn previous_anchor_tick(&self, tick: Tick) -> Tick {
        self.anchors
            .range(..tick)
            .next_back()
            .map(|(t, _)| *t)
            .unwrap_or(self.base_tick)
    }

    pub fn deltas_since_anchor(&self) -> u64 {
        self.head_tick - self.last_anchor_tick()
    }

    pub fn nearest_live_anchor(&self, tick: Tick) -> Option<&AnchorEntry> {
        self.anchors.range(..=tick).rev().map(|(_, e)| e).find(|e| e.live)
    }

    pub fn live_anchor_ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        self.anchors.iter().filter(|(_, e)| e.live).map(|(t, _)| *t)
    }

    pub fn latest_live_anchor(&self) -> Option<&AnchorEntry> {
        self.anchors.values().rev().find(|e| e.live)
    }

    /// Anchor records in `(from, to]`.
    pub fn anchors_between(&self, from: Tick, to: Tick) -> Vec<Anchor> {
        if from >= to {
            return Vec::new();
        }
        self.anchors
            .range(from + 1..=to)
            .map(|(_, e)| e.anchor.clone())
            .collect()
    }

    pub fn apply_delta(&mut self, delta: Delta, hash: Hash, new_state: StateVector) {
        self.head_tick = delta.tick;
        self.head_hash = hash;
        self.head_state = new_state;
        self.deltas.push(delta);
        self.delta_hashes.push(hash);
    }

    pub fn apply_anchor(&mut self, anchor: Anchor, now: u64) {
        self.anchors.insert(
            anchor.tick,
            AnchorEntry {
                anchor,
                live: true,
                created_at: now,
            },
        );
    }

    pub fn apply_demoted(&mut self, tick: Tick) {
        if let Some(entry) = self.anchors.get_mut(&tick) {
            entry.live = false;
        }
    }

    /// Recompute hashes and parent links over `(from, to]`.
    pub fn verify_links(&self, from: Tick, to: Tick) -> Result<(), String> {
        let mut prev = self
            .hash_at(from)
            .ok_or_else(|| format!("no head hash at tick {from}"))?;
        for (delta, stored) in self.deltas_between(from, to).iter().zip(self.hashes_between(from, to)) {
            if delta.parent_hash != prev {
                return Err(format!("delta {} does not link to its predecessor", delta.tick));
            }
            let actual = delta
                .compute_hash()
                .map_err(|e| format!("delta {} encode: {e}", delta.tick))?;
            if actual != *stored {
                return Err(format!("delta {} hash mismatch", delta.tick));
            }
            prev = actual;
        }
        Ok(())
    }
}

/// Trailing-window read counters, kept outside the state lock so readers can
/// update them under a shared lock.
#[derive(Debug, Default)]
pub(crate) struct ReadStats {
    chain_reads: VecDeque<u64>,
    anchor_reads: BTreeMap<Tick, VecDeque<u64>>,
}

impl ReadStats {
    pub fn record(&mut self, now: u64, anchor_tick: Tick, window: u64) {
        self.chain_reads.push_back(now);
        self.anchor_reads.entry(anchor_tick).or_default().push_back(now);
        self.prune(now, window);
    }

    pub fn prune(&mut self, now: u64, window: u64) {
        let floor = now.saturating_sub(window);
        trim(&mut self.chain_reads, floor);
        self.anchor_reads.retain(|_, reads| {
            trim(reads, floor);
            !reads.is_empty()
        });
    }

    pub fn chain_reads(&self) -> u32 {
        self.chain_reads.len() as u32
    }

    pub fn anchor_reads(&self, tick: Tick) -> u32 {
        self.anchor_reads.get(&tick).map(|r| r.len() as u32).unwrap_or(0)
    }
}

fn trim(reads: &mut VecDeque<u64>, floor: u64) {
    while reads.front().is_some_and(|ts| *ts < floor) {
        reads.pop_front();
    }
}

#[derive(Debug)]
pub(crate) struct ChainCell {
    /// Creation order; multi-chain operations lock in ascending ordinal.
    pub ordinal: u64,
    pub allocator: TickAllocator,
    state: RwLock<ChainState>,
    reads: Mutex<ReadStats>,
}

impl ChainCell {
    pub fn new(ordinal: u64, state: ChainState) -> Self {
        Self {
            ordinal,
            allocator: TickAllocator::new(state.head_tick + 1),
            state: RwLock::new(state),
            reads: Mutex::new(ReadStats::default()),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reads(&self) -> MutexGuard<'_, ReadStats> {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
