//! Replay recipes: everything needed to re-run a holon from its last checkpoint,
//! and a replayer that re-executes one against an isolated ledger.

use std::collections::BTreeSet;
use std::sync::Arc;

use hol_cbor::Hash;
use hol_store::{MemStore, Store};
use serde::{Deserialize, Serialize};

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::journal::mem::MemJournal;
use crate::ledger::{
    Anchor, ChainId, Delta, LedgerResult, NewChain, SnapshotBlob, StateLedger, apply_transform,
};
use crate::policy::{DeterminismTier, EnsembleDiagnostics};
use crate::receipts::{Receipt, ReceiptCodec};
use crate::seed::{RecordedSeeds, Seed, SeedNode};
use crate::state::{Params, StateVector, TransformEngine, TransformOp};
use crate::tick::Tick;

/// The anchor a recipe starts from, with its state inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub tick: Tick,
    pub checkpoint_id: Hash,
    pub state_hash: Hash,
    pub merkle_root: Hash,
    pub head_hash: Hash,
    /// Hex of the snapshot bytes; keeps the state bit-exact through JSON.
    pub state: String,
}

impl CheckpointRef {
    fn from_anchor(anchor: &Anchor, state: &StateVector) -> Self {
        Self {
            tick: anchor.tick,
            checkpoint_id: anchor.checkpoint_id,
            state_hash: anchor.state_hash,
            merkle_root: anchor.merkle_root,
            head_hash: anchor.head_hash,
            state: hex::encode(state.to_snapshot_bytes()),
        }
    }

    pub fn state_vector(&self) -> Option<StateVector> {
        hex::decode(&self.state)
            .ok()
            .and_then(|bytes| StateVector::from_snapshot_bytes(&bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecipe {
    pub holon_id: String,
    pub chain_id: ChainId,
    #[serde(rename = "determinism_tier")]
    pub tier: DeterminismTier,
    pub root_seed: Seed,
    /// Derivations from `root_seed` down to the holon.
    pub seed_path: Vec<SeedNode>,
    pub config_hash: Hash,
    pub config: serde_json::Value,
    pub inbound_receipts: Vec<Receipt>,
    pub checkpoint: CheckpointRef,
    /// Present for statistical chains, which replay in distribution only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<EnsembleDiagnostics>,
}

impl ReplayRecipe {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Run id the holon belongs to.
    pub fn run_id(&self) -> &str {
        self.holon_id.split('/').next().unwrap_or_default()
    }

    pub fn chain_seed(&self) -> Seed {
        self.seed_path.last().map_or(self.root_seed, |node| node.derived_seed)
    }
}

impl<S: Store + 'static> StateLedger<S> {
    /// Capture what a replay of `holon_id` needs: its tier and seeds, its
    /// config, the latest live checkpoint, and every inbound receipt recorded
    /// since that checkpoint or consumed by a delta after it.
    pub fn build_recipe(&self, holon_id: &str) -> LedgerResult<ReplayRecipe> {
        let holon = self.holon(holon_id)?;
        let result = self.build_recipe_inner(holon_id, &holon.chain_id, holon.config_hash, holon.config);
        match result {
            Ok(recipe) => Ok(recipe),
            Err(err) => {
                let audit = self.audit("build_recipe", &holon.chain_id, &serde_json::json!({ "holon": holon_id }));
                Err(self.record_failure(audit, self.tier(&holon.chain_id).ok(), err))
            }
        }
    }

    fn build_recipe_inner(
        &self,
        holon_id: &str,
        chain: &ChainId,
        config_hash: Hash,
        config: serde_json::Value,
    ) -> LedgerResult<ReplayRecipe> {
        let seed_path = self.seed_path(holon_id)?;
        let run_id = holon_id.split('/').next().unwrap_or_default();
        let root_seed = self
            .root_seed(run_id)
            .ok_or_else(|| LedgerError::MissingParentSeed(run_id.to_string()))?;

        let cell = self.cell(chain)?;
        let state = cell.read();
        let entry = state
            .latest_live_anchor()
            .ok_or_else(|| LedgerError::unreachable(chain, state.head_tick, "no live checkpoint"))?;
        let anchor = entry.anchor.clone();
        let bytes = self.store().get_blob(anchor.state_snapshot)?;
        let checkpoint_state = SnapshotBlob::decode(&bytes, chain, anchor.tick)
            .map_err(|detail| LedgerError::corrupted(chain, detail))?;

        let pending = state.deltas_between(anchor.tick, state.head_tick);
        let mut seen = BTreeSet::new();
        let mut inbound_receipts = Vec::new();
        {
            let receipts = self.receipt_log();
            for delta in pending {
                for rid in &delta.parameters.inputs {
                    let receipt = receipts.get(rid).ok_or_else(|| LedgerError::IncompleteReceiptChain {
                        chain: chain.clone(),
                        tick: delta.tick,
                        rid: *rid,
                    })?;
                    if seen.insert(*rid) {
                        inbound_receipts.push(receipt.clone());
                    }
                }
            }
            // Inputs recorded since the checkpoint that no delta consumed yet.
            let unconsumed = receipts.for_chain(chain).filter(|r| {
                r.status.is_ok() && r.inbound.as_ref().is_some_and(|i| i.chain_tick >= anchor.tick)
            });
            for receipt in unconsumed {
                if seen.insert(receipt.rid) {
                    inbound_receipts.push(receipt.clone());
                }
            }
        }
        let distribution = (!state.tier.supports_anchors())
            .then(|| EnsembleDiagnostics::from_samples(pending.iter().map(|d| d.parameters.values.as_slice())));

        log::debug!(
            "recipe for {holon_id}: checkpoint {} with {} inbound receipts",
            anchor.tick,
            inbound_receipts.len()
        );
        Ok(ReplayRecipe {
            holon_id: holon_id.to_string(),
            chain_id: chain.clone(),
            tier: state.tier,
            root_seed,
            seed_path,
            config_hash,
            config,
            inbound_receipts,
            checkpoint: CheckpointRef::from_anchor(&anchor, &checkpoint_state),
            distribution,
        })
    }

    /// Open the recipe's chain starting at its checkpoint, after checking the
    /// checkpoint and seed derivation are self-consistent.
    pub(crate) fn open_replay_chain(&self, recipe: &ReplayRecipe) -> LedgerResult<()> {
        let chain = &recipe.chain_id;
        let cp = &recipe.checkpoint;
        let state = cp
            .state_vector()
            .ok_or_else(|| LedgerError::corrupted(chain, "recipe checkpoint state is malformed"))?;
        if state.state_hash() != cp.state_hash {
            return Err(LedgerError::corrupted(chain, "recipe checkpoint state does not match its hash"));
        }
        if !crate::ledger::verify_seed_path(self.root_seed(recipe.run_id()), &recipe.seed_path, &recipe.chain_seed()) {
            return Err(LedgerError::DeterminismViolation {
                chain: chain.clone(),
                reason: "recipe seed path does not derive from the recorded root".into(),
            });
        }
        let snapshot = self.store().put_blob(&SnapshotBlob::encode(chain, cp.tick, &state)?)?;
        let base = Anchor::new(chain, cp.tick, snapshot, cp.merkle_root, cp.state_hash, cp.head_hash);
        if base.checkpoint_id != cp.checkpoint_id {
            return Err(LedgerError::corrupted(chain, "recipe checkpoint id does not match its contents"));
        }
        let holon = self.open_chain(NewChain {
            holon_id: recipe.holon_id.clone(),
            parent: None,
            parent_chain_id: None,
            tier: recipe.tier,
            seed: recipe.chain_seed(),
            seed_node: recipe.seed_path.last().cloned(),
            seed_path: recipe.seed_path.clone(),
            config: recipe.config.clone(),
            base_state: state,
            base: Some(base),
        })?;
        if holon.config_hash != recipe.config_hash {
            return Err(LedgerError::corrupted(chain, "recipe config does not match its hash"));
        }
        Ok(())
    }
}

/// Re-executes a holon's activity inside a [`ReplaySession`].
pub trait ReplayDriver {
    fn drive<S: Store + 'static>(&self, session: &mut ReplaySession<'_, S>) -> LedgerResult<()>;
}

/// Replays a fixed list of transitions, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaScript {
    pub steps: Vec<(TransformOp, Params)>,
}

impl DeltaScript {
    pub fn new(steps: Vec<(TransformOp, Params)>) -> Self {
        Self { steps }
    }

    /// The transitions a chain recorded after `after_tick`.
    pub fn from_chain<S: Store + 'static>(
        ledger: &StateLedger<S>,
        chain: &ChainId,
        after_tick: Tick,
    ) -> LedgerResult<Self> {
        let (head, _) = ledger.head(chain)?;
        let mut steps = Vec::new();
        for tick in after_tick + 1..=head {
            if let Some(delta) = ledger.delta(chain, tick)? {
                steps.push((delta.transform_op, delta.parameters));
            }
        }
        Ok(Self { steps })
    }
}

impl ReplayDriver for DeltaScript {
    fn drive<S: Store + 'static>(&self, session: &mut ReplaySession<'_, S>) -> LedgerResult<()> {
        for (op, params) in &self.steps {
            session.append(op.clone(), params.clone())?;
        }
        Ok(())
    }
}

/// A replay in progress. Appends continue from the recipe's checkpoint; an
/// append that the chain already holds is skipped, not repeated.
pub struct ReplaySession<'a, S: Store + 'static> {
    ledger: &'a StateLedger<S>,
    recipe: &'a ReplayRecipe,
    cursor_tick: Tick,
    cursor_hash: Hash,
    state: StateVector,
    deltas: Vec<Delta>,
    duplicates: usize,
}

impl<'a, S: Store + 'static> ReplaySession<'a, S> {
    pub fn chain_id(&self) -> &ChainId {
        &self.recipe.chain_id
    }

    pub fn inbound(&self) -> &[Receipt] {
        &self.recipe.inbound_receipts
    }

    /// State after the last replayed transition.
    pub fn state(&self) -> &StateVector {
        &self.state
    }

    pub fn tick(&self) -> Tick {
        self.cursor_tick
    }

    pub fn append(&mut self, op: TransformOp, params: Params) -> LedgerResult<Delta> {
        let (delta, duplicate) = self.ledger.append_delta_outcome(
            &self.recipe.chain_id,
            self.cursor_hash,
            op,
            params,
            true,
        )?;
        if duplicate {
            self.duplicates += 1;
        }
        self.state = apply_transform(
            self.ledger.engine().as_ref(),
            &self.state,
            &delta.transform_op,
            &delta.parameters,
        )?;
        self.cursor_tick = delta.tick;
        self.cursor_hash = delta.compute_hash()?;
        self.deltas.push(delta.clone());
        Ok(delta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub chain_id: ChainId,
    pub head_tick: Tick,
    pub head_hash: Hash,
    pub final_state_hash: Hash,
    pub delta_hashes: Vec<Hash>,
    /// Dedupe keys of the append receipts, in replay order.
    pub dedupe_keys: Vec<Hash>,
    pub canonical_hashes: Vec<Hash>,
    /// Appends the target chain already held.
    pub duplicates_skipped: usize,
    /// Inbound receipts the target ledger already held.
    pub receipts_already_present: usize,
}

pub struct Replayer {
    engine: Arc<dyn TransformEngine>,
    config: LedgerConfig,
}

impl Replayer {
    pub fn new(engine: Arc<dyn TransformEngine>, config: LedgerConfig) -> Self {
        Self { engine, config }
    }

    /// Replay against a fresh in-memory ledger seeded only from the recipe.
    pub fn replay<D: ReplayDriver>(&self, recipe: &ReplayRecipe, driver: &D) -> LedgerResult<ReplayReport> {
        let seeds = RecordedSeeds::with(recipe.run_id(), recipe.root_seed);
        let ledger = StateLedger::open_with_config(
            Arc::new(MemStore::new()),
            Box::new(MemJournal::new()),
            self.engine.clone(),
            Arc::new(seeds),
            self.config.clone(),
        )?;
        self.replay_into(&ledger, recipe, driver)
    }

    /// Replay into an existing ledger. Anything the ledger already holds is
    /// deduplicated, so replaying into the ledger that produced the recipe
    /// changes nothing.
    pub fn replay_into<S: Store + 'static, D: ReplayDriver>(
        &self,
        ledger: &StateLedger<S>,
        recipe: &ReplayRecipe,
        driver: &D,
    ) -> LedgerResult<ReplayReport> {
        let chain = &recipe.chain_id;
        if ledger.contains_chain(chain) {
            let at_checkpoint = ledger.delta(chain, recipe.checkpoint.tick)?.map(|d| d.compute_hash()).transpose()?;
            let anchored = ledger
                .anchors(chain)?
                .into_iter()
                .any(|info| info.anchor.checkpoint_id == recipe.checkpoint.checkpoint_id);
            if !anchored && at_checkpoint != Some(recipe.checkpoint.head_hash) {
                return Err(LedgerError::corrupted(
                    chain,
                    format!("chain does not pass through checkpoint {}", recipe.checkpoint.tick),
                ));
            }
        } else {
            ledger.open_replay_chain(recipe)?;
        }

        let mut receipts_already_present = 0;
        for receipt in &recipe.inbound_receipts {
            if ledger.import_receipt(receipt)?.is_duplicate() {
                receipts_already_present += 1;
            }
        }

        let state = recipe
            .checkpoint
            .state_vector()
            .ok_or_else(|| LedgerError::corrupted(chain, "recipe checkpoint state is malformed"))?;
        let mut session = ReplaySession {
            ledger,
            recipe,
            cursor_tick: recipe.checkpoint.tick,
            cursor_hash: recipe.checkpoint.head_hash,
            state,
            deltas: Vec::new(),
            duplicates: 0,
        };
        driver.drive(&mut session)?;

        let tenant = &ledger.config().tenant;
        let mut delta_hashes = Vec::with_capacity(session.deltas.len());
        let mut dedupe_keys = Vec::with_capacity(session.deltas.len());
        let mut canonical_hashes = Vec::with_capacity(session.deltas.len());
        {
            let receipts = ledger.receipt_log();
            for delta in &session.deltas {
                delta_hashes.push(delta.compute_hash()?);
                let key = ReceiptCodec::dedupe_key(tenant, chain.as_str(), delta.tick, "append_delta");
                if let Some(receipt) = receipts.by_dedupe_key(&key) {
                    canonical_hashes.push(receipt.canonical_hash);
                }
                dedupe_keys.push(key);
            }
        }
        log::info!(
            "replayed {} onto {chain}: {} deltas, {} already present",
            recipe.holon_id,
            session.deltas.len(),
            session.duplicates
        );
        Ok(ReplayReport {
            chain_id: chain.clone(),
            head_tick: session.cursor_tick,
            head_hash: session.cursor_hash,
            final_state_hash: session.state.state_hash(),
            delta_hashes,
            dedupe_keys,
            canonical_hashes,
            duplicates_skipped: session.duplicates,
            receipts_already_present,
        })
    }
}
