use super::*;

use hol_store::StoreError;

use crate::merkle::merkle_root;
use crate::policy::Operation;
use crate::state::EngineError;
use crate::tick::CancelToken;

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    /// Fatal `CorruptedHistory` if the replayed state hash differs.
    pub expected_state: Option<Hash>,
    /// Fatal `CorruptedHistory` if the computed Merkle root differs.
    pub expected_root: Option<Hash>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconstructOptions {
    pub cancel: Option<CancelToken>,
}

#[derive(Debug)]
pub(crate) enum ReplayFailure {
    Corrupt(String),
    MissingSnapshot(Tick),
    Cancelled,
    Store(StoreError),
}

/// Everything a replay needs, cloned out of the chain so it can run without
/// holding the chain lock.
#[derive(Debug, Clone)]
pub(crate) struct ReplayPlan {
    pub chain_id: ChainId,
    pub start: Anchor,
    pub deltas: Vec<Delta>,
    pub hashes: Vec<Hash>,
    /// Anchor records after `start`, verified as the replay passes them.
    pub checkpoints: Vec<Anchor>,
    pub verifying_key: [u8; 32],
}

impl ReplayPlan {
    pub fn build(state: &ChainState, start: &Anchor, target: Tick) -> Self {
        Self {
            chain_id: state.chain_id.clone(),
            start: start.clone(),
            deltas: state.deltas_between(start.tick, target).to_vec(),
            hashes: state.hashes_between(start.tick, target).to_vec(),
            checkpoints: state.anchors_between(start.tick, target),
            verifying_key: state.verifying_key,
        }
    }

    pub fn run<S: Store + ?Sized>(
        &self,
        store: &S,
        engine: &dyn TransformEngine,
        cancel: Option<&CancelToken>,
        mut visit: impl FnMut(Tick, &StateVector),
    ) -> Result<StateVector, ReplayFailure> {
        let bytes = match store.get_blob(self.start.state_snapshot) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound { .. }) => return Err(ReplayFailure::MissingSnapshot(self.start.tick)),
            Err(err) if err.is_corruption() => {
                return Err(ReplayFailure::Corrupt(format!(
                    "snapshot of anchor {}: {err}",
                    self.start.tick
                )));
            }
            Err(err) => return Err(ReplayFailure::Store(err)),
        };
        let mut state =
            SnapshotBlob::decode(&bytes, &self.chain_id, self.start.tick).map_err(ReplayFailure::Corrupt)?;
        if state.state_hash() != self.start.state_hash {
            return Err(ReplayFailure::Corrupt(format!(
                "anchor {} snapshot does not match its state hash",
                self.start.tick
            )));
        }
        visit(self.start.tick, &state);

        let mut prev = self.start.head_hash;
        let mut segment: Vec<Hash> = Vec::new();
        let mut checkpoints = self.checkpoints.iter().peekable();
        for (delta, stored) in self.deltas.iter().zip(&self.hashes) {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(ReplayFailure::Cancelled);
            }
            if delta.parent_hash != prev {
                return Err(ReplayFailure::Corrupt(format!(
                    "delta {} does not link to {}",
                    delta.tick,
                    prev.short()
                )));
            }
            let actual = delta
                .compute_hash()
                .map_err(|e| ReplayFailure::Corrupt(format!("delta {} encode: {e}", delta.tick)))?;
            if actual != *stored {
                return Err(ReplayFailure::Corrupt(format!("delta {} hash mismatch", delta.tick)));
            }
            delta
                .verify_signature(&self.verifying_key, &actual)
                .map_err(|e| ReplayFailure::Corrupt(format!("delta {}: {e}", delta.tick)))?;
            state = apply_transform(engine, &state, &delta.transform_op, &delta.parameters)
                .map_err(|e| ReplayFailure::Corrupt(format!("replaying delta {} failed: {e}", delta.tick)))?;
            segment.push(actual);
            prev = actual;
            visit(delta.tick, &state);

            if let Some(checkpoint) = checkpoints.next_if(|a| a.tick == delta.tick) {
                if checkpoint.state_hash != state.state_hash() {
                    return Err(ReplayFailure::Corrupt(format!(
                        "state at anchor {} diverges from its recorded hash",
                        checkpoint.tick
                    )));
                }
                if checkpoint.merkle_root != merkle_root(&segment) || checkpoint.head_hash != actual {
                    return Err(ReplayFailure::Corrupt(format!(
                        "anchor {} merkle root does not cover the replayed deltas",
                        checkpoint.tick
                    )));
                }
                segment.clear();
            }
        }
        Ok(state)
    }
}

/// Apply one recorded transition. Gate deliveries are the identity.
pub(crate) fn apply_transform(
    engine: &dyn TransformEngine,
    state: &StateVector,
    op: &TransformOp,
    params: &Params,
) -> Result<StateVector, EngineError> {
    if op.is_gate_receive() {
        return Ok(state.clone());
    }
    engine.apply(state, op, params)
}

impl<S: Store + 'static> StateLedger<S> {
    pub fn materialize(&self, chain: &ChainId) -> LedgerResult<Anchor> {
        self.materialize_with(chain, MaterializeOptions::default())
    }

    pub fn materialize_with(&self, chain: &ChainId, options: MaterializeOptions) -> LedgerResult<Anchor> {
        let audit = self.audit(
            "materialize",
            chain,
            &serde_json::json!({
                "expected_state": options.expected_state,
                "expected_root": options.expected_root,
            }),
        );
        let cell = match self.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(self.record_failure(audit, None, err)),
        };
        let mut state = cell.write();
        let tier = state.tier;
        let result = self.materialize_locked(&mut state, &options);
        self.finish(audit, Some(tier), result)
    }

    /// Replay to the head and persist an anchor. The caller holds the chain's
    /// write lock for the whole call, so nothing is visible until the commit.
    pub(crate) fn materialize_locked(&self, state: &mut ChainState, options: &MaterializeOptions) -> LedgerResult<Anchor> {
        state.ensure_writable()?;
        self.enforce(state, Operation::Materialize, 0, true)?;
        let chain = state.chain_id.clone();
        let target = state.head_tick;

        if let Some(entry) = state.anchors.get(&target).filter(|e| e.live) {
            let anchor = entry.anchor.clone();
            self.check_expectations(state, &anchor.state_hash, &anchor.merkle_root, options)?;
            return Ok(anchor);
        }

        let start = state
            .nearest_live_anchor(target)
            .map(|entry| entry.anchor.clone())
            .ok_or_else(|| LedgerError::unreachable(&chain, target, "no live anchor to replay from"))?;
        let plan = ReplayPlan::build(state, &start, target);
        log::debug!(
            "materializing {chain}@{target} from anchor {} ({} deltas)",
            start.tick,
            plan.deltas.len()
        );
        let replayed = match plan.run(self.store.as_ref(), self.engine.as_ref(), options.cancel.as_ref(), |_, _| {}) {
            Ok(replayed) => replayed,
            Err(failure) => return Err(self.replay_failed(state, target, failure)),
        };

        let state_hash = replayed.state_hash();
        if state_hash != state.head_state.state_hash() {
            let detail = format!("replay diverged from the working state at tick {target}");
            self.quarantine_locked(state, &detail);
            return Err(LedgerError::corrupted(&chain, detail));
        }
        let root = merkle_root(state.hashes_between(state.previous_anchor_tick(target), target));
        if let Some(prior) = state.anchors.get(&target) {
            if prior.anchor.state_hash != state_hash || prior.anchor.merkle_root != root {
                let detail = format!("re-materialized anchor {target} differs from its record");
                self.quarantine_locked(state, &detail);
                return Err(LedgerError::corrupted(&chain, detail));
            }
        }
        self.check_expectations(state, &state_hash, &root, options)?;
        if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(LedgerError::Cancelled(chain));
        }

        let blob = SnapshotBlob::encode(&chain, target, &replayed)?;
        let snapshot = self.store.put_blob(&blob)?;
        let anchor = Anchor::new(&chain, target, snapshot, root, state_hash, state.head_hash);
        self.journal_record(&LedgerRecord::Anchor(anchor.clone()))?;
        state.apply_anchor(anchor.clone(), self.clock.now());
        log::info!(
            "anchored {chain} at tick {target} (checkpoint {})",
            anchor.checkpoint_id.short()
        );
        Ok(anchor)
    }

    fn check_expectations(
        &self,
        state: &mut ChainState,
        state_hash: &Hash,
        root: &Hash,
        options: &MaterializeOptions,
    ) -> LedgerResult<()> {
        let mismatch = if options.expected_state.is_some_and(|h| h != *state_hash) {
            Some("state hash")
        } else if options.expected_root.is_some_and(|h| h != *root) {
            Some("merkle root")
        } else {
            None
        };
        if let Some(what) = mismatch {
            let detail = format!("{what} at tick {} does not match the expected value", state.head_tick);
            self.quarantine_locked(state, &detail);
            return Err(LedgerError::corrupted(&state.chain_id, detail));
        }
        Ok(())
    }

    pub(crate) fn replay_failed(&self, state: &mut ChainState, tick: Tick, failure: ReplayFailure) -> LedgerError {
        match failure {
            ReplayFailure::Corrupt(detail) => {
                self.quarantine_locked(state, &detail);
                LedgerError::corrupted(&state.chain_id, detail)
            }
            ReplayFailure::MissingSnapshot(anchor) => LedgerError::unreachable(
                &state.chain_id,
                tick,
                format!("snapshot of anchor {anchor} is gone"),
            ),
            ReplayFailure::Cancelled => LedgerError::Cancelled(state.chain_id.clone()),
            ReplayFailure::Store(err) => LedgerError::Store(err),
        }
    }

    pub fn reconstruct_state(&self, chain: &ChainId, target: Tick) -> LedgerResult<StateVector> {
        self.reconstruct_state_with(chain, target, &ReconstructOptions::default())
    }

    /// Replays from the nearest live anchor at or before `target`. Successful
    /// reads feed the read window rather than the receipt log.
    pub fn reconstruct_state_with(
        &self,
        chain: &ChainId,
        target: Tick,
        options: &ReconstructOptions,
    ) -> LedgerResult<StateVector> {
        match self.reconstruct_inner(chain, target, options) {
            Ok(state) => Ok(state),
            Err(err) => {
                let audit = self.audit("reconstruct_state", chain, &serde_json::json!({ "target": target }));
                Err(self.record_failure(audit, self.tier(chain).ok(), err))
            }
        }
    }

    fn reconstruct_inner(&self, chain: &ChainId, target: Tick, options: &ReconstructOptions) -> LedgerResult<StateVector> {
        let cell = self.cell(chain)?;
        let plan = {
            let state = cell.read();
            let plan = self.plan_reconstruction(&state, target)?;
            cell.reads().record(self.clock.now(), plan.start.tick, self.config.read_window);
            plan
        };
        match plan.run(self.store.as_ref(), self.engine.as_ref(), options.cancel.as_ref(), |_, _| {}) {
            Ok(state) => {
                self.promote_if_hot(&cell);
                Ok(state)
            }
            Err(failure) => {
                let mut state = cell.write();
                Err(self.replay_failed(&mut state, target, failure))
            }
        }
    }

    pub(crate) fn plan_reconstruction(&self, state: &ChainState, target: Tick) -> LedgerResult<ReplayPlan> {
        let chain = &state.chain_id;
        if target > state.head_tick {
            return Err(LedgerError::unreachable(
                chain,
                target,
                format!("chain head is at tick {}", state.head_tick),
            ));
        }
        if target < state.base_tick {
            return Err(LedgerError::unreachable(
                chain,
                target,
                format!("chain starts at tick {}", state.base_tick),
            ));
        }
        self.enforce(state, Operation::Reconstruct, 0, true)?;
        let start = state
            .nearest_live_anchor(target)
            .ok_or_else(|| LedgerError::unreachable(chain, target, "no live anchor at or before the target"))?;
        let distance = target - start.anchor.tick;
        if distance > self.config.k_max {
            return Err(LedgerError::unreachable(
                chain,
                target,
                format!(
                    "nearest live anchor is tick {} ({distance} deltas back, k_max {})",
                    start.anchor.tick, self.config.k_max
                ),
            ));
        }
        if let Err(detail) = state.verify_links(start.anchor.tick, target) {
            return Err(LedgerError::unreachable(chain, target, format!("broken delta chain: {detail}")));
        }
        Ok(ReplayPlan::build(state, &start.anchor, target))
    }
}
