use super::*;

use crate::journal::TierChangedRecord;
use crate::policy::{EnsembleDiagnostics, Transition, TransitionEvidence};
use crate::state::OpKind;

/// Outcome of [`StateLedger::transition_tier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChange {
    pub from: DeterminismTier,
    pub to: DeterminismTier,
    pub transition: Transition,
}

impl Bundled for TierChange {
    fn bundle_hash(&self) -> Hash {
        Hash::of_parts(&[b"tier", self.from.as_str().as_bytes(), self.to.as_str().as_bytes()])
    }
}

impl<S: Store + 'static> StateLedger<S> {
    /// Move a chain to another determinism tier. Loosening always succeeds;
    /// tightening must present the target tier's evidence, which the ledger
    /// gathers from the chain's own history. `ensemble` backs a move to D2.
    pub fn transition_tier(
        &self,
        chain: &ChainId,
        to: DeterminismTier,
        ensemble: Option<EnsembleDiagnostics>,
    ) -> LedgerResult<TierChange> {
        let audit = self.audit("transition_tier", chain, &serde_json::json!({ "to": to }));
        let cell = match self.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(self.record_failure(audit, None, err)),
        };
        let mut state = cell.write();
        let from = state.tier;
        let result = self.transition_locked(&mut state, to, ensemble);
        self.finish(audit, Some(from), result)
    }

    fn transition_locked(
        &self,
        state: &mut ChainState,
        to: DeterminismTier,
        ensemble: Option<EnsembleDiagnostics>,
    ) -> LedgerResult<TierChange> {
        state.ensure_writable()?;
        let from = state.tier;
        let evidence = if to.is_stricter_than(from) {
            self.gather_evidence(state, to, ensemble)?
        } else {
            TransitionEvidence::default()
        };
        let transition = self
            .policy
            .check_transition(from, to, &evidence)
            .map_err(|reason| LedgerError::PolicyDenied {
                chain: state.chain_id.clone(),
                operation: "transition_tier".into(),
                reason,
            })?;
        if transition != Transition::Unchanged {
            self.journal_record(&LedgerRecord::TierChanged(TierChangedRecord {
                chain_id: state.chain_id.clone(),
                from,
                to,
            }))?;
            state.tier = to;
            log::info!("{} moved from {from} to {to} ({transition:?})", state.chain_id);
        }
        Ok(TierChange { from, to, transition })
    }

    fn gather_evidence(
        &self,
        state: &ChainState,
        to: DeterminismTier,
        ensemble: Option<EnsembleDiagnostics>,
    ) -> LedgerResult<TransitionEvidence> {
        let inputs_recorded = {
            let receipts = self.receipt_log();
            state
                .deltas
                .iter()
                .flat_map(|d| &d.parameters.inputs)
                .all(|rid| receipts.get(rid).is_some())
        };
        let no_ambient = state.deltas.iter().all(|d| d.transform_op.kind != OpKind::Ambient);
        let mut evidence = TransitionEvidence {
            all_actions_recorded: inputs_recorded && no_ambient,
            seed_recorded: state.seed_recorded,
            determinism_proven: false,
            ensemble,
        };
        if to == DeterminismTier::D0 && evidence.all_actions_recorded {
            evidence.determinism_proven = self.replays_bit_exact(state)?;
        }
        Ok(evidence)
    }

    /// Every delta is admissible at D0 and a replay from the base anchor lands
    /// on the working state bit for bit.
    fn replays_bit_exact(&self, state: &ChainState) -> LedgerResult<bool> {
        let admissible = state
            .deltas
            .iter()
            .all(|d| matches!(d.transform_op.kind, OpKind::Pure | OpKind::Seeded));
        if !admissible {
            return Ok(false);
        }
        let Some(base) = state.anchors.get(&state.base_tick).filter(|e| e.live) else {
            return Ok(false);
        };
        let plan = ReplayPlan::build(state, &base.anchor, state.head_tick);
        match plan.run(self.store.as_ref(), self.engine.as_ref(), None, |_, _| {}) {
            Ok(replayed) => Ok(replayed.state_hash() == state.head_state.state_hash()),
            Err(ReplayFailure::Corrupt(detail)) => Err(LedgerError::corrupted(&state.chain_id, detail)),
            Err(failure) => {
                log::debug!("determinism proof for {} failed: {failure:?}", state.chain_id);
                Ok(false)
            }
        }
    }
}
