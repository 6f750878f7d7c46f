use super::*;

use super::replay::apply_transform;
use crate::journal::{AnchorDemotedRecord, ChainOpenedRecord};
use crate::policy::Operation;

impl<S: Store + 'static> StateLedger<S> {
    /// Rebuild the in-memory view from the journal. Records are applied in
    /// journal order with the same checks a live append runs; a chain whose
    /// records fail verification is quarantined in memory and its later
    /// records are skipped.
    pub(crate) fn recover(&self) -> LedgerResult<()> {
        let entries = {
            let journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
            journal.load_from(0)?
        };
        if entries.is_empty() {
            return Ok(());
        }
        let total = entries.len();
        for entry in entries {
            let record = entry.record()?;
            self.apply_recovered(record)?;
        }
        let quarantined: Vec<ChainId> = self
            .chain_ids()
            .into_iter()
            .filter(|chain| self.is_quarantined(chain).unwrap_or(false))
            .collect();
        log::info!(
            "recovered {total} journal entries: {} chains, {} receipts, clock at {}",
            self.chain_ids().len(),
            self.receipt_count(),
            self.clock.now()
        );
        if !quarantined.is_empty() {
            log::warn!("quarantined after recovery: {quarantined:?}");
        }
        Ok(())
    }

    fn apply_recovered(&self, record: LedgerRecord) -> LedgerResult<()> {
        match record {
            LedgerRecord::ChainOpened(opened) => self.recover_chain(opened),
            LedgerRecord::Receipt(receipt) => {
                self.clock.observe(receipt.logical_timestamp);
                self.receipt_log().append(receipt);
                Ok(())
            }
            LedgerRecord::Delta(delta) => {
                let cell = self.cell(&delta.chain_id)?;
                let mut state = cell.write();
                if state.quarantined.is_some() {
                    return Ok(());
                }
                if let Err(detail) = self.recover_delta(&mut state, delta) {
                    log::warn!("recovery of {} stopped: {detail}", state.chain_id);
                    state.quarantined = Some(detail);
                }
                cell.allocator.reset(state.head_tick + 1);
                Ok(())
            }
            LedgerRecord::Anchor(anchor) => {
                let cell = self.cell(&anchor.chain_id)?;
                let mut state = cell.write();
                if state.quarantined.is_none() {
                    state.apply_anchor(anchor, self.clock.now());
                }
                Ok(())
            }
            LedgerRecord::AnchorDemoted(demoted) => self.recover_demotion(demoted),
            LedgerRecord::TierChanged(change) => {
                self.cell(&change.chain_id)?.write().tier = change.to;
                Ok(())
            }
            LedgerRecord::Quarantined(q) => {
                self.cell(&q.chain_id)?.write().quarantined = Some(q.reason);
                Ok(())
            }
            LedgerRecord::Compaction(record) => {
                for tick in &record.pruned_anchors {
                    let snapshot = self
                        .cell(&record.chain_id)?
                        .read()
                        .anchors
                        .get(tick)
                        .map(|entry| entry.anchor.state_snapshot);
                    if let Some(state_snapshot) = snapshot {
                        self.recover_demotion(AnchorDemotedRecord {
                            chain_id: record.chain_id.clone(),
                            tick: *tick,
                            state_snapshot,
                        })?;
                    }
                }
                let cell = self.cell(&record.chain_id)?;
                let mut state = cell.write();
                state.last_compaction_at = self.clock.now();
                state.compactions.push(record);
                Ok(())
            }
        }
    }

    fn recover_chain(&self, opened: ChainOpenedRecord) -> LedgerResult<()> {
        let base = &opened.base;
        let bytes = self.store.get_blob(base.state_snapshot)?;
        let state = SnapshotBlob::decode(&bytes, &base.chain_id, base.tick)
            .map_err(|detail| LedgerError::corrupted(&base.chain_id, detail))?;
        if state.state_hash() != base.state_hash {
            return Err(LedgerError::corrupted(
                &base.chain_id,
                "base snapshot does not match its anchor",
            ));
        }
        let signer = signing::ChainSigner::from_seed(&opened.seed);
        if signer.verifying_key_bytes().as_slice() != opened.verifying_key.as_slice() {
            return Err(LedgerError::corrupted(
                &opened.chain_id,
                "journaled verifying key does not derive from the chain seed",
            ));
        }
        let mut holons = self.holons.write().unwrap_or_else(PoisonError::into_inner);
        self.install_chain(&mut holons, opened, state);
        Ok(())
    }

    /// Re-run one journaled delta against the recovered head. Errors are
    /// returned as quarantine reasons.
    fn recover_delta(&self, state: &mut ChainState, delta: Delta) -> Result<(), String> {
        if delta.tick != state.head_tick + 1 || delta.parent_hash != state.head_hash {
            return Err(format!(
                "journaled delta {} does not extend head {}",
                delta.tick, state.head_tick
            ));
        }
        let hash = delta
            .compute_hash()
            .map_err(|e| format!("delta {} encode: {e}", delta.tick))?;
        delta
            .verify_signature(&state.verifying_key, &hash)
            .map_err(|e| format!("delta {}: {e}", delta.tick))?;
        let next = apply_transform(
            self.engine.as_ref(),
            &state.head_state,
            &delta.transform_op,
            &delta.parameters,
        )
        .map_err(|e| format!("replaying delta {} failed: {e}", delta.tick))?;
        // Annotations are derived, not journaled; recompute them.
        let op = Operation::Transform(delta.transform_op.kind);
        let ulp = self.engine.ulp_error(&delta.transform_op);
        let finite = delta.parameters.is_finite() && next.is_finite();
        if let Ok(Some(note)) = self.enforce(state, op, ulp, finite) {
            state.annotations.push((delta.tick, note));
        }
        state.apply_delta(delta, hash, next);
        Ok(())
    }

    fn recover_demotion(&self, demoted: AnchorDemotedRecord) -> LedgerResult<()> {
        let cell = self.cell(&demoted.chain_id)?;
        cell.write().apply_demoted(demoted.tick);
        // Finish a demotion interrupted between the journal write and the delete.
        if self.store.has_blob(demoted.state_snapshot)? {
            self.store.delete_blob(demoted.state_snapshot)?;
            log::debug!("removed leftover snapshot of {}@{}", demoted.chain_id, demoted.tick);
        }
        Ok(())
    }
}
