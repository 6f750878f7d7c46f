use super::*;

use super::holon::InboundInput;
use super::replay::apply_transform;
use crate::policy::{Decision, EnforceContext, Operation};
use crate::receipts::{AppendOutcome, InboundPayload, ReceiptDraft, ReceiptStatus};

impl<S: Store + 'static> StateLedger<S> {
    /// Append one transition at the chain head. `parent_hash` must be the
    /// current head hash; a stale parent or a lost tick race is
    /// [`LedgerError::OutOfOrderDelta`], which callers may retry.
    pub fn append_delta(
        &self,
        chain: &ChainId,
        parent_hash: Hash,
        transform_op: TransformOp,
        parameters: Params,
    ) -> LedgerResult<Delta> {
        self.append_delta_outcome(chain, parent_hash, transform_op, parameters, false)
            .map(|(delta, _)| delta)
    }

    /// Like [`Self::append_delta`]. With `idempotent` set, a transition that
    /// already follows `parent_hash` is returned instead of rejected, and the
    /// flag reports it.
    pub(crate) fn append_delta_outcome(
        &self,
        chain: &ChainId,
        parent_hash: Hash,
        transform_op: TransformOp,
        parameters: Params,
        idempotent: bool,
    ) -> LedgerResult<(Delta, bool)> {
        let audit = self.audit(
            "append_delta",
            chain,
            &serde_json::json!({
                "parent_hash": parent_hash,
                "transform_op": &transform_op,
                "parameters": &parameters,
            }),
        );
        let cell = match self.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(self.record_failure(audit, None, err)),
        };
        let tier = cell.read().tier;
        match self.try_append(&cell, parent_hash, transform_op, parameters, idempotent) {
            Ok((delta, duplicate)) => self.finish(audit, Some(tier), Ok(delta)).map(|delta| (delta, duplicate)),
            Err(err) => Err(self.record_failure(audit, Some(tier), err)),
        }
    }

    fn try_append(
        &self,
        cell: &ChainCell,
        parent_hash: Hash,
        transform_op: TransformOp,
        parameters: Params,
        idempotent: bool,
    ) -> LedgerResult<(Delta, bool)> {
        if idempotent {
            let state = cell.read();
            if parent_hash != state.head_hash {
                if let Some(existing) = find_transition(&state, &parent_hash, &transform_op, &parameters) {
                    log::debug!("{} already holds delta {}; skipping", state.chain_id, existing.tick);
                    return Ok((existing.clone(), true));
                }
            }
        }
        self.promote_before_append(cell)?;

        let (chain, tick, before, annotation) = {
            let state = cell.read();
            state.ensure_writable()?;
            if parent_hash != state.head_hash {
                return Err(out_of_order(&state, parent_hash));
            }
            let annotation = self.enforce(
                &state,
                Operation::Transform(transform_op.kind),
                self.engine.ulp_error(&transform_op),
                parameters.is_finite(),
            )?;
            (state.chain_id.clone(), state.head_tick + 1, state.head_state.clone(), annotation)
        };

        {
            let receipts = self.receipt_log();
            for rid in parameters.inputs.iter().filter(|rid| receipts.get(rid).is_none()) {
                log::warn!("delta {tick} on {chain} consumes unrecorded input {}", rid.short());
            }
        }

        // The engine runs outside the chain lock; the tick claim below decides
        // which of several racing writers commits.
        let next = apply_transform(self.engine.as_ref(), &before, &transform_op, &parameters)?;
        let annotation = match (next.is_finite(), annotation) {
            (true, note) => note,
            (false, _) => {
                let state = cell.read();
                self.enforce(&state, Operation::Transform(transform_op.kind), 0, false)?
            }
        };
        let hash = Delta::hash_parts(&chain, tick, &parent_hash, &transform_op, &parameters)?;

        if cell.allocator.claim(tick).is_err() {
            let state = cell.read();
            return Err(out_of_order(&state, parent_hash));
        }
        let mut state = cell.write();
        if state.head_hash != parent_hash || state.head_tick + 1 != tick {
            cell.allocator.reset(state.head_tick + 1);
            return Err(out_of_order(&state, parent_hash));
        }
        if let Err(err) = state.ensure_writable() {
            cell.allocator.reset(tick);
            return Err(err);
        }
        let delta = Delta {
            chain_id: chain,
            tick,
            parent_hash,
            transform_op,
            parameters,
            signature: state.signer.sign(&hash),
        };
        if let Err(err) = self.journal_record(&LedgerRecord::Delta(delta.clone())) {
            cell.allocator.reset(tick);
            return Err(err);
        }
        if let Some(note) = annotation {
            state.annotations.push((tick, note));
        }
        state.apply_delta(delta.clone(), hash, next);
        Ok((delta, false))
    }

    /// Run the determinism policy for one operation on a chain. `Some` is a
    /// note that the operation weakened the chain's guarantee.
    pub(crate) fn enforce(
        &self,
        state: &ChainState,
        op: Operation,
        ulp_error: u32,
        finite: bool,
    ) -> LedgerResult<Option<String>> {
        let ctx = EnforceContext {
            op,
            seed_recorded: state.seed_recorded,
            ulp_error,
            finite,
        };
        match self.policy.enforce(state.tier, &ctx) {
            Decision::Allow => Ok(None),
            Decision::Annotate(note) => {
                log::debug!("{} on {}: {note}", op.name(), state.chain_id);
                Ok(Some(note))
            }
            Decision::Deny(reason) => Err(reason.into_error(&state.chain_id, &op)),
        }
    }

    /// Record an external input addressed to `chain`. A repeat of the same
    /// `(source, sequence)` returns the original receipt.
    pub fn record_inbound(&self, chain: &ChainId, input: InboundInput) -> LedgerResult<Receipt> {
        self.record_inbound_outcome(chain, input).map(AppendOutcome::into_receipt)
    }

    pub(crate) fn record_inbound_outcome(&self, chain: &ChainId, input: InboundInput) -> LedgerResult<AppendOutcome> {
        let audit = self.audit(
            "record_inbound",
            chain,
            &serde_json::json!({ "source": &input.source, "sequence": input.sequence }),
        );
        let cell = match self.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(self.record_failure(audit, None, err)),
        };
        let state = cell.read();
        let tier = state.tier;
        let result = state
            .ensure_writable()
            .and_then(|_| self.enforce(&state, Operation::RecordInbound, 0, true))
            .and_then(|_| self.codec.canonical_hash(&input.payload).map_err(LedgerError::from));
        let bundle_hash = match result {
            Ok(hash) => hash,
            Err(err) => {
                drop(state);
                return Err(self.record_failure(audit, Some(tier), err));
            }
        };
        let op_kind = format!("inbound:{}", input.source);
        let draft = ReceiptDraft {
            dedupe_key: Some(ReceiptCodec::dedupe_key(
                &self.config.tenant,
                chain.as_str(),
                input.sequence,
                &op_kind,
            )),
            op_kind,
            tenant: self.config.tenant.clone(),
            chain_id: chain.clone(),
            logical_timestamp: 0,
            selectors_hash: audit.selectors,
            policy_hash: self.policy_hash(Some(tier)),
            bundle_hash,
            status: ReceiptStatus::Ok,
            inbound: Some(InboundPayload {
                source: input.source,
                sequence: input.sequence,
                chain_tick: state.head_tick,
                payload: input.payload,
            }),
        };
        let outcome = self.record_receipt(draft)?;
        if outcome.is_duplicate() {
            log::debug!("inbound {} on {chain} already recorded", outcome.receipt().rid.short());
        }
        Ok(outcome)
    }
}

fn out_of_order(state: &ChainState, parent_hash: Hash) -> LedgerError {
    LedgerError::OutOfOrderDelta {
        chain: state.chain_id.clone(),
        head_tick: state.head_tick,
        head_hash: state.head_hash,
        tick: state
            .tick_of_hash(&parent_hash)
            .map_or(state.head_tick + 1, |t| t + 1),
        parent_hash,
    }
}

fn find_transition<'a>(
    state: &'a ChainState,
    parent_hash: &Hash,
    op: &TransformOp,
    params: &Params,
) -> Option<&'a Delta> {
    let tick = state.tick_of_hash(parent_hash)? + 1;
    state
        .delta_at(tick)
        .filter(|delta| delta.same_transition(op, params))
}
