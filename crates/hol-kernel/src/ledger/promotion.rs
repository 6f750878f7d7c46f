use super::*;

/// Chain-level inputs to a promotion decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    /// Deltas since the last anchor record.
    pub pending_deltas: u64,
    /// `pending_deltas` after the operation being considered.
    pub prospective_deltas: u64,
    pub reads_in_window: u32,
}

/// Per-anchor inputs to a demotion decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorStats {
    pub tick: Tick,
    pub reads_in_window: u32,
    /// Logical clock ticks since the snapshot was written.
    pub age: u64,
    pub has_earlier_live_anchor: bool,
    pub is_base: bool,
    pub is_latest: bool,
}

/// Decides when anchors are created and when their snapshots are dropped.
pub trait AnchorPolicy: Send + Sync {
    fn should_promote(&self, stats: &ChainStats) -> bool;
    fn should_demote(&self, stats: &AnchorStats) -> bool;
}

#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    pub chain_length_threshold: u64,
    pub hot_reads: u32,
    pub hot_min_deltas: u64,
    pub cold_reads: u32,
    pub read_window: u64,
}

impl ThresholdPolicy {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            chain_length_threshold: config.chain_length_threshold,
            hot_reads: config.hot_reads,
            hot_min_deltas: config.hot_min_deltas,
            cold_reads: config.cold_reads,
            read_window: config.read_window,
        }
    }
}

impl AnchorPolicy for ThresholdPolicy {
    fn should_promote(&self, stats: &ChainStats) -> bool {
        if stats.prospective_deltas > self.chain_length_threshold {
            return true;
        }
        stats.reads_in_window > self.hot_reads && stats.pending_deltas >= self.hot_min_deltas.max(1)
    }

    fn should_demote(&self, stats: &AnchorStats) -> bool {
        !stats.is_base
            && !stats.is_latest
            && stats.has_earlier_live_anchor
            && stats.age >= self.read_window
            && stats.reads_in_window < self.cold_reads
    }
}

impl<S: Store + 'static> StateLedger<S> {
    fn chain_stats(&self, cell: &ChainCell, state: &ChainState, appending: bool) -> ChainStats {
        let pending = state.deltas_since_anchor();
        let mut reads = cell.reads();
        reads.prune(self.clock.now(), self.config.read_window);
        ChainStats {
            pending_deltas: pending,
            prospective_deltas: pending + u64::from(appending),
            reads_in_window: reads.chain_reads(),
        }
    }

    /// Materialize the head if the next append would push the chain past the
    /// length threshold. Runs before the append is admitted.
    pub(crate) fn promote_before_append(&self, cell: &ChainCell) -> LedgerResult<()> {
        self.promote_if(cell, true)
    }

    /// Materialize the head of a chain whose reads have gone hot.
    pub(crate) fn promote_if_hot(&self, cell: &ChainCell) {
        if let Err(err) = self.promote_if(cell, false) {
            log::warn!("hot promotion failed: {err}");
        }
    }

    fn promote_if(&self, cell: &ChainCell, appending: bool) -> LedgerResult<()> {
        {
            let state = cell.read();
            if !state.tier.supports_anchors() || state.quarantined.is_some() {
                return Ok(());
            }
            if !self.anchor_policy.should_promote(&self.chain_stats(cell, &state, appending)) {
                return Ok(());
            }
        }
        let mut state = cell.write();
        // Another writer may have promoted while the lock was released.
        if !self.anchor_policy.should_promote(&self.chain_stats(cell, &state, appending)) {
            return Ok(());
        }
        let chain = state.chain_id.clone();
        let tier = state.tier;
        log::debug!(
            "promoting {chain}@{} ({} pending deltas)",
            state.head_tick,
            state.deltas_since_anchor()
        );
        let audit = self.audit("promote", &chain, &serde_json::json!({ "head": state.head_tick }));
        let result = self.materialize_locked(&mut state, &MaterializeOptions::default());
        self.finish(audit, Some(tier), result).map(|_| ())
    }

    /// Drop the snapshot blob of the live anchor at `tick`. The anchor record
    /// and every delta stay; the state remains reachable by replay from an
    /// earlier live anchor.
    pub fn demote_anchor(&self, chain: &ChainId, tick: Tick) -> LedgerResult<Anchor> {
        let audit = self.audit("demote_anchor", chain, &serde_json::json!({ "tick": tick }));
        let cell = match self.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(self.record_failure(audit, None, err)),
        };
        let mut state = cell.write();
        let tier = state.tier;
        let result = state
            .ensure_writable()
            .and_then(|_| self.demote_locked(&mut state, tick));
        self.finish(audit, Some(tier), result)
    }

    /// Demote every anchor the anchor policy considers cold.
    pub fn demote_cold_anchors(&self, chain: &ChainId) -> LedgerResult<Vec<Tick>> {
        let audit = self.audit("demote_cold_anchors", chain, &serde_json::json!({}));
        let cell = match self.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(self.record_failure(audit, None, err)),
        };
        let mut state = cell.write();
        let tier = state.tier;
        let result = state
            .ensure_writable()
            .and_then(|_| self.demote_cold_locked(&cell, &mut state));
        drop(state);
        self.finish(audit, Some(tier), result)
    }

    fn demote_cold_locked(&self, cell: &ChainCell, state: &mut ChainState) -> LedgerResult<Vec<Tick>> {
        let now = self.clock.now();
        let candidates: Vec<AnchorStats> = {
            let mut reads = cell.reads();
            reads.prune(now, self.config.read_window);
            let live: Vec<Tick> = state.live_anchor_ticks().collect();
            let latest = live.last().copied();
            live.iter()
                .filter_map(|tick| state.anchors.get(tick).map(|entry| (tick, entry)))
                .map(|(tick, entry)| AnchorStats {
                    tick: *tick,
                    reads_in_window: reads.anchor_reads(*tick),
                    age: now.saturating_sub(entry.created_at),
                    has_earlier_live_anchor: live.first().is_some_and(|first| first < tick),
                    is_base: *tick == state.base_tick,
                    is_latest: Some(*tick) == latest,
                })
                .collect()
        };
        let mut demoted = Vec::new();
        for stats in candidates {
            if self.anchor_policy.should_demote(&stats) {
                self.demote_locked(state, stats.tick)?;
                demoted.push(stats.tick);
            }
        }
        if !demoted.is_empty() {
            log::info!("demoted {} cold anchors on {}: {demoted:?}", demoted.len(), state.chain_id);
        }
        Ok(demoted)
    }

    /// Verify the delta path back to the previous live anchor, journal the
    /// demotion, then delete the blob.
    pub(crate) fn demote_locked(&self, state: &mut ChainState, tick: Tick) -> LedgerResult<Anchor> {
        let anchor = self.check_demotion(state, tick)?;
        self.commit_demotion(state, tick, &anchor)?;
        Ok(anchor)
    }

    /// The live anchor at `tick`, once the deltas back to the previous live
    /// anchor verify. Writes nothing unless the links are broken, which
    /// quarantines the chain.
    pub(crate) fn check_demotion(&self, state: &mut ChainState, tick: Tick) -> LedgerResult<Anchor> {
        let chain = state.chain_id.clone();
        let anchor = match state.anchors.get(&tick) {
            Some(entry) if entry.live => entry.anchor.clone(),
            Some(_) => return Err(denied(&chain, format!("anchor {tick} is already demoted"))),
            None => return Err(denied(&chain, format!("no anchor at tick {tick}"))),
        };
        let earlier = state
            .anchors
            .range(..tick)
            .rev()
            .find(|(_, entry)| entry.live)
            .map(|(t, _)| *t)
            .ok_or_else(|| denied(&chain, format!("anchor {tick} has no earlier live anchor")))?;
        if let Err(detail) = state.verify_links(earlier, tick) {
            let detail = format!("cannot demote anchor {tick}: {detail}");
            self.quarantine_locked(state, &detail);
            return Err(LedgerError::corrupted(&chain, detail));
        }
        Ok(anchor)
    }

    pub(crate) fn commit_demotion(&self, state: &mut ChainState, tick: Tick, anchor: &Anchor) -> LedgerResult<()> {
        self.journal_record(&LedgerRecord::AnchorDemoted(crate::journal::AnchorDemotedRecord {
            chain_id: state.chain_id.clone(),
            tick,
            state_snapshot: anchor.state_snapshot,
        }))?;
        self.drop_snapshot(state, tick, anchor);
        Ok(())
    }

    /// Mark the anchor demoted and delete its blob. The demotion must already
    /// be journaled.
    pub(crate) fn drop_snapshot(&self, state: &mut ChainState, tick: Tick, anchor: &Anchor) {
        let chain = &state.chain_id;
        match self.store.delete_blob(anchor.state_snapshot) {
            Ok(true) => {}
            Ok(false) => log::warn!("snapshot of {chain}@{tick} was already gone"),
            Err(err) => log::warn!("failed to delete snapshot of {chain}@{tick}: {err}"),
        }
        log::debug!("demoted {chain}@{tick}");
        state.apply_demoted(tick);
    }
}

fn denied(chain: &ChainId, reason: String) -> LedgerError {
    LedgerError::PolicyDenied {
        chain: chain.clone(),
        operation: "demote_anchor".into(),
        reason,
    }
}
