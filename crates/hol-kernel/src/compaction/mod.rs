//! Geometry-aware log compaction.
//!
//! Compaction never deletes a delta. It simplifies the chain's state trajectory
//! into a stored summary and demotes intermediate anchor snapshots, and it
//! commits only if causality, homotopy and reachability all survive.

pub mod invariants;
pub mod trajectory;

pub use invariants::{DeltaLink, HistoryView, InvariantContext, InvariantReport, verify_invariants};
pub use trajectory::{
    ForbiddenZones, HyperbolicBallZones, NoZones, Simplification, TrajectoryError, Zone, compact_trajectory,
    poincare_distance, segment_distance,
};

use hol_cbor::Hash;
use hol_store::Store;
use serde::{Deserialize, Serialize};

use crate::config::CompactionConfig;
use crate::error::LedgerError;
use crate::journal::LedgerRecord;
use crate::ledger::{Bundled, ChainId, ChainState, LedgerResult, ReplayPlan, StateLedger};
use crate::policy::Operation;
use crate::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    PeriodicSweep,
    LedgerSize,
    /// Runs after a finality checkpoint.
    Finality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionParams {
    /// Inclusive tick range; `None` is the whole chain.
    pub range: Option<(Tick, Tick)>,
    pub epsilon: f64,
    pub keep_anchors_every: usize,
    pub trigger: CompactionTrigger,
}

impl CompactionParams {
    pub fn from_config(config: &CompactionConfig, trigger: CompactionTrigger) -> Self {
        Self {
            range: None,
            epsilon: config.epsilon,
            keep_anchors_every: config.keep_anchors_every,
            trigger,
        }
    }

    pub fn with_range(mut self, from: Tick, to: Tick) -> Self {
        self.range = Some((from, to));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub chain_id: ChainId,
    pub trigger: CompactionTrigger,
    pub original_range: (Tick, Tick),
    /// Checkpoint of the live anchor that covers the end of the range.
    pub summary_anchor: Hash,
    pub epsilon: f64,
    pub invariant_proofs: InvariantReport,
    pub retained_ticks: Vec<Tick>,
    pub pruned_anchors: Vec<Tick>,
    /// Store node holding the simplified trajectory.
    pub trajectory_ref: Hash,
    /// False when a state left the unit ball and every point was kept.
    pub trajectory_simplified: bool,
}

impl Bundled for CompactionRecord {
    fn bundle_hash(&self) -> Hash {
        Hash::of_cbor(self).unwrap_or(Hash::ZERO)
    }
}

/// Simplified trajectory persisted as a store node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySummary {
    pub chain_id: ChainId,
    pub epsilon: f64,
    pub ticks: Vec<Tick>,
    pub points: Vec<Vec<f64>>,
}

/// Anchor ticks to demote out of `live`. The first, every `keep_every`-th and
/// the last are kept.
pub fn select_prunable(live: &[Tick], keep_every: usize) -> Vec<Tick> {
    let keep_every = keep_every.max(1);
    let last = live.len().saturating_sub(1);
    live.iter()
        .enumerate()
        .filter(|(i, _)| *i != 0 && *i != last && i % keep_every != 0)
        .map(|(_, t)| *t)
        .collect()
}

pub struct Compactor {
    zones: Box<dyn ForbiddenZones>,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor").finish_non_exhaustive()
    }
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(Box::new(NoZones))
    }
}

impl Compactor {
    pub fn new(zones: Box<dyn ForbiddenZones>) -> Self {
        Self { zones }
    }

    pub fn zones(&self) -> &dyn ForbiddenZones {
        self.zones.as_ref()
    }

    /// Which trigger, if any, makes `chain` due for compaction now.
    pub fn due<S: Store + 'static>(
        &self,
        ledger: &StateLedger<S>,
        chain: &ChainId,
    ) -> LedgerResult<Option<CompactionTrigger>> {
        let cell = ledger.cell(chain)?;
        let state = cell.read();
        if state.quarantined.is_some() || !state.tier.supports_anchors() {
            return Ok(None);
        }
        let config = &ledger.config().compaction;
        if state.deltas.len() as u64 >= config.size_threshold {
            return Ok(Some(CompactionTrigger::LedgerSize));
        }
        if ledger.now().saturating_sub(state.last_compaction_at) >= config.sweep_interval {
            return Ok(Some(CompactionTrigger::PeriodicSweep));
        }
        Ok(None)
    }

    /// Compact every chain that is due. Failures are reported per chain.
    pub fn sweep<S: Store + 'static>(&self, ledger: &StateLedger<S>) -> Vec<(ChainId, LedgerResult<CompactionRecord>)> {
        let mut results = Vec::new();
        for chain in ledger.chain_ids() {
            let trigger = match self.due(ledger, &chain) {
                Ok(Some(trigger)) => trigger,
                Ok(None) => continue,
                Err(err) => {
                    results.push((chain, Err(err)));
                    continue;
                }
            };
            let params = CompactionParams::from_config(&ledger.config().compaction, trigger);
            let result = self.compact(ledger, &chain, &params);
            if let Err(err) = &result {
                log::warn!("compaction of {chain} ({trigger:?}) failed: {err}");
            }
            results.push((chain, result));
        }
        results
    }

    /// Checkpoint the head, then compact the whole chain.
    pub fn compact_after_finality<S: Store + 'static>(
        &self,
        ledger: &StateLedger<S>,
        chain: &ChainId,
    ) -> LedgerResult<CompactionRecord> {
        ledger.materialize(chain)?;
        let params = CompactionParams::from_config(&ledger.config().compaction, CompactionTrigger::Finality);
        self.compact(ledger, chain, &params)
    }

    /// Simplify, plan pruning, verify, commit. The chain's write lock is held
    /// from the first read to the last write.
    pub fn compact<S: Store + 'static>(
        &self,
        ledger: &StateLedger<S>,
        chain: &ChainId,
        params: &CompactionParams,
    ) -> LedgerResult<CompactionRecord> {
        let audit = ledger.audit(
            "compact",
            chain,
            &serde_json::json!({
                "range": params.range,
                "epsilon": params.epsilon,
                "keep_anchors_every": params.keep_anchors_every,
                "trigger": params.trigger,
            }),
        );
        let cell = match ledger.cell(chain) {
            Ok(cell) => cell,
            Err(err) => return Err(ledger.record_failure(audit, None, err)),
        };
        let mut state = cell.write();
        let tier = state.tier;
        let result = self.compact_locked(ledger, &mut state, params);
        ledger.finish(audit, Some(tier), result)
    }

    fn compact_locked<S: Store + 'static>(
        &self,
        ledger: &StateLedger<S>,
        state: &mut ChainState,
        params: &CompactionParams,
    ) -> LedgerResult<CompactionRecord> {
        state.ensure_writable()?;
        ledger.enforce(state, Operation::Compact, 0, true)?;
        let chain = state.chain_id.clone();
        let (from, to) = params.range.unwrap_or((state.base_tick, state.head_tick));
        if from > to || from < state.base_tick || to > state.head_tick {
            return Err(LedgerError::unreachable(
                &chain,
                to,
                format!("compaction range {from}..={to} is outside {}..={}", state.base_tick, state.head_tick),
            ));
        }

        let (ticks, points) = self.trajectory(ledger, state, from, to)?;
        let (simplified, in_ball) = match compact_trajectory(&points, params.epsilon, self.zones.as_ref()) {
            Ok(simplified) => (simplified, true),
            Err(TrajectoryError::OutsideBall { index, norm }) => {
                log::info!(
                    "{chain}: state at tick {} has norm {norm}, keeping the trajectory unsimplified",
                    ticks[index]
                );
                let all = Simplification {
                    retained: (0..points.len()).collect(),
                    rejected_chords: Vec::new(),
                };
                (all, false)
            }
            Err(err) => return Err(err.into()),
        };

        let live: Vec<Tick> = state.live_anchor_ticks().collect();
        let in_range: Vec<Tick> = live.iter().copied().filter(|t| (from..=to).contains(t)).collect();
        let latest = live.last().copied();
        let pruned: Vec<Tick> = select_prunable(&in_range, params.keep_anchors_every)
            .into_iter()
            .filter(|t| *t != state.base_tick && Some(*t) != latest)
            .collect();

        let kept: Vec<Tick> = live.iter().copied().filter(|t| !pruned.contains(t)).collect();
        let retained_points: Vec<Vec<f64>> = simplified.retained.iter().map(|i| points[*i].clone()).collect();
        let retained_ticks: Vec<Tick> = simplified.retained.iter().map(|i| ticks[*i]).collect();
        // Homotopy is only checked on a path that lies in the ball.
        let (before, after) = if in_ball {
            (
                self.history_view(state, &live, &ticks, &points, false)?,
                self.history_view(state, &kept, &retained_ticks, &retained_points, true)?,
            )
        } else {
            (
                self.history_view(state, &live, &[], &[], false)?,
                self.history_view(state, &kept, &[], &[], true)?,
            )
        };
        let report = verify_invariants(
            &before,
            &after,
            &InvariantContext {
                k_max: ledger.config().k_max,
                range: from..=to,
                zones: self.zones.as_ref(),
            },
        );
        if !report.all_hold() {
            let detail = format!("compaction of {from}..={to} aborted: {:?} failed", report.failures());
            if !report.causal_chain_intact {
                ledger.quarantine_locked(state, &detail);
            }
            return Err(LedgerError::corrupted(&chain, detail));
        }

        let summary_anchor = kept
            .iter()
            .rev()
            .find(|t| **t <= to)
            .and_then(|t| state.anchors.get(t))
            .map_or(Hash::ZERO, |entry| entry.anchor.checkpoint_id);
        let mut demotions = Vec::with_capacity(pruned.len());
        for tick in &pruned {
            demotions.push((*tick, ledger.check_demotion(state, *tick)?));
        }
        // The summary node is unreferenced until the record below commits.
        let trajectory_ref = ledger.store().put_node(&TrajectorySummary {
            chain_id: chain.clone(),
            epsilon: params.epsilon,
            ticks: retained_ticks.clone(),
            points: retained_points,
        })?;
        let record = CompactionRecord {
            chain_id: chain.clone(),
            trigger: params.trigger,
            original_range: (from, to),
            summary_anchor,
            epsilon: params.epsilon,
            invariant_proofs: report,
            retained_ticks,
            pruned_anchors: pruned,
            trajectory_ref,
            trajectory_simplified: in_ball,
        };
        // One journal record commits the summary and every demotion.
        ledger.journal_record(&LedgerRecord::Compaction(record.clone()))?;
        for (tick, anchor) in &demotions {
            ledger.drop_snapshot(state, *tick, anchor);
        }
        state.compactions.push(record.clone());
        state.last_compaction_at = ledger.now();
        log::info!(
            "compacted {chain} {from}..={to}: {} of {} points retained, {} snapshots pruned",
            record.retained_ticks.len(),
            ticks.len(),
            record.pruned_anchors.len()
        );
        Ok(record)
    }

    /// States at every tick of `from..=to`, replayed from the nearest live
    /// anchor under the caller's lock.
    fn trajectory<S: Store + 'static>(
        &self,
        ledger: &StateLedger<S>,
        state: &mut ChainState,
        from: Tick,
        to: Tick,
    ) -> LedgerResult<(Vec<Tick>, Vec<Vec<f64>>)> {
        let start = state
            .nearest_live_anchor(from)
            .map(|entry| entry.anchor.clone())
            .ok_or_else(|| LedgerError::unreachable(&state.chain_id, from, "no live anchor before the range"))?;
        let plan = ReplayPlan::build(state, &start, to);
        let mut ticks = Vec::new();
        let mut points = Vec::new();
        let run = plan.run(ledger.store().as_ref(), ledger.engine().as_ref(), None, |tick, s| {
            if tick >= from {
                ticks.push(tick);
                points.push(s.as_slice().to_vec());
            }
        });
        match run {
            Ok(_) => Ok((ticks, points)),
            Err(failure) => Err(ledger.replay_failed(state, to, failure)),
        }
    }

    fn history_view(
        &self,
        state: &ChainState,
        live: &[Tick],
        ticks: &[Tick],
        points: &[Vec<f64>],
        recompute: bool,
    ) -> LedgerResult<HistoryView> {
        let mut deltas = Vec::with_capacity(state.deltas.len());
        for (delta, stored) in state.deltas.iter().zip(&state.delta_hashes) {
            let hash = if recompute { delta.compute_hash()? } else { *stored };
            deltas.push(DeltaLink {
                tick: delta.tick,
                parent_hash: delta.parent_hash,
                hash,
            });
        }
        Ok(HistoryView {
            base_tick: state.base_tick,
            base_hash: state.hash_at(state.base_tick).unwrap_or(Hash::ZERO),
            deltas,
            live_anchors: live.to_vec(),
            path: points.to_vec(),
            path_ticks: ticks.to_vec(),
        })
    }
}

/// Demote intermediate anchor snapshots without touching deltas: the first,
/// every `keep_anchors_every`-th and the latest live anchor stay. Refuses to
/// leave any state beyond `k_max` of a live anchor.
pub fn prune_snapshots<S: Store + 'static>(
    ledger: &StateLedger<S>,
    chain: &ChainId,
    keep_anchors_every: usize,
) -> LedgerResult<Vec<Tick>> {
    let audit = ledger.audit(
        "prune_snapshots",
        chain,
        &serde_json::json!({ "keep_anchors_every": keep_anchors_every }),
    );
    let cell = match ledger.cell(chain) {
        Ok(cell) => cell,
        Err(err) => return Err(ledger.record_failure(audit, None, err)),
    };
    let mut state = cell.write();
    let tier = state.tier;
    let result = prune_locked(ledger, &mut state, keep_anchors_every);
    ledger.finish(audit, Some(tier), result)
}

fn prune_locked<S: Store + 'static>(
    ledger: &StateLedger<S>,
    state: &mut ChainState,
    keep_every: usize,
) -> LedgerResult<Vec<Tick>> {
    state.ensure_writable()?;
    let live: Vec<Tick> = state.live_anchor_ticks().collect();
    let pruned = select_prunable(&live, keep_every);
    let kept: Vec<Tick> = live.iter().copied().filter(|t| !pruned.contains(t)).collect();
    let k_max = ledger.config().k_max;
    if let Some(gap) = kept.windows(2).find(|w| w[1] - w[0] > k_max + 1) {
        return Err(LedgerError::PolicyDenied {
            chain: state.chain_id.clone(),
            operation: "prune_snapshots".into(),
            reason: format!("pruning would leave ticks {}..{} beyond k_max {k_max}", gap[0] + k_max + 1, gap[1]),
        });
    }
    let mut demotions = Vec::with_capacity(pruned.len());
    for tick in &pruned {
        demotions.push((*tick, ledger.check_demotion(state, *tick)?));
    }
    for (tick, anchor) in &demotions {
        ledger.commit_demotion(state, *tick, anchor)?;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunable_keeps_first_last_and_every_nth() {
        let live = [0, 20, 40, 60, 80, 100, 120];
        assert_eq!(select_prunable(&live, 2), vec![20, 60, 100]);
        assert_eq!(select_prunable(&live, 3), vec![20, 40, 80, 100]);
        assert_eq!(select_prunable(&live, 1), Vec::<Tick>::new());
        assert_eq!(select_prunable(&[0, 5], 10), Vec::<Tick>::new());
    }
}
