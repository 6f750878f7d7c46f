//! Safety checks run before a compaction commits.

use std::ops::RangeInclusive;

use hol_cbor::Hash;
use serde::{Deserialize, Serialize};

use super::trajectory::{ForbiddenZones, path_zones, segment_zones};
use crate::tick::Tick;

/// One delta as the causal check sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaLink {
    pub tick: Tick,
    pub parent_hash: Hash,
    pub hash: Hash,
}

/// A chain's history before or after a compaction.
#[derive(Debug, Clone, Default)]
pub struct HistoryView {
    pub base_tick: Tick,
    pub base_hash: Hash,
    pub deltas: Vec<DeltaLink>,
    /// Ticks of anchors whose snapshot is (or would remain) present.
    pub live_anchors: Vec<Tick>,
    /// Trajectory over the compacted range and the tick of each point.
    pub path: Vec<Vec<f64>>,
    pub path_ticks: Vec<Tick>,
}

impl HistoryView {
    pub fn head_tick(&self) -> Tick {
        self.deltas.last().map_or(self.base_tick, |d| d.tick)
    }
}

pub struct InvariantContext<'a> {
    pub k_max: u64,
    /// Ticks whose reachability is checked.
    pub range: RangeInclusive<Tick>,
    pub zones: &'a dyn ForbiddenZones,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantReport {
    pub causal_chain_intact: bool,
    pub homotopy_preserved: bool,
    pub reachability_bound: bool,
}

impl InvariantReport {
    pub fn all_hold(&self) -> bool {
        self.causal_chain_intact && self.homotopy_preserved && self.reachability_bound
    }

    pub fn failures(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.causal_chain_intact {
            failed.push("causal_chain_intact");
        }
        if !self.homotopy_preserved {
            failed.push("homotopy_preserved");
        }
        if !self.reachability_bound {
            failed.push("reachability_bound");
        }
        failed
    }
}

pub fn verify_invariants(before: &HistoryView, after: &HistoryView, ctx: &InvariantContext<'_>) -> InvariantReport {
    InvariantReport {
        causal_chain_intact: causal_chain_intact(before, after),
        homotopy_preserved: homotopy_preserved(before, after, ctx.zones),
        reachability_bound: reachability_bound(before, after, ctx),
    }
}

/// No delta removed or altered, and every parent link still resolves.
fn causal_chain_intact(before: &HistoryView, after: &HistoryView) -> bool {
    if before.deltas != after.deltas || before.base_hash != after.base_hash {
        return false;
    }
    let mut prev = after.base_hash;
    let mut tick = after.base_tick;
    for link in &after.deltas {
        if link.parent_hash != prev || link.tick != tick + 1 {
            return false;
        }
        prev = link.hash;
        tick = link.tick;
    }
    true
}

/// The simplified path keeps both endpoints, keeps points in order, and no
/// retained chord enters a zone the original sub-path avoided.
fn homotopy_preserved(before: &HistoryView, after: &HistoryView, zones: &dyn ForbiddenZones) -> bool {
    if before.path.len() != before.path_ticks.len() || after.path.len() != after.path_ticks.len() {
        return false;
    }
    if before.path.is_empty() {
        return after.path.is_empty();
    }
    if after.path_ticks.first() != before.path_ticks.first() || after.path_ticks.last() != before.path_ticks.last() {
        return false;
    }
    let mut indices = Vec::with_capacity(after.path_ticks.len());
    for (tick, point) in after.path_ticks.iter().zip(&after.path) {
        let Some(i) = before.path_ticks.iter().position(|t| t == tick) else {
            return false;
        };
        if &before.path[i] != point || indices.last().is_some_and(|last| *last >= i) {
            return false;
        }
        indices.push(i);
    }
    let segments = segment_zones(&before.path, zones);
    indices.windows(2).all(|w| {
        let (start, end) = (w[0], w[1]);
        end == start + 1 || zones.crossed(&before.path[start], &before.path[end]).is_subset(&path_zones(&segments, start, end))
    })
}

/// Every tick reachable before (a live anchor within `k_max` deltas at or
/// below it) is still reachable after.
fn reachability_bound(before: &HistoryView, after: &HistoryView, ctx: &InvariantContext<'_>) -> bool {
    let head = before.head_tick().min(*ctx.range.end());
    let start = (*ctx.range.start()).max(before.base_tick);
    (start..=head).all(|tick| !reachable(&before.live_anchors, tick, ctx.k_max) || reachable(&after.live_anchors, tick, ctx.k_max))
}

fn reachable(live_anchors: &[Tick], tick: Tick, k_max: u64) -> bool {
    let idx = live_anchors.partition_point(|a| *a <= tick);
    idx > 0 && tick - live_anchors[idx - 1] <= k_max
}
