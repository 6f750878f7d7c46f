use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, ensure};
use hol_kernel::compaction::TrajectorySummary;
use hol_kernel::journal::JournalKind;
use hol_kernel::{
    ChainId, CompactionParams, CompactionTrigger, Compactor, DeterminismTier, ForbiddenZones,
    HolonSpec, HyperbolicBallZones, LedgerConfig, LedgerError, MemJournal, ReceiptStatus, StateVector, Zone,
    compact_trajectory, prune_snapshots,
};
use hol_store::{MemStore, Store};
use hol_testkit::{
    RUN_ID, TestLedger, append_path, append_walk, config_with_threshold, ledger_on, mem_ledger_with, spawn,
};
use proptest::prelude::*;

/// Threshold 20 with reads that never promote, so anchors stay at 0, 20, 40, 60.
fn compaction_config(k_max: u64) -> LedgerConfig {
    LedgerConfig {
        k_max,
        hot_reads: 1000,
        ..config_with_threshold(20)
    }
}

/// Out along the x axis to 0.4 and back to the origin in 80 steps.
fn out_and_back() -> Vec<Vec<f64>> {
    (1..=80)
        .map(|i| {
            let x = if i <= 40 { 0.01 * i as f64 } else { 0.4 - 0.01 * (i - 40) as f64 };
            vec![x, 0.0]
        })
        .collect()
}

fn ledger_with_path(k_max: u64) -> Result<(TestLedger, ChainId)> {
    let ledger = mem_ledger_with(compaction_config(k_max));
    let chain = spawn(&ledger, "walker", DeterminismTier::D1, 2).chain_id;
    append_path(&ledger, &chain, &out_and_back())?;
    ensure!(ledger.live_anchor_ticks(&chain)? == vec![0, 20, 40, 60]);
    Ok((ledger, chain))
}

fn whole_chain(trigger: CompactionTrigger) -> CompactionParams {
    CompactionParams::from_config(&LedgerConfig::default().compaction, trigger)
}

#[test]
fn compaction_prunes_snapshots_and_preserves_every_state() -> Result<()> {
    let (ledger, chain) = ledger_with_path(50)?;
    let before: Vec<StateVector> = (0..=80)
        .map(|t| ledger.reconstruct_state(&chain, t))
        .collect::<Result<_, _>>()?;
    let deltas = ledger.delta_count(&chain)?;

    let record = Compactor::default().compact(&ledger, &chain, &whole_chain(CompactionTrigger::PeriodicSweep))?;

    ensure!(record.original_range == (0, 80));
    ensure!(record.pruned_anchors == vec![20]);
    ensure!(record.retained_ticks == vec![0, 40, 80], "{:?}", record.retained_ticks);
    ensure!(record.invariant_proofs.all_hold());
    ensure!(ledger.live_anchor_ticks(&chain)? == vec![0, 40, 60]);
    ensure!(ledger.delta_count(&chain)? == deltas);

    // The demoted anchor is still listed, just without a live snapshot.
    let demoted = ledger.anchors(&chain)?.into_iter().find(|a| a.anchor.tick == 20);
    ensure!(demoted.is_some_and(|a| !a.live));

    for (tick, expected) in before.iter().enumerate() {
        ensure!(&ledger.reconstruct_state(&chain, tick as u64)? == expected, "tick {tick} changed");
    }

    let summary: TrajectorySummary = ledger.store().get_node(record.trajectory_ref)?;
    ensure!(summary.ticks == record.retained_ticks);
    ensure!(summary.points == vec![vec![0.0, 0.0], vec![0.4, 0.0], vec![0.0, 0.0]]);
    ensure!(ledger.compactions(&chain)? == vec![record]);
    Ok(())
}

#[test]
fn compaction_that_would_strand_states_aborts() -> Result<()> {
    // With k_max 30, dropping anchor 20 leaves ticks 31..39 out of reach.
    let (ledger, chain) = ledger_with_path(30)?;
    let head = ledger.head(&chain)?;

    let err = Compactor::default()
        .compact(&ledger, &chain, &whole_chain(CompactionTrigger::LedgerSize))
        .unwrap_err();
    match &err {
        LedgerError::CorruptedHistory { detail, .. } => ensure!(detail.contains("reachability_bound"), "{detail}"),
        other => anyhow::bail!("expected CorruptedHistory, got {other}"),
    }

    ensure!(!ledger.is_quarantined(&chain)?);
    ensure!(ledger.live_anchor_ticks(&chain)? == vec![0, 20, 40, 60]);
    ensure!(ledger.head(&chain)? == head);
    ensure!(ledger.compactions(&chain)?.is_empty());
    let last = ledger.receipts_for(&chain).pop().expect("compaction receipt");
    ensure!(last.op_kind == "compact");
    ensure!(matches!(last.status, ReceiptStatus::Rejected { .. }));
    Ok(())
}

#[test]
fn statistical_chains_are_not_compacted() -> Result<()> {
    let ledger = mem_ledger_with(compaction_config(50));
    let chain = spawn(&ledger, "swarm", DeterminismTier::D2, 2).chain_id;
    let err = Compactor::default()
        .compact(&ledger, &chain, &whole_chain(CompactionTrigger::PeriodicSweep))
        .unwrap_err();
    ensure!(matches!(err, LedgerError::PolicyDenied { .. }), "{err}");
    ensure!(Compactor::default().due(&ledger, &chain)?.is_none());
    Ok(())
}

#[test]
fn range_outside_the_chain_is_unreachable() -> Result<()> {
    let (ledger, chain) = ledger_with_path(50)?;
    let params = whole_chain(CompactionTrigger::PeriodicSweep).with_range(10, 500);
    let err = Compactor::default().compact(&ledger, &chain, &params).unwrap_err();
    ensure!(matches!(err, LedgerError::UnreachableState { .. }), "{err}");
    Ok(())
}

#[test]
fn zone_aware_compaction_keeps_the_detour() -> Result<()> {
    let ledger = mem_ledger_with(compaction_config(50));
    let chain = ledger
        .spawn_root(RUN_ID, "rover", HolonSpec::new(DeterminismTier::D1, StateVector::new(vec![0.0, 0.0])))?
        .chain_id;
    // Around a zone centred on (0.25, 0) instead of through it.
    append_path(&ledger, &chain, &[vec![0.1, 0.2], vec![0.25, 0.25], vec![0.4, 0.2], vec![0.5, 0.0]])?;
    let zones = HyperbolicBallZones::new([Zone {
        center: vec![0.25, 0.0],
        radius: 0.1,
    }]);
    let params = CompactionParams {
        epsilon: 10.0,
        ..whole_chain(CompactionTrigger::PeriodicSweep)
    };

    let guarded = Compactor::new(Box::new(zones)).compact(&ledger, &chain, &params)?;
    ensure!(guarded.retained_ticks == vec![0, 1, 2, 3, 4]);

    let loose = Compactor::default().compact(&ledger, &chain, &params)?;
    ensure!(loose.retained_ticks == vec![0, 4]);
    ensure!(ledger.compactions(&chain)?.len() == 2);
    Ok(())
}

#[test]
fn sweep_compacts_only_chains_that_are_due() -> Result<()> {
    let config = LedgerConfig {
        compaction: hol_kernel::CompactionConfig {
            size_threshold: 50,
            ..hol_kernel::CompactionConfig::default()
        },
        ..compaction_config(50)
    };
    let ledger = mem_ledger_with(config);
    let big = spawn(&ledger, "big", DeterminismTier::D1, 2).chain_id;
    let small = spawn(&ledger, "small", DeterminismTier::D1, 2).chain_id;
    append_path(&ledger, &big, &out_and_back())?;
    append_walk(&ledger, &small, 5)?;

    let compactor = Compactor::default();
    ensure!(compactor.due(&ledger, &big)? == Some(CompactionTrigger::LedgerSize));
    ensure!(compactor.due(&ledger, &small)?.is_none());

    let results = compactor.sweep(&ledger);
    ensure!(results.len() == 1);
    let (chain, result) = &results[0];
    ensure!(chain == &big);
    ensure!(result.as_ref().is_ok_and(|r| r.trigger == CompactionTrigger::LedgerSize));
    ensure!(ledger.compactions(&small)?.is_empty());
    Ok(())
}

#[test]
fn prune_snapshots_respects_k_max() -> Result<()> {
    let (ledger, chain) = ledger_with_path(50)?;
    ensure!(prune_snapshots(&ledger, &chain, 2)? == vec![20]);
    ensure!(ledger.live_anchor_ticks(&chain)? == vec![0, 40, 60]);

    let (strict, chain) = ledger_with_path(30)?;
    let err = prune_snapshots(&strict, &chain, 2).unwrap_err();
    ensure!(matches!(err, LedgerError::PolicyDenied { .. }), "{err}");
    ensure!(strict.live_anchor_ticks(&chain)? == vec![0, 20, 40, 60]);
    Ok(())
}

fn zones_on(zones: &HyperbolicBallZones, points: &[Vec<f64>], start: usize, end: usize) -> BTreeSet<usize> {
    points[start..=end]
        .windows(2)
        .flat_map(|w| zones.crossed(&w[0], &w[1]))
        .collect()
}

fn ball_point() -> impl Strategy<Value = Vec<f64>> {
    (0.0..0.8f64, 0.0..std::f64::consts::TAU).prop_map(|(r, theta)| vec![r * theta.cos(), r * theta.sin()])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// No retained chord enters a zone the sub-path it replaces stayed out of.
    #[test]
    fn retained_chords_never_cut_through_new_zones(
        points in proptest::collection::vec(ball_point(), 2..40),
        centres in proptest::collection::vec(ball_point(), 0..4),
        radius in 0.05..0.4f64,
        epsilon in 0.0..0.5f64,
    ) {
        let zones = HyperbolicBallZones::new(centres.into_iter().map(|center| Zone { center, radius }));
        let out = compact_trajectory(&points, epsilon, &zones).unwrap();

        prop_assert_eq!(out.retained.first().copied(), Some(0));
        prop_assert_eq!(out.retained.last().copied(), Some(points.len() - 1));
        prop_assert!(out.retained.windows(2).all(|w| w[0] < w[1]));
        for w in out.retained.windows(2) {
            let chord = zones.crossed(&points[w[0]], &points[w[1]]);
            prop_assert!(chord.is_subset(&zones_on(&zones, &points, w[0], w[1])));
        }
    }
}

#[test]
fn states_outside_the_ball_keep_every_point_and_still_prune() -> Result<()> {
    let ledger = mem_ledger_with(compaction_config(50));
    let chain = spawn(&ledger, "drifter", DeterminismTier::D0, 2).chain_id;
    let path: Vec<Vec<f64>> = (1..=80).map(|i| vec![0.05 * i as f64, 0.0]).collect();
    append_path(&ledger, &chain, &path)?;
    ensure!(ledger.live_anchor_ticks(&chain)? == vec![0, 20, 40, 60]);
    let head_state = ledger.head_state(&chain)?;

    let record = Compactor::default().compact(&ledger, &chain, &whole_chain(CompactionTrigger::PeriodicSweep))?;

    ensure!(!record.trajectory_simplified);
    ensure!(record.retained_ticks == (0..=80).collect::<Vec<u64>>());
    ensure!(record.pruned_anchors == vec![20]);
    ensure!(record.invariant_proofs.all_hold());
    ensure!(ledger.live_anchor_ticks(&chain)? == vec![0, 40, 60]);
    ensure!((ledger.reconstruct_state(&chain, 30)?.as_slice()[0] - 1.5).abs() < 1e-12);
    ensure!(ledger.head_state(&chain)? == head_state);
    Ok(())
}

/// Summary and demotions commit through one journal record, and recovery
/// applies the demotions it carries.
#[test]
fn compaction_commits_in_one_journal_record() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let config = compaction_config(50);
    let ledger = ledger_on(store.clone(), Box::new(MemJournal::new()), config.clone());
    let chain = spawn(&ledger, "walker", DeterminismTier::D1, 2).chain_id;
    append_path(&ledger, &chain, &out_and_back())?;
    let written = ledger.dump_journal()?.len();

    let record = Compactor::default().compact(&ledger, &chain, &whole_chain(CompactionTrigger::PeriodicSweep))?;
    ensure!(record.pruned_anchors == vec![20]);

    let entries = ledger.dump_journal()?;
    let kinds: Vec<JournalKind> = entries[written..].iter().map(|e| e.kind).collect();
    ensure!(!kinds.contains(&JournalKind::AnchorDemoted), "{kinds:?}");
    ensure!(kinds.iter().filter(|k| **k == JournalKind::Compaction).count() == 1);

    let restored = ledger_on(store, Box::new(MemJournal::from_entries(&entries)), config);
    ensure!(restored.live_anchor_ticks(&chain)? == vec![0, 40, 60]);
    ensure!(restored.anchors(&chain)? == ledger.anchors(&chain)?);
    ensure!(restored.compactions(&chain)? == vec![record]);
    Ok(())
}
