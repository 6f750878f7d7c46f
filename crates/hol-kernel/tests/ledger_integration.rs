use std::sync::{Arc, Barrier};

use hol_kernel::{
    CancelToken, DeterminismTier, LedgerConfig, LedgerError, MaterializeOptions, MemJournal,
    OpKind, Params, ReceiptStatus, ReconstructOptions, StateVector, TransformOp,
};
use hol_store::{MemStore, Store};
use hol_testkit::{
    append_at_head, append_walk, config_with_threshold, fake_hash, ledger_on, mem_ledger, mem_ledger_with, spawn,
    translate,
};

/// 150 deltas against a threshold of 100 anchor exactly once, at tick 100.
#[test]
fn chain_length_threshold_promotes_at_tick_100() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "walker", DeterminismTier::D1, 3);
    let chain = &holon.chain_id;

    append_walk(&ledger, chain, 150).unwrap();

    assert_eq!(ledger.head(chain).unwrap().0, 150);
    assert_eq!(ledger.live_anchor_ticks(chain).unwrap(), vec![0, 100]);
    let anchor = ledger
        .anchors(chain)
        .unwrap()
        .into_iter()
        .find(|info| info.anchor.tick == 100)
        .unwrap();
    assert_eq!(
        anchor.anchor.state_hash,
        ledger.reconstruct_state(chain, 100).unwrap().state_hash()
    );

    // The counter restarted at 100: fifty more deltas promote at 200.
    append_walk(&ledger, chain, 51).unwrap();
    assert_eq!(ledger.live_anchor_ticks(chain).unwrap(), vec![0, 100, 200]);
}

/// Anchors {0,100,200,300,400}, k_max 150: tick 500 replays from 400, and is
/// unreachable once 400's snapshot is gone.
#[test]
fn reconstruct_uses_nearest_anchor_within_k_max() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "walker", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    append_walk(&ledger, chain, 500).unwrap();
    assert_eq!(ledger.live_anchor_ticks(chain).unwrap(), vec![0, 100, 200, 300, 400]);

    let head = ledger.head_state(chain).unwrap();
    assert_eq!(ledger.reconstruct_state(chain, 500).unwrap(), head);

    let demoted = ledger.demote_anchor(chain, 400).unwrap();
    assert_eq!(demoted.tick, 400);
    assert!(!ledger.store().has_blob(demoted.state_snapshot).unwrap());
    assert_eq!(ledger.live_anchor_ticks(chain).unwrap(), vec![0, 100, 200, 300]);
    // The anchor record and every delta survive demotion.
    assert_eq!(ledger.anchors(chain).unwrap().len(), 5);
    assert_eq!(ledger.delta_count(chain).unwrap(), 500);

    let err = ledger.reconstruct_state(chain, 500).unwrap_err();
    assert!(matches!(err, LedgerError::UnreachableState { tick: 500, .. }), "{err}");
    assert!(!err.retryable());

    // 450 is exactly k_max past 300.
    let at_450 = ledger.reconstruct_state(chain, 450).unwrap();
    assert_eq!(at_450.len(), 2);
}

#[test]
fn reconstruct_rejects_targets_outside_the_chain() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "walker", DeterminismTier::D1, 2);
    append_walk(&ledger, &holon.chain_id, 10).unwrap();

    let err = ledger.reconstruct_state(&holon.chain_id, 11).unwrap_err();
    assert!(matches!(err, LedgerError::UnreachableState { tick: 11, .. }));

    let rejected = ledger
        .receipts_for(&holon.chain_id)
        .into_iter()
        .rev()
        .find(|r| r.op_kind == "reconstruct_state")
        .unwrap();
    assert_eq!(
        rejected.status,
        ReceiptStatus::Rejected {
            code: "unreachable_state".into(),
            message: err.to_string(),
        }
    );
}

#[test]
fn stale_parent_is_out_of_order() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    let (_, parent) = ledger.head(chain).unwrap();

    let (op, params) = translate(vec![0.1, 0.0]);
    let first = ledger.append_delta(chain, parent, op.clone(), params.clone()).unwrap();
    assert_eq!(first.tick, 1);

    let err = ledger.append_delta(chain, parent, op.clone(), params.clone()).unwrap_err();
    match &err {
        LedgerError::OutOfOrderDelta { head_tick, tick, .. } => {
            assert_eq!(*head_tick, 1);
            assert_eq!(*tick, 1);
        }
        other => panic!("expected OutOfOrderDelta, got {other}"),
    }
    assert!(err.retryable());

    // Retrying against the fresh head succeeds.
    let (_, head) = ledger.head(chain).unwrap();
    assert_eq!(ledger.append_delta(chain, head, op, params).unwrap().tick, 2);
}

#[test]
fn concurrent_appends_on_one_parent_admit_exactly_one() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    let (_, parent) = ledger.head(chain).unwrap();
    let barrier = Barrier::new(2);

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = [0.1, 0.2]
            .into_iter()
            .map(|dx| {
                let (ledger, barrier) = (&ledger, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    ledger.append_delta(chain, parent, TransformOp::pure("translate"), Params::new(vec![dx, 0.0]))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(loser, LedgerError::OutOfOrderDelta { .. }), "{loser}");
    assert_eq!(ledger.head(chain).unwrap().0, 1);
}

#[test]
fn d0_materialize_round_trips_bit_exact() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "exact", DeterminismTier::D0, 4);
    let chain = &holon.chain_id;
    for i in 0..37 {
        let step = vec![0.1 * i as f64, -0.03, 1e-7, 0.0];
        append_at_head(&ledger, chain, translate(step)).unwrap();
    }

    let anchor = ledger.materialize(chain).unwrap();
    assert_eq!(anchor.tick, 37);
    let replayed = ledger.reconstruct_state(chain, anchor.tick).unwrap();
    assert_eq!(replayed.state_hash(), anchor.state_hash);
    assert_eq!(replayed, ledger.head_state(chain).unwrap());

    // Materializing an anchored head returns the existing anchor.
    assert_eq!(ledger.materialize(chain).unwrap(), anchor);
}

#[test]
fn d0_rejects_sampled_and_over_budget_ops() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "exact", DeterminismTier::D0, 2);
    let chain = &holon.chain_id;
    let (_, head) = ledger.head(chain).unwrap();

    let err = ledger
        .append_delta(chain, head, TransformOp::new("set", OpKind::Sampled), Params::new(vec![0.1, 0.1]))
        .unwrap_err();
    assert!(matches!(err, LedgerError::DeterminismViolation { .. }), "{err}");

    let err = ledger
        .append_delta(chain, head, TransformOp::pure("translate"), Params::new(vec![f64::NAN, 0.0]))
        .unwrap_err();
    assert!(matches!(err, LedgerError::DeterminismViolation { .. }), "{err}");
    assert_eq!(ledger.head(chain).unwrap().0, 0);
}

#[test]
fn materialize_checks_expectations() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    append_walk(&ledger, chain, 5).unwrap();
    let expected = ledger.head_state(chain).unwrap().state_hash();

    let anchor = ledger
        .materialize_with(
            chain,
            MaterializeOptions {
                expected_state: Some(expected),
                ..MaterializeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(anchor.state_hash, expected);

    append_walk(&ledger, chain, 1).unwrap();
    let err = ledger
        .materialize_with(
            chain,
            MaterializeOptions {
                expected_state: Some(fake_hash(1)),
                ..MaterializeOptions::default()
            },
        )
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(ledger.is_quarantined(chain).unwrap());
    assert!(matches!(
        append_walk(&ledger, chain, 1).unwrap_err(),
        LedgerError::ChainQuarantined { .. }
    ));
}

#[test]
fn cancelled_materialize_persists_nothing() {
    let store = Arc::new(MemStore::new());
    let ledger = ledger_on(store.clone(), Box::new(MemJournal::new()), LedgerConfig::default());
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    append_walk(&ledger, chain, 20).unwrap();
    let blobs = store.blob_count();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = ledger
        .materialize_with(
            chain,
            MaterializeOptions {
                cancel: Some(cancel.clone()),
                ..MaterializeOptions::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled(_)), "{err}");
    assert_eq!(ledger.live_anchor_ticks(chain).unwrap(), vec![0]);
    assert_eq!(store.blob_count(), blobs);
    assert!(!ledger.is_quarantined(chain).unwrap());

    let err = ledger
        .reconstruct_state_with(chain, 20, &ReconstructOptions { cancel: Some(cancel) })
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled(_)));
}

#[test]
fn tampered_snapshot_quarantines_the_chain() {
    let store = Arc::new(MemStore::new());
    let ledger = ledger_on(store.clone(), Box::new(MemJournal::new()), config_with_threshold(10));
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    append_walk(&ledger, chain, 15).unwrap();
    let anchor = ledger
        .anchors(chain)
        .unwrap()
        .into_iter()
        .find(|info| info.anchor.tick == 10)
        .unwrap()
        .anchor;

    store.tamper_blob(anchor.state_snapshot, vec![0xde, 0xad]);
    let err = ledger.reconstruct_state(chain, 12).unwrap_err();
    assert!(matches!(err, LedgerError::CorruptedHistory { .. }), "{err}");
    assert!(ledger.is_quarantined(chain).unwrap());

    // Reads of the quarantined chain still work from an intact anchor.
    let at_5 = ledger.reconstruct_state(chain, 5).unwrap();
    assert_eq!(at_5.len(), 2);
    let err = append_walk(&ledger, chain, 1).unwrap_err();
    assert!(matches!(err, LedgerError::ChainQuarantined { .. }));
}

#[test]
fn hot_reads_promote_the_head() {
    let config = LedgerConfig {
        hot_reads: 3,
        hot_min_deltas: 4,
        ..LedgerConfig::default()
    };
    let ledger = mem_ledger_with(config);
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    append_walk(&ledger, chain, 6).unwrap();

    for _ in 0..4 {
        ledger.reconstruct_state(chain, 6).unwrap();
    }
    assert_eq!(ledger.live_anchor_ticks(chain).unwrap(), vec![0, 6]);
}

#[test]
fn demotion_keeps_the_base_anchor() {
    let ledger = mem_ledger_with(config_with_threshold(10));
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    append_walk(&ledger, chain, 25).unwrap();

    let err = ledger.demote_anchor(chain, 0).unwrap_err();
    assert!(matches!(err, LedgerError::PolicyDenied { .. }), "{err}");
    let err = ledger.demote_anchor(chain, 7).unwrap_err();
    assert!(matches!(err, LedgerError::PolicyDenied { .. }), "{err}");

    ledger.demote_anchor(chain, 10).unwrap();
    let err = ledger.demote_anchor(chain, 10).unwrap_err();
    assert!(matches!(err, LedgerError::PolicyDenied { .. }), "{err}");
}

#[test]
fn every_mutation_leaves_a_receipt() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    let before = ledger.receipt_count();
    append_walk(&ledger, chain, 3).unwrap();
    ledger.materialize(chain).unwrap();
    assert_eq!(ledger.receipt_count(), before + 4);

    let receipts = ledger.receipts_for(chain);
    assert!(receipts.iter().all(|r| ledger.codec().verify(r).unwrap()));
    let appends: Vec<_> = receipts.iter().filter(|r| r.op_kind == "append_delta").collect();
    assert_eq!(appends.len(), 3);
    assert!(appends.iter().all(|r| r.status.is_ok() && r.dedupe_key.is_some()));

    // Timestamps come from the logical clock and strictly increase.
    let stamps: Vec<u64> = receipts.iter().map(|r| r.logical_timestamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));

    let err = ledger
        .append_delta(chain, fake_hash(3), TransformOp::pure("translate"), Params::new(vec![0.0, 0.0]))
        .unwrap_err();
    let last = ledger.receipts_for(chain).pop().unwrap();
    assert_eq!(last.op_kind, "append_delta");
    assert!(matches!(last.status, ReceiptStatus::Rejected { ref code, .. } if code == err.code()));
}

#[test]
fn engine_failure_is_rejected_without_advancing() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "a", DeterminismTier::D1, 2);
    let chain = &holon.chain_id;
    let (_, head) = ledger.head(chain).unwrap();
    let err = ledger
        .append_delta(chain, head, TransformOp::pure("fail"), Params::default())
        .unwrap_err();
    assert!(matches!(err, LedgerError::Engine(_)), "{err}");
    assert_eq!(ledger.head(chain).unwrap(), (0, head));
    assert_eq!(ledger.head_state(chain).unwrap(), StateVector::new(vec![0.0, 0.0]));
}

#[test]
fn debug_output_lists_chains() {
    let ledger = mem_ledger();
    let holon = spawn(&ledger, "walker", DeterminismTier::D1, 2);
    let text = format!("{ledger:?}");
    assert!(text.starts_with("StateLedger"), "{text}");
    assert!(text.contains(holon.chain_id.as_str()), "{text}");
}
