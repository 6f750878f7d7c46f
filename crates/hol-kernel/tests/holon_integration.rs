use anyhow::{Context, Result, ensure};
use hol_kernel::policy::Transition;
use hol_kernel::{
    ChainId, DeterminismTier, EnsembleDiagnostics, HolonSpec, InboundInput, LedgerError, OpKind, Params,
    ReceiptStatus, StateVector, TransformOp, derive_seed,
};
use hol_testkit::{RUN_ID, append_at_head, append_walk, mem_ledger, root_seed, sampled, spawn};
use serde_json::json;

fn zeros(dim: usize) -> StateVector {
    StateVector::new(vec![0.0; dim])
}

#[test]
fn child_seeds_derive_from_the_parent_head() -> Result<()> {
    let ledger = mem_ledger();
    let root = spawn(&ledger, "colony", DeterminismTier::D1, 2);
    append_walk(&ledger, &root.chain_id, 3)?;

    let child = ledger.spawn_child(
        &root.holon_id,
        "agent",
        "scout",
        HolonSpec::new(DeterminismTier::D1, zeros(2)).with_salt(b"s1".to_vec()),
    )?;
    ensure!(child.holon_id == format!("{}/agent:scout", root.holon_id));
    ensure!(child.parent.as_deref() == Some(root.holon_id.as_str()));
    ensure!(child.parent_chain_id.as_ref() == Some(&root.chain_id));
    ensure!(child.seed == derive_seed(Some(&root.seed), "agent", "scout", 3, b"s1")?);
    ensure!(ledger.holon(&root.holon_id)?.children == vec![child.holon_id.clone()]);

    let path = ledger.seed_path(&child.holon_id)?;
    ensure!(path.len() == 2);
    ensure!(path[0].parent_seed_ref == root_seed());
    ensure!(path[0].derived_seed == root.seed);
    ensure!(path[1].parent_seed_ref == root.seed);
    ensure!(path[1].derived_seed == child.seed);
    ensure!(path.iter().all(|node| node.verify()));

    // Siblings with the same salt still get distinct seeds.
    let sibling = ledger.spawn_child(
        &root.holon_id,
        "agent",
        "scout-2",
        HolonSpec::new(DeterminismTier::D1, zeros(2)).with_salt(b"s1".to_vec()),
    )?;
    ensure!(sibling.seed != child.seed);
    Ok(())
}

#[test]
fn spawn_failures_are_typed_and_receipted() -> Result<()> {
    let ledger = mem_ledger();
    let root = spawn(&ledger, "colony", DeterminismTier::D1, 2);

    let err = ledger
        .spawn_root("unrecorded-run", "x", HolonSpec::new(DeterminismTier::D1, zeros(2)))
        .unwrap_err();
    ensure!(matches!(err, LedgerError::MissingParentSeed(ref run) if run == "unrecorded-run"), "{err}");
    let rejected = ledger.receipts_for(&ChainId::new("unrecorded-run/holon:x"));
    ensure!(rejected.len() == 1);
    ensure!(matches!(rejected[0].status, ReceiptStatus::Rejected { ref code, .. } if code == "missing_parent_seed"));

    let err = ledger
        .spawn_root(RUN_ID, "colony", HolonSpec::new(DeterminismTier::D1, zeros(2)))
        .unwrap_err();
    ensure!(matches!(err, LedgerError::HolonExists(_)), "{err}");

    let err = ledger
        .spawn_child(&root.holon_id, "tribe", "x", HolonSpec::new(DeterminismTier::D1, zeros(2)))
        .unwrap_err();
    ensure!(matches!(err, LedgerError::InvalidNamespace(ref ns) if ns == "tribe"), "{err}");

    let err = ledger
        .spawn_child("run-1/holon:nobody", "agent", "x", HolonSpec::new(DeterminismTier::D1, zeros(2)))
        .unwrap_err();
    ensure!(matches!(err, LedgerError::UnknownHolon(_)), "{err}");
    ensure!(ledger.holon_ids() == vec![root.holon_id]);
    Ok(())
}

#[test]
fn gate_messages_are_delivered_once_per_sender_tick() -> Result<()> {
    let ledger = mem_ledger();
    let a = spawn(&ledger, "a", DeterminismTier::D1, 2).chain_id;
    let b = spawn(&ledger, "b", DeterminismTier::D1, 2).chain_id;
    append_walk(&ledger, &a, 2)?;

    let msg = ledger.send_gate(&a, &b, json!({"hello": 1}))?;
    ensure!(msg.sender_tick == 2);
    ensure!(msg.receiver_tick == 1);
    ensure!(ledger.head_state(&b)? == zeros(2));
    let delta = ledger.delta(&b, 1)?.context("gate delta")?;
    ensure!(delta.transform_op.is_gate_receive());
    ensure!(delta.parameters.inputs == vec![msg.rid]);
    let receipt = ledger.receipt(&msg.rid).context("inbound receipt")?;
    let inbound = receipt.inbound.context("inbound payload")?;
    ensure!(inbound.source == format!("gate:{a}"));
    ensure!(inbound.sequence == 2);

    // Resending before the sender moves is a no-op.
    let receipts = ledger.receipt_count();
    ensure!(ledger.send_gate(&a, &b, json!({"hello": 1}))? == msg);
    ensure!(ledger.head(&b)?.0 == 1);
    ensure!(ledger.receipt_count() == receipts);

    append_walk(&ledger, &a, 1)?;
    let next = ledger.send_gate(&a, &b, json!({"hello": 2}))?;
    ensure!((next.sender_tick, next.receiver_tick) == (3, 2));
    ensure!(next.rid != msg.rid);
    Ok(())
}

#[test]
fn child_errors_reach_the_parent_as_gate_messages() -> Result<()> {
    let ledger = mem_ledger();
    let root = spawn(&ledger, "colony", DeterminismTier::D1, 2);
    let child = ledger.spawn_child(&root.holon_id, "agent", "worker", HolonSpec::new(DeterminismTier::D1, zeros(2)))?;

    let failure = LedgerError::Cancelled(child.chain_id.clone());
    let msg = ledger
        .notify_parent(&child.chain_id, &failure)?
        .context("child has a parent")?;
    ensure!(msg.sender == child.chain_id);
    ensure!(msg.receiver == root.chain_id);
    let payload = ledger
        .receipt(&msg.rid)
        .and_then(|r| r.inbound)
        .context("inbound payload")?
        .payload;
    ensure!(payload["code"] == json!(failure.code()));
    ensure!(payload["retryable"] == json!(failure.retryable()));
    ensure!(ledger.head(&root.chain_id)?.0 == 1);

    ensure!(ledger.notify_parent(&root.chain_id, &failure)?.is_none());
    Ok(())
}

#[test]
fn inbound_inputs_are_recorded_once() -> Result<()> {
    let ledger = mem_ledger();
    let chain = spawn(&ledger, "a", DeterminismTier::D0, 2).chain_id;

    let first = ledger.record_inbound(&chain, InboundInput::new("sensor", 7, json!({"v": 1})))?;
    let count = ledger.receipt_count();
    let again = ledger.record_inbound(&chain, InboundInput::new("sensor", 7, json!({"v": 2})))?;
    ensure!(again == first);
    ensure!(ledger.receipt_count() == count);

    let other = ledger.record_inbound(&chain, InboundInput::new("sensor", 8, json!({"v": 1})))?;
    ensure!(other.rid != first.rid);
    ensure!(ledger.head(&chain)?.0 == 0);
    Ok(())
}

#[test]
fn tier_transitions_need_evidence_to_tighten() -> Result<()> {
    let ledger = mem_ledger();
    let chain = spawn(&ledger, "a", DeterminismTier::D3, 2).chain_id;
    append_walk(&ledger, &chain, 5)?;

    let change = ledger.transition_tier(&chain, DeterminismTier::D1, None)?;
    ensure!(change.transition == Transition::Tightened);
    let change = ledger.transition_tier(&chain, DeterminismTier::D0, None)?;
    ensure!(change.transition == Transition::Tightened);
    ensure!(ledger.tier(&chain)? == DeterminismTier::D0);

    let same = ledger.transition_tier(&chain, DeterminismTier::D0, None)?;
    ensure!(same.transition == Transition::Unchanged);
    let loosened = ledger.transition_tier(&chain, DeterminismTier::D3, None)?;
    ensure!(loosened.transition == Transition::Loosened);
    Ok(())
}

#[test]
fn ambient_history_blocks_tightening() -> Result<()> {
    let ledger = mem_ledger();
    let chain = spawn(&ledger, "a", DeterminismTier::D3, 2).chain_id;
    append_walk(&ledger, &chain, 2)?;
    append_at_head(&ledger, &chain, (TransformOp::new("noop", OpKind::Ambient), Params::default()))?;

    for target in [DeterminismTier::D0, DeterminismTier::D1] {
        let err = ledger.transition_tier(&chain, target, None).unwrap_err();
        ensure!(matches!(err, LedgerError::PolicyDenied { .. }), "{err}");
    }
    ensure!(ledger.tier(&chain)? == DeterminismTier::D3);
    let last = ledger.receipts_for(&chain).pop().context("transition receipt")?;
    ensure!(last.op_kind == "transition_tier");
    ensure!(matches!(last.status, ReceiptStatus::Rejected { .. }));
    Ok(())
}

#[test]
fn statistical_tier_needs_a_usable_ensemble() -> Result<()> {
    let ledger = mem_ledger();
    let chain = spawn(&ledger, "a", DeterminismTier::D3, 2).chain_id;

    ensure!(ledger.transition_tier(&chain, DeterminismTier::D2, None).is_err());
    let single = EnsembleDiagnostics::from_samples([[0.1, 0.2].as_slice()]);
    ensure!(ledger.transition_tier(&chain, DeterminismTier::D2, Some(single)).is_err());

    let samples = [vec![0.1, 0.2], vec![0.3, 0.1], vec![0.2, 0.2]];
    let ensemble = EnsembleDiagnostics::from_samples(samples.iter().map(Vec::as_slice));
    let change = ledger.transition_tier(&chain, DeterminismTier::D2, Some(ensemble))?;
    ensure!(change.transition == Transition::Tightened);
    ensure!(ledger.tier(&chain)? == DeterminismTier::D2);
    Ok(())
}

#[test]
fn family_checkpoint_skips_statistical_children() -> Result<()> {
    let ledger = mem_ledger();
    let root = spawn(&ledger, "colony", DeterminismTier::D1, 2);
    let worker = ledger.spawn_child(&root.holon_id, "agent", "worker", HolonSpec::new(DeterminismTier::D1, zeros(2)))?;
    let swarm = ledger.spawn_child(&root.holon_id, "agent", "swarm", HolonSpec::new(DeterminismTier::D2, zeros(2)))?;
    let link = ledger.spawn_child(&worker.holon_id, "channel", "link", HolonSpec::new(DeterminismTier::D1, zeros(2)))?;

    append_walk(&ledger, &root.chain_id, 4)?;
    append_walk(&ledger, &worker.chain_id, 6)?;
    append_walk(&ledger, &link.chain_id, 3)?;
    append_at_head(&ledger, &swarm.chain_id, sampled(vec![0.1, 0.1]))?;

    let anchors = ledger.checkpoint_family(&root.holon_id)?;
    ensure!(anchors.len() == 3);
    for anchor in &anchors {
        ensure!(anchor.tick == ledger.head(&anchor.chain_id)?.0);
        ensure!(ledger.live_anchor_ticks(&anchor.chain_id)?.contains(&anchor.tick));
    }
    ensure!(anchors.iter().all(|a| a.chain_id != swarm.chain_id));
    ensure!(ledger.live_anchor_ticks(&swarm.chain_id)? == vec![0]);

    // A subtree checkpoint only touches the subtree.
    append_walk(&ledger, &root.chain_id, 1)?;
    let sub = ledger.checkpoint_family(&worker.holon_id)?;
    ensure!(sub.len() == 2);
    ensure!(ledger.live_anchor_ticks(&root.chain_id)? == vec![0, 4]);
    Ok(())
}
