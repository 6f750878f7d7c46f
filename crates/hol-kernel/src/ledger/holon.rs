use super::*;

use crate::journal::ChainOpenedRecord;
use crate::merkle::merkle_root;
use crate::seed::{Namespace, SeedNode};

/// Everything needed to bring a holon and its chain into existence.
#[derive(Debug, Clone)]
pub struct HolonSpec {
    pub tier: DeterminismTier,
    pub salt: Vec<u8>,
    pub config: serde_json::Value,
    pub initial_state: StateVector,
}

impl HolonSpec {
    pub fn new(tier: DeterminismTier, initial_state: StateVector) -> Self {
        Self {
            tier,
            salt: Vec::new(),
            config: serde_json::Value::Null,
            initial_state,
        }
    }

    pub fn with_salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.salt = salt.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Arena entry for one holon. Parents are referenced by id, never owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolonRecord {
    pub holon_id: String,
    pub chain_id: ChainId,
    pub parent: Option<String>,
    pub parent_chain_id: Option<ChainId>,
    pub seed: Seed,
    pub seed_node: Option<SeedNode>,
    pub config_hash: Hash,
    pub config: serde_json::Value,
    pub children: Vec<String>,
    pub ordinal: u64,
}

impl Bundled for HolonRecord {
    fn bundle_hash(&self) -> Hash {
        Hash::of_parts(&[
            self.holon_id.as_bytes(),
            self.chain_id.as_str().as_bytes(),
            self.seed.as_bytes(),
            self.config_hash.as_bytes(),
        ])
    }

    fn state_version(&self) -> Option<Tick> {
        Some(0)
    }
}

/// An external input for [`StateLedger::record_inbound`]. `(source, sequence)`
/// identifies it; recording it twice is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundInput {
    pub source: String,
    pub sequence: u64,
    pub payload: serde_json::Value,
}

impl InboundInput {
    pub fn new(source: impl Into<String>, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            sequence,
            payload,
        }
    }
}

/// A message delivered across chains, stamped with both chains' ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateMessage {
    pub sender: ChainId,
    pub receiver: ChainId,
    pub sender_tick: Tick,
    pub receiver_tick: Tick,
    /// Inbound receipt on the receiving chain.
    pub rid: Hash,
}

/// Chain parameters resolved before a chain is journaled.
pub(crate) struct NewChain {
    pub holon_id: String,
    pub parent: Option<String>,
    pub parent_chain_id: Option<ChainId>,
    pub tier: DeterminismTier,
    pub seed: Seed,
    pub seed_node: Option<SeedNode>,
    pub seed_path: Vec<SeedNode>,
    pub config: serde_json::Value,
    pub base_state: StateVector,
    /// Start from an existing checkpoint instead of a fresh genesis anchor.
    pub base: Option<Anchor>,
}

impl<S: Store + 'static> StateLedger<S> {
    /// Spawn a top-level holon of run `run_id`. Its seed derives from the run's
    /// recorded root seed at the current logical time.
    pub fn spawn_root(&self, run_id: &str, entity_id: &str, spec: HolonSpec) -> LedgerResult<HolonRecord> {
        let holon_id = format!("{run_id}/{}:{entity_id}", Namespace::Holon);
        let audit = self.audit(
            "spawn",
            &ChainId::new(holon_id.as_str()),
            &serde_json::json!({
                "run_id": run_id,
                "entity_id": entity_id,
                "tier": spec.tier,
                "salt": hex::encode(&spec.salt),
                "config": &spec.config,
            }),
        );
        let tier = spec.tier;
        let result = self
            .seeds
            .root_seed(run_id)
            .ok_or_else(|| LedgerError::MissingParentSeed(run_id.to_string()))
            .and_then(|root| {
                let node = SeedNode::derive(&root, Namespace::Holon, entity_id, self.clock.now(), spec.salt);
                self.open_chain(NewChain {
                    holon_id: holon_id.clone(),
                    parent: None,
                    parent_chain_id: None,
                    tier: spec.tier,
                    seed: node.derived_seed,
                    seed_node: Some(node),
                    seed_path: Vec::new(),
                    config: spec.config,
                    base_state: spec.initial_state,
                    base: None,
                })
            });
        self.finish(audit, Some(tier), result)
    }

    /// Spawn a holon under `parent`, seeded from the parent's seed at the
    /// parent's current head tick.
    pub fn spawn_child(
        &self,
        parent: &str,
        namespace: &str,
        entity_id: &str,
        spec: HolonSpec,
    ) -> LedgerResult<HolonRecord> {
        let holon_id = format!("{parent}/{namespace}:{entity_id}");
        let audit = self.audit(
            "spawn",
            &ChainId::new(holon_id.as_str()),
            &serde_json::json!({
                "parent": parent,
                "namespace": namespace,
                "entity_id": entity_id,
                "tier": spec.tier,
                "salt": hex::encode(&spec.salt),
                "config": &spec.config,
            }),
        );
        let tier = spec.tier;
        let result = self.spawn_child_inner(parent, namespace, entity_id, holon_id, spec);
        self.finish(audit, Some(tier), result)
    }

    fn spawn_child_inner(
        &self,
        parent: &str,
        namespace: &str,
        entity_id: &str,
        holon_id: String,
        spec: HolonSpec,
    ) -> LedgerResult<HolonRecord> {
        let namespace: Namespace = namespace.parse()?;
        let parent_record = self.holon(parent)?;
        let creation_tick = self.cell(&parent_record.chain_id)?.read().head_tick;
        let node = SeedNode::derive(&parent_record.seed, namespace, entity_id, creation_tick, spec.salt);
        self.open_chain(NewChain {
            holon_id,
            parent: Some(parent_record.holon_id),
            parent_chain_id: Some(parent_record.chain_id),
            tier: spec.tier,
            seed: node.derived_seed,
            seed_node: Some(node),
            seed_path: Vec::new(),
            config: spec.config,
            base_state: spec.initial_state,
            base: None,
        })
    }

    pub fn holon(&self, holon_id: &str) -> LedgerResult<HolonRecord> {
        self.holons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(holon_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownHolon(holon_id.to_string()))
    }

    pub fn holon_ids(&self) -> Vec<String> {
        self.holons
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Seed derivations from the run root down to `holon_id`, root first.
    pub fn seed_path(&self, holon_id: &str) -> LedgerResult<Vec<SeedNode>> {
        let holons = self.holons.read().unwrap_or_else(PoisonError::into_inner);
        let mut path = Vec::new();
        let mut next = Some(holon_id.to_string());
        while let Some(id) = next {
            let record = holons.get(&id).ok_or_else(|| LedgerError::UnknownHolon(id.clone()))?;
            if let Some(node) = &record.seed_node {
                path.push(node.clone());
            }
            next = record.parent.clone();
        }
        path.reverse();
        Ok(path)
    }

    /// Journal and install a new chain. The holon arena lock is held across the
    /// existence check and the journal write so an id is opened only once.
    pub(crate) fn open_chain(&self, new: NewChain) -> LedgerResult<HolonRecord> {
        let mut holons = self.holons.write().unwrap_or_else(PoisonError::into_inner);
        if holons.contains_key(&new.holon_id) {
            return Err(LedgerError::HolonExists(new.holon_id));
        }
        let chain_id = ChainId::new(new.holon_id.as_str());
        let config_hash = self.codec.canonical_hash(&new.config)?;
        let state_hash = new.base_state.state_hash();
        let base = match new.base {
            Some(anchor) => anchor,
            None => {
                let blob = SnapshotBlob::encode(&chain_id, 0, &new.base_state)?;
                let snapshot = self.store.put_blob(&blob)?;
                let head = genesis_hash(&chain_id, &new.seed, &config_hash, &state_hash)?;
                Anchor::new(&chain_id, 0, snapshot, merkle_root(&[]), state_hash, head)
            }
        };
        if base.state_hash != state_hash {
            return Err(LedgerError::corrupted(&chain_id, "base state does not match its anchor"));
        }
        let record = ChainOpenedRecord {
            chain_id,
            holon_id: new.holon_id,
            parent_holon: new.parent,
            parent_chain_id: new.parent_chain_id,
            ordinal: self.allocate_ordinal(),
            tier: new.tier,
            seed: new.seed,
            seed_node: new.seed_node,
            seed_path: new.seed_path,
            config_hash,
            config: new.config,
            verifying_key: signing::ChainSigner::from_seed(&new.seed).verifying_key_bytes().to_vec(),
            base,
        };
        self.journal_record(&LedgerRecord::ChainOpened(record.clone()))?;
        let base_tick = record.base.tick;
        let holon = self.install_chain(&mut holons, record, new.base_state);
        log::info!(
            "opened chain {} with seed {} (tier {}, base tick {base_tick})",
            holon.chain_id,
            holon.seed.as_hash().short(),
            new.tier,
        );
        Ok(holon)
    }

    /// Apply a journaled chain opening to the in-memory maps.
    pub(crate) fn install_chain(
        &self,
        holons: &mut BTreeMap<String, HolonRecord>,
        record: ChainOpenedRecord,
        base_state: StateVector,
    ) -> HolonRecord {
        let mut state = ChainState::new(
            record.chain_id.clone(),
            record.holon_id.clone(),
            record.tier,
            record.seed,
            record.config_hash,
            record.base.clone(),
            base_state,
            self.clock.now(),
        );
        state.seed_recorded = self.seed_is_recorded(holons, &record);
        if !state.seed_recorded {
            log::warn!("seed of {} does not trace to a recorded root", record.chain_id);
        }
        self.next_ordinal.fetch_max(record.ordinal + 1, Ordering::SeqCst);
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.chain_id.clone(), Arc::new(ChainCell::new(record.ordinal, state)));

        if let Some(parent) = record.parent_holon.as_ref().and_then(|p| holons.get_mut(p)) {
            parent.children.push(record.holon_id.clone());
        }
        let holon = HolonRecord {
            holon_id: record.holon_id,
            chain_id: record.chain_id,
            parent: record.parent_holon,
            parent_chain_id: record.parent_chain_id,
            seed: record.seed,
            seed_node: record.seed_node,
            config_hash: record.config_hash,
            config: record.config,
            children: Vec::new(),
            ordinal: record.ordinal,
        };
        holons.insert(holon.holon_id.clone(), holon.clone());
        holon
    }

    fn seed_is_recorded(&self, holons: &BTreeMap<String, HolonRecord>, record: &ChainOpenedRecord) -> bool {
        let Some(node) = &record.seed_node else {
            return false;
        };
        if !node.verify() || node.derived_seed != record.seed {
            return false;
        }
        let run_id = record.holon_id.split('/').next().unwrap_or_default();
        let root = self.seeds.root_seed(run_id);
        if !record.seed_path.is_empty() {
            return verify_seed_path(root, &record.seed_path, &record.seed);
        }
        match &record.parent_holon {
            Some(parent) => holons.get(parent).is_some_and(|p| p.seed == node.parent_seed_ref),
            None => root == Some(node.parent_seed_ref),
        }
    }

    /// Materialize a holon and all of its descendants. Chain locks are taken
    /// in creation order and held until every anchor is written.
    pub fn checkpoint_family(&self, holon_id: &str) -> LedgerResult<Vec<Anchor>> {
        let root = self.holon(holon_id)?;
        let audit = self.audit("checkpoint_family", &root.chain_id, &serde_json::json!({ "holon": holon_id }));
        let result = self.family_chains(holon_id).and_then(|chains| {
            let cells = self.cells_in_lock_order(&chains)?;
            let mut guards: Vec<_> = cells.iter().map(|cell| cell.write()).collect();
            let mut anchors = Vec::new();
            for state in guards.iter_mut() {
                if !state.tier.supports_anchors() {
                    log::debug!("skipping {} in family checkpoint: tier {}", state.chain_id, state.tier);
                    continue;
                }
                anchors.push(self.materialize_locked(state, &MaterializeOptions::default())?);
            }
            Ok(anchors)
        });
        let tier = self.tier(&root.chain_id).ok();
        self.finish(audit, tier, result)
    }

    fn family_chains(&self, holon_id: &str) -> LedgerResult<Vec<ChainId>> {
        let holons = self.holons.read().unwrap_or_else(PoisonError::into_inner);
        let mut chains = Vec::new();
        let mut stack = vec![holon_id.to_string()];
        while let Some(id) = stack.pop() {
            let record = holons.get(&id).ok_or_else(|| LedgerError::UnknownHolon(id.clone()))?;
            chains.push(record.chain_id.clone());
            stack.extend(record.children.iter().cloned());
        }
        Ok(chains)
    }

    /// Deliver `payload` from one chain to another. The receiver records an
    /// inbound receipt keyed by the sender's head tick and appends a gate delta
    /// consuming it; resending at the same sender tick returns the first
    /// delivery.
    pub fn send_gate(&self, from: &ChainId, to: &ChainId, payload: serde_json::Value) -> LedgerResult<GateMessage> {
        let sender_tick = self.cell(from)?.read().head_tick;
        let input = InboundInput::new(format!("gate:{from}"), sender_tick, payload);
        let outcome = self.record_inbound_outcome(to, input)?;
        let rid = outcome.receipt().rid;
        if outcome.is_duplicate() {
            let cell = self.cell(to)?;
            let state = cell.read();
            if let Some(delta) = state.deltas.iter().rev().find(|d| d.parameters.inputs.contains(&rid)) {
                return Ok(GateMessage {
                    sender: from.clone(),
                    receiver: to.clone(),
                    sender_tick,
                    receiver_tick: delta.tick,
                    rid,
                });
            }
        }
        let (_, head) = self.head(to)?;
        let params = Params::new(Vec::new()).with_inputs(vec![rid]);
        let delta = self.append_delta(to, head, TransformOp::gate_receive(), params)?;
        log::debug!("gate {from}@{sender_tick} -> {to}@{}", delta.tick);
        Ok(GateMessage {
            sender: from.clone(),
            receiver: to.clone(),
            sender_tick,
            receiver_tick: delta.tick,
            rid,
        })
    }

    /// Report a child's failure to its parent chain as a gate message. The
    /// only path by which one chain's error reaches another. Returns `None`
    /// for chains without a parent.
    pub fn notify_parent(&self, child: &ChainId, error: &LedgerError) -> LedgerResult<Option<GateMessage>> {
        let parent = {
            let holons = self.holons.read().unwrap_or_else(PoisonError::into_inner);
            holons
                .values()
                .find(|h| &h.chain_id == child)
                .and_then(|h| h.parent_chain_id.clone())
        };
        let Some(parent) = parent else {
            return Ok(None);
        };
        log::warn!("{child} reports {} to {parent}", error.code());
        let payload = serde_json::json!({
            "child": child,
            "code": error.code(),
            "message": error.to_string(),
            "retryable": error.retryable(),
        });
        self.send_gate(child, &parent, payload).map(Some)
    }
}

/// A derivation path is recorded when it starts at the run's recorded root,
/// each step derives from the previous one, and it ends at `seed`.
pub(crate) fn verify_seed_path(root: Option<Seed>, path: &[SeedNode], seed: &Seed) -> bool {
    let Some(mut parent) = root else {
        return false;
    };
    for node in path {
        if node.parent_seed_ref != parent || !node.verify() {
            return false;
        }
        parent = node.derived_seed;
    }
    !path.is_empty() && parent == *seed
}
