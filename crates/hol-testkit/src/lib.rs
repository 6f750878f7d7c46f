//! Deterministic fixtures for exercising the state ledger: a small affine
//! transform engine, ledger builders over in-memory or on-disk backends, and
//! helpers that drive chains along paths inside the unit ball.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use hol_cbor::Hash;
use hol_kernel::{
    ChainId, Delta, DeterminismTier, EngineError, FsJournal, HolonRecord, HolonSpec, Journal,
    LedgerConfig, LedgerResult, MemJournal, OpKind, Params, RecordedSeeds, Seed, StateLedger,
    StateVector, TransformEngine, TransformOp,
};
use hol_store::{FsStore, MemStore, Store};

pub const RUN_ID: &str = "run-1";

pub type TestLedger = StateLedger<MemStore>;

/// Engine with a handful of affine operations. Operation names select the
/// behaviour; the op kind only matters to the determinism policy.
///
/// - `translate`: add `params.values` component-wise
/// - `scale`: multiply by `params.values[0]`
/// - `set`: replace the state with `params.values`
/// - `noop`: identity
/// - `fail`: always errors
#[derive(Debug, Default, Clone)]
pub struct AffineEngine {
    ulps: BTreeMap<String, u32>,
}

impl AffineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `ulps` of worst-case error for operation `name`.
    pub fn with_ulp_error(mut self, name: &str, ulps: u32) -> Self {
        self.ulps.insert(name.to_string(), ulps);
        self
    }
}

impl TransformEngine for AffineEngine {
    fn apply(&self, state: &StateVector, op: &TransformOp, params: &Params) -> Result<StateVector, EngineError> {
        match op.name.as_str() {
            "translate" => {
                if params.values.len() != state.len() {
                    return Err(EngineError(format!(
                        "translate expects {} components, got {}",
                        state.len(),
                        params.values.len()
                    )));
                }
                Ok(StateVector::new(
                    state.as_slice().iter().zip(&params.values).map(|(x, d)| x + d).collect(),
                ))
            }
            "scale" => {
                let factor = params
                    .values
                    .first()
                    .ok_or_else(|| EngineError("scale expects a factor".into()))?;
                Ok(StateVector::new(state.as_slice().iter().map(|x| x * factor).collect()))
            }
            "set" => Ok(StateVector::new(params.values.clone())),
            "noop" => Ok(state.clone()),
            "fail" => Err(EngineError("injected failure".into())),
            other => Err(EngineError(format!("unknown transform '{other}'"))),
        }
    }

    fn ulp_error(&self, op: &TransformOp) -> u32 {
        self.ulps.get(&op.name).copied().unwrap_or(0)
    }
}

pub fn root_seed() -> Seed {
    Seed::from_bytes([42u8; 32])
}

pub fn recorded_seeds() -> Arc<RecordedSeeds> {
    Arc::new(RecordedSeeds::with(RUN_ID, root_seed()))
}

pub fn fake_hash(byte: u8) -> Hash {
    Hash::from([byte; 32])
}

/// Default config with a smaller promotion threshold and reconstruction bound.
pub fn config_with_threshold(threshold: u64) -> LedgerConfig {
    LedgerConfig {
        chain_length_threshold: threshold,
        k_max: threshold + threshold / 2,
        ..LedgerConfig::default()
    }
}

pub fn mem_ledger() -> TestLedger {
    mem_ledger_with(LedgerConfig::default())
}

pub fn mem_ledger_with(config: LedgerConfig) -> TestLedger {
    ledger_on(Arc::new(MemStore::new()), Box::new(MemJournal::new()), config)
}

/// Open a ledger over an existing store and journal, recovering what the
/// journal holds. Panics on recovery failure.
pub fn ledger_on<S: Store + 'static>(store: Arc<S>, journal: Box<dyn Journal>, config: LedgerConfig) -> StateLedger<S> {
    try_ledger_on(store, journal, config).expect("open ledger")
}

pub fn try_ledger_on<S: Store + 'static>(
    store: Arc<S>,
    journal: Box<dyn Journal>,
    config: LedgerConfig,
) -> LedgerResult<StateLedger<S>> {
    StateLedger::open_with_config(store, journal, Arc::new(AffineEngine::new()), recorded_seeds(), config)
}

/// Ledger whose store and journal live under `dir`.
pub fn fs_ledger(dir: &Path, config: LedgerConfig) -> LedgerResult<StateLedger<FsStore>> {
    let store = Arc::new(FsStore::open(dir.join("store"))?);
    let journal = FsJournal::open(dir.join("journal"))?;
    try_ledger_on(store, Box::new(journal), config)
}

pub fn spawn<S: Store + 'static>(ledger: &StateLedger<S>, name: &str, tier: DeterminismTier, dim: usize) -> HolonRecord {
    ledger
        .spawn_root(RUN_ID, name, HolonSpec::new(tier, StateVector::new(vec![0.0; dim])))
        .expect("spawn holon")
}

pub fn translate(values: Vec<f64>) -> (TransformOp, Params) {
    (TransformOp::pure("translate"), Params::new(values))
}

pub fn set(values: Vec<f64>) -> (TransformOp, Params) {
    (TransformOp::pure("set"), Params::new(values))
}

pub fn sampled(values: Vec<f64>) -> (TransformOp, Params) {
    (TransformOp::new("set", OpKind::Sampled), Params::new(values))
}

/// Point `i` of a closed loop of `n` points with radius 0.5 around the origin.
pub fn loop_point(i: usize, n: usize) -> Vec<f64> {
    let theta = std::f64::consts::TAU * i as f64 / n as f64;
    vec![0.5 * theta.cos(), 0.5 * theta.sin()]
}

/// Append at the current head, retrying nothing.
pub fn append_at_head<S: Store + 'static>(
    ledger: &StateLedger<S>,
    chain: &ChainId,
    (op, params): (TransformOp, Params),
) -> LedgerResult<Delta> {
    let (_, head) = ledger.head(chain)?;
    ledger.append_delta(chain, head, op, params)
}

/// Append `n` small translations; the walk stays within radius `0.01 * n`.
pub fn append_walk<S: Store + 'static>(ledger: &StateLedger<S>, chain: &ChainId, n: usize) -> LedgerResult<Vec<Delta>> {
    let dim = ledger.head_state(chain)?.len();
    (0..n)
        .map(|i| {
            let mut step = vec![0.0; dim];
            if dim > 0 {
                step[i % dim] = if i % 2 == 0 { 0.01 } else { -0.005 };
            }
            append_at_head(ledger, chain, translate(step))
        })
        .collect()
}

/// Append `set` deltas that visit `points` in order.
pub fn append_path<S: Store + 'static>(
    ledger: &StateLedger<S>,
    chain: &ChainId,
    points: &[Vec<f64>],
) -> LedgerResult<Vec<Delta>> {
    points
        .iter()
        .map(|p| append_at_head(ledger, chain, set(p.clone())))
        .collect()
}
