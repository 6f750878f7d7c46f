//! Deterministic state ledger for nested holons: signed delta chains with
//! materialized anchors, canonical receipts, seed derivation, tiered
//! determinism policy, homotopy-safe compaction and replay recipes.

pub mod compaction;
pub mod config;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod merkle;
pub mod policy;
pub mod receipts;
pub mod recipe;
pub mod seed;
pub mod signing;
pub mod state;
pub mod tick;

pub use compaction::{
    CompactionParams, CompactionRecord, CompactionTrigger, Compactor, ForbiddenZones,
    HyperbolicBallZones, NoZones, Zone, compact_trajectory, prune_snapshots, verify_invariants,
};
pub use config::{CompactionConfig, LedgerConfig};
pub use error::LedgerError;
pub use journal::{Journal, fs::FsJournal, mem::MemJournal};
pub use ledger::{
    Anchor, AnchorInfo, AnchorPolicy, ChainId, Delta, GateMessage, HolonRecord, HolonSpec,
    InboundInput, LedgerResult, MaterializeOptions, ReconstructOptions, StateLedger,
    ThresholdPolicy, TierChange,
};
pub use policy::{DeterminismPolicy, DeterminismTier, EnsembleDiagnostics};
pub use receipts::{Receipt, ReceiptCodec, ReceiptStatus};
pub use recipe::{DeltaScript, ReplayDriver, ReplayRecipe, ReplayReport, ReplaySession, Replayer};
pub use seed::{Namespace, RecordedSeeds, Seed, SeedNode, SeedSource, derive_seed};
pub use state::{EngineError, OpKind, Params, StateVector, TransformEngine, TransformOp};
pub use tick::{CancelToken, Tick};
