//! Hash-chained seed derivation for nested holons.
//!
//! Every seed is `H(parent ‖ namespace ‖ entity_id ‖ creation_tick ‖ salt)` with
//! length-prefixed fields. Root contexts come from a [`SeedSource`] holding
//! recorded values, so a derivation never touches ambient entropy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use hol_cbor::Hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tick::Tick;

const SEED_DOMAIN: &[u8] = b"hol/seed/v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeedError {
    #[error("invalid seed namespace '{0}'")]
    InvalidNamespace(String),
    #[error("no root seed recorded for '{0}'")]
    MissingParentSeed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Holon,
    Agent,
    Channel,
    Run,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Holon => "holon",
            Namespace::Agent => "agent",
            Namespace::Channel => "channel",
            Namespace::Run => "run",
        }
    }
}

impl FromStr for Namespace {
    type Err = SeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holon" => Ok(Namespace::Holon),
            "agent" => Ok(Namespace::Agent),
            "channel" => Ok(Namespace::Channel),
            "run" => Ok(Namespace::Run),
            other => Err(SeedError::InvalidNamespace(other.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 256-bit deterministic seed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(Hash);

impl Seed {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Seed(Hash::from(bytes))
    }

    pub fn as_hash(&self) -> &Hash {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({})", self.0.short())
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Pure seed derivation. `parent` is `None` when the caller could not resolve a
/// root context, which is reported as [`SeedError::MissingParentSeed`].
pub fn derive_seed(
    parent: Option<&Seed>,
    namespace: &str,
    entity_id: &str,
    tick: Tick,
    salt: &[u8],
) -> Result<Seed, SeedError> {
    let namespace: Namespace = namespace.parse()?;
    let parent = parent.ok_or_else(|| SeedError::MissingParentSeed(entity_id.to_string()))?;
    Ok(derive_typed(parent, namespace, entity_id, tick, salt))
}

fn derive_typed(parent: &Seed, namespace: Namespace, entity_id: &str, tick: Tick, salt: &[u8]) -> Seed {
    Seed(Hash::of_parts(&[
        SEED_DOMAIN,
        parent.as_bytes(),
        namespace.as_str().as_bytes(),
        entity_id.as_bytes(),
        &tick.to_le_bytes(),
        salt,
    ]))
}

/// Immutable record of one derivation, created once at spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    pub namespace: Namespace,
    pub entity_id: String,
    pub parent_seed_ref: Seed,
    pub creation_tick: Tick,
    #[serde(with = "serde_bytes")]
    pub salt: Vec<u8>,
    pub derived_seed: Seed,
}

impl SeedNode {
    pub fn derive(
        parent: &Seed,
        namespace: Namespace,
        entity_id: impl Into<String>,
        creation_tick: Tick,
        salt: impl Into<Vec<u8>>,
    ) -> Self {
        let entity_id = entity_id.into();
        let salt = salt.into();
        let derived_seed = derive_typed(parent, namespace, &entity_id, creation_tick, &salt);
        Self {
            namespace,
            entity_id,
            parent_seed_ref: *parent,
            creation_tick,
            salt,
            derived_seed,
        }
    }

    /// Recompute the derivation and compare with the stored seed.
    pub fn verify(&self) -> bool {
        derive_typed(
            &self.parent_seed_ref,
            self.namespace,
            &self.entity_id,
            self.creation_tick,
            &self.salt,
        ) == self.derived_seed
    }
}

/// Source of recorded root seeds. Implementations must return values that were
/// themselves recorded (configuration, a prior journal), never fresh entropy.
pub trait SeedSource: Send + Sync {
    fn root_seed(&self, run_id: &str) -> Option<Seed>;
}

#[derive(Debug, Default)]
pub struct RecordedSeeds {
    seeds: RwLock<BTreeMap<String, Seed>>,
}

impl RecordedSeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(run_id: impl Into<String>, seed: Seed) -> Self {
        let seeds = Self::new();
        seeds.record(run_id, seed);
        seeds
    }

    /// Record a root seed. The first recorded value for a run wins.
    pub fn record(&self, run_id: impl Into<String>, seed: Seed) -> Seed {
        let mut guard = self.seeds.write().unwrap_or_else(PoisonError::into_inner);
        *guard.entry(run_id.into()).or_insert(seed)
    }
}

impl SeedSource for RecordedSeeds {
    fn root_seed(&self, run_id: &str) -> Option<Seed> {
        self.seeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn root() -> Seed {
        Seed::from_bytes([7u8; 32])
    }

    #[test]
    fn unknown_namespace_is_rejected() {
        let err = derive_seed(Some(&root()), "widget", "a", 0, b"").unwrap_err();
        assert_eq!(err, SeedError::InvalidNamespace("widget".into()));
    }

    #[test]
    fn missing_root_context_is_reported() {
        let err = derive_seed(None, "holon", "planner", 0, b"").unwrap_err();
        assert!(matches!(err, SeedError::MissingParentSeed(_)));
        let seeds = RecordedSeeds::new();
        assert!(seeds.root_seed("run-1").is_none());
    }

    #[test]
    fn seed_node_verifies_and_matches_free_function() {
        let node = SeedNode::derive(&root(), Namespace::Agent, "scout", 12, b"s".to_vec());
        assert!(node.verify());
        let direct = derive_seed(Some(&root()), "agent", "scout", 12, b"s").unwrap();
        assert_eq!(node.derived_seed, direct);

        let mut forged = node.clone();
        forged.creation_tick = 13;
        assert!(!forged.verify());
    }

    #[test]
    fn recorded_seed_first_write_wins() {
        let seeds = RecordedSeeds::with("run-1", root());
        let kept = seeds.record("run-1", Seed::from_bytes([9u8; 32]));
        assert_eq!(kept, root());
        assert_eq!(seeds.root_seed("run-1"), Some(root()));
    }

    proptest! {
        #[test]
        fn derivation_is_pure(entity in "[a-z]{1,12}", tick in 0u64..10_000, salt in proptest::collection::vec(any::<u8>(), 0..16)) {
            let a = derive_seed(Some(&root()), "holon", &entity, tick, &salt).unwrap();
            let b = derive_seed(Some(&root()), "holon", &entity, tick, &salt).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn any_single_input_change_changes_the_seed(entity in "[a-z]{1,12}", tick in 0u64..10_000, salt in proptest::collection::vec(any::<u8>(), 0..16)) {
            let base = derive_seed(Some(&root()), "holon", &entity, tick, &salt).unwrap();
            let other_parent = Seed::from_bytes([8u8; 32]);
            prop_assert_ne!(base, derive_seed(Some(&other_parent), "holon", &entity, tick, &salt).unwrap());
            prop_assert_ne!(base, derive_seed(Some(&root()), "agent", &entity, tick, &salt).unwrap());
            prop_assert_ne!(base, derive_seed(Some(&root()), "holon", &format!("{entity}x"), tick, &salt).unwrap());
            prop_assert_ne!(base, derive_seed(Some(&root()), "holon", &entity, tick + 1, &salt).unwrap());
            let mut salted = salt.clone();
            salted.push(0);
            prop_assert_ne!(base, derive_seed(Some(&root()), "holon", &entity, tick, &salted).unwrap());
        }
    }
}
