use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Record keys that carry wall-clock time and are never hashed.
pub const DEFAULT_WALL_CLOCK_FIELDS: &[&str] = &[
    "wall_clock",
    "wall_time",
    "wall_time_ns",
    "now_ns",
    "received_at",
    "created_at",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Tenant stamped on receipts and mixed into dedupe keys.
    pub tenant: String,
    /// Promote once the deltas since the last anchor would exceed this.
    pub chain_length_threshold: u64,
    /// Maximum deltas a reconstruction may replay from its anchor.
    pub k_max: u64,
    /// Trailing-window reads above which a chain head is hot.
    pub hot_reads: u32,
    /// Hot promotion still needs at least this many pending deltas.
    pub hot_min_deltas: u64,
    /// Anchors read fewer times than this in the window are cold.
    pub cold_reads: u32,
    /// Width of the read window, in logical clock ticks.
    pub read_window: u64,
    /// Floats are quantized to `10^-quantum_decimals` before hashing.
    pub quantum_decimals: u32,
    pub ulp_budget: u32,
    pub wall_clock_fields: Vec<String>,
    pub compaction: CompactionConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            tenant: "default".into(),
            chain_length_threshold: 100,
            k_max: 150,
            hot_reads: 32,
            hot_min_deltas: 8,
            cold_reads: 1,
            read_window: 256,
            quantum_decimals: 9,
            ulp_budget: 4,
            wall_clock_fields: DEFAULT_WALL_CLOCK_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            compaction: CompactionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Logical ticks between periodic sweeps.
    pub sweep_interval: u64,
    /// Deltas on a chain above which a size-triggered compaction runs.
    pub size_threshold: u64,
    pub keep_anchors_every: usize,
    pub epsilon: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: 1024,
            size_threshold: 10_000,
            keep_anchors_every: 2,
            epsilon: 1e-3,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

impl LedgerConfig {
    /// Defaults overridden by `HOL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LedgerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(tenant) = lookup("HOL_TENANT") {
            cfg.tenant = tenant;
        }
        override_parsed(&lookup, "HOL_CHAIN_LENGTH_THRESHOLD", &mut cfg.chain_length_threshold)?;
        override_parsed(&lookup, "HOL_K_MAX", &mut cfg.k_max)?;
        override_parsed(&lookup, "HOL_HOT_READS", &mut cfg.hot_reads)?;
        override_parsed(&lookup, "HOL_HOT_MIN_DELTAS", &mut cfg.hot_min_deltas)?;
        override_parsed(&lookup, "HOL_COLD_READS", &mut cfg.cold_reads)?;
        override_parsed(&lookup, "HOL_READ_WINDOW", &mut cfg.read_window)?;
        override_parsed(&lookup, "HOL_QUANTUM_DECIMALS", &mut cfg.quantum_decimals)?;
        override_parsed(&lookup, "HOL_ULP_BUDGET", &mut cfg.ulp_budget)?;
        if let Some(fields) = lookup("HOL_WALL_CLOCK_FIELDS") {
            cfg.wall_clock_fields = fields
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        override_parsed(&lookup, "HOL_SWEEP_INTERVAL", &mut cfg.compaction.sweep_interval)?;
        override_parsed(&lookup, "HOL_SIZE_THRESHOLD", &mut cfg.compaction.size_threshold)?;
        override_parsed(&lookup, "HOL_KEEP_ANCHORS_EVERY", &mut cfg.compaction.keep_anchors_every)?;
        override_parsed(&lookup, "HOL_EPSILON", &mut cfg.compaction.epsilon)?;

        if cfg.quantum_decimals > 15 {
            return Err(ConfigError::Invalid {
                key: "HOL_QUANTUM_DECIMALS",
                value: cfg.quantum_decimals.to_string(),
            });
        }
        if cfg.compaction.keep_anchors_every == 0 {
            return Err(ConfigError::Invalid {
                key: "HOL_KEEP_ANCHORS_EVERY",
                value: "0".into(),
            });
        }
        if !(cfg.compaction.epsilon.is_finite() && cfg.compaction.epsilon >= 0.0) {
            return Err(ConfigError::Invalid {
                key: "HOL_EPSILON",
                value: cfg.compaction.epsilon.to_string(),
            });
        }
        Ok(cfg)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw.clone() })?;
    }
    Ok(())
}
