//! Determinism tiers: classification of operations, per-operation enforcement
//! and gated tier transitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::ledger::ChainId;
use crate::state::OpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeterminismTier {
    /// Bit-exact replay.
    D0,
    /// Replayable given recorded inputs.
    D1,
    /// Statistical: ensembles agree in distribution.
    D2,
    /// Best effort.
    D3,
}

impl DeterminismTier {
    /// Higher is stricter.
    pub fn strictness(&self) -> u8 {
        match self {
            DeterminismTier::D0 => 3,
            DeterminismTier::D1 => 2,
            DeterminismTier::D2 => 1,
            DeterminismTier::D3 => 0,
        }
    }

    pub fn is_stricter_than(&self, other: DeterminismTier) -> bool {
        self.strictness() > other.strictness()
    }

    /// D2 and D3 chains are receipt-only: no anchors past genesis.
    pub fn supports_anchors(&self) -> bool {
        matches!(self, DeterminismTier::D0 | DeterminismTier::D1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeterminismTier::D0 => "D0",
            DeterminismTier::D1 => "D1",
            DeterminismTier::D2 => "D2",
            DeterminismTier::D3 => "D3",
        }
    }
}

impl fmt::Display for DeterminismTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeterminismTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "D0" | "d0" => Ok(DeterminismTier::D0),
            "D1" | "d1" => Ok(DeterminismTier::D1),
            "D2" | "d2" => Ok(DeterminismTier::D2),
            "D3" | "d3" => Ok(DeterminismTier::D3),
            other => Err(format!("unknown determinism tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Transform(OpKind),
    Materialize,
    Reconstruct,
    Compact,
    RecordInbound,
    ReadWallClock,
    DrawEntropy,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transform(_) => "append_delta",
            Operation::Materialize => "materialize",
            Operation::Reconstruct => "reconstruct_state",
            Operation::Compact => "compact",
            Operation::RecordInbound => "record_inbound",
            Operation::ReadWallClock => "read_wall_clock",
            Operation::DrawEntropy => "draw_entropy",
        }
    }

    fn needs_anchors(&self) -> bool {
        matches!(self, Operation::Materialize | Operation::Compact)
    }
}

/// Strictest tier at which `op` can still run.
pub fn classify(op: &Operation) -> DeterminismTier {
    match op {
        Operation::Transform(OpKind::Pure | OpKind::Seeded) => DeterminismTier::D0,
        Operation::Transform(OpKind::External) => DeterminismTier::D1,
        Operation::Transform(OpKind::Sampled) => DeterminismTier::D2,
        Operation::Transform(OpKind::Ambient) | Operation::ReadWallClock | Operation::DrawEntropy => {
            DeterminismTier::D3
        }
        Operation::Materialize
        | Operation::Reconstruct
        | Operation::Compact
        | Operation::RecordInbound => DeterminismTier::D0,
    }
}

/// Numeric-policy collaborator: ULP budgets and NaN/Inf handling per tier.
pub trait NumericPolicy: Send + Sync {
    /// `None` means unbounded.
    fn ulp_budget(&self, tier: DeterminismTier) -> Option<u32>;

    fn rejects_non_finite(&self, tier: DeterminismTier) -> bool {
        tier != DeterminismTier::D3
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedUlpBudget {
    pub ulps: u32,
}

impl NumericPolicy for FixedUlpBudget {
    fn ulp_budget(&self, tier: DeterminismTier) -> Option<u32> {
        match tier {
            DeterminismTier::D0 | DeterminismTier::D1 => Some(self.ulps),
            DeterminismTier::D2 | DeterminismTier::D3 => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnforceContext {
    pub op: Operation,
    pub seed_recorded: bool,
    pub ulp_error: u32,
    pub finite: bool,
}

impl EnforceContext {
    pub fn new(op: Operation) -> Self {
        Self {
            op,
            seed_recorded: true,
            ulp_error: 0,
            finite: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    TierTooWeak {
        required: DeterminismTier,
        chain: DeterminismTier,
    },
    MissingSeed,
    UlpBudgetExceeded { ulps: u32, budget: u32 },
    NonFinite,
    AnchorsUnsupported(DeterminismTier),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::TierTooWeak { required, chain } => {
                write!(f, "operation is only admissible at {required}, chain runs at {chain}")
            }
            DenyReason::MissingSeed => f.write_str("D0 requires a recorded seed"),
            DenyReason::UlpBudgetExceeded { ulps, budget } => {
                write!(f, "numeric path error {ulps} ulp exceeds budget {budget}")
            }
            DenyReason::NonFinite => f.write_str("NaN or infinite value"),
            DenyReason::AnchorsUnsupported(tier) => write!(f, "{tier} chains keep no anchors"),
        }
    }
}

impl DenyReason {
    pub fn into_error(self, chain: &ChainId, op: &Operation) -> LedgerError {
        match self {
            DenyReason::AnchorsUnsupported(_) => LedgerError::PolicyDenied {
                chain: chain.clone(),
                operation: op.name().to_string(),
                reason: self.to_string(),
            },
            other => LedgerError::DeterminismViolation {
                chain: chain.clone(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    /// Allowed, with a note that the chain's guarantee is weakened.
    Annotate(String),
}

/// Evidence a chain presents when asking for a stricter tier.
#[derive(Debug, Clone, Default)]
pub struct TransitionEvidence {
    pub all_actions_recorded: bool,
    pub seed_recorded: bool,
    pub determinism_proven: bool,
    pub ensemble: Option<EnsembleDiagnostics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Loosened,
    Tightened,
}

pub const MIN_ENSEMBLE_RUNS: usize = 2;

pub struct DeterminismPolicy {
    numeric: Box<dyn NumericPolicy>,
}

impl fmt::Debug for DeterminismPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterminismPolicy")
            .field("d0_budget", &self.numeric.ulp_budget(DeterminismTier::D0))
            .finish()
    }
}

impl DeterminismPolicy {
    pub fn new(numeric: Box<dyn NumericPolicy>) -> Self {
        Self { numeric }
    }

    pub fn with_ulp_budget(ulps: u32) -> Self {
        Self::new(Box::new(FixedUlpBudget { ulps }))
    }

    pub fn classify(&self, op: &Operation) -> DeterminismTier {
        classify(op)
    }

    pub fn enforce(&self, tier: DeterminismTier, ctx: &EnforceContext) -> Decision {
        if !ctx.finite {
            if self.numeric.rejects_non_finite(tier) {
                return Decision::Deny(DenyReason::NonFinite);
            }
            return Decision::Annotate("non-finite value on best-effort chain".into());
        }
        if ctx.op.needs_anchors() && !tier.supports_anchors() {
            return Decision::Deny(DenyReason::AnchorsUnsupported(tier));
        }
        let required = classify(&ctx.op);
        if tier.is_stricter_than(required) {
            return Decision::Deny(DenyReason::TierTooWeak {
                required,
                chain: tier,
            });
        }
        let budget = self.numeric.ulp_budget(tier);
        match tier {
            DeterminismTier::D0 => {
                if !ctx.seed_recorded {
                    return Decision::Deny(DenyReason::MissingSeed);
                }
                if let Some(budget) = budget.filter(|b| ctx.ulp_error > *b) {
                    return Decision::Deny(DenyReason::UlpBudgetExceeded {
                        ulps: ctx.ulp_error,
                        budget,
                    });
                }
                Decision::Allow
            }
            DeterminismTier::D1 => match budget.filter(|b| ctx.ulp_error > *b) {
                Some(budget) => Decision::Annotate(format!(
                    "numeric drift {} ulp above budget {budget}",
                    ctx.ulp_error
                )),
                None => Decision::Allow,
            },
            DeterminismTier::D2 if ctx.op == Operation::Reconstruct => {
                Decision::Annotate("statistical chain: reconstruction is not bit-exact".into())
            }
            DeterminismTier::D2 => Decision::Allow,
            DeterminismTier::D3 if required == DeterminismTier::D3 => {
                Decision::Annotate(format!("ambient input via {}", ctx.op.name()))
            }
            DeterminismTier::D3 => Decision::Allow,
        }
    }

    /// Loosening is always allowed; tightening needs the target tier's predicate.
    pub fn check_transition(
        &self,
        from: DeterminismTier,
        to: DeterminismTier,
        evidence: &TransitionEvidence,
    ) -> Result<Transition, String> {
        if from == to {
            return Ok(Transition::Unchanged);
        }
        if !to.is_stricter_than(from) {
            return Ok(Transition::Loosened);
        }
        match to {
            DeterminismTier::D0 => {
                if !evidence.all_actions_recorded {
                    return Err("not every action is recorded".into());
                }
                if !evidence.seed_recorded {
                    return Err("no recorded seed".into());
                }
                if !evidence.determinism_proven {
                    return Err("replay does not reproduce the recorded states".into());
                }
            }
            DeterminismTier::D1 => {
                if !evidence.all_actions_recorded {
                    return Err("not every action is recorded".into());
                }
            }
            DeterminismTier::D2 => match &evidence.ensemble {
                Some(ensemble) if ensemble.is_usable() => {}
                Some(ensemble) => {
                    return Err(format!(
                        "ensemble of {} runs is not usable (need {MIN_ENSEMBLE_RUNS} with finite moments)",
                        ensemble.runs
                    ));
                }
                None => return Err("D2 requires ensemble diagnostics".into()),
            },
            DeterminismTier::D3 => {}
        }
        Ok(Transition::Tightened)
    }
}

/// Running mean/variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl Moments {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }
}

/// Per-dimension distribution of a set of sample vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDiagnostics {
    pub runs: usize,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

impl EnsembleDiagnostics {
    pub fn from_samples<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut moments: Vec<Moments> = Vec::new();
        let mut runs = 0;
        for sample in samples {
            runs += 1;
            if moments.len() < sample.len() {
                moments.resize(sample.len(), Moments::default());
            }
            for (m, x) in moments.iter_mut().zip(sample) {
                m.push(*x);
            }
        }
        Self {
            runs,
            mean: moments.iter().map(|m| m.mean).collect(),
            variance: moments.iter().map(Moments::variance).collect(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.runs >= MIN_ENSEMBLE_RUNS
            && self.mean.iter().chain(&self.variance).all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DeterminismPolicy {
        DeterminismPolicy::with_ulp_budget(4)
    }

    #[test]
    fn classification_follows_op_kind() {
        assert_eq!(classify(&Operation::Transform(OpKind::Pure)), DeterminismTier::D0);
        assert_eq!(classify(&Operation::Transform(OpKind::External)), DeterminismTier::D1);
        assert_eq!(classify(&Operation::Transform(OpKind::Sampled)), DeterminismTier::D2);
        assert_eq!(classify(&Operation::DrawEntropy), DeterminismTier::D3);
    }

    #[test]
    fn d0_needs_seed_and_budget() {
        let p = policy();
        let mut ctx = EnforceContext::new(Operation::Transform(OpKind::Pure));
        assert_eq!(p.enforce(DeterminismTier::D0, &ctx), Decision::Allow);
        ctx.ulp_error = 5;
        assert_eq!(
            p.enforce(DeterminismTier::D0, &ctx),
            Decision::Deny(DenyReason::UlpBudgetExceeded { ulps: 5, budget: 4 })
        );
        assert!(matches!(p.enforce(DeterminismTier::D1, &ctx), Decision::Annotate(_)));
        ctx.ulp_error = 0;
        ctx.seed_recorded = false;
        assert_eq!(p.enforce(DeterminismTier::D0, &ctx), Decision::Deny(DenyReason::MissingSeed));
    }

    #[test]
    fn weaker_ops_are_denied_on_strict_chains() {
        let p = policy();
        let ctx = EnforceContext::new(Operation::ReadWallClock);
        assert!(matches!(
            p.enforce(DeterminismTier::D1, &ctx),
            Decision::Deny(DenyReason::TierTooWeak { .. })
        ));
        assert!(matches!(p.enforce(DeterminismTier::D3, &ctx), Decision::Annotate(_)));
    }

    #[test]
    fn receipt_only_tiers_deny_anchor_ops() {
        let p = policy();
        let ctx = EnforceContext::new(Operation::Materialize);
        assert_eq!(
            p.enforce(DeterminismTier::D2, &ctx),
            Decision::Deny(DenyReason::AnchorsUnsupported(DeterminismTier::D2))
        );
        let err = DenyReason::AnchorsUnsupported(DeterminismTier::D2)
            .into_error(&ChainId::new("r/holon:a"), &Operation::Materialize);
        assert_eq!(err.code(), "policy_denied");
    }

    #[test]
    fn non_finite_values_only_pass_on_best_effort() {
        let p = policy();
        let mut ctx = EnforceContext::new(Operation::Transform(OpKind::Pure));
        ctx.finite = false;
        assert_eq!(p.enforce(DeterminismTier::D2, &ctx), Decision::Deny(DenyReason::NonFinite));
        assert!(matches!(p.enforce(DeterminismTier::D3, &ctx), Decision::Annotate(_)));
    }

    #[test]
    fn transitions_loosen_freely_and_tighten_on_evidence() {
        let p = policy();
        let none = TransitionEvidence::default();
        assert_eq!(p.check_transition(DeterminismTier::D0, DeterminismTier::D3, &none), Ok(Transition::Loosened));
        assert!(p.check_transition(DeterminismTier::D3, DeterminismTier::D1, &none).is_err());
        let recorded = TransitionEvidence {
            all_actions_recorded: true,
            ..Default::default()
        };
        assert_eq!(
            p.check_transition(DeterminismTier::D3, DeterminismTier::D1, &recorded),
            Ok(Transition::Tightened)
        );
        assert!(p.check_transition(DeterminismTier::D1, DeterminismTier::D0, &recorded).is_err());

        let samples = [vec![1.0, 2.0], vec![3.0, 2.0]];
        let ensemble = EnsembleDiagnostics::from_samples(samples.iter().map(Vec::as_slice));
        assert_eq!(ensemble.mean, vec![2.0, 2.0]);
        assert_eq!(ensemble.variance, vec![1.0, 0.0]);
        let with_ensemble = TransitionEvidence {
            ensemble: Some(ensemble),
            ..Default::default()
        };
        assert_eq!(
            p.check_transition(DeterminismTier::D3, DeterminismTier::D2, &with_ensemble),
            Ok(Transition::Tightened)
        );
    }
}
