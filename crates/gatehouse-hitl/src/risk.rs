//! Deterministic risk scoring.
//!
//! Five factors, each mapped to a score in [0, 1] and weighted:
//!
//! | Factor | Context key(s) | Values |
//! |--------|----------------|--------|
//! | action type | `action_type` | read 0.0, write 0.4, execute 0.7, delete 1.0 |
//! | impact scope | `impact_scope` | single_user 0.0, single_system 0.3, multi_system 0.7, global 1.0 |
//! | reversibility | `reversibility` | reversible 0.0, partial 0.5, irreversible 1.0 |
//! | production target | `production` | false 0.0, true 1.0 |
//! | sensitive data | `pii`, `financial` | neither 0.0, one 0.7, both 1.0 |
//!
//! Factors missing from the request context fall back to per-intent
//! defaults.  [`RiskAssessor::assess`] does no I/O and reads no clock, so the
//! same decision and context always produce the same assessment.

use gatehouse_kernel::{
    ApprovalTier, FactorContribution, IntentCategory, RiskAssessment, RiskLevel, RoutingDecision,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HitlError, Result};

use gatehouse_intent::ContextMap;

// ---------------------------------------------------------------------------
// Factor values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionType {
    Read,
    Write,
    Execute,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImpactScope {
    SingleUser,
    SingleSystem,
    MultiSystem,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reversibility {
    Reversible,
    Partial,
    Irreversible,
}

/// A closed set of named values with fixed factor scores.
trait FactorValue: Sized + Copy + PartialEq + 'static {
    const KEY: &'static str;
    const TABLE: &'static [(&'static str, Self, f64)];

    fn score(self) -> f64 {
        Self::TABLE
            .iter()
            .find(|(_, v, _)| *v == self)
            .map_or(0.0, |(_, _, s)| *s)
    }

    fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, v, _)| *v == self)
            .map_or("", |(n, _, _)| n)
    }

    fn parse(raw: &str) -> Result<Self> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::TABLE
            .iter()
            .find(|(n, _, _)| *n == wanted)
            .map(|(_, v, _)| *v)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Self::TABLE.iter().map(|(n, _, _)| *n).collect();
                HitlError::validation(format!(
                    "unknown {} `{raw}` (expected one of {})",
                    Self::KEY,
                    allowed.join(", ")
                ))
            })
    }
}

impl FactorValue for ActionType {
    const KEY: &'static str = "action_type";
    const TABLE: &'static [(&'static str, Self, f64)] = &[
        ("read", Self::Read, 0.0),
        ("write", Self::Write, 0.4),
        ("execute", Self::Execute, 0.7),
        ("delete", Self::Delete, 1.0),
    ];
}

impl FactorValue for ImpactScope {
    const KEY: &'static str = "impact_scope";
    const TABLE: &'static [(&'static str, Self, f64)] = &[
        ("single_user", Self::SingleUser, 0.0),
        ("single_system", Self::SingleSystem, 0.3),
        ("multi_system", Self::MultiSystem, 0.7),
        ("global", Self::Global, 1.0),
    ];
}

impl FactorValue for Reversibility {
    const KEY: &'static str = "reversibility";
    const TABLE: &'static [(&'static str, Self, f64)] = &[
        ("reversible", Self::Reversible, 0.0),
        ("partial", Self::Partial, 0.5),
        ("irreversible", Self::Irreversible, 1.0),
    ];
}

fn intent_defaults(intent: IntentCategory) -> (ActionType, ImpactScope, Reversibility) {
    use ActionType::*;
    use ImpactScope::*;
    use Reversibility::*;
    match intent {
        IntentCategory::Incident => (Execute, SingleSystem, Partial),
        IntentCategory::Request => (Write, SingleUser, Reversible),
        IntentCategory::Change => (Write, SingleSystem, Partial),
        IntentCategory::Query => (Read, SingleUser, Reversible),
        IntentCategory::Unknown => (Execute, SingleSystem, Partial),
    }
}

/// Factors as read from a request context; `None` where absent.
#[derive(Debug, Default)]
struct ContextFactors {
    action: Option<ActionType>,
    scope: Option<ImpactScope>,
    reversibility: Option<Reversibility>,
    production: Option<bool>,
    pii: Option<bool>,
    financial: Option<bool>,
}

fn read_enum<T: FactorValue>(ctx: &ContextMap) -> Result<Option<T>> {
    match ctx.get(T::KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => T::parse(s).map(Some),
        Some(other) => Err(HitlError::validation(format!(
            "context `{}` must be a string, got {other}",
            T::KEY
        ))),
    }
}

fn read_flag(ctx: &ContextMap, key: &str) -> Result<Option<bool>> {
    match ctx.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some(other) => Err(HitlError::validation(format!(
            "context `{key}` must be a boolean, got {other}"
        ))),
    }
}

impl ContextFactors {
    fn read(ctx: &ContextMap) -> Result<Self> {
        Ok(Self {
            action: read_enum(ctx)?,
            scope: read_enum(ctx)?,
            reversibility: read_enum(ctx)?,
            production: read_flag(ctx, "production")?,
            pii: read_flag(ctx, "pii")?,
            financial: read_flag(ctx, "financial")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub action_type: f64,
    pub impact_scope: f64,
    pub reversibility: f64,
    pub production: f64,
    pub sensitive_data: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            action_type: 0.25,
            impact_scope: 0.25,
            reversibility: 0.15,
            production: 0.20,
            sensitive_data: 0.15,
        }
    }
}

impl RiskWeights {
    fn all(&self) -> [f64; 5] {
        [
            self.action_type,
            self.impact_scope,
            self.reversibility,
            self.production,
            self.sensitive_data,
        ]
    }
}

/// Lower bounds of the medium, high and critical bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelBoundaries {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LevelBoundaries {
    fn default() -> Self {
        Self {
            medium: 0.3,
            high: 0.6,
            critical: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierMapping {
    pub low: ApprovalTier,
    pub medium: ApprovalTier,
    pub high: ApprovalTier,
    pub critical: ApprovalTier,
}

impl Default for TierMapping {
    fn default() -> Self {
        Self {
            low: ApprovalTier::None,
            medium: ApprovalTier::SelfService,
            high: ApprovalTier::Manager,
            critical: ApprovalTier::Security,
        }
    }
}

impl TierMapping {
    fn for_level(&self, level: RiskLevel) -> ApprovalTier {
        match level {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub boundaries: LevelBoundaries,
    pub tiers: TierMapping,
    /// Approval is required when the score is strictly above this.
    pub approval_threshold: f64,
    /// Tier used when approval is forced but the level maps to `none`.
    pub forced_tier: ApprovalTier,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            boundaries: LevelBoundaries::default(),
            tiers: TierMapping::default(),
            approval_threshold: 0.3,
            forced_tier: ApprovalTier::Manager,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: String| HitlError::Config { reason };
        let weights = self.weights.all();
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(bad("risk weights must lie in [0, 1]".into()));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(bad(format!("risk weights must sum to 1.0, got {sum:.4}")));
        }
        let b = &self.boundaries;
        if !(0.0 < b.medium && b.medium < b.high && b.high < b.critical && b.critical <= 1.0) {
            return Err(bad(format!(
                "level boundaries must be increasing in (0, 1], got {}/{}/{}",
                b.medium, b.high, b.critical
            )));
        }
        if !(0.0..=1.0).contains(&self.approval_threshold) {
            return Err(bad("approval_threshold must lie in [0, 1]".into()));
        }
        if self.forced_tier == ApprovalTier::None {
            return Err(bad("forced_tier cannot be `none`".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Assessor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskAssessor {
    config: RiskConfig,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Reject contexts with unknown or mistyped risk factors.  Used at
    /// ingress, before any record exists.
    pub fn validate_context(context: &ContextMap) -> Result<()> {
        ContextFactors::read(context).map(|_| ())
    }

    pub fn assess(&self, decision: &RoutingDecision, context: &ContextMap) -> Result<RiskAssessment> {
        let given = ContextFactors::read(context)?;
        let (default_action, default_scope, default_rev) = intent_defaults(decision.intent);
        let w = &self.config.weights;

        let mut factors = Vec::with_capacity(5);
        let mut push = |factor: &str, value: String, from_context: bool, weight: f64, score: f64| {
            factors.push(FactorContribution {
                factor: factor.to_string(),
                value,
                from_context,
                weight,
                score,
                contribution: weight * score,
            });
        };

        let action = given.action.unwrap_or(default_action);
        push(
            ActionType::KEY,
            action.name().into(),
            given.action.is_some(),
            w.action_type,
            action.score(),
        );

        let scope = given.scope.unwrap_or(default_scope);
        push(
            ImpactScope::KEY,
            scope.name().into(),
            given.scope.is_some(),
            w.impact_scope,
            scope.score(),
        );

        let rev = given.reversibility.unwrap_or(default_rev);
        push(
            Reversibility::KEY,
            rev.name().into(),
            given.reversibility.is_some(),
            w.reversibility,
            rev.score(),
        );

        let production = given.production.unwrap_or(false);
        push(
            "production",
            production.to_string(),
            given.production.is_some(),
            w.production,
            if production { 1.0 } else { 0.0 },
        );

        let (pii, financial) = (given.pii.unwrap_or(false), given.financial.unwrap_or(false));
        let (sensitive, sensitive_score) = match (pii, financial) {
            (true, true) => ("pii+financial", 1.0),
            (true, false) => ("pii", 0.7),
            (false, true) => ("financial", 0.7),
            (false, false) => ("none", 0.0),
        };
        push(
            "sensitive_data",
            sensitive.into(),
            given.pii.is_some() || given.financial.is_some(),
            w.sensitive_data,
            sensitive_score,
        );

        let raw: f64 = factors.iter().map(|f| f.contribution).sum();
        let score = (raw.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0;
        let level = self.level_for(score);
        let requires_approval = score > self.config.approval_threshold || decision.requires_approval;
        let tier = match (requires_approval, self.config.tiers.for_level(level)) {
            (false, _) => ApprovalTier::None,
            (true, ApprovalTier::None) => self.config.forced_tier,
            (true, tier) => tier,
        };

        Ok(RiskAssessment {
            level,
            score,
            requires_approval,
            tier,
            factors,
        })
    }

    fn level_for(&self, score: f64) -> RiskLevel {
        let b = &self.config.boundaries;
        if score < b.medium {
            RiskLevel::Low
        } else if score < b.high {
            RiskLevel::Medium
        } else if score < b.critical {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self {
            config: RiskConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gatehouse_kernel::{ClassificationResult, Evidence, RoutingLayer, WorkflowType};
    use serde_json::json;

    use super::*;

    fn decision(intent: IntentCategory) -> RoutingDecision {
        let result = ClassificationResult {
            matched: true,
            intent,
            sub_intent: "x".into(),
            workflow: WorkflowType::Simple,
            confidence: 0.9,
            layer: RoutingLayer::Pattern,
            evidence: Evidence::Rule {
                rule_id: "R".into(),
                rule_name: "r".into(),
            },
        };
        RoutingDecision::from_classification("req", "text", &result, 10, BTreeMap::new())
    }

    fn ctx(pairs: &[(&str, Value)]) -> ContextMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn request_defaults_are_low_risk() {
        let a = RiskAssessor::default()
            .assess(&decision(IntentCategory::Request), &ContextMap::new())
            .unwrap();
        assert!((a.score - 0.10).abs() < 1e-9);
        assert_eq!(a.level, RiskLevel::Low);
        assert!(!a.requires_approval);
        assert_eq!(a.tier, ApprovalTier::None);
        assert_eq!(a.factors.len(), 5);
        assert!(a.factors.iter().all(|f| !f.from_context));
    }

    #[test]
    fn production_incident_across_systems_is_high() {
        let a = RiskAssessor::default()
            .assess(
                &decision(IntentCategory::Incident),
                &ctx(&[
                    ("production", json!(true)),
                    ("impact_scope", json!("multi_system")),
                ]),
            )
            .unwrap();
        assert!((a.score - 0.625).abs() < 1e-9);
        assert_eq!(a.level, RiskLevel::High);
        assert!(a.requires_approval);
        assert_eq!(a.tier, ApprovalTier::Manager);

        let scope = a.factors.iter().find(|f| f.factor == "impact_scope").unwrap();
        assert!(scope.from_context);
        assert_eq!(scope.value, "multi_system");
    }

    #[test]
    fn worst_case_is_critical() {
        let a = RiskAssessor::default()
            .assess(
                &decision(IntentCategory::Change),
                &ctx(&[
                    ("action_type", json!("delete")),
                    ("impact_scope", json!("global")),
                    ("reversibility", json!("irreversible")),
                    ("production", json!(true)),
                    ("pii", json!(true)),
                    ("financial", json!(true)),
                ]),
            )
            .unwrap();
        assert!((a.score - 1.0).abs() < 1e-9);
        assert_eq!(a.level, RiskLevel::Critical);
        assert_eq!(a.tier, ApprovalTier::Security);
    }

    #[test]
    fn fallback_hint_forces_approval() {
        let fallback = RoutingDecision::fallback("req", "???", 0, BTreeMap::new());
        let a = RiskAssessor::default()
            .assess(
                &fallback,
                &ctx(&[
                    ("action_type", json!("read")),
                    ("impact_scope", json!("single_user")),
                    ("reversibility", json!("reversible")),
                ]),
            )
            .unwrap();
        assert_eq!(a.level, RiskLevel::Low);
        assert!(a.requires_approval);
        assert_eq!(a.tier, ApprovalTier::Manager);
    }

    #[test]
    fn unknown_factor_value_is_rejected() {
        let err = RiskAssessor::default()
            .assess(
                &decision(IntentCategory::Query),
                &ctx(&[("action_type", json!("obliterate"))]),
            )
            .unwrap_err();
        assert!(matches!(err, HitlError::Validation { .. }));
        assert!(err.to_string().contains("obliterate"));

        assert!(RiskAssessor::validate_context(&ctx(&[("production", json!(3))])).is_err());
        assert!(RiskAssessor::validate_context(&ctx(&[("production", json!("true"))])).is_ok());
    }

    #[test]
    fn assessment_is_deterministic() {
        let assessor = RiskAssessor::default();
        let d = decision(IntentCategory::Change);
        let c = ctx(&[("pii", json!(true))]);
        assert_eq!(assessor.assess(&d, &c).unwrap(), assessor.assess(&d, &c).unwrap());
    }

    #[test]
    fn raising_any_factor_never_lowers_the_score() {
        let assessor = RiskAssessor::default();
        let d = decision(IntentCategory::Request);
        let mut previous = 0.0;
        for action in ["read", "write", "execute", "delete"] {
            let s = assessor
                .assess(&d, &ctx(&[("action_type", json!(action))]))
                .unwrap()
                .score;
            assert!(s >= previous, "{action}: {s} < {previous}");
            previous = s;
        }
        let off = assessor.assess(&d, &ctx(&[("production", json!(false))])).unwrap();
        let on = assessor.assess(&d, &ctx(&[("production", json!(true))])).unwrap();
        assert!(on.score > off.score);
        assert!(on.level >= off.level);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = RiskConfig::default();
        config.weights.production = 0.5;
        assert!(matches!(
            RiskAssessor::new(config),
            Err(HitlError::Config { .. })
        ));
    }

    #[test]
    fn boundaries_are_configurable() {
        let mut config = RiskConfig::default();
        config.boundaries = LevelBoundaries {
            medium: 0.05,
            high: 0.5,
            critical: 0.9,
        };
        let a = RiskAssessor::new(config)
            .unwrap()
            .assess(&decision(IntentCategory::Request), &ContextMap::new())
            .unwrap();
        assert_eq!(a.level, RiskLevel::Medium);
        // Score 0.10 is still under the approval threshold.
        assert!(!a.requires_approval);
        assert_eq!(a.tier, ApprovalTier::None);
    }
}
