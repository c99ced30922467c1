//! Deterministic rule engine: the first layer of the routing cascade.
//!
//! Rules carry either a regex or a keyword list.  They are compiled once,
//! when a rule set is built, so a malformed pattern is rejected at load time
//! and never surfaces while matching.
//!
//! | Matcher | Technique | Semantics |
//! |---------|-----------|-----------|
//! | `pattern` | [`regex`], case-insensitive | any match in the text |
//! | `keywords` | [`aho_corasick`], ASCII case folding | any keyword as a whole word |
//!
//! The active rule set is an immutable [`RuleSet`] behind
//! `RwLock<Arc<RuleSet>>`.  Readers clone the `Arc` and release the lock
//! before evaluating; [`PatternMatcher::add_rule`] and
//! [`PatternMatcher::reload_rules`] build a brand-new set and swap the
//! pointer.  Rules are evaluated by descending priority, ties broken by id
//! ascending, and the first match wins.
//!
//! # Example
//!
//! ```rust
//! # use gatehouse_kernel::pattern::{PatternMatcher, RuleFile};
//! let rules = RuleFile::from_toml_str(r#"
//!     [[rule]]
//!     id = "REQ-001"
//!     name = "password reset"
//!     pattern = "reset (my )?password"
//!     intent = "request"
//!     sub_intent = "password_reset"
//!     workflow = "simple"
//!     priority = 80
//!     confidence = 0.95
//! "#).unwrap();
//!
//! let matcher = PatternMatcher::new(rules.rule).unwrap();
//! let result = matcher.match_text("Please RESET my password");
//! assert!(result.matched);
//! assert_eq!(result.rule.unwrap().id, "REQ-001");
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::intent::{ClassificationResult, Evidence, IntentCategory, RoutingLayer, WorkflowType};

// ---------------------------------------------------------------------------
// Rule definitions (serde)
// ---------------------------------------------------------------------------

/// A rule as written in a rule file.  Exactly one of `pattern` or
/// `keywords` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub intent: IntentCategory,
    pub sub_intent: String,
    pub workflow: WorkflowType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn default_confidence() -> f64 {
    0.9
}

fn default_enabled() -> bool {
    true
}

/// Top-level shape of a `rules.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rule: Vec<RuleSpec>,
}

impl RuleFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| KernelError::RuleFileParse {
            reason: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| KernelError::RuleFileParse {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }
}

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RuleMatcher {
    Regex(Regex),
    Keywords(AhoCorasick),
}

/// A compiled, immutable rule.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub id: String,
    pub name: String,
    pub intent: IntentCategory,
    pub sub_intent: String,
    pub workflow: WorkflowType,
    pub priority: i32,
    pub confidence: f64,
    pub enabled: bool,
    pub tags: BTreeSet<String>,
    spec: RuleSpec,
    matcher: RuleMatcher,
}

impl PatternRule {
    /// Validate and compile a rule definition.
    pub fn compile(spec: RuleSpec) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(KernelError::InvalidRule {
                rule_id: spec.id.clone(),
                reason: "rule id must not be empty".into(),
            });
        }
        if !(0.0..=1.0).contains(&spec.confidence) {
            return Err(KernelError::InvalidRule {
                rule_id: spec.id.clone(),
                reason: format!("confidence {} outside [0, 1]", spec.confidence),
            });
        }
        if spec.intent == IntentCategory::Unknown {
            return Err(KernelError::InvalidRule {
                rule_id: spec.id.clone(),
                reason: "rules cannot target the unknown category".into(),
            });
        }

        let matcher = match (&spec.pattern, spec.keywords.is_empty()) {
            (Some(_), false) => {
                return Err(KernelError::InvalidRule {
                    rule_id: spec.id.clone(),
                    reason: "set either `pattern` or `keywords`, not both".into(),
                });
            }
            (None, true) => {
                return Err(KernelError::InvalidRule {
                    rule_id: spec.id.clone(),
                    reason: "rule has neither a pattern nor keywords".into(),
                });
            }
            (Some(pattern), true) => {
                if pattern.trim().is_empty() {
                    return Err(KernelError::InvalidPattern {
                        rule_id: spec.id.clone(),
                        pattern: pattern.clone(),
                        reason: "empty pattern".into(),
                    });
                }
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| KernelError::InvalidPattern {
                        rule_id: spec.id.clone(),
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                RuleMatcher::Regex(re)
            }
            (None, false) => {
                let keywords: Vec<&str> = spec
                    .keywords
                    .iter()
                    .map(|k| k.trim())
                    .filter(|k| !k.is_empty())
                    .collect();
                if keywords.is_empty() {
                    return Err(KernelError::InvalidRule {
                        rule_id: spec.id.clone(),
                        reason: "keyword list contains only blank entries".into(),
                    });
                }
                let ac = AhoCorasickBuilder::new()
                    .ascii_case_insensitive(true)
                    .build(&keywords)
                    .map_err(|e| KernelError::InvalidPattern {
                        rule_id: spec.id.clone(),
                        pattern: keywords.join(","),
                        reason: e.to_string(),
                    })?;
                RuleMatcher::Keywords(ac)
            }
        };

        Ok(Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            intent: spec.intent,
            sub_intent: spec.sub_intent.clone(),
            workflow: spec.workflow,
            priority: spec.priority,
            confidence: spec.confidence,
            enabled: spec.enabled,
            tags: spec.tags.clone(),
            spec,
            matcher,
        })
    }

    /// The definition this rule was compiled from.
    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn is_match(&self, text: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Regex(re) => re.is_match(text),
            RuleMatcher::Keywords(ac) => ac
                .find_overlapping_iter(text)
                .any(|m| is_word_bounded(text, m.start(), m.end())),
        }
    }

    /// The layer-local classification this rule produces on a match.
    pub fn classification(&self) -> ClassificationResult {
        ClassificationResult {
            matched: true,
            intent: self.intent,
            sub_intent: self.sub_intent.clone(),
            workflow: self.workflow,
            confidence: self.confidence,
            layer: RoutingLayer::Pattern,
            evidence: Evidence::Rule {
                rule_id: self.id.clone(),
                rule_name: self.name.clone(),
            },
        }
    }
}

fn is_word_bounded(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    !before.is_some_and(is_word) && !after.is_some_and(is_word)
}

// ---------------------------------------------------------------------------
// RuleSet snapshot
// ---------------------------------------------------------------------------

/// An immutable, ordered collection of compiled rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<PatternRule>>,
}

impl RuleSet {
    /// Compile every definition and order the result.  Duplicate ids are
    /// rejected.
    pub fn compile(specs: Vec<RuleSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                return Err(KernelError::InvalidRule {
                    rule_id: spec.id,
                    reason: "duplicate rule id".into(),
                });
            }
            rules.push(Arc::new(PatternRule::compile(spec)?));
        }
        Ok(Self::from_compiled(rules))
    }

    fn from_compiled(mut rules: Vec<Arc<PatternRule>>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Self { rules }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Arc<PatternRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<PatternRule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    fn first_match(&self, text: &str) -> Option<&Arc<PatternRule>> {
        self.rules.iter().filter(|r| r.enabled).find(|r| r.is_match(text))
    }
}

// ---------------------------------------------------------------------------
// PatternMatcher
// ---------------------------------------------------------------------------

/// Outcome of evaluating the active rule set against one text.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    pub rule: Option<Arc<PatternRule>>,
    pub confidence: f64,
}

impl MatchResult {
    fn miss() -> Self {
        Self {
            matched: false,
            rule: None,
            confidence: 0.0,
        }
    }
}

/// Counters exposed through [`PatternMatcher::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStats {
    pub rule_count: usize,
    pub enabled_count: usize,
    pub evaluations: u64,
    pub matches: u64,
    /// Hits per rule id.
    pub rule_hits: BTreeMap<String, u64>,
}

/// Thread-safe front-end over the active [`RuleSet`].
pub struct PatternMatcher {
    active: RwLock<Arc<RuleSet>>,
    /// Serializes writers so concurrent `add_rule` calls never lose a rule.
    writer: Mutex<()>,
    hits: DashMap<String, u64>,
    evaluations: AtomicU64,
    matches: AtomicU64,
}

impl PatternMatcher {
    /// Build a matcher from rule definitions.
    pub fn new(specs: Vec<RuleSpec>) -> Result<Self> {
        let set = RuleSet::compile(specs)?;
        tracing::info!(rules = set.len(), "pattern rule set loaded");
        Ok(Self {
            active: RwLock::new(Arc::new(set)),
            writer: Mutex::new(()),
            hits: DashMap::new(),
            evaluations: AtomicU64::new(0),
            matches: AtomicU64::new(0),
        })
    }

    /// An empty matcher that never matches.
    pub fn empty() -> Self {
        Self {
            active: RwLock::new(Arc::new(RuleSet::default())),
            writer: Mutex::new(()),
            hits: DashMap::new(),
            evaluations: AtomicU64::new(0),
            matches: AtomicU64::new(0),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, set: RuleSet) {
        let mut guard = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(set);
    }

    /// Evaluate `text` and record hit statistics.
    pub fn match_text(&self, text: &str) -> MatchResult {
        let result = self.match_text_quiet(text);
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        if let Some(rule) = &result.rule {
            self.matches.fetch_add(1, Ordering::Relaxed);
            *self.hits.entry(rule.id.clone()).or_insert(0) += 1;
            tracing::debug!(rule_id = %rule.id, priority = rule.priority, "pattern rule matched");
        }
        result
    }

    /// Evaluate `text` without touching any counters.
    pub fn match_text_quiet(&self, text: &str) -> MatchResult {
        let set = self.snapshot();
        match set.first_match(text) {
            Some(rule) => MatchResult {
                matched: true,
                confidence: rule.confidence,
                rule: Some(Arc::clone(rule)),
            },
            None => MatchResult::miss(),
        }
    }

    /// Compile `spec` and publish a new snapshot containing it.
    pub fn add_rule(&self, spec: RuleSpec) -> Result<()> {
        let rule = Arc::new(PatternRule::compile(spec)?);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot();
        if current.get(&rule.id).is_some() {
            return Err(KernelError::InvalidRule {
                rule_id: rule.id.clone(),
                reason: "duplicate rule id".into(),
            });
        }
        let mut rules = current.rules().to_vec();
        tracing::debug!(rule_id = %rule.id, "rule added");
        rules.push(rule);
        self.swap(RuleSet::from_compiled(rules));
        Ok(())
    }

    /// Replace the whole rule set.  On error the previous set stays active.
    pub fn reload_rules(&self, specs: Vec<RuleSpec>) -> Result<usize> {
        let set = RuleSet::compile(specs)?;
        let count = set.len();
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.swap(set);
        tracing::info!(rules = count, "pattern rule set reloaded");
        Ok(count)
    }

    pub fn stats(&self) -> PatternStats {
        let set = self.snapshot();
        PatternStats {
            rule_count: set.len(),
            enabled_count: set.rules().iter().filter(|r| r.enabled).count(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            rule_hits: self
                .hits
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn regex_rule(id: &str, pattern: &str, priority: i32) -> RuleSpec {
        RuleSpec {
            id: id.into(),
            name: id.to_lowercase(),
            pattern: Some(pattern.into()),
            keywords: Vec::new(),
            intent: IntentCategory::Request,
            sub_intent: format!("{}_sub", id.to_lowercase()),
            workflow: WorkflowType::Simple,
            priority,
            confidence: 0.9,
            enabled: true,
            tags: BTreeSet::new(),
        }
    }

    fn keyword_rule(id: &str, keywords: &[&str], priority: i32) -> RuleSpec {
        RuleSpec {
            pattern: None,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ..regex_rule(id, "", priority)
        }
    }

    #[test]
    fn regex_match_is_case_insensitive() {
        let m = PatternMatcher::new(vec![regex_rule("REQ-001", r"reset (my )?password", 80)])
            .unwrap();
        let result = m.match_text("Please RESET MY PASSWORD");
        assert!(result.matched);
        assert_eq!(result.rule.unwrap().id, "REQ-001");
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let m = PatternMatcher::new(vec![keyword_rule("KW-1", &["vpn"], 10)]).unwrap();
        assert!(m.match_text("My VPN is down").matched);
        assert!(m.match_text("vpn").matched);
        assert!(!m.match_text("openvpnclient crashed").matched);
    }

    #[test]
    fn higher_priority_wins() {
        let m = PatternMatcher::new(vec![
            regex_rule("LOW", "server", 10),
            regex_rule("HIGH", "server", 90),
        ])
        .unwrap();
        let result = m.match_text("server is down");
        assert_eq!(result.rule.unwrap().id, "HIGH");
    }

    #[test]
    fn priority_ties_break_on_id() {
        let m = PatternMatcher::new(vec![
            regex_rule("B-2", "printer", 50),
            regex_rule("A-1", "printer", 50),
        ])
        .unwrap();
        assert_eq!(m.match_text("printer jam").rule.unwrap().id, "A-1");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut disabled = regex_rule("HIGH", "disk", 90);
        disabled.enabled = false;
        let m = PatternMatcher::new(vec![disabled, regex_rule("LOW", "disk", 10)]).unwrap();
        assert_eq!(m.match_text("disk full").rule.unwrap().id, "LOW");
        assert_eq!(m.stats().enabled_count, 1);
    }

    #[test]
    fn invalid_regex_is_rejected_at_load() {
        match PatternMatcher::new(vec![regex_rule("BAD", "[invalid(", 1)]) {
            Err(KernelError::InvalidPattern { rule_id, .. }) => assert_eq!(rule_id, "BAD"),
            Err(other) => panic!("expected InvalidPattern, got {other:?}"),
            Ok(_) => panic!("expected InvalidPattern, got a matcher"),
        }
    }

    #[test]
    fn empty_keyword_list_is_rejected() {
        assert!(PatternRule::compile(keyword_rule("KW", &["  "], 1)).is_err());
        assert!(PatternRule::compile(keyword_rule("KW", &[], 1)).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let m = PatternMatcher::new(vec![regex_rule("X", "a", 1)]).unwrap();
        assert!(m.add_rule(regex_rule("X", "b", 2)).is_err());
        assert!(PatternMatcher::new(vec![regex_rule("Y", "a", 1), regex_rule("Y", "b", 1)]).is_err());
    }

    #[test]
    fn add_rule_publishes_new_snapshot() {
        let m = PatternMatcher::new(vec![regex_rule("A", "alpha", 1)]).unwrap();
        let before = m.snapshot();
        m.add_rule(regex_rule("B", "beta", 5)).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(m.snapshot().len(), 2);
        assert_eq!(m.match_text("beta test").rule.unwrap().id, "B");
    }

    #[test]
    fn failed_reload_keeps_previous_rules() {
        let m = PatternMatcher::new(vec![regex_rule("A", "alpha", 1)]).unwrap();
        assert!(m.reload_rules(vec![regex_rule("BAD", "(", 1)]).is_err());
        assert!(m.match_text("alpha").matched);

        assert_eq!(m.reload_rules(vec![regex_rule("C", "gamma", 1)]).unwrap(), 1);
        assert!(!m.match_text("alpha").matched);
    }

    #[test]
    fn stats_count_hits_but_quiet_matching_does_not() {
        let m = PatternMatcher::new(vec![regex_rule("A", "alpha", 1)]).unwrap();
        m.match_text("alpha");
        m.match_text("alpha again");
        m.match_text("nothing");
        m.match_text_quiet("alpha");

        let stats = m.stats();
        assert_eq!(stats.evaluations, 3);
        assert_eq!(stats.matches, 2);
        assert_eq!(stats.rule_hits.get("A"), Some(&2));
    }

    #[test]
    fn rule_file_parses_both_matcher_kinds() {
        let file = RuleFile::from_toml_str(
            r#"
            [[rule]]
            id = "INC-001"
            name = "etl failure"
            pattern = "etl.*(fail|error)"
            intent = "incident"
            sub_intent = "etl_failure"
            workflow = "magentic"
            priority = 90
            tags = ["data"]

            [[rule]]
            id = "QRY-001"
            name = "status question"
            keywords = ["status of", "is it up"]
            intent = "query"
            sub_intent = "status"
            workflow = "simple"
            "#,
        )
        .unwrap();
        assert_eq!(file.rule.len(), 2);
        assert_eq!(file.rule[1].priority, 0);
        assert!(file.rule[1].enabled);

        let m = PatternMatcher::new(file.rule).unwrap();
        let hit = m.match_text("the ETL pipeline is failing").rule.unwrap();
        assert_eq!(hit.workflow, WorkflowType::Magentic);
        assert!(hit.tags.contains("data"));
    }

    #[test]
    fn unknown_workflow_in_rule_file_is_a_parse_error() {
        let err = RuleFile::from_toml_str(
            r#"
            [[rule]]
            id = "X"
            name = "x"
            pattern = "x"
            intent = "request"
            sub_intent = "x"
            workflow = "waterfall"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::RuleFileParse { .. }));
    }
}
