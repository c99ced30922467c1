//! The routing cascade.
//!
//! [`IntentRouter::route`] runs the layers in a fixed order and stops at the
//! first confident answer:
//!
//! 1. **Pattern** -- synchronous rule engine, microseconds.
//! 2. **Semantic** -- embedding nearest neighbour, bounded by
//!    `semantic_timeout`.
//! 3. **LLM** -- structured classifier, bounded by `llm_timeout`.
//! 4. **Fallback** -- `unknown` / `human_queue`, approval required.
//!
//! A layer that times out (either our deadline or the provider's own) is
//! retried once; every other failure moves straight to the next layer.
//! Routing never fails.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatehouse_kernel::{ClassificationResult, PatternMatcher, RoutingDecision, RoutingLayer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::layer::{ClassificationLayer, ContextMap, LayerOutcome, pattern_outcome};
use crate::stats::{RouterStats, StatsRecorder, Tally};

/// Timeouts and retry policy for the network-bound layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    #[serde(with = "millis")]
    pub semantic_timeout: Duration,
    #[serde(with = "millis")]
    pub llm_timeout: Duration,
    /// Retries after a timeout; `1` means one extra attempt.
    pub timeout_retries: u32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            semantic_timeout: Duration::from_secs(2),
            llm_timeout: Duration::from_secs(10),
            timeout_retries: 1,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

/// Result of running one layer, including its retry.
struct LayerRun {
    outcome: LayerOutcome,
    latency_us: u64,
    retries: u64,
}

pub struct IntentRouter {
    pattern: Arc<PatternMatcher>,
    semantic: Option<Arc<dyn ClassificationLayer>>,
    llm: Option<Arc<dyn ClassificationLayer>>,
    config: CascadeConfig,
    stats: StatsRecorder,
}

impl IntentRouter {
    pub fn new(pattern: Arc<PatternMatcher>) -> Self {
        Self {
            pattern,
            semantic: None,
            llm: None,
            config: CascadeConfig::default(),
            stats: StatsRecorder::default(),
        }
    }

    pub fn with_semantic(mut self, layer: Arc<dyn ClassificationLayer>) -> Self {
        self.semantic = Some(layer);
        self
    }

    pub fn with_llm(mut self, layer: Arc<dyn ClassificationLayer>) -> Self {
        self.llm = Some(layer);
        self
    }

    pub fn with_config(mut self, config: CascadeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pattern(&self) -> &Arc<PatternMatcher> {
        &self.pattern
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Classify `text` and freeze the result.
    pub async fn route(&self, request_id: &str, text: &str, context: &ContextMap) -> RoutingDecision {
        self.run(request_id, text, context, true).await
    }

    /// Same cascade, no statistics.
    pub async fn dry_run(&self, request_id: &str, text: &str, context: &ContextMap) -> RoutingDecision {
        self.run(request_id, text, context, false).await
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.snapshot(self.pattern.stats())
    }

    async fn run(
        &self,
        request_id: &str,
        text: &str,
        context: &ContextMap,
        record: bool,
    ) -> RoutingDecision {
        let mut timings = serde_json::Map::new();
        let mut notes = serde_json::Map::new();
        let mut total_us = 0;

        // Layer 1: pattern.
        let start = Instant::now();
        let outcome = if record {
            pattern_outcome(self.pattern.match_text(text))
        } else {
            pattern_outcome(self.pattern.match_text_quiet(text))
        };
        let us = elapsed_us(start);
        total_us += us;
        timings.insert(RoutingLayer::Pattern.to_string(), json!(us));
        if record {
            self.stats.pattern.record(tally_of(&outcome), 0, us);
        }
        if let LayerOutcome::Matched(result) = outcome {
            return self.decide(request_id, text, &result, total_us, timings, notes, record);
        }

        // Layers 2 and 3: semantic, LLM.
        let network_layers = [
            (&self.semantic, self.config.semantic_timeout),
            (&self.llm, self.config.llm_timeout),
        ];
        for (layer, deadline) in network_layers {
            let Some(layer) = layer else { continue };
            let kind = layer.layer();
            let run = self.attempt(&**layer, text, context, deadline).await;
            total_us += run.latency_us;
            timings.insert(kind.to_string(), json!(run.latency_us));
            if record && let Some(counters) = self.stats.layer(kind) {
                counters.record(tally_of(&run.outcome), run.retries, run.latency_us);
            }

            match run.outcome {
                LayerOutcome::Matched(result) => {
                    return self.decide(request_id, text, &result, total_us, timings, notes, record);
                }
                other => {
                    let reason = other.reason().unwrap_or_default().to_string();
                    debug!(request_id, layer = %kind, %reason, "layer did not match");
                    notes.insert(kind.to_string(), Value::String(reason));
                }
            }
        }

        // Layer 4: fallback.
        let mut metadata = BTreeMap::new();
        metadata.insert("layer_latency_us".into(), Value::Object(timings));
        metadata.insert("layer_notes".into(), Value::Object(notes));
        let decision = RoutingDecision::fallback(request_id, text, total_us, metadata);
        if record {
            self.stats.decided(RoutingLayer::Fallback);
        }
        warn!(request_id, latency_us = total_us, "all layers missed, routing to human queue");
        decision
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        request_id: &str,
        text: &str,
        result: &ClassificationResult,
        total_us: u64,
        timings: serde_json::Map<String, Value>,
        notes: serde_json::Map<String, Value>,
        record: bool,
    ) -> RoutingDecision {
        let mut metadata = BTreeMap::new();
        metadata.insert("layer_latency_us".into(), Value::Object(timings));
        if !notes.is_empty() {
            metadata.insert("layer_notes".into(), Value::Object(notes));
        }
        if let Ok(evidence) = serde_json::to_value(&result.evidence) {
            metadata.insert("evidence".into(), evidence);
        }
        let decision =
            RoutingDecision::from_classification(request_id, text, result, total_us, metadata);
        if record {
            self.stats.decided(result.layer);
        }
        info!(
            request_id,
            layer = %decision.layer,
            decision = %decision.summary(),
            confidence = decision.confidence,
            latency_us = total_us,
            "request routed"
        );
        decision
    }

    /// Run `layer` under `deadline`, retrying after a timeout.
    async fn attempt(
        &self,
        layer: &dyn ClassificationLayer,
        text: &str,
        context: &ContextMap,
        deadline: Duration,
    ) -> LayerRun {
        let start = Instant::now();
        let mut retries = 0;
        loop {
            let outcome = match tokio::time::timeout(deadline, layer.classify(text, context)).await
            {
                Ok(outcome) => outcome,
                Err(_) => LayerOutcome::Failed {
                    reason: format!("timed out after {} ms", deadline.as_millis()),
                    timed_out: true,
                },
            };
            if outcome.is_timeout() && retries < u64::from(self.config.timeout_retries) {
                retries += 1;
                warn!(layer = %layer.layer(), retries, "layer timed out, retrying");
                continue;
            }
            return LayerRun {
                outcome,
                latency_us: elapsed_us(start),
                retries,
            };
        }
    }
}

fn tally_of(outcome: &LayerOutcome) -> Tally {
    match outcome {
        LayerOutcome::Matched(_) => Tally::Hit,
        LayerOutcome::NoMatch { .. } => Tally::Miss,
        LayerOutcome::Failed {
            timed_out: true, ..
        } => Tally::Timeout,
        LayerOutcome::Failed { .. } => Tally::Failure,
    }
}
