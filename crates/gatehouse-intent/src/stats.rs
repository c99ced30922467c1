//! Per-layer cascade counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use gatehouse_kernel::{PatternStats, RoutingLayer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct LayerCounters {
    attempts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    latency_us: AtomicU64,
}

/// How a layer invocation ended, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tally {
    Hit,
    Miss,
    Failure,
    Timeout,
}

impl LayerCounters {
    pub(crate) fn record(&self, tally: Tally, retries: u64, latency_us: u64) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.retries.fetch_add(retries, Ordering::Relaxed);
        self.latency_us.fetch_add(latency_us, Ordering::Relaxed);
        let counter = match tally {
            Tally::Hit => &self.hits,
            Tally::Miss => &self.misses,
            Tally::Failure => &self.failures,
            Tally::Timeout => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LayerStats {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let latency = self.latency_us.load(Ordering::Relaxed);
        LayerStats {
            attempts,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            hit_rate: ratio(hits, attempts),
            mean_latency_us: ratio(latency, attempts),
        }
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub attempts: u64,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub hit_rate: f64,
    pub mean_latency_us: f64,
}

/// Snapshot returned by [`crate::IntentRouter::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_routed: u64,
    pub fallbacks: u64,
    /// Decisions per final layer (`pattern`, `semantic`, `llm`, `fallback`).
    pub decisions_by_layer: BTreeMap<String, u64>,
    pub layers: BTreeMap<String, LayerStats>,
    pub pattern: PatternStats,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    pub(crate) pattern: LayerCounters,
    pub(crate) semantic: LayerCounters,
    pub(crate) llm: LayerCounters,
    total: AtomicU64,
    by_pattern: AtomicU64,
    by_semantic: AtomicU64,
    by_llm: AtomicU64,
    fallbacks: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn layer(&self, layer: RoutingLayer) -> Option<&LayerCounters> {
        match layer {
            RoutingLayer::Pattern => Some(&self.pattern),
            RoutingLayer::Semantic => Some(&self.semantic),
            RoutingLayer::Llm => Some(&self.llm),
            RoutingLayer::Fallback => None,
        }
    }

    pub(crate) fn decided(&self, layer: RoutingLayer) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match layer {
            RoutingLayer::Pattern => &self.by_pattern,
            RoutingLayer::Semantic => &self.by_semantic,
            RoutingLayer::Llm => &self.by_llm,
            RoutingLayer::Fallback => &self.fallbacks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, pattern: PatternStats) -> RouterStats {
        let decisions_by_layer = [
            (RoutingLayer::Pattern, &self.by_pattern),
            (RoutingLayer::Semantic, &self.by_semantic),
            (RoutingLayer::Llm, &self.by_llm),
            (RoutingLayer::Fallback, &self.fallbacks),
        ]
        .into_iter()
        .map(|(l, c)| (l.as_str().to_string(), c.load(Ordering::Relaxed)))
        .collect();

        let layers = [
            (RoutingLayer::Pattern, &self.pattern),
            (RoutingLayer::Semantic, &self.semantic),
            (RoutingLayer::Llm, &self.llm),
        ]
        .into_iter()
        .map(|(l, c)| (l.as_str().to_string(), c.snapshot()))
        .collect();

        RouterStats {
            total_routed: self.total.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            decisions_by_layer,
            layers,
            pattern,
        }
    }
}
