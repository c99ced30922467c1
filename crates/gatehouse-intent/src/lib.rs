//! Intent routing for Gatehouse.
//!
//! This crate provides the classification cascade that turns free text into
//! a frozen [`RoutingDecision`](gatehouse_kernel::RoutingDecision):
//!
//! - **Layer contract**: [`ClassificationLayer`] and [`LayerOutcome`], with
//!   the kernel's `PatternMatcher` as the first implementation.
//! - **Semantic routing**: embedding nearest neighbour over example
//!   utterances via [`semantic::SemanticRouter`].
//! - **LLM classification**: schema-checked structured output via
//!   [`classifier::LlmClassifier`].
//! - **Cascade**: ordered evaluation, timeouts, retry and fallback via
//!   [`cascade::IntentRouter`].
//! - **Defaults**: the built-in rule and route packs.

pub mod cascade;
pub mod classifier;
pub mod defaults;
pub mod error;
pub mod layer;
pub mod semantic;
pub mod stats;

pub use cascade::{CascadeConfig, IntentRouter};
pub use classifier::{LlmClassificationResult, LlmClassifier};
pub use defaults::{default_routes, default_rules};
pub use error::{IntentError, Result};
pub use layer::{ClassificationLayer, ContextMap, LayerOutcome};
pub use semantic::{RouteFile, SemanticMatchResult, SemanticRoute, SemanticRouter};
pub use stats::{LayerStats, RouterStats};
