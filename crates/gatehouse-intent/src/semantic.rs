//! Embedding nearest-neighbour router: the second layer of the cascade.
//!
//! Each [`SemanticRoute`] lists example utterances.  [`SemanticRouter::initialize`]
//! embeds all of them (reusing vectors persisted in the [`EmbeddingStore`]
//! under the provider's model id) into an immutable [`RouteIndex`].  A query
//! is embedded and compared against every utterance vector by cosine
//! similarity; the best one wins if it clears the threshold.
//!
//! The index lives behind `RwLock<Option<Arc<RouteIndex>>>`.  Readers clone
//! the `Arc` and release the lock; reloads build a complete new index before
//! swapping it in, so a failed reload leaves the old one serving.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use gatehouse_kernel::{
    ClassificationResult, Evidence, IntentCategory, RoutingLayer, WorkflowType,
};
use gatehouse_llm::EmbeddingProvider;
use gatehouse_store::EmbeddingStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IntentError, Result};
use crate::layer::{ClassificationLayer, ContextMap, LayerOutcome};

/// Default minimum cosine similarity for a match.
pub const DEFAULT_THRESHOLD: f64 = 0.85;

// ---------------------------------------------------------------------------
// Route definitions (serde)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticRoute {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub intent: IntentCategory,
    pub sub_intent: String,
    pub workflow: WorkflowType,
    pub utterances: Vec<String>,
}

impl SemanticRoute {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| IntentError::InvalidRoute {
            route: self.name.clone(),
            reason: reason.into(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.intent == IntentCategory::Unknown {
            return Err(invalid("routes cannot target the unknown intent"));
        }
        if self.utterances.is_empty() {
            return Err(invalid("at least one utterance is required"));
        }
        if self.utterances.iter().any(|u| u.trim().is_empty()) {
            return Err(invalid("utterances must not be blank"));
        }
        Ok(())
    }
}

/// Top-level shape of a `routes.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteFile {
    #[serde(default)]
    pub route: Vec<SemanticRoute>,
}

impl RouteFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| IntentError::RouteFileParse {
            reason: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| IntentError::RouteFileParse {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }
}

fn validate_all(routes: &[SemanticRoute]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for route in routes {
        route.validate()?;
        if !seen.insert(route.name.as_str()) {
            return Err(IntentError::InvalidRoute {
                route: route.name.clone(),
                reason: "duplicate route name".into(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

struct IndexedUtterance {
    route: Arc<SemanticRoute>,
    vector: Arc<Vec<f32>>,
}

/// Immutable snapshot of every utterance vector for one model.
pub struct RouteIndex {
    model_id: String,
    dims: usize,
    routes: Vec<Arc<SemanticRoute>>,
    entries: Vec<IndexedUtterance>,
}

impl RouteIndex {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn utterance_count(&self) -> usize {
        self.entries.len()
    }

    fn nearest(&self, query: &[f32]) -> Option<(&Arc<SemanticRoute>, f64)> {
        self.entries
            .iter()
            .map(|e| (&e.route, cosine_similarity(query, &e.vector)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Best neighbour for one query.
#[derive(Debug, Clone)]
pub struct SemanticMatchResult {
    pub matched: bool,
    pub route: Option<Arc<SemanticRoute>>,
    pub similarity: f64,
    pub confidence: f64,
}

impl SemanticMatchResult {
    pub fn classification(&self) -> Option<ClassificationResult> {
        let route = self.route.as_ref().filter(|_| self.matched)?;
        Some(ClassificationResult {
            matched: true,
            intent: route.intent,
            sub_intent: route.sub_intent.clone(),
            workflow: route.workflow,
            confidence: self.confidence,
            layer: RoutingLayer::Semantic,
            evidence: Evidence::Similarity {
                route: route.name.clone(),
                similarity: self.similarity,
            },
        })
    }
}

pub struct SemanticRouter {
    provider: Arc<dyn EmbeddingProvider>,
    store: Option<EmbeddingStore>,
    threshold: f64,
    routes: RwLock<Arc<Vec<SemanticRoute>>>,
    index: RwLock<Option<Arc<RouteIndex>>>,
    /// Serializes index builds.
    writer: tokio::sync::Mutex<()>,
}

impl SemanticRouter {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, routes: Vec<SemanticRoute>) -> Result<Self> {
        validate_all(&routes)?;
        Ok(Self {
            provider,
            store: None,
            threshold: DEFAULT_THRESHOLD,
            routes: RwLock::new(Arc::new(routes)),
            index: RwLock::new(None),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Persist and reuse utterance vectors across restarts.
    pub fn with_store(mut self, store: EmbeddingStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_initialized(&self) -> bool {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn index(&self) -> Option<Arc<RouteIndex>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn routes(&self) -> Arc<Vec<SemanticRoute>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Embed every utterance and publish the index.  Returns the number of
    /// indexed utterances.
    pub async fn initialize(&self) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let routes = self.routes();
        let index = self.build_index(&routes, false).await?;
        Ok(self.publish(routes, index))
    }

    /// Validate, embed and swap in a new route set.  On error the previous
    /// routes and index stay active.
    pub async fn reload_routes(&self, routes: Vec<SemanticRoute>) -> Result<usize> {
        validate_all(&routes)?;
        let _writer = self.writer.lock().await;
        let routes = Arc::new(routes);
        let index = self.build_index(&routes, false).await?;
        Ok(self.publish(routes, index))
    }

    /// Re-embed everything under the provider's current model, ignoring
    /// persisted vectors, and drop vectors of other models.
    pub async fn reindex(&self) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let model_id = self.provider.model_id().to_string();
        if let Some(store) = &self.store {
            store.clear_model(&model_id).await?;
        }
        let routes = self.routes();
        let index = self.build_index(&routes, true).await?;
        if let Some(store) = &self.store {
            store.prune_other_models(&model_id).await?;
        }
        Ok(self.publish(routes, index))
    }

    pub async fn route(&self, text: &str) -> Result<SemanticMatchResult> {
        let index = self.index().ok_or(IntentError::NotInitialized)?;
        let query = self.provider.embed(text).await?;
        if index.dims != 0 && query.len() != index.dims {
            return Err(IntentError::DimensionMismatch {
                expected: index.dims,
                actual: query.len(),
            });
        }

        let Some((route, similarity)) = index.nearest(&query) else {
            return Ok(SemanticMatchResult {
                matched: false,
                route: None,
                similarity: 0.0,
                confidence: 0.0,
            });
        };
        let matched = similarity >= self.threshold;
        debug!(
            route = %route.name,
            similarity,
            threshold = self.threshold,
            matched,
            "semantic nearest neighbour"
        );
        Ok(SemanticMatchResult {
            matched,
            route: Some(Arc::clone(route)),
            similarity,
            confidence: similarity.clamp(0.0, 1.0),
        })
    }

    fn publish(&self, routes: Arc<Vec<SemanticRoute>>, index: RouteIndex) -> usize {
        let count = index.utterance_count();
        info!(
            routes = index.route_count(),
            utterances = count,
            model_id = %index.model_id,
            "semantic index published"
        );
        *self.routes.write().unwrap_or_else(PoisonError::into_inner) = routes;
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(index));
        count
    }

    async fn build_index(&self, routes: &[SemanticRoute], force: bool) -> Result<RouteIndex> {
        let model_id = self.provider.model_id().to_string();

        let texts: Vec<String> = routes
            .iter()
            .flat_map(|r| r.utterances.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut vectors: Vec<Option<Arc<Vec<f32>>>> = match (&self.store, force) {
            (Some(store), false) => store.get_many(&model_id, &texts).await?,
            _ => vec![None; texts.len()],
        };

        let missing: Vec<String> = texts
            .iter()
            .zip(&vectors)
            .filter(|(_, v)| v.is_none())
            .map(|(t, _)| t.clone())
            .collect();

        if !missing.is_empty() {
            debug!(count = missing.len(), model_id = %model_id, "embedding utterances");
            let fresh = self.provider.embed_batch(&missing).await?;
            if fresh.len() != missing.len() {
                return Err(IntentError::Internal(format!(
                    "provider returned {} vectors for {} utterances",
                    fresh.len(),
                    missing.len()
                )));
            }
            if let Some(store) = &self.store {
                store
                    .put_many(
                        &model_id,
                        missing.iter().cloned().zip(fresh.iter().cloned()).collect(),
                    )
                    .await?;
            }
            let mut fresh = fresh.into_iter();
            for slot in vectors.iter_mut().filter(|v| v.is_none()) {
                *slot = fresh.next().map(Arc::new);
            }
        }

        let by_text: std::collections::HashMap<&str, Arc<Vec<f32>>> = texts
            .iter()
            .map(String::as_str)
            .zip(vectors)
            .filter_map(|(text, vector)| vector.map(|v| (text, v)))
            .collect();

        let mut dims = 0;
        let mut shared_routes = Vec::with_capacity(routes.len());
        let mut entries = Vec::new();
        for route in routes {
            let route = Arc::new(route.clone());
            for utterance in &route.utterances {
                let Some(vector) = by_text.get(utterance.as_str()) else {
                    continue;
                };
                if dims == 0 {
                    dims = vector.len();
                } else if vector.len() != dims {
                    return Err(IntentError::DimensionMismatch {
                        expected: dims,
                        actual: vector.len(),
                    });
                }
                entries.push(IndexedUtterance {
                    route: Arc::clone(&route),
                    vector: Arc::clone(vector),
                });
            }
            shared_routes.push(route);
        }

        Ok(RouteIndex {
            model_id,
            dims,
            routes: shared_routes,
            entries,
        })
    }
}

#[async_trait]
impl ClassificationLayer for SemanticRouter {
    fn layer(&self) -> RoutingLayer {
        RoutingLayer::Semantic
    }

    async fn classify(&self, text: &str, _context: &ContextMap) -> LayerOutcome {
        match self.route(text).await {
            Ok(result) => match result.classification() {
                Some(c) => LayerOutcome::Matched(c),
                None => LayerOutcome::NoMatch {
                    reason: format!(
                        "best similarity {:.3} below threshold {:.2}",
                        result.similarity, self.threshold
                    ),
                },
            },
            Err(err) => LayerOutcome::failed(&err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
