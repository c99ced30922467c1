//! Wiring: turn a [`GateConfig`] into a running [`Pipeline`].
//!
//! The semantic and LLM layers are optional.  A layer whose credentials are
//! missing is left out with a warning and the cascade runs without it;
//! pattern rules and fallback always work.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use gatehouse_hitl::{
    FanoutNotifier, HitlController, HttpDispatcher, LogNotifier, LoggingDispatcher, Notifier,
    Pipeline, RiskAssessor, WebhookNotifier, WorkflowDispatcher,
};
use gatehouse_intent::{
    ClassificationLayer, IntentRouter, LlmClassifier, RouteFile, SemanticRoute, SemanticRouter,
    default_routes, default_rules,
};
use gatehouse_kernel::{EventBus, PatternMatcher, RuleFile, RuleSet, RuleSpec};
use gatehouse_llm::{EmbeddingClient, EmbeddingClientConfig, LlmClient, LlmClientConfig};
use gatehouse_store::{Database, EmbeddingStore, SqliteRepository, StateManager};
use gatehouse_web::ConfigReloader;
use tracing::{info, warn};

use crate::config::{GateConfig, LlmProviderName, env_non_empty};

/// Everything a subcommand may need after wiring.
pub struct Runtime {
    pub config: GateConfig,
    pub pipeline: Pipeline,
    pub pattern: Arc<PatternMatcher>,
    pub semantic: Option<Arc<SemanticRouter>>,
    pub bus: EventBus,
}

impl Runtime {
    /// Reloader over the config directory, wired to the live snapshots.
    pub fn reloader(&self) -> ConfigReloader {
        let reloader = ConfigReloader::new(&self.config.server.config_dir, Arc::clone(&self.pattern));
        match &self.semantic {
            Some(semantic) => reloader.with_semantic(Arc::clone(semantic)),
            None => reloader,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule and route files
// ---------------------------------------------------------------------------

/// Rules from `path`, or the built-in pack when the file is absent.
pub fn load_rules(path: &Path) -> Result<Vec<RuleSpec>> {
    if path.exists() {
        let file = RuleFile::load(path).with_context(|| format!("failed to load {}", path.display()))?;
        info!(path = %path.display(), rules = file.rule.len(), "loaded rule file");
        Ok(file.rule)
    } else {
        info!(path = %path.display(), "no rule file, using built-in rules");
        default_rules().context("built-in rules are invalid")
    }
}

/// Routes from `path`, or the built-in pack when the file is absent.
pub fn load_routes(path: &Path) -> Result<Vec<SemanticRoute>> {
    if path.exists() {
        let file = RouteFile::load(path).with_context(|| format!("failed to load {}", path.display()))?;
        info!(path = %path.display(), routes = file.route.len(), "loaded route file");
        Ok(file.route)
    } else {
        info!(path = %path.display(), "no route file, using built-in routes");
        default_routes().context("built-in routes are invalid")
    }
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

pub async fn open_database(config: &GateConfig) -> Result<Database> {
    if config.store.in_memory() {
        return Database::in_memory_migrated()
            .await
            .context("failed to open in-memory database");
    }
    let path = config.store.path.clone();
    let db = Database::open_and_migrate(path.clone())
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    info!(path = %path.display(), "store initialized");
    Ok(db)
}

/// `None` when the layer is disabled or its API key is missing.
fn build_llm(config: &GateConfig) -> Result<Option<Arc<LlmClassifier>>> {
    let llm = &config.llm;
    if !llm.enabled {
        return Ok(None);
    }
    let Some(api_key) = env_non_empty(&llm.api_key_env) else {
        warn!(env = %llm.api_key_env, "no LLM API key, LLM layer disabled");
        return Ok(None);
    };

    let model = llm.model();
    let mut client_config = match llm.provider {
        LlmProviderName::Anthropic => LlmClientConfig::anthropic(api_key, model),
        LlmProviderName::Openai => LlmClientConfig::openai(api_key, model),
        LlmProviderName::OpenaiCompatible => LlmClientConfig::openai_compatible(
            api_key,
            model,
            llm.base_url.clone().unwrap_or_default(),
        ),
    };
    if let Some(base) = &llm.base_url {
        client_config.base_url = base.clone();
    }
    let client_config = client_config.with_timeout(std::time::Duration::from_secs(llm.timeout_secs.max(1)));

    let client = LlmClient::new(client_config).context("failed to build LLM client")?;
    info!(provider = client.provider().as_str(), model = client.default_model(), "LLM layer ready");
    Ok(Some(Arc::new(
        LlmClassifier::new(Arc::new(client)).with_min_confidence(llm.min_confidence),
    )))
}

/// `None` when the layer is disabled or its API key is missing.  The index
/// is built by the caller.
fn build_semantic(config: &GateConfig, db: &Database) -> Result<Option<Arc<SemanticRouter>>> {
    let section = &config.semantic;
    if !section.enabled {
        return Ok(None);
    }
    let embedding = &config.embedding;
    let mut client_config = EmbeddingClientConfig::new(&embedding.base_url, &embedding.model);
    if !embedding.api_key_env.is_empty() {
        let Some(api_key) = env_non_empty(&embedding.api_key_env) else {
            warn!(env = %embedding.api_key_env, "no embedding API key, semantic layer disabled");
            return Ok(None);
        };
        client_config = client_config.with_api_key(api_key);
    }

    let client = EmbeddingClient::new(client_config).context("failed to build embedding client")?;
    let routes = load_routes(&config.routes_path())?;
    let router = SemanticRouter::new(Arc::new(client), routes)
        .context("invalid semantic routes")?
        .with_store(EmbeddingStore::new(db.clone(), section.cache_capacity))
        .with_threshold(section.threshold);
    Ok(Some(Arc::new(router)))
}

fn build_notifier(config: &GateConfig) -> Arc<dyn Notifier> {
    let mut channels: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = config.notify.url() {
        info!(url, "approval webhook enabled");
        channels.push(Arc::new(WebhookNotifier::new(url)));
    }
    Arc::new(FanoutNotifier::new(channels))
}

fn build_dispatcher(config: &GateConfig) -> Arc<dyn WorkflowDispatcher> {
    match config.dispatch.url() {
        Some(url) => {
            info!(url, "dispatching to workflow engine");
            Arc::new(HttpDispatcher::new(url))
        }
        None => {
            warn!("no dispatch webhook configured, cleared requests are only logged");
            Arc::new(LoggingDispatcher)
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Open the store and assemble the full pipeline.
pub async fn build(config: GateConfig) -> Result<Runtime> {
    let db = open_database(&config).await?;
    build_with_database(config, db).await
}

pub async fn build_with_database(config: GateConfig, db: Database) -> Result<Runtime> {
    let bus = EventBus::default();
    let states = StateManager::new(Arc::new(SqliteRepository::new(db.clone())), bus.clone());

    let pattern = Arc::new(
        PatternMatcher::new(load_rules(&config.rules_path())?).context("failed to compile rules")?,
    );
    let mut router = IntentRouter::new(Arc::clone(&pattern)).with_config(config.cascade.clone());

    let semantic = build_semantic(&config, &db)?;
    if let Some(semantic) = &semantic {
        match semantic.initialize().await {
            Ok(count) => info!(utterances = count, "semantic index ready"),
            Err(e) => warn!(error = %e, "semantic index build failed, layer will be skipped until reload"),
        }
        router = router.with_semantic(Arc::clone(semantic) as Arc<dyn ClassificationLayer>);
    }
    if let Some(llm) = build_llm(&config)? {
        router = router.with_llm(llm as Arc<dyn ClassificationLayer>);
    }

    let assessor = RiskAssessor::new(config.risk.clone()).context("invalid risk configuration")?;
    let controller = HitlController::new(states)
        .with_notifier(build_notifier(&config))
        .with_policy(config.approvals.policy());
    let pipeline = Pipeline::new(Arc::new(router), assessor, controller, build_dispatcher(&config));

    Ok(Runtime {
        config,
        pipeline,
        pattern,
        semantic,
        bus,
    })
}

/// Parse and compile a rule file without touching any live matcher.
pub fn check_rules(path: &Path) -> Result<RuleSet> {
    let file = RuleFile::load(path).with_context(|| format!("failed to parse {}", path.display()))?;
    RuleSet::compile(file.rule).with_context(|| format!("failed to compile {}", path.display()))
}
