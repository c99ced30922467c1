//! `gatehouse.toml` loading.
//!
//! Every field has a default, so an absent file or an empty one yields a
//! working pattern-only deployment.  A handful of environment variables
//! override file values so containers can be configured without a mount.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gatehouse_hitl::{ApprovalPolicy, RiskConfig};
use gatehouse_intent::CascadeConfig;
use serde::{Deserialize, Serialize};

pub const ENV_BIND: &str = "GATEHOUSE_BIND";
pub const ENV_PORT: &str = "GATEHOUSE_PORT";
pub const ENV_DB: &str = "GATEHOUSE_DB";

const DEFAULT_MODEL_ANTHROPIC: &str = "claude-sonnet-4-20250514";
const DEFAULT_MODEL_OPENAI: &str = "gpt-4o";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    /// Directory holding `rules.toml` and `routes.toml`.
    pub config_dir: PathBuf,
    pub hot_reload: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            config_dir: PathBuf::from("config"),
            hot_reload: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite file; `:memory:` keeps everything in process.
    pub path: PathBuf,
    /// Terminal requests older than this are purged by the sweeper.  `0`
    /// keeps them forever.
    pub retention_hours: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/gatehouse.db"),
            retention_hours: 24 * 30,
        }
    }
}

impl StoreSection {
    pub fn in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        (self.retention_hours > 0).then(|| chrono::Duration::hours(self.retention_hours as i64))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticSection {
    pub enabled: bool,
    pub threshold: f64,
    /// Overrides `<config_dir>/routes.toml`.
    pub routes_file: Option<PathBuf>,
    pub cache_capacity: u64,
}

impl Default for SemanticSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: gatehouse_intent::semantic::DEFAULT_THRESHOLD,
            routes_file: None,
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderName {
    #[default]
    Anthropic,
    Openai,
    /// Any OpenAI-compatible server; needs `base_url`.
    OpenaiCompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub enabled: bool,
    pub provider: LlmProviderName,
    pub base_url: Option<String>,
    /// Defaults per provider when unset.
    pub model: Option<String>,
    pub api_key_env: String,
    pub min_confidence: f64,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: LlmProviderName::Anthropic,
            base_url: None,
            model: None,
            api_key_env: "ANTHROPIC_API_KEY".into(),
            min_confidence: gatehouse_intent::classifier::DEFAULT_MIN_CONFIDENCE,
            timeout_secs: 30,
        }
    }
}

impl LlmSection {
    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| {
            match self.provider {
                LlmProviderName::Anthropic => DEFAULT_MODEL_ANTHROPIC,
                LlmProviderName::Openai | LlmProviderName::OpenaiCompatible => DEFAULT_MODEL_OPENAI,
            }
            .to_owned()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub base_url: String,
    pub model: String,
    /// Empty means the endpoint does not authenticate.
    pub api_key_env: String,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsSection {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub auto_escalate: bool,
    pub max_escalations: u32,
}

impl Default for ApprovalsSection {
    fn default() -> Self {
        let policy = ApprovalPolicy::default();
        Self {
            ttl_secs: policy.ttl_secs,
            sweep_interval_secs: 30,
            auto_escalate: policy.auto_escalate,
            max_escalations: policy.max_escalations,
        }
    }
}

impl ApprovalsSection {
    pub fn policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            ttl_secs: self.ttl_secs,
            auto_escalate: self.auto_escalate,
            max_escalations: self.max_escalations,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    pub webhook_url: Option<String>,
}

impl WebhookSection {
    pub fn url(&self) -> Option<&str> {
        self.webhook_url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

// ---------------------------------------------------------------------------
// GateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub log_format: LogFormat,
    pub server: ServerSection,
    pub store: StoreSection,
    pub cascade: CascadeConfig,
    pub semantic: SemanticSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub risk: RiskConfig,
    pub approvals: ApprovalsSection,
    pub notify: WebhookSection,
    pub dispatch: WebhookSection,
}

impl GateConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("invalid configuration")?;
        Ok(config)
    }

    /// Read `path` (defaults if it does not exist), apply environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(env_non_empty)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEHOUSE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a port number: {port}"))?;
        }
        if let Some(db) = lookup(ENV_DB) {
            self.store.path = PathBuf::from(db);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.risk.validate().context("invalid [risk] section")?;
        if !(0.0..=1.0).contains(&self.semantic.threshold) {
            bail!("semantic.threshold must lie in [0, 1], got {}", self.semantic.threshold);
        }
        if !(0.0..=1.0).contains(&self.llm.min_confidence) {
            bail!("llm.min_confidence must lie in [0, 1], got {}", self.llm.min_confidence);
        }
        if self.llm.provider == LlmProviderName::OpenaiCompatible && self.llm.base_url.is_none() {
            bail!("llm.base_url is required for the openai_compatible provider");
        }
        if self.approvals.ttl_secs == 0 {
            bail!("approvals.ttl_secs must be positive");
        }
        Ok(())
    }

    pub fn rules_path(&self) -> PathBuf {
        self.server.config_dir.join(gatehouse_web::reload::RULES_FILE)
    }

    pub fn routes_path(&self) -> PathBuf {
        self.semantic
            .routes_file
            .clone()
            .unwrap_or_else(|| self.server.config_dir.join(gatehouse_web::reload::ROUTES_FILE))
    }
}

/// Read a non-empty environment variable, returning `None` if unset or empty.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
