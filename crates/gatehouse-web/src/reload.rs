//! Hot reload of rule and route files.
//!
//! [`ConfigReloader`] watches a config directory with `notify` on a blocking
//! thread.  A change to the rules file recompiles the pattern rule set; a
//! change to the routes file re-embeds the semantic routes.  A file that
//! fails to parse or compile is logged and the previous snapshot stays
//! active.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gatehouse_intent::{RouteFile, SemanticRouter};
use gatehouse_kernel::{PatternMatcher, RuleFile};
use tokio::runtime::Handle;

pub const RULES_FILE: &str = "rules.toml";
pub const ROUTES_FILE: &str = "routes.toml";

/// Which snapshot a changed file feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTarget {
    Rules,
    Routes,
}

#[derive(Clone)]
pub struct ConfigReloader {
    dir: PathBuf,
    pattern: Arc<PatternMatcher>,
    semantic: Option<Arc<SemanticRouter>>,
}

impl ConfigReloader {
    pub fn new(dir: impl Into<PathBuf>, pattern: Arc<PatternMatcher>) -> Self {
        Self {
            dir: dir.into(),
            pattern,
            semantic: None,
        }
    }

    pub fn with_semantic(mut self, semantic: Arc<SemanticRouter>) -> Self {
        self.semantic = Some(semantic);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn target_for(path: &Path) -> Option<ReloadTarget> {
        match path.file_name()?.to_str()? {
            RULES_FILE => Some(ReloadTarget::Rules),
            ROUTES_FILE => Some(ReloadTarget::Routes),
            _ => None,
        }
    }

    /// Recompile the pattern rules from `path`.  Returns the new rule count.
    pub fn reload_rules(&self, path: &Path) -> Result<usize, String> {
        let file = RuleFile::load(path).map_err(|e| e.to_string())?;
        self.pattern.reload_rules(file.rule).map_err(|e| e.to_string())
    }

    /// Re-embed the semantic routes from `path`.  Returns the number of
    /// utterances indexed.
    pub async fn reload_routes(&self, path: &Path) -> Result<usize, String> {
        let Some(semantic) = &self.semantic else {
            return Err("semantic layer is disabled".into());
        };
        let file = RouteFile::load(path).map_err(|e| e.to_string())?;
        semantic
            .reload_routes(file.route)
            .await
            .map_err(|e| e.to_string())
    }

    /// Start watching on a blocking thread.  Must be called from inside a
    /// tokio runtime.
    pub fn spawn(self) {
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || self.watch(handle));
    }

    fn watch(self, handle: Handle) {
        use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
        use std::sync::mpsc;

        if !self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "config directory does not exist, skipping file watcher");
            return;
        }

        let (tx, rx) = mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create file watcher, hot-reload disabled");
                return;
            }
        };
        if let Err(e) = watcher.watch(&self.dir, RecursiveMode::NonRecursive) {
            tracing::warn!(error = %e, "failed to watch config directory");
            return;
        }
        tracing::info!(dir = %self.dir.display(), "rule hot-reload watcher started");

        for event in rx {
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "file watcher error");
                    continue;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }

            for path in &event.paths {
                let file = path.display();
                match Self::target_for(path) {
                    Some(ReloadTarget::Rules) => match self.reload_rules(path) {
                        Ok(count) => tracing::info!(%file, rules = count, "hot-reloaded pattern rules"),
                        Err(e) => tracing::warn!(%file, error = %e, "rule reload rejected, keeping previous rules"),
                    },
                    Some(ReloadTarget::Routes) if self.semantic.is_some() => {
                        match handle.block_on(self.reload_routes(path)) {
                            Ok(count) => tracing::info!(%file, utterances = count, "hot-reloaded semantic routes"),
                            Err(e) => tracing::warn!(%file, error = %e, "route reload rejected, keeping previous routes"),
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use gatehouse_intent::default_rules;

    use super::*;

    const ONE_RULE: &str = r#"
[[rule]]
id = "T-1"
name = "printer"
keywords = ["printer"]
intent = "incident"
sub_intent = "printer_jam"
workflow = "simple"
priority = 10
confidence = 0.9
"#;

    #[test]
    fn only_known_files_are_targets() {
        assert_eq!(
            ConfigReloader::target_for(Path::new("config/rules.toml")),
            Some(ReloadTarget::Rules)
        );
        assert_eq!(
            ConfigReloader::target_for(Path::new("/etc/gatehouse/routes.toml")),
            Some(ReloadTarget::Routes)
        );
        assert_eq!(ConfigReloader::target_for(Path::new("config/gatehouse.toml")), None);
    }

    #[test]
    fn reload_swaps_rules_and_bad_files_keep_the_old_set() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = Arc::new(PatternMatcher::new(default_rules().unwrap()).unwrap());
        let reloader = ConfigReloader::new(dir.path(), Arc::clone(&pattern));

        let path = dir.path().join(RULES_FILE);
        std::fs::write(&path, ONE_RULE).unwrap();
        assert_eq!(reloader.reload_rules(&path).unwrap(), 1);
        assert!(pattern.match_text("the printer is jammed").matched);
        assert!(!pattern.match_text("reset my password").matched);

        std::fs::write(&path, "[[rule]]\nid = \"\"\n").unwrap();
        assert!(reloader.reload_rules(&path).is_err());
        assert_eq!(pattern.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn routes_need_a_semantic_layer() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = Arc::new(PatternMatcher::empty());
        let reloader = ConfigReloader::new(dir.path(), pattern);
        let err = reloader
            .reload_routes(&dir.path().join(ROUTES_FILE))
            .await
            .unwrap_err();
        assert!(err.contains("disabled"));
    }
}
