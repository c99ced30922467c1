//! CLI argument definitions for Gatehouse.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Gatehouse -- intent routing with risk-gated human approval.
#[derive(Parser)]
#[command(
    name = "gatehouse",
    version,
    about = "Gatehouse -- intent routing with risk-gated human approval",
    long_about = "Classifies free-text IT requests through a pattern, semantic and LLM cascade, \
                  scores their risk and holds risky ones for human approval before dispatching \
                  them to the workflow engine."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "config/gatehouse.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST server, the approval sweeper and the rule watcher.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on.
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Classify one request and print the decision.
    Route {
        /// The request text.
        text: String,

        /// Request context as a JSON object, e.g. '{"production": true}'.
        #[arg(long)]
        context: Option<String>,

        /// Only route and score; do not persist or dispatch anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Expire (or escalate) overdue approvals once and exit.
    Sweep,

    /// Re-embed all semantic routes under the configured embedding model.
    Reindex,

    /// Inspect rule files.
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },
}

/// Actions for rule files.
#[derive(Subcommand)]
pub enum RuleAction {
    /// Parse and compile a rule file without loading it.
    Check {
        /// Rule file to check. Defaults to `rules.toml` in the config directory.
        path: Option<PathBuf>,
    },
}
