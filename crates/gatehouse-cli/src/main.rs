//! CLI entry point for Gatehouse.
//!
//! This binary provides the `gatehouse` command: the REST server plus
//! one-shot routing and maintenance subcommands.

mod cli;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use gatehouse_cli::config::GateConfig;
use gatehouse_cli::helpers::{init_tracing, spawn_audit_log};
use gatehouse_cli::{Runtime, bootstrap, check_rules};
use gatehouse_hitl::Sweeper;
use gatehouse_intent::ContextMap;
use gatehouse_kernel::RequestPayload;
use gatehouse_web::{WebConfig, WebServer};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::cli::{Cli, Commands, RuleAction};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = GateConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing("info", config.log_format);

    match cli.command {
        Commands::Serve { bind, port } => cmd_serve(config, bind, port).await,
        Commands::Route {
            text,
            context,
            dry_run,
        } => cmd_route(config, text, context, dry_run).await,
        Commands::Sweep => cmd_sweep(config).await,
        Commands::Reindex => cmd_reindex(config).await,
        Commands::Rules {
            action: RuleAction::Check { path },
        } => cmd_rules_check(&config, path),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(mut config: GateConfig, bind: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let runtime = bootstrap::build(config).await?;
    let Runtime {
        config,
        pipeline,
        bus,
        ..
    } = &runtime;

    let audit = spawn_audit_log(bus);

    pipeline
        .recover()
        .await
        .context("failed to recover in-flight requests")?;

    let mut sweeper = Sweeper::new(pipeline.controller().clone(), config.approvals.sweep_interval());
    if let Some(retention) = config.store.retention() {
        sweeper = sweeper.with_retention(retention);
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = sweeper.spawn(shutdown_rx);

    let web_config = WebConfig {
        bind_addr: config.server.bind.clone(),
        port: config.server.port,
    };
    let mut server = WebServer::new(web_config, pipeline.clone());
    if config.server.hot_reload {
        server = server.with_reloader(runtime.reloader());
    }

    println!();
    println!("  Gatehouse v{}", env!("CARGO_PKG_VERSION"));
    println!("  Listening on http://{}", server.addr());
    println!("  Press Ctrl+C to stop.");
    println!();

    let served = server.start().await.context("web server failed");

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    audit.abort();
    served
}

// ---------------------------------------------------------------------------
// Subcommand: route
// ---------------------------------------------------------------------------

fn parse_context(raw: Option<&str>) -> Result<ContextMap> {
    let Some(raw) = raw else {
        return Ok(ContextMap::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!("--context must be a JSON object"),
    }
}

async fn cmd_route(config: GateConfig, text: String, context: Option<String>, dry_run: bool) -> Result<()> {
    let context = parse_context(context.as_deref())?;
    let runtime = bootstrap::build(config).await?;
    let pipeline = &runtime.pipeline;

    if dry_run {
        let report = pipeline.dry_run(&text, &context).await?;
        return print_json(&report);
    }

    let mut payload = RequestPayload::new(text);
    payload.context = context;
    payload.channel = "cli".into();
    let accepted = pipeline.accept(payload).await?;
    let ctx = pipeline.process(&accepted.request_id).await?;
    print_json(&ctx)
}

// ---------------------------------------------------------------------------
// Subcommand: sweep
// ---------------------------------------------------------------------------

async fn cmd_sweep(config: GateConfig) -> Result<()> {
    let runtime = bootstrap::build(config).await?;
    let report = runtime.pipeline.sweep().await?;
    info!(?report, "sweep finished");

    if let Some(retention) = runtime.config.store.retention() {
        let purged = runtime.pipeline.states().purge(retention).await?;
        info!(purged, "retention purge finished");
    }
    print_json(&report)
}

// ---------------------------------------------------------------------------
// Subcommand: reindex
// ---------------------------------------------------------------------------

async fn cmd_reindex(config: GateConfig) -> Result<()> {
    let runtime = bootstrap::build(config).await?;
    let Some(semantic) = &runtime.semantic else {
        bail!("semantic layer is disabled or has no embedding API key; nothing to reindex");
    };
    let count = semantic
        .reindex()
        .await
        .context("failed to rebuild the semantic index")?;
    println!("reindexed {count} utterances");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: rules check
// ---------------------------------------------------------------------------

fn cmd_rules_check(config: &GateConfig, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(|| config.rules_path());
    let rules = check_rules(&path)?;

    println!("{}: {} rules OK", path.display(), rules.len());
    for rule in rules.rules() {
        let spec = rule.spec();
        let state = if spec.enabled { "" } else { " (disabled)" };
        println!(
            "  {:<10} {:>4}  {}/{}{}",
            spec.id, spec.priority, spec.intent, spec.sub_intent, state
        );
    }
    Ok(())
}
