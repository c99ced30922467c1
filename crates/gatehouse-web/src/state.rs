//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers.  All mutable state lives behind the pipeline (the repository and
//! the rule snapshots), so the state itself is read-only.

use std::time::Instant;

use gatehouse_hitl::Pipeline;

use crate::WebConfig;

pub struct AppState {
    pub pipeline: Pipeline,
    pub config: WebConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: Pipeline, config: WebConfig) -> Self {
        Self {
            pipeline,
            config,
            started_at: Instant::now(),
        }
    }
}
