//! Main web server setup and startup.
//!
//! [`WebServer`] composes the Axum router, registers all routes, and starts
//! the HTTP listener.  When a config directory is attached it also spawns a
//! [`ConfigReloader`] that hot-reloads rule and route files.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use gatehouse_hitl::Pipeline;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::WebConfig;
use crate::api;
use crate::reload::ConfigReloader;
use crate::state::AppState;

/// The Gatehouse REST server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
    reloader: Option<ConfigReloader>,
}

impl WebServer {
    pub fn new(config: WebConfig, pipeline: Pipeline) -> Self {
        let state = Arc::new(AppState::new(pipeline, config.clone()));
        Self {
            config,
            state,
            reloader: None,
        }
    }

    /// Watch a config directory for rule/route changes while serving.
    pub fn with_reloader(mut self, reloader: ConfigReloader) -> Self {
        self.reloader = Some(reloader);
        self
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(HeaderValue::from_static("*"))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any);

        Router::new()
            .route("/requests", post(api::submit_request))
            .route("/requests/{id}", get(api::get_request))
            .route("/requests/{id}/cancel", post(api::cancel_request))
            .route("/approvals", get(api::list_approvals))
            .route("/approvals/{id}/decision", post(api::submit_decision))
            .route("/routing/test", post(api::routing_test))
            .route("/stats", get(api::stats))
            .route("/health", get(api::health))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.addr()).await
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        if let Some(reloader) = self.reloader {
            reloader.spawn();
        }

        let local: Option<SocketAddr> = listener.local_addr().ok();
        tracing::info!(addr = ?local, "starting web server");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("web server stopped");
        Ok(())
    }

    /// Bind and serve until Ctrl-C.
    pub async fn start(self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }
}
