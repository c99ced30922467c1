//! Background expiry sweep and retention purge.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::HitlController;

pub struct Sweeper {
    controller: HitlController,
    interval: Duration,
    retention: Option<chrono::Duration>,
}

impl Sweeper {
    pub fn new(controller: HitlController, interval: Duration) -> Self {
        Self {
            controller,
            interval: interval.max(Duration::from_millis(10)),
            retention: None,
        }
    }

    /// Also purge terminal requests older than `retention` on every tick.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// One sweep plus purge.
    pub async fn tick(&self) {
        match self.controller.sweep_expired().await {
            Ok(report) => debug!(?report, "sweep tick"),
            Err(e) => warn!(error = %e, "approval sweep failed"),
        }
        if let Some(retention) = self.retention
            && let Err(e) = self.controller.states().purge(retention).await
        {
            warn!(error = %e, "retention purge failed");
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "approval sweeper started");
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("approval sweeper stopped");
        })
    }
}
