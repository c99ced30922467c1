//! The request state machine, persisted.
//!
//! [`StateManager`] is the only writer of [`RequestContext`] records.  Every
//! mutation is read-modify-CAS against the [`Repository`]; a lost race is
//! retried against the fresh record (up to `max_retries`), so a transition
//! that became illegal in the meantime surfaces as `IllegalTransition`
//! instead of overwriting the winner.  Accepted edges are published on the
//! [`EventBus`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use gatehouse_kernel::{EventBus, GateEvent, RequestContext, RequestPayload, RequestState};
use tracing::{debug, info, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::repository::Repository;

const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct StateManager {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    max_retries: u32,
}

impl StateManager {
    pub fn new(repo: Arc<dyn Repository>, bus: EventBus) -> Self {
        Self {
            repo,
            bus,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Persist a fresh context in `received` under a new time-ordered id.
    pub async fn create(&self, payload: RequestPayload) -> StoreResult<RequestContext> {
        self.create_with_id(uuid::Uuid::now_v7().to_string(), payload)
            .await
    }

    #[instrument(skip(self, payload))]
    pub async fn create_with_id(
        &self,
        request_id: String,
        payload: RequestPayload,
    ) -> StoreResult<RequestContext> {
        let ctx = RequestContext::new(request_id, payload, Utc::now());
        self.repo.insert_context(&ctx).await?;
        info!(request_id = %ctx.request_id, channel = %ctx.payload.channel, "request received");
        Ok(ctx)
    }

    pub async fn find(&self, request_id: &str) -> StoreResult<Option<RequestContext>> {
        self.repo.get_context(request_id).await
    }

    pub async fn get(&self, request_id: &str) -> StoreResult<RequestContext> {
        self.repo
            .get_context(request_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "request context",
                id: request_id.to_string(),
            })
    }

    /// Move `request_id` to `to`, applying `mutate` to the record in the
    /// same write.
    ///
    /// Already being in `to` is a no-op that returns the stored record
    /// without calling `mutate`.
    pub async fn transition<F>(
        &self,
        request_id: &str,
        to: RequestState,
        reason: &str,
        mutate: F,
    ) -> StoreResult<RequestContext>
    where
        F: Fn(&mut RequestContext) + Send + Sync,
    {
        self.advance(request_id, to, reason, mutate, true, |_| true)
            .await
    }

    /// Like [`transition`](Self::transition), but already being in `to` is
    /// an `IllegalTransition`.  Exactly one of several concurrent callers
    /// gets `Ok`.
    pub async fn claim<F>(
        &self,
        request_id: &str,
        to: RequestState,
        reason: &str,
        mutate: F,
    ) -> StoreResult<RequestContext>
    where
        F: Fn(&mut RequestContext) + Send + Sync,
    {
        self.advance(request_id, to, reason, mutate, false, |_| true)
            .await
    }

    /// `allowed` is checked against every fresh read, so a source state
    /// that a concurrent writer reached first is never acted on.
    #[instrument(skip(self, mutate, allowed))]
    async fn advance<F>(
        &self,
        request_id: &str,
        to: RequestState,
        reason: &str,
        mutate: F,
        idempotent: bool,
        allowed: fn(RequestState) -> bool,
    ) -> StoreResult<RequestContext>
    where
        F: Fn(&mut RequestContext) + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let current = self.get(request_id).await?;
            if !allowed(current.state) {
                return Err(StoreError::IllegalTransition {
                    request_id: request_id.to_string(),
                    from: current.state,
                    to,
                });
            }
            if current.state == to {
                if !idempotent {
                    return Err(StoreError::IllegalTransition {
                        request_id: request_id.to_string(),
                        from: current.state,
                        to,
                    });
                }
                debug!(request_id, state = %to, "already in target state");
                return Ok(current);
            }

            let from = current.state;
            let mut next = current;
            let now = Utc::now();
            next.advance(to, reason, now)?;
            mutate(&mut next);

            match self.repo.update_context(&next).await {
                Ok(stored) => {
                    debug!(request_id, %from, %to, reason, "state changed");
                    self.bus.publish(GateEvent::StateChanged {
                        request_id: request_id.to_string(),
                        from,
                        to,
                        reason: reason.to_string(),
                        at: now,
                    });
                    return Ok(stored);
                }
                Err(StoreError::Conflict { .. }) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(request_id, attempt, "version conflict, retrying transition");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Apply `mutate` without changing state.
    pub async fn update<F>(&self, request_id: &str, mutate: F) -> StoreResult<RequestContext>
    where
        F: Fn(&mut RequestContext) + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let mut next = self.get(request_id).await?;
            mutate(&mut next);
            next.updated_at = Utc::now();
            match self.repo.update_context(&next).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict { .. }) if attempt < self.max_retries => {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Terminal failure with `reason` recorded as the error.
    pub async fn fail(&self, request_id: &str, reason: &str) -> StoreResult<RequestContext> {
        let error = reason.to_string();
        self.transition(request_id, RequestState::Failed, reason, move |ctx| {
            ctx.error = Some(error.clone());
        })
        .await
    }

    /// Like [`fail`](Self::fail), but only while the request has not
    /// reached `dispatching`.  Once the dispatcher owns the request this is
    /// an `IllegalTransition` and the stored record is left alone.
    pub async fn fail_before_dispatch(
        &self,
        request_id: &str,
        reason: &str,
    ) -> StoreResult<RequestContext> {
        let error = reason.to_string();
        self.advance(
            request_id,
            RequestState::Failed,
            reason,
            move |ctx| ctx.error = Some(error.clone()),
            false,
            RequestState::is_pre_dispatch,
        )
        .await
    }

    /// Drop terminal contexts last touched more than `retention` ago.
    pub async fn purge(&self, retention: Duration) -> StoreResult<usize> {
        let removed = self.repo.purge_terminal_before(Utc::now() - retention).await?;
        if removed > 0 {
            info!(removed, "purged terminal request contexts");
        }
        Ok(removed)
    }
}
