//! Request and approval persistence with optimistic locking.
//!
//! Every record carries a `version`.  Updates are compare-and-swap on that
//! column: the caller passes the record as it last read it, the write only
//! lands if the stored version still matches, and the returned copy carries
//! the bumped version.  A lost race surfaces as [`StoreError::Conflict`] and
//! leaves the stored record untouched.
//!
//! Two implementations share the contract: [`SqliteRepository`] for durable
//! deployments and [`MemoryRepository`] for tests and ephemeral runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatehouse_kernel::{
    ApprovalRequest, ApprovalStatus, ApprovalTier, RequestContext, RequestState, TransitionRecord,
};
use rusqlite::{OptionalExtension, params};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Contract
// ═══════════════════════════════════════════════════════════════════════

/// Filter for [`Repository::list_approvals`].
#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub tier: Option<ApprovalTier>,
    pub request_id: Option<String>,
}

impl ApprovalFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(ApprovalStatus::Pending),
            ..Default::default()
        }
    }

    pub fn with_tier(mut self, tier: Option<ApprovalTier>) -> Self {
        self.tier = tier;
        self
    }

    fn accepts(&self, a: &ApprovalRequest) -> bool {
        self.status.is_none_or(|s| a.status == s)
            && self.tier.is_none_or(|t| a.tier == t)
            && self.request_id.as_deref().is_none_or(|r| a.request_id == r)
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Fails with `AlreadyExists` if the id is taken.
    async fn insert_context(&self, ctx: &RequestContext) -> StoreResult<()>;

    async fn get_context(&self, request_id: &str) -> StoreResult<Option<RequestContext>>;

    /// CAS on `ctx.version`; returns the stored copy with the new version.
    async fn update_context(&self, ctx: &RequestContext) -> StoreResult<RequestContext>;

    async fn insert_approval(&self, approval: &ApprovalRequest) -> StoreResult<()>;

    async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<ApprovalRequest>>;

    /// CAS on `approval.version`; returns the stored copy with the new version.
    async fn update_approval(&self, approval: &ApprovalRequest) -> StoreResult<ApprovalRequest>;

    /// CAS-update `old` and insert `successor` as one unit.  Used by
    /// escalation so a superseded approval never exists without its
    /// replacement.
    async fn supersede_approval(
        &self,
        old: &ApprovalRequest,
        successor: &ApprovalRequest,
    ) -> StoreResult<ApprovalRequest>;

    /// Oldest first.
    async fn list_approvals(&self, filter: &ApprovalFilter) -> StoreResult<Vec<ApprovalRequest>>;

    /// Pending approvals whose deadline is at or before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> StoreResult<Vec<ApprovalRequest>>;

    /// Contexts currently in any of `states`, oldest first.
    async fn list_contexts_in(&self, states: &[RequestState]) -> StoreResult<Vec<RequestContext>>;

    /// Delete terminal contexts (and their approvals) last updated before
    /// `cutoff`.  Returns the number of contexts removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Liveness probe for health checks.
    async fn ping(&self) -> StoreResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════
//  SQLite
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SqliteRepository {
    db: Database,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(entity: &'static str, id: &str, ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        entity,
        id: id.to_string(),
        reason: format!("timestamp {ms} out of range"),
    })
}

fn to_json_opt<T: serde::Serialize>(v: &Option<T>) -> StoreResult<Option<String>> {
    Ok(v.as_ref().map(serde_json::to_string).transpose()?)
}

fn from_json_opt<T: DeserializeOwned>(s: Option<String>) -> StoreResult<Option<T>> {
    Ok(s.as_deref().map(serde_json::from_str).transpose()?)
}

/// Raw `request_contexts` row before JSON decoding.
struct ContextRow {
    request_id: String,
    state: String,
    payload: String,
    decision: Option<String>,
    edited_decision: Option<String>,
    risk: Option<String>,
    approval_id: Option<String>,
    workflow_instance_id: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

const CONTEXT_COLUMNS: &str = "request_id, state, payload, decision, edited_decision, risk, \
     approval_id, workflow_instance_id, result, error, created_at, updated_at, version";

impl ContextRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get(0)?,
            state: row.get(1)?,
            payload: row.get(2)?,
            decision: row.get(3)?,
            edited_decision: row.get(4)?,
            risk: row.get(5)?,
            approval_id: row.get(6)?,
            workflow_instance_id: row.get(7)?,
            result: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            version: row.get(12)?,
        })
    }

    fn into_context(self, history: Vec<TransitionRecord>) -> StoreResult<RequestContext> {
        let corrupt = |reason: String| StoreError::Corrupt {
            entity: "request context",
            id: self.request_id.clone(),
            reason,
        };
        Ok(RequestContext {
            state: self.state.parse().map_err(|e| corrupt(format!("{e}")))?,
            payload: serde_json::from_str(&self.payload)?,
            decision: from_json_opt(self.decision)?,
            edited_decision: from_json_opt(self.edited_decision)?,
            risk: from_json_opt(self.risk)?,
            approval_id: self.approval_id,
            workflow_instance_id: self.workflow_instance_id,
            result: from_json_opt(self.result)?,
            error: self.error,
            created_at: from_millis("request context", &self.request_id, self.created_at)?,
            updated_at: from_millis("request context", &self.request_id, self.updated_at)?,
            version: self.version,
            history,
            request_id: self.request_id,
        })
    }
}

/// Serialized columns shared by insert and update.
struct ContextColumns {
    state: &'static str,
    payload: String,
    decision: Option<String>,
    edited_decision: Option<String>,
    risk: Option<String>,
    result: Option<String>,
}

impl ContextColumns {
    fn of(ctx: &RequestContext) -> StoreResult<Self> {
        Ok(Self {
            state: ctx.state.as_str(),
            payload: serde_json::to_string(&ctx.payload)?,
            decision: to_json_opt(&ctx.decision)?,
            edited_decision: to_json_opt(&ctx.edited_decision)?,
            risk: to_json_opt(&ctx.risk)?,
            result: to_json_opt(&ctx.result)?,
        })
    }
}

fn load_history(conn: &rusqlite::Connection, request_id: &str) -> StoreResult<Vec<TransitionRecord>> {
    let mut stmt = conn.prepare(
        "SELECT from_state, to_state, reason, at FROM request_transitions \
         WHERE request_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![request_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (from, to, reason, at) = row?;
        let corrupt = |reason: String| StoreError::Corrupt {
            entity: "transition",
            id: request_id.to_string(),
            reason,
        };
        out.push(TransitionRecord {
            from: from.parse().map_err(|e| corrupt(format!("{e}")))?,
            to: to.parse().map_err(|e| corrupt(format!("{e}")))?,
            reason,
            at: from_millis("transition", request_id, at)?,
        });
    }
    Ok(out)
}

/// Append the history entries not yet persisted.
fn append_history(
    conn: &rusqlite::Connection,
    request_id: &str,
    history: &[TransitionRecord],
) -> StoreResult<()> {
    let stored: i64 = conn.query_row(
        "SELECT count(*) FROM request_transitions WHERE request_id = ?1",
        params![request_id],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO request_transitions (request_id, seq, from_state, to_state, reason, at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (seq, t) in history.iter().enumerate().skip(stored as usize) {
        stmt.execute(params![
            request_id,
            seq as i64,
            t.from.as_str(),
            t.to.as_str(),
            t.reason,
            millis(t.at)
        ])?;
    }
    Ok(())
}

/// Raw `approvals` row before JSON decoding.
struct ApprovalRow {
    approval_id: String,
    request_id: String,
    tier: String,
    status: String,
    created_at: i64,
    expires_at: i64,
    escalation_count: i64,
    escalated_to: Option<String>,
    risk: String,
    decision: String,
    resolution: Option<String>,
    version: i64,
}

const APPROVAL_COLUMNS: &str = "approval_id, request_id, tier, status, created_at, expires_at, \
     escalation_count, escalated_to, risk, decision, resolution, version";

impl ApprovalRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            approval_id: row.get(0)?,
            request_id: row.get(1)?,
            tier: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
            escalation_count: row.get(6)?,
            escalated_to: row.get(7)?,
            risk: row.get(8)?,
            decision: row.get(9)?,
            resolution: row.get(10)?,
            version: row.get(11)?,
        })
    }

    fn into_approval(self) -> StoreResult<ApprovalRequest> {
        let corrupt = |reason: String| StoreError::Corrupt {
            entity: "approval",
            id: self.approval_id.clone(),
            reason,
        };
        Ok(ApprovalRequest {
            request_id: self.request_id,
            tier: self.tier.parse().map_err(|e| corrupt(format!("{e}")))?,
            status: self.status.parse().map_err(|e| corrupt(format!("{e}")))?,
            created_at: from_millis("approval", &self.approval_id, self.created_at)?,
            expires_at: from_millis("approval", &self.approval_id, self.expires_at)?,
            escalation_count: self.escalation_count as u32,
            escalated_to: self.escalated_to,
            risk: serde_json::from_str(&self.risk)?,
            decision: serde_json::from_str(&self.decision)?,
            resolution: from_json_opt(self.resolution)?,
            version: self.version,
            approval_id: self.approval_id,
        })
    }
}

fn insert_approval_row(conn: &rusqlite::Connection, a: &ApprovalRequest) -> StoreResult<()> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO approvals (approval_id, request_id, tier, status, created_at, \
         expires_at, escalation_count, escalated_to, risk, decision, resolution, version) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            a.approval_id,
            a.request_id,
            a.tier.as_str(),
            a.status.as_str(),
            millis(a.created_at),
            millis(a.expires_at),
            a.escalation_count as i64,
            a.escalated_to,
            serde_json::to_string(&a.risk)?,
            serde_json::to_string(&a.decision)?,
            to_json_opt(&a.resolution)?,
            a.version,
        ],
    )?;
    if inserted == 0 {
        return Err(StoreError::AlreadyExists {
            entity: "approval",
            id: a.approval_id.clone(),
        });
    }
    Ok(())
}

/// CAS update of the mutable approval columns.
fn cas_approval_row(conn: &rusqlite::Connection, a: &ApprovalRequest) -> StoreResult<ApprovalRequest> {
    let changed = conn.execute(
        "UPDATE approvals SET tier = ?1, status = ?2, expires_at = ?3, escalation_count = ?4, \
         escalated_to = ?5, decision = ?6, resolution = ?7, version = version + 1 \
         WHERE approval_id = ?8 AND version = ?9",
        params![
            a.tier.as_str(),
            a.status.as_str(),
            millis(a.expires_at),
            a.escalation_count as i64,
            a.escalated_to,
            serde_json::to_string(&a.decision)?,
            to_json_opt(&a.resolution)?,
            a.approval_id,
            a.version,
        ],
    )?;
    if changed == 0 {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM approvals WHERE approval_id = ?1",
                params![a.approval_id],
                |row| row.get(0),
            )
            .optional()?;
        return Err(match exists {
            Some(_) => StoreError::Conflict {
                entity: "approval",
                id: a.approval_id.clone(),
                expected: a.version,
            },
            None => StoreError::NotFound {
                entity: "approval",
                id: a.approval_id.clone(),
            },
        });
    }
    let mut stored = a.clone();
    stored.version += 1;
    Ok(stored)
}

#[async_trait]
impl Repository for SqliteRepository {
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    async fn insert_context(&self, ctx: &RequestContext) -> StoreResult<()> {
        let cols = ContextColumns::of(ctx)?;
        let ctx = ctx.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO request_contexts (request_id, state, payload, decision, \
                     edited_decision, risk, approval_id, workflow_instance_id, result, error, \
                     created_at, updated_at, version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        ctx.request_id,
                        cols.state,
                        cols.payload,
                        cols.decision,
                        cols.edited_decision,
                        cols.risk,
                        ctx.approval_id,
                        ctx.workflow_instance_id,
                        cols.result,
                        ctx.error,
                        millis(ctx.created_at),
                        millis(ctx.updated_at),
                        ctx.version,
                    ],
                )?;
                if inserted == 0 {
                    return Err(StoreError::AlreadyExists {
                        entity: "request context",
                        id: ctx.request_id.clone(),
                    });
                }
                append_history(&tx, &ctx.request_id, &ctx.history)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!("request context inserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_context(&self, request_id: &str) -> StoreResult<Option<RequestContext>> {
        let request_id = request_id.to_string();
        self.db
            .execute(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {CONTEXT_COLUMNS} FROM request_contexts WHERE request_id = ?1"
                        ),
                        params![request_id],
                        ContextRow::from_row,
                    )
                    .optional()?;
                match row {
                    Some(row) => {
                        let history = load_history(conn, &request_id)?;
                        row.into_context(history).map(Some)
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id, version = ctx.version))]
    async fn update_context(&self, ctx: &RequestContext) -> StoreResult<RequestContext> {
        let cols = ContextColumns::of(ctx)?;
        let ctx = ctx.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE request_contexts SET state = ?1, payload = ?2, decision = ?3, \
                     edited_decision = ?4, risk = ?5, approval_id = ?6, workflow_instance_id = ?7, \
                     result = ?8, error = ?9, updated_at = ?10, version = version + 1 \
                     WHERE request_id = ?11 AND version = ?12",
                    params![
                        cols.state,
                        cols.payload,
                        cols.decision,
                        cols.edited_decision,
                        cols.risk,
                        ctx.approval_id,
                        ctx.workflow_instance_id,
                        cols.result,
                        ctx.error,
                        millis(ctx.updated_at),
                        ctx.request_id,
                        ctx.version,
                    ],
                )?;
                if changed == 0 {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT version FROM request_contexts WHERE request_id = ?1",
                            params![ctx.request_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    return Err(match exists {
                        Some(_) => StoreError::Conflict {
                            entity: "request context",
                            id: ctx.request_id.clone(),
                            expected: ctx.version,
                        },
                        None => StoreError::NotFound {
                            entity: "request context",
                            id: ctx.request_id.clone(),
                        },
                    });
                }
                append_history(&tx, &ctx.request_id, &ctx.history)?;
                tx.commit()?;

                let mut stored = ctx;
                stored.version += 1;
                Ok(stored)
            })
            .await
    }

    #[instrument(skip(self, approval), fields(approval_id = %approval.approval_id))]
    async fn insert_approval(&self, approval: &ApprovalRequest) -> StoreResult<()> {
        let approval = approval.clone();
        self.db
            .execute(move |conn| insert_approval_row(conn, &approval))
            .await
    }

    #[instrument(skip(self))]
    async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<ApprovalRequest>> {
        let approval_id = approval_id.to_string();
        self.db
            .execute(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE approval_id = ?1"),
                        params![approval_id],
                        ApprovalRow::from_row,
                    )
                    .optional()?;
                row.map(ApprovalRow::into_approval).transpose()
            })
            .await
    }

    #[instrument(skip(self, approval), fields(approval_id = %approval.approval_id, version = approval.version))]
    async fn update_approval(&self, approval: &ApprovalRequest) -> StoreResult<ApprovalRequest> {
        let approval = approval.clone();
        self.db
            .execute(move |conn| cas_approval_row(conn, &approval))
            .await
    }

    #[instrument(skip(self, old, successor), fields(old = %old.approval_id, new = %successor.approval_id))]
    async fn supersede_approval(
        &self,
        old: &ApprovalRequest,
        successor: &ApprovalRequest,
    ) -> StoreResult<ApprovalRequest> {
        let old = old.clone();
        let successor = successor.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let stored = cas_approval_row(&tx, &old)?;
                insert_approval_row(&tx, &successor)?;
                tx.commit()?;
                Ok(stored)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_approvals(&self, filter: &ApprovalFilter) -> StoreResult<Vec<ApprovalRequest>> {
        let status = filter.status.map(|s| s.as_str());
        let tier = filter.tier.map(|t| t.as_str());
        let request_id = filter.request_id.clone();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals \
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR tier = ?2) \
                       AND (?3 IS NULL OR request_id = ?3) \
                     ORDER BY created_at, approval_id"
                ))?;
                let rows = stmt.query_map(params![status, tier, request_id], ApprovalRow::from_row)?;
                rows.map(|r| r.map_err(StoreError::from).and_then(ApprovalRow::into_approval))
                    .collect()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_overdue(&self, now: DateTime<Utc>) -> StoreResult<Vec<ApprovalRequest>> {
        let now = millis(now);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals \
                     WHERE status = 'pending' AND expires_at <= ?1 ORDER BY expires_at"
                ))?;
                let rows = stmt.query_map(params![now], ApprovalRow::from_row)?;
                rows.map(|r| r.map_err(StoreError::from).and_then(ApprovalRow::into_approval))
                    .collect()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_contexts_in(&self, states: &[RequestState]) -> StoreResult<Vec<RequestContext>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<&'static str> = states.iter().map(|s| s.as_str()).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONTEXT_COLUMNS} FROM request_contexts \
                     WHERE state IN ({placeholders}) ORDER BY created_at, request_id"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(names.iter()), ContextRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .map(|row| {
                        let history = load_history(conn, &row.request_id)?;
                        row.into_context(history)
                    })
                    .collect()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = millis(cutoff);
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM approvals WHERE request_id IN (\
                        SELECT request_id FROM request_contexts \
                        WHERE state IN ('completed','failed') AND updated_at < ?1)",
                    params![cutoff],
                )?;
                let removed = tx.execute(
                    "DELETE FROM request_contexts \
                     WHERE state IN ('completed','failed') AND updated_at < ?1",
                    params![cutoff],
                )?;
                tx.commit()?;
                Ok(removed)
            })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.db.ping().await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  In-memory
// ═══════════════════════════════════════════════════════════════════════

/// [`Repository`] over two `DashMap`s.  Same semantics as SQLite, no
/// durability.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    contexts: Arc<DashMap<String, RequestContext>>,
    approvals: Arc<DashMap<String, ApprovalRequest>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn cas_approval(&self, approval: &ApprovalRequest) -> StoreResult<ApprovalRequest> {
        let mut slot = self
            .approvals
            .get_mut(&approval.approval_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "approval",
                id: approval.approval_id.clone(),
            })?;
        if slot.version != approval.version {
            return Err(StoreError::Conflict {
                entity: "approval",
                id: approval.approval_id.clone(),
                expected: approval.version,
            });
        }
        let mut stored = approval.clone();
        stored.version += 1;
        *slot = stored.clone();
        Ok(stored)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_context(&self, ctx: &RequestContext) -> StoreResult<()> {
        match self.contexts.entry(ctx.request_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                entity: "request context",
                id: ctx.request_id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(ctx.clone());
                Ok(())
            }
        }
    }

    async fn get_context(&self, request_id: &str) -> StoreResult<Option<RequestContext>> {
        Ok(self.contexts.get(request_id).map(|c| c.clone()))
    }

    async fn update_context(&self, ctx: &RequestContext) -> StoreResult<RequestContext> {
        let mut slot =
            self.contexts
                .get_mut(&ctx.request_id)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "request context",
                    id: ctx.request_id.clone(),
                })?;
        if slot.version != ctx.version {
            return Err(StoreError::Conflict {
                entity: "request context",
                id: ctx.request_id.clone(),
                expected: ctx.version,
            });
        }
        let mut stored = ctx.clone();
        stored.version += 1;
        *slot = stored.clone();
        Ok(stored)
    }

    async fn insert_approval(&self, approval: &ApprovalRequest) -> StoreResult<()> {
        match self.approvals.entry(approval.approval_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                entity: "approval",
                id: approval.approval_id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(approval.clone());
                Ok(())
            }
        }
    }

    async fn get_approval(&self, approval_id: &str) -> StoreResult<Option<ApprovalRequest>> {
        Ok(self.approvals.get(approval_id).map(|a| a.clone()))
    }

    async fn update_approval(&self, approval: &ApprovalRequest) -> StoreResult<ApprovalRequest> {
        self.cas_approval(approval)
    }

    async fn supersede_approval(
        &self,
        old: &ApprovalRequest,
        successor: &ApprovalRequest,
    ) -> StoreResult<ApprovalRequest> {
        if self.approvals.contains_key(&successor.approval_id) {
            return Err(StoreError::AlreadyExists {
                entity: "approval",
                id: successor.approval_id.clone(),
            });
        }
        // The shard guard from `cas_approval` is released before the insert.
        let stored = self.cas_approval(old)?;
        self.approvals
            .insert(successor.approval_id.clone(), successor.clone());
        Ok(stored)
    }

    async fn list_approvals(&self, filter: &ApprovalFilter) -> StoreResult<Vec<ApprovalRequest>> {
        let mut out: Vec<ApprovalRequest> = self
            .approvals
            .iter()
            .filter(|a| filter.accepts(a.value()))
            .map(|a| a.value().clone())
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.approval_id.cmp(&b.approval_id))
        });
        Ok(out)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> StoreResult<Vec<ApprovalRequest>> {
        let mut out: Vec<ApprovalRequest> = self
            .approvals
            .iter()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.value().clone())
            .collect();
        out.sort_by_key(|a| a.expires_at);
        Ok(out)
    }

    async fn list_contexts_in(&self, states: &[RequestState]) -> StoreResult<Vec<RequestContext>> {
        let mut out: Vec<RequestContext> = self
            .contexts
            .iter()
            .filter(|c| states.contains(&c.state))
            .map(|c| c.value().clone())
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(out)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let doomed: Vec<String> = self
            .contexts
            .iter()
            .filter(|c| c.state.is_terminal() && c.updated_at < cutoff)
            .map(|c| c.request_id.clone())
            .collect();
        for id in &doomed {
            self.contexts.remove(id);
            self.approvals.retain(|_, a| a.request_id != *id);
        }
        Ok(doomed.len())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;
    use gatehouse_kernel::{
        DecisionAction, DecisionRecord, RequestPayload, RiskAssessment, RiskLevel, RoutingDecision,
    };

    use super::*;

    fn context(id: &str) -> RequestContext {
        RequestContext::new(id, RequestPayload::new("reset my password"), Utc::now())
    }

    fn approval(id: &str, request_id: &str, expires_in: Duration) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            approval_id: id.into(),
            request_id: request_id.into(),
            risk: RiskAssessment {
                level: RiskLevel::High,
                score: 0.625,
                requires_approval: true,
                tier: ApprovalTier::Manager,
                factors: Vec::new(),
            },
            decision: RoutingDecision::fallback(request_id, "text", 0, BTreeMap::new()),
            tier: ApprovalTier::Manager,
            created_at: now,
            expires_at: now + expires_in,
            status: ApprovalStatus::Pending,
            escalation_count: 0,
            escalated_to: None,
            resolution: None,
            version: 0,
        }
    }

    async fn sqlite() -> SqliteRepository {
        SqliteRepository::new(Database::in_memory_migrated().await.unwrap())
    }

    /// Run the same scenario against both backends.
    async fn both<F, Fut>(f: F)
    where
        F: Fn(Arc<dyn Repository>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        f(Arc::new(MemoryRepository::new())).await;
        f(Arc::new(sqlite().await)).await;
    }

    #[tokio::test]
    async fn context_round_trip_with_history() {
        both(|repo| async move {
            let mut ctx = context("r1");
            repo.insert_context(&ctx).await.unwrap();

            ctx.advance(RequestState::Routing, "accepted", Utc::now()).unwrap();
            let stored = repo.update_context(&ctx).await.unwrap();
            assert_eq!(stored.version, 1);

            let loaded = repo.get_context("r1").await.unwrap().unwrap();
            assert_eq!(loaded.state, RequestState::Routing);
            assert_eq!(loaded.version, 1);
            assert_eq!(loaded.history.len(), 1);
            assert_eq!(loaded.history[0].reason, "accepted");
            assert_eq!(loaded.payload.text, "reset my password");
        })
        .await;
    }

    #[tokio::test]
    async fn stale_context_write_conflicts() {
        both(|repo| async move {
            let ctx = context("r2");
            repo.insert_context(&ctx).await.unwrap();

            let mut a = ctx.clone();
            a.advance(RequestState::Routing, "a", Utc::now()).unwrap();
            let mut b = ctx.clone();
            b.advance(RequestState::Failed, "b", Utc::now()).unwrap();

            repo.update_context(&a).await.unwrap();
            match repo.update_context(&b).await {
                Err(StoreError::Conflict { expected, .. }) => assert_eq!(expected, 0),
                other => panic!("expected Conflict, got {other:?}"),
            }
            let loaded = repo.get_context("r2").await.unwrap().unwrap();
            assert_eq!(loaded.state, RequestState::Routing);
        })
        .await;
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        both(|repo| async move {
            repo.insert_context(&context("dup")).await.unwrap();
            assert!(matches!(
                repo.insert_context(&context("dup")).await,
                Err(StoreError::AlreadyExists { .. })
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        both(|repo| async move {
            assert!(matches!(
                repo.update_context(&context("ghost")).await,
                Err(StoreError::NotFound { .. })
            ));
            assert!(matches!(
                repo.update_approval(&approval("ghost", "r", Duration::hours(1))).await,
                Err(StoreError::NotFound { .. })
            ));
        })
        .await;
    }

    #[tokio::test]
    async fn approval_resolution_is_single_winner() {
        both(|repo| async move {
            let a = approval("a1", "r1", Duration::hours(1));
            repo.insert_approval(&a).await.unwrap();

            let mut approve = a.clone();
            approve.status = ApprovalStatus::Approved;
            approve.resolution = Some(DecisionRecord {
                actor: "alice".into(),
                action: DecisionAction::Approve,
                comment: None,
                decided_at: Utc::now(),
            });
            let mut reject = a.clone();
            reject.status = ApprovalStatus::Rejected;

            repo.update_approval(&approve).await.unwrap();
            assert!(matches!(
                repo.update_approval(&reject).await,
                Err(StoreError::Conflict { .. })
            ));

            let stored = repo.get_approval("a1").await.unwrap().unwrap();
            assert_eq!(stored.status, ApprovalStatus::Approved);
            assert_eq!(stored.resolution.unwrap().actor, "alice");
        })
        .await;
    }

    #[tokio::test]
    async fn supersede_links_and_inserts_atomically() {
        both(|repo| async move {
            let old = approval("old", "r1", Duration::hours(1));
            repo.insert_approval(&old).await.unwrap();

            let mut escalated = old.clone();
            escalated.status = ApprovalStatus::Escalated;
            escalated.escalated_to = Some("new".into());
            let mut successor = approval("new", "r1", Duration::hours(2));
            successor.tier = ApprovalTier::Security;
            successor.escalation_count = 1;

            repo.supersede_approval(&escalated, &successor).await.unwrap();

            let pending = repo.list_approvals(&ApprovalFilter::pending()).await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].approval_id, "new");
            assert_eq!(pending[0].tier, ApprovalTier::Security);

            // A stale supersede must not insert its successor.
            let stale_successor = approval("newer", "r1", Duration::hours(2));
            assert!(repo.supersede_approval(&escalated, &stale_successor).await.is_err());
            assert!(repo.get_approval("newer").await.unwrap().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn overdue_and_tier_filters() {
        both(|repo| async move {
            let mut late = approval("late", "r1", Duration::seconds(-5));
            late.tier = ApprovalTier::SelfService;
            repo.insert_approval(&late).await.unwrap();
            repo.insert_approval(&approval("fresh", "r2", Duration::hours(1)))
                .await
                .unwrap();

            let overdue = repo.list_overdue(Utc::now()).await.unwrap();
            assert_eq!(overdue.len(), 1);
            assert_eq!(overdue[0].approval_id, "late");

            let managers = repo
                .list_approvals(&ApprovalFilter::pending().with_tier(Some(ApprovalTier::Manager)))
                .await
                .unwrap();
            assert_eq!(managers.len(), 1);
            assert_eq!(managers[0].approval_id, "fresh");
        })
        .await;
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_contexts() {
        both(|repo| async move {
            let mut done = context("done");
            done.state = RequestState::Failed;
            done.updated_at = Utc::now() - Duration::days(10);
            repo.insert_context(&done).await.unwrap();
            repo.insert_approval(&approval("done-approval", "done", Duration::hours(1)))
                .await
                .unwrap();

            let mut recent = context("recent");
            recent.state = RequestState::Completed;
            repo.insert_context(&recent).await.unwrap();

            repo.insert_context(&context("live")).await.unwrap();

            let removed = repo
                .purge_terminal_before(Utc::now() - Duration::days(7))
                .await
                .unwrap();
            assert_eq!(removed, 1);
            assert!(repo.get_context("done").await.unwrap().is_none());
            assert!(repo.get_approval("done-approval").await.unwrap().is_none());
            assert!(repo.get_context("recent").await.unwrap().is_some());
            assert!(repo.get_context("live").await.unwrap().is_some());
        })
        .await;
    }

    #[tokio::test]
    async fn contexts_listed_by_state_oldest_first() {
        both(|repo| async move {
            let mut later = context("later");
            later.created_at = Utc::now() + Duration::seconds(5);
            repo.insert_context(&later).await.unwrap();

            let mut routing = context("routing");
            routing
                .advance(RequestState::Routing, "accepted", Utc::now())
                .unwrap();
            repo.insert_context(&routing).await.unwrap();

            repo.insert_context(&context("earlier")).await.unwrap();

            let mut done = context("done");
            done.state = RequestState::Completed;
            repo.insert_context(&done).await.unwrap();

            let received = repo
                .list_contexts_in(&[RequestState::Received])
                .await
                .unwrap();
            let ids: Vec<&str> = received.iter().map(|c| c.request_id.as_str()).collect();
            assert_eq!(ids, ["earlier", "later"]);

            let in_flight = repo
                .list_contexts_in(&[RequestState::Routing, RequestState::Dispatching])
                .await
                .unwrap();
            assert_eq!(in_flight.len(), 1);
            assert_eq!(in_flight[0].request_id, "routing");
            assert_eq!(in_flight[0].history.len(), 1);

            assert!(repo.list_contexts_in(&[]).await.unwrap().is_empty());
        })
        .await;
    }
}
