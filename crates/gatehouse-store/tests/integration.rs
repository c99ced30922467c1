//! Integration tests for the gatehouse-store crate.
//!
//! These run against a real SQLite file on disk (via tempfile) to cover
//! reopen, concurrent CAS writers and the full request walk.

use std::sync::Arc;

use gatehouse_kernel::{EventBus, RequestPayload, RequestState};
use gatehouse_store::{
    Database, EmbeddingStore, Repository, SqliteRepository, StateManager, StoreError,
};

// ═══════════════════════════════════════════════════════════════════════
//  Durability
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn contexts_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gatehouse.db");

    let id = {
        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        let states = StateManager::new(Arc::new(SqliteRepository::new(db)), EventBus::default());
        let ctx = states
            .create(RequestPayload::new("ETL pipeline failing"))
            .await
            .unwrap();
        states
            .transition(&ctx.request_id, RequestState::Routing, "accepted", |_| {})
            .await
            .unwrap();
        ctx.request_id
    };

    let db = Database::open_and_migrate(path).await.unwrap();
    let repo = SqliteRepository::new(db);
    let ctx = repo.get_context(&id).await.unwrap().unwrap();
    assert_eq!(ctx.state, RequestState::Routing);
    assert_eq!(ctx.history.len(), 1);
    assert_eq!(ctx.payload.text, "ETL pipeline failing");
}

#[tokio::test]
async fn embeddings_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gatehouse.db");

    {
        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        EmbeddingStore::new(db, 16)
            .put("text-embedding-3-small", "reset my password", vec![0.1, 0.2, 0.3])
            .await
            .unwrap();
    }

    let db = Database::open_and_migrate(path).await.unwrap();
    let store = EmbeddingStore::new(db, 16);
    let v = store
        .get("text-embedding-3-small", "reset my password")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v.len(), 3);
    assert!((v[1] - 0.2).abs() < f32::EPSILON);
}

// ═══════════════════════════════════════════════════════════════════════
//  Concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn racing_transitions_from_the_same_state_have_one_winner() {
    let db = Database::in_memory_migrated().await.unwrap();
    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::new(db));
    let states = StateManager::new(Arc::clone(&repo), EventBus::default());

    let ctx = states.create(RequestPayload::new("x")).await.unwrap();
    let mut seeded = ctx.clone();
    for (to, reason) in [
        (RequestState::Routing, "accepted"),
        (RequestState::RiskAssessing, "routed"),
        (RequestState::AwaitingApproval, "needs approval"),
    ] {
        seeded = states
            .transition(&seeded.request_id, to, reason, |_| {})
            .await
            .unwrap();
    }

    let a = {
        let states = states.clone();
        let id = ctx.request_id.clone();
        tokio::spawn(async move {
            states
                .transition(&id, RequestState::Approved, "approve", |_| {})
                .await
        })
    };
    let b = {
        let states = states.clone();
        let id = ctx.request_id.clone();
        tokio::spawn(async move {
            states
                .transition(&id, RequestState::Rejected, "reject", |_| {})
                .await
        })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "a={a:?} b={b:?}");
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(StoreError::IllegalTransition { .. })));

    let stored = repo.get_context(&ctx.request_id).await.unwrap().unwrap();
    assert!(matches!(
        stored.state,
        RequestState::Approved | RequestState::Rejected
    ));
    assert_eq!(stored.history.len(), 4);
    for edge in &stored.history {
        assert!(edge.from.can_transition_to(edge.to));
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Retention
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn purge_with_zero_retention_drops_terminal_requests() {
    let db = Database::in_memory_migrated().await.unwrap();
    let states = StateManager::new(Arc::new(SqliteRepository::new(db)), EventBus::default());

    let done = states.create(RequestPayload::new("done")).await.unwrap();
    states.fail(&done.request_id, "rejected").await.unwrap();
    let live = states.create(RequestPayload::new("live")).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let removed = states.purge(chrono::Duration::zero()).await.unwrap();
    assert_eq!(removed, 1);
    assert!(states.find(&done.request_id).await.unwrap().is_none());
    assert!(states.find(&live.request_id).await.unwrap().is_some());
}
