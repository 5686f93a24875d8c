//! End-to-end behavior of the synchronization orchestrator against a
//! scripted backend: optimistic creation, conflict resolution, offline
//! degradation, and cache-first lookups.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use valo_backend_client::SessionApi;
use valo_protocol::{
    ApplicationError, CorrelationId, ErrorKind, SessionView, ValuationSession, classify_status,
};
use valo_session_sync::{MemoryStore, SessionSyncConfig, SessionSyncManager, SyncStatus};

#[derive(Clone)]
enum CreateScript {
    /// Accept the posted session as-is.
    Echo,
    /// Report that a session for this report already exists.
    Conflict,
    /// The backend is unreachable.
    NetworkDown,
}

#[derive(Clone)]
enum FetchScript {
    Ok(ValuationSession),
    NotFound,
    NetworkDown,
}

struct ScriptedApi {
    create: CreateScript,
    fetch: FetchScript,
    create_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl ScriptedApi {
    fn new(create: CreateScript, fetch: FetchScript) -> Arc<Self> {
        Arc::new(Self {
            create,
            fetch,
            create_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SessionApi for ScriptedApi {
    async fn create_session(
        &self,
        session: &ValuationSession,
        _correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        match &self.create {
            CreateScript::Echo => Ok(session.clone()),
            CreateScript::Conflict => Err(classify_status(409, "session already exists")),
            CreateScript::NetworkDown => Err(ApplicationError::network("connection refused")),
        }
    }

    async fn fetch_session(
        &self,
        _report_id: &str,
        _correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match &self.fetch {
            FetchScript::Ok(session) => Ok(session.clone()),
            FetchScript::NotFound => Err(classify_status(404, "no such session")),
            FetchScript::NetworkDown => Err(ApplicationError::network("connection refused")),
        }
    }

    async fn update_session(
        &self,
        session: &ValuationSession,
        _correlation: &CorrelationId,
    ) -> Result<ValuationSession, ApplicationError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(session.clone())
    }
}

fn manager_with(api: Arc<ScriptedApi>) -> Arc<SessionSyncManager> {
    SessionSyncManager::new(api, Arc::new(MemoryStore::new()), SessionSyncConfig::default())
}

/// Wait (in virtual time) for the background sync to reach a terminal state.
async fn await_terminal(manager: &Arc<SessionSyncManager>, report_id: &str) -> SyncStatus {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match manager.sync_status(report_id) {
                Some(status @ (SyncStatus::Synced | SyncStatus::SyncFailed)) => return status,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("background sync never reached a terminal state")
}

#[tokio::test(start_paused = true)]
async fn concurrent_creation_issues_one_backend_create() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NotFound);
    let manager = manager_with(api.clone());

    let (a, b) = tokio::join!(
        manager.get_or_create_session("val_1", SessionView::Manual, None),
        manager.get_or_create_session("val_1", SessionView::Manual, None),
    );

    let a = a.expect("first caller gets a session");
    let b = b.expect("second caller gets a session");
    assert_eq!(a.report_id, "val_1");
    assert_eq!(a.session_id, b.session_id, "both callers share one session");

    assert_eq!(await_terminal(&manager, "val_1").await, SyncStatus::Synced);
    assert_eq!(api.create_calls.load(Ordering::SeqCst), 1, "exactly one backend create");
}

#[tokio::test(start_paused = true)]
async fn conflict_resolves_to_the_backend_record() {
    let mut existing =
        ValuationSession::new_local("val_1", SessionView::Conversational, Default::default());
    existing.session_id = "sess_backend".to_string();
    // The backend record predates the optimistic copy; it must still win.
    existing.created_at = existing.created_at - chrono::Duration::hours(1);
    existing.updated_at = existing.created_at;

    let api = ScriptedApi::new(CreateScript::Conflict, FetchScript::Ok(existing.clone()));
    let manager = manager_with(api.clone());

    let optimistic = manager
        .get_or_create_session("val_1", SessionView::Manual, None)
        .await
        .expect("optimistic session");
    assert_ne!(optimistic.session_id, "sess_backend");

    assert_eq!(await_terminal(&manager, "val_1").await, SyncStatus::Synced);
    assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);

    let cached = manager.cache().get("val_1").expect("cache holds resolved session");
    assert_eq!(cached.session_id, "sess_backend", "backend record replaced the optimistic copy");
    assert_eq!(cached.current_view, SessionView::Conversational);
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_degrades_to_local_session() {
    let api = ScriptedApi::new(CreateScript::NetworkDown, FetchScript::NetworkDown);
    let manager = manager_with(api.clone());

    let start = tokio::time::Instant::now();
    let session = manager
        .get_or_create_session("val_1", SessionView::Manual, None)
        .await
        .expect("optimistic path never fails on network trouble");
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "no network wait on the optimistic path"
    );
    assert_eq!(session.report_id, "val_1");

    assert_eq!(await_terminal(&manager, "val_1").await, SyncStatus::SyncFailed);
    assert_eq!(
        api.create_calls.load(Ordering::SeqCst),
        4,
        "initial attempt plus three retries"
    );
    assert_eq!(
        manager.breaker().stats().total_calls,
        4,
        "every attempt went through the breaker"
    );

    // The local session keeps working from cache.
    let again = manager
        .get_or_create_session("val_1", SessionView::Manual, None)
        .await
        .expect("cached session");
    assert_eq!(again.session_id, session.session_id);
}

#[tokio::test(start_paused = true)]
async fn warm_cache_skips_backend_entirely() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NetworkDown);
    let manager = manager_with(api.clone());

    let first = manager
        .get_or_create_session("val_1", SessionView::Manual, None)
        .await
        .expect("create");
    await_terminal(&manager, "val_1").await;

    let second = manager
        .get_or_create_session("val_1", SessionView::Manual, None)
        .await
        .expect("cached");
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(api.create_calls.load(Ordering::SeqCst), 1, "no second create");
}

#[tokio::test(start_paused = true)]
async fn get_session_fetches_once_then_serves_from_cache() {
    let mut remote = ValuationSession::new_local("val_9", SessionView::Manual, Default::default());
    remote.session_id = "sess_backend".to_string();

    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::Ok(remote.clone()));
    let manager = manager_with(api.clone());

    let loaded = manager
        .get_session("val_9")
        .await
        .expect("lookup succeeds")
        .expect("session exists");
    assert_eq!(loaded.session_id, "sess_backend");
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);

    let cached = manager
        .get_session("val_9")
        .await
        .expect("lookup succeeds")
        .expect("session cached");
    assert_eq!(cached.session_id, "sess_backend");
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1, "second lookup is cache-first");
}

#[tokio::test(start_paused = true)]
async fn get_session_surfaces_genuine_not_found_as_none() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NotFound);
    let manager = manager_with(api.clone());

    let result = manager.get_session("val_missing").await.expect("lookup completes");
    assert_eq!(result, None);
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn get_session_propagates_transient_errors_without_a_cached_copy() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NetworkDown);
    let manager = manager_with(api);

    let error = manager
        .get_session("val_unreachable")
        .await
        .expect_err("no local copy to degrade to");
    assert_eq!(error.kind, ErrorKind::Network);
}

#[tokio::test(start_paused = true)]
async fn validation_errors_surface_at_creation_time() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NotFound);
    let manager = manager_with(api.clone());

    let error = manager
        .get_or_create_session("   ", SessionView::Manual, None)
        .await
        .expect_err("blank reportId is rejected");
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(api.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn record_answer_merges_and_syncs_in_background() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NotFound);
    let manager = manager_with(api.clone());

    manager
        .get_or_create_session("val_1", SessionView::Conversational, None)
        .await
        .expect("create");
    await_terminal(&manager, "val_1").await;

    let updated = manager
        .record_answer("val_1", "revenue", 1_000_000.0.into())
        .await
        .expect("answer recorded");
    assert!(updated.partial_data.contains_key("revenue"));

    assert_eq!(await_terminal(&manager, "val_1").await, SyncStatus::Synced);
    assert_eq!(api.update_calls.load(Ordering::SeqCst), 1);

    let cached = manager.cache().get("val_1").expect("cache updated");
    assert!(cached.partial_data.contains_key("revenue"));
}

#[tokio::test(start_paused = true)]
async fn record_answer_without_session_is_a_not_found() {
    let api = ScriptedApi::new(CreateScript::Echo, FetchScript::NotFound);
    let manager = manager_with(api);

    let error = manager
        .record_answer("val_nope", "revenue", 1.0.into())
        .await
        .expect_err("nothing to update");
    assert_eq!(error.kind, ErrorKind::NotFound);
}
