mod common;

use std::time::Duration;

use common::{harness, harness_with};
use hive_kernel::{CredentialSpec, HiveKernel, LifecycleError};
use hive_store::{EndReason, MessageRole, SessionState};
use serde_json::json;

#[tokio::test]
async fn concurrent_init_builds_one_sandbox() {
    let h = harness().await;
    *h.runtime.spawn_delay.lock() = Duration::from_millis(50);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lifecycle = h.kernel.lifecycle.clone();
        handles.push(tokio::spawn(async move {
            lifecycle.init("alice", "writer").await.unwrap()
        }));
    }

    let mut descriptors = Vec::new();
    for handle in handles {
        descriptors.push(handle.await.unwrap());
    }

    let first = &descriptors[0];
    assert_eq!(first.state, SessionState::Ready);
    assert!(first.sandbox_id.is_some());
    assert!(descriptors.iter().all(|d| d == first));
    assert_eq!(h.runtime.spawned(), 1);
    assert_eq!(h.kernel.supervisor.stats().live_sandboxes, 1);
}

#[tokio::test]
async fn init_is_idempotent_for_live_sessions() {
    let h = harness().await;
    let first = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.lifecycle.start(first.session_id).await.unwrap();

    let again = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    assert_eq!(again.sandbox_id, first.sandbox_id);
    assert_eq!(again.state, SessionState::Active);
    assert_eq!(h.runtime.spawned(), 1);

    let other = h.kernel.lifecycle.init("alice", "reviewer").await.unwrap();
    assert_ne!(other.session_id, first.session_id);
    assert_eq!(h.runtime.spawned(), 2);
}

#[tokio::test]
async fn start_leases_a_credential_and_end_releases_it() {
    let h = harness().await;
    let session = h.kernel.lifecycle.init("alice", "writer").await.unwrap();

    let started = h.kernel.lifecycle.start(session.session_id).await.unwrap();
    assert_eq!(started.state, SessionState::Active);
    let status = h.kernel.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.credential_id.as_deref(), Some("primary"));
    assert!(status.heartbeat_age_ms.is_some());

    let ended = h.kernel.lifecycle.end(session.session_id).await.unwrap();
    assert_eq!(ended.state, SessionState::Terminated);
    assert_eq!(ended.end_reason, Some(EndReason::Ended));
    assert_eq!(ended.credential_id, None);
    assert_eq!(h.kernel.credentials.lease_of(session.session_id).await, None);

    // Zero reuse window: the sandbox goes with the session.
    assert_eq!(h.kernel.supervisor.stats().live_sandboxes, 0);
    assert_eq!(h.runtime.alive(), 0);

    // Ending twice is a no-op.
    let again = h.kernel.lifecycle.end(session.session_id).await.unwrap();
    assert_eq!(again.state, SessionState::Terminated);
}

#[tokio::test]
async fn start_without_free_credential_is_retryable() {
    let h = harness().await;
    h.kernel
        .credentials
        .register(CredentialSpec {
            id: "primary".into(),
            secret_ref: "env:PRIMARY_KEY".into(),
            quota: 1_000,
            max_sessions: 1,
        })
        .await
        .unwrap();

    let first = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    let second = h.kernel.lifecycle.init("bob", "writer").await.unwrap();
    h.kernel.lifecycle.start(first.session_id).await.unwrap();

    let err = h.kernel.lifecycle.start(second.session_id).await.unwrap_err();
    assert_eq!(err, LifecycleError::CredentialUnavailable);
    let status = h.kernel.lifecycle.status(second.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Ready);

    h.kernel.lifecycle.end(first.session_id).await.unwrap();
    let started = h.kernel.lifecycle.start(second.session_id).await.unwrap();
    assert_eq!(started.state, SessionState::Active);
}

#[tokio::test]
async fn start_requires_an_initialized_session() {
    let h = harness().await;
    let record = h.db.ensure_session("alice", "writer").await.unwrap();

    let err = h.kernel.lifecycle.start(record.id).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition {
            state: SessionState::Uninitialized,
            ..
        }
    ));

    let missing = uuid::Uuid::new_v4();
    assert_eq!(
        h.kernel.lifecycle.status(missing).await.unwrap_err(),
        LifecycleError::NotFound(missing)
    );
}

#[tokio::test]
async fn ended_session_reuses_parked_sandbox_within_window() {
    let h = harness_with(|config| config.reuse_window = Duration::from_secs(30)).await;
    let first = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.lifecycle.end(first.session_id).await.unwrap();
    assert_eq!(h.kernel.supervisor.stats().live_sandboxes, 1);

    let revived = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    assert_eq!(revived.session_id, first.session_id);
    assert_eq!(revived.sandbox_id, first.sandbox_id);
    assert_eq!(revived.state, SessionState::Ready);
    assert_eq!(h.runtime.spawned(), 1);
}

#[tokio::test]
async fn parked_sandbox_is_destroyed_after_window() {
    let h = harness_with(|config| config.reuse_window = Duration::from_millis(50)).await;
    let first = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.lifecycle.end(first.session_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.kernel.supervisor.stats().live_sandboxes, 0);

    let fresh = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    assert_ne!(fresh.sandbox_id, first.sandbox_id);
    assert_eq!(h.runtime.spawned(), 2);
}

#[tokio::test]
async fn end_cancels_in_flight_creation() {
    let h = harness().await;
    *h.runtime.spawn_delay.lock() = Duration::from_millis(300);
    let record = h.db.ensure_session("alice", "writer").await.unwrap();

    let lifecycle = h.kernel.lifecycle.clone();
    let pending = tokio::spawn(async move { lifecycle.init("alice", "writer").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = h.kernel.lifecycle.status(record.id).await.unwrap();
    assert_eq!(status.state, SessionState::Initializing);

    let ended = h.kernel.lifecycle.end(record.id).await.unwrap();
    assert_eq!(ended.state, SessionState::Terminated);

    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err(), LifecycleError::Cancelled(record.id));

    // The abandoned creation still runs to completion and then tears down.
    let mut settled = false;
    for _ in 0..200 {
        let stats = h.kernel.supervisor.stats();
        if h.runtime.spawned() == 1
            && stats.live_sandboxes == 0
            && stats.reserved_bytes == 0
            && stats.free_identities == stats.identity_capacity
        {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "cancelled creation leaked: {:?}", h.kernel.supervisor.stats());
    assert_eq!(h.runtime.alive(), 0);
}

#[tokio::test]
async fn resources_report_sandbox_usage() {
    let h = harness().await;
    let session = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    let sandbox_id = session.sandbox_id.unwrap();

    let usage = h.kernel.lifecycle.resources(session.session_id).await.unwrap();
    assert_eq!(usage.sandbox_id, sandbox_id);
    assert_eq!(usage.memory_max_bytes, 1_000);
    assert_eq!(usage.resident_bytes, Some(400));
    assert_eq!(usage.workdir_bytes, 0);
    assert_eq!(usage.workdir_quota_bytes, None);

    let workdir = h.kernel.supervisor.get(sandbox_id).unwrap().workdir;
    std::fs::write(workdir.join("draft.md"), "0123456789").unwrap();
    let usage = h.kernel.lifecycle.resources(session.session_id).await.unwrap();
    assert_eq!(usage.workdir_bytes, 10);

    // Inspection is not activity and leaves the state alone.
    let status = h.kernel.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Ready);
}

#[tokio::test]
async fn resources_of_vanished_sandbox_mark_the_session_lost() {
    let h = harness().await;
    let session = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.supervisor.destroy(session.sandbox_id.unwrap()).await.unwrap();

    let err = h.kernel.lifecycle.resources(session.session_id).await.unwrap_err();
    assert_eq!(err, LifecycleError::SandboxLost(session.session_id));
    let status = h.kernel.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Terminated);
    assert_eq!(status.end_reason, Some(EndReason::SandboxLost));

    let err = h.kernel.lifecycle.resources(session.session_id).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition {
            state: SessionState::Terminated,
            ..
        }
    ));
}

#[tokio::test]
async fn ended_sessions_leave_the_cache() {
    let h = harness().await;
    for agent in ["writer", "reviewer", "planner"] {
        let session = h.kernel.lifecycle.init("alice", agent).await.unwrap();
        h.kernel.lifecycle.end(session.session_id).await.unwrap();
    }
    assert_eq!(h.kernel.lifecycle.cached_sessions(), 0);

    let live = h.kernel.lifecycle.init("bob", "writer").await.unwrap();
    assert_eq!(h.kernel.lifecycle.cached_sessions(), 1);
    let status = h.kernel.lifecycle.status(live.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Ready);
}

#[tokio::test]
async fn dead_sandbox_surfaces_as_lost_and_submit_rehydrates() {
    let h = harness().await;
    let session = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.lifecycle.start(session.session_id).await.unwrap();
    h.kernel
        .lifecycle
        .submit(session.session_id, MessageRole::User, json!("first"))
        .await
        .unwrap();

    h.runtime.crash_all();
    let status = h.kernel.supervisor.health_check(session.sandbox_id.unwrap()).await.unwrap();
    assert_eq!(status, hive_kernel::HealthStatus::Dead);

    let err = h.kernel.lifecycle.heartbeat(session.session_id).await.unwrap_err();
    assert_eq!(err, LifecycleError::SandboxLost(session.session_id));
    let status = h.kernel.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Terminated);
    assert_eq!(status.end_reason, Some(EndReason::SandboxLost));

    let message = h
        .kernel
        .lifecycle
        .submit(session.session_id, MessageRole::User, json!("second"))
        .await
        .unwrap();
    assert_eq!(message.seq, 2);

    let status = h.kernel.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Active);
    assert_ne!(status.sandbox_id, session.sandbox_id);
    assert_eq!(h.runtime.spawned(), 2);
}

#[tokio::test]
async fn sync_tracks_last_delivered_seq() {
    let h = harness().await;
    let session = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.lifecycle.start(session.session_id).await.unwrap();
    for i in 0..3 {
        h.kernel
            .lifecycle
            .append(session.session_id, MessageRole::Assistant, json!({ "chunk": i }))
            .await
            .unwrap();
    }

    let batch = h.kernel.lifecycle.sync_since(session.session_id, 1, 10).await.unwrap();
    let seqs: Vec<i64> = batch.messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![2, 3]);
    assert!(!batch.has_more);

    let status = h.kernel.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.last_sync_seq, 3);
    let stored = h.db.fetch_session(session.session_id).await.unwrap().unwrap();
    assert_eq!(stored.last_sync_seq, 3);
}

#[tokio::test]
async fn bootstrap_terminates_sessions_left_live() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("hive.db");
    let db = hive_store::Database::connect_file(&db_path).await.unwrap();
    let h = harness().await;

    let config = common::test_config(dir.path());
    let kernel = HiveKernel::bootstrap(db.clone(), h.runtime.clone(), config.clone(), None)
        .await
        .unwrap();
    kernel
        .credentials
        .register(CredentialSpec {
            id: "k".into(),
            secret_ref: "env:K".into(),
            quota: 10,
            max_sessions: 1,
        })
        .await
        .unwrap();
    let session = kernel.lifecycle.init("alice", "writer").await.unwrap();
    kernel.lifecycle.start(session.session_id).await.unwrap();
    drop(kernel);

    let restarted = HiveKernel::bootstrap(db, h.runtime.clone(), config, None)
        .await
        .unwrap();
    let status = restarted.lifecycle.status(session.session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Terminated);
    assert_eq!(status.end_reason, Some(EndReason::HostRestart));
    assert_eq!(status.sandbox_id, None);

    // Credential state survives the restart.
    let snapshot = restarted.credentials.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].active_leases, 0);
}

#[tokio::test]
async fn credential_failover_never_blocks_start() {
    let h = harness().await;
    // Retire the harness credential so only the scenario keys are eligible.
    h.kernel.credentials.record_usage("primary", 1_000).await.unwrap();
    for (id, quota) in [("key1", 0), ("key2", 10)] {
        h.kernel
            .credentials
            .register(CredentialSpec {
                id: id.into(),
                secret_ref: format!("env:{id}"),
                quota,
                max_sessions: 4,
            })
            .await
            .unwrap();
    }

    let first = h.kernel.lifecycle.init("alice", "writer").await.unwrap();
    h.kernel.lifecycle.start(first.session_id).await.unwrap();
    let status = h.kernel.lifecycle.status(first.session_id).await.unwrap();
    assert_eq!(status.credential_id.as_deref(), Some("key2"));

    for _ in 0..3 {
        h.kernel.credentials.report_failure("key2").await.unwrap();
    }
    h.kernel.credentials.replenish("key1", 10).await.unwrap();

    let second = h.kernel.lifecycle.init("bob", "writer").await.unwrap();
    let started = tokio::time::timeout(
        Duration::from_secs(1),
        h.kernel.lifecycle.start(second.session_id),
    )
    .await
    .expect("start must not block")
    .unwrap();
    assert_eq!(started.state, SessionState::Active);
    let status = h.kernel.lifecycle.status(second.session_id).await.unwrap();
    assert_eq!(status.credential_id.as_deref(), Some("key1"));
}
