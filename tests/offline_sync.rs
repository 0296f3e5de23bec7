//! Offline-first synchronization integration scenarios.
//!
//! Exercises the full pipeline: offline session run -> outbox -> reconnect
//! flush -> id migration -> index pruning, including simulated reloads
//! against an on-disk SQLite store.
//!
//! Run with: `cargo test --test offline_sync`

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use zuptsync::{
    LocalStore, MemorySessionStore, OpKind, OutboxOp, Plan, SessionEngine, SessionId,
    SessionStatus, ZuptPoint, flush,
};

fn ts(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
}

fn zupt(name: &str, wait_secs: u32) -> ZuptPoint {
    ZuptPoint {
        id: format!("z-{}", name),
        name: name.to_string(),
        lat: 59.91,
        lon: 10.75,
        height: 32.0,
        wait_secs,
    }
}

fn plan() -> Plan {
    Plan {
        id: "p1".to_string(),
        name: "Harbor survey".to_string(),
        anchors: Default::default(),
        zupts: vec![zupt("Z1", 5), zupt("Z2", 0)],
    }
}

/// Helper: engine over an on-disk store so a "reload" can reopen it.
fn open_engine(
    dir: &TempDir,
    remote: MemorySessionStore,
    online: bool,
) -> SessionEngine<MemorySessionStore> {
    let db_path = dir.path().join("zuptsync.db");
    let local = LocalStore::open(db_path.to_str().unwrap()).expect("failed to open store");
    let mut engine = SessionEngine::new(local, remote, "u1", online);
    engine.recover();
    engine
}

// ============================================================================
// Scenario: offline run, then reconnect
// ============================================================================

#[test]
fn test_offline_run_syncs_on_reconnect() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open_engine(&tmp, MemorySessionStore::new(), false);

    // Offline start allocates a local placeholder and queues the create.
    assert!(engine.start(&plan(), "T1", "Europe/Oslo").ok);
    let local_id = engine.active_session_id().unwrap().clone();
    assert!(local_id.is_local());
    let entries = engine.local().index_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, SessionStatus::Active);

    // Capture before any lap is open is rejected with no state change.
    let outcome = engine.capture(&zupt("Z1", 5));
    assert!(!outcome.ok);
    assert_eq!(outcome.message, "lap not open");
    assert!(engine.view_model().unwrap().stamps.is_empty());

    // Open lap 1, then capture Z1.
    assert!(engine.toggle_lap().ok);
    let view = engine.view_model().unwrap();
    assert!(view.loop_open);
    assert_eq!(view.loop_index, 1);

    assert!(engine.capture(&zupt("Z1", 5)).ok);
    let view = engine.view_model().unwrap();
    assert_eq!(view.stamps.len(), 2);
    assert!(view.captured.contains("Z1"));

    // Nothing touched the remote store yet.
    assert_eq!(engine.remote().create_calls, 0);

    // Reconnect: synchronizer creates the session with both stamps and
    // migrates every local key to the remote id.
    let outcome = engine.set_online(true);
    assert!(outcome.ok, "{}", outcome.message);

    let remote_id = engine.active_session_id().unwrap().clone();
    assert!(!remote_id.is_local());
    let doc = engine.remote().doc(remote_id.as_str()).unwrap();
    assert_eq!(doc.timestamps.len(), 2);
    assert_eq!(doc.timestamps[0].zupt_name, "L1 Start");
    assert_eq!(doc.timestamps[1].zupt_name, "Z1");
    assert!(doc.started_offline);

    assert_eq!(engine.local().queued_op_count(), 0);
    assert!(engine.local().index_entry(&local_id).is_none());
    assert!(engine.local().stamps(&local_id).is_empty());
    assert_eq!(engine.local().stamps(&remote_id).len(), 2);
}

// ============================================================================
// Scenario: offline finish, idempotent reconnect
// ============================================================================

#[test]
fn test_offline_finish_applies_once_and_prunes() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open_engine(&tmp, MemorySessionStore::new(), false);

    engine.start(&plan(), "T1", "Europe/Oslo");
    engine.toggle_lap();
    assert!(engine.finish().ok);
    assert!(engine.active_session_id().is_none());

    let entries = engine.local().index_entries();
    assert_eq!(entries[0].status, SessionStatus::FinishedPending);
    assert_eq!(engine.pending_counts().pending_finish_sessions, 1);

    // Reconnect applies create + update + finish exactly once.
    assert!(engine.set_online(true).ok);
    assert_eq!(engine.remote().create_calls, 1);
    let update_calls = engine.remote().update_calls;
    assert!(engine.local().index_entries().is_empty(), "entry pruned");

    // A forced second flush is a remote no-op.
    assert!(engine.sync_now().ok);
    assert_eq!(engine.remote().create_calls, 1);
    assert_eq!(engine.remote().update_calls, update_calls);
}

// ============================================================================
// Scenario: reload mid-flush
// ============================================================================

#[test]
fn test_replay_after_interrupted_flush_issues_no_remote_calls() {
    // Simulates a reload that interrupted a flush after the operations
    // were applied and recorded as processed, but before the outbox was
    // rewritten: the queued ops come back verbatim on restart and must
    // all be recognized as already applied.
    let mut local = LocalStore::in_memory().unwrap();
    let mut remote = MemorySessionStore::new();

    let id = SessionId::from_token("local-100-1");
    let mut doc = zuptsync::SessionDoc {
        uid: "u1".to_string(),
        plan_id: "p1".to_string(),
        plan_name: "Harbor survey".to_string(),
        plan_snapshot: Some(plan()),
        session_title: "T1".to_string(),
        timezone: "Europe/Oslo".to_string(),
        started_at: ts(0),
        ended_at: None,
        timestamps: Vec::new(),
        started_offline: true,
        is_merged: false,
        created_at: ts(0),
    };
    doc.timestamps.push(zuptsync::Stamp::lap_start(1, ts(1)));

    let create = OutboxOp::new(id.clone(), OpKind::Create { doc: doc.clone() }, ts(0));
    let finish = OutboxOp::new(id.clone(), OpKind::Finish { ended_at: ts(60) }, ts(60));
    local.enqueue(&create).unwrap();
    local.enqueue(&finish).unwrap();

    let report = flush(&mut local, &mut remote).unwrap();
    assert_eq!(report.applied_ops, 2);
    let creates = remote.create_calls;
    let updates = remote.update_calls;

    // "Reload": the same ops reappear in the outbox.
    local.enqueue(&create).unwrap();
    local.enqueue(&finish).unwrap();

    let report = flush(&mut local, &mut remote).unwrap();
    assert_eq!(report.applied_ops, 0);
    assert_eq!(remote.create_calls, creates, "no duplicate remote session");
    assert_eq!(remote.update_calls, updates, "no re-finish");
    assert!(local.outbox().is_empty());
    assert_eq!(remote.doc_count(), 1);
}

// ============================================================================
// Scenario: reload of an in-flight offline session
// ============================================================================

#[test]
fn test_reload_resumes_offline_session_from_disk() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open_engine(&tmp, MemorySessionStore::new(), false);

    engine.start(&plan(), "T1", "Europe/Oslo");
    engine.toggle_lap();
    engine.capture(&zupt("Z2", 0));
    let id = engine.active_session_id().unwrap().clone();

    // "Reload": tear down and reopen over the same database file.
    let (_, remote) = engine.into_parts();
    let mut engine = open_engine(&tmp, remote, false);

    let report = engine.recover();
    assert_eq!(report.local_sessions.len(), 1);
    assert_eq!(report.local_sessions[0].id, id);
    assert_eq!(report.pending.queued_ops, 3); // create + two updates

    assert!(engine.resume_local(&id).ok);
    let view = engine.view_model().unwrap();
    assert!(view.loop_open);
    assert_eq!(view.loop_index, 1);
    assert!(view.captured.contains("Z2"));
    assert_eq!(view.stamps.len(), 2);

    // The plan snapshot survived via the queued create payload even
    // though the plan cache is empty.
    engine.toggle_lap();
    assert!(engine.set_online(true).ok);
    let remote_id = engine.active_session_id().unwrap().clone();
    assert_eq!(
        engine.remote().doc(remote_id.as_str()).unwrap().timestamps.len(),
        3
    );
}

// ============================================================================
// Scenario: one failing session does not block others
// ============================================================================

#[test]
fn test_failing_session_does_not_block_others() {
    let tmp = TempDir::new().unwrap();
    let mut engine = open_engine(&tmp, MemorySessionStore::new(), false);

    engine.start(&plan(), "bad", "Europe/Oslo");
    engine.finish();
    engine.start(&plan(), "good", "Europe/Oslo");
    engine.finish();

    engine
        .remote_mut()
        .fail_titles
        .insert("bad".to_string());

    let outcome = engine.set_online(true);
    assert!(outcome.ok, "{}", outcome.message);
    assert_eq!(engine.remote().doc_count(), 1, "'good' synchronized");
    assert_eq!(engine.pending_counts().pending_finish_sessions, 1);
    assert!(engine.pending_counts().queued_ops >= 2, "'bad' ops retained");

    // Next flush after the remote recovers drains the rest.
    engine.remote_mut().fail_titles.clear();
    assert!(engine.sync_now().ok);
    assert_eq!(engine.remote().doc_count(), 2);
    assert_eq!(engine.pending_counts().queued_ops, 0);
    assert!(engine.local().index_entries().is_empty());
}

// ============================================================================
// Scenario: unfinished-session discovery on recovery
// ============================================================================

#[test]
fn test_recovery_surfaces_remote_unfinished_sessions() {
    let tmp = TempDir::new().unwrap();
    let mut seed = MemorySessionStore::new();

    // A session left open remotely by an earlier run.
    let mut engine = open_engine(&tmp, seed, true);
    engine.start(&plan(), "left open", "Europe/Oslo");
    let (_, remote) = engine.into_parts();
    seed = remote;

    let mut engine = open_engine(&tmp, seed, true);
    let report = engine.recover();
    assert_eq!(report.remote_unfinished.len(), 1);
    let (remote_id, doc) = &report.remote_unfinished[0];
    assert_eq!(doc.session_title, "left open");

    // The surfaced document can be resumed directly.
    assert!(engine.resume_remote(remote_id, doc.clone()).ok);
    assert!(engine.toggle_lap().ok);
    assert_eq!(
        engine
            .remote()
            .doc(remote_id)
            .unwrap()
            .timestamps
            .len(),
        1
    );
}
