//! Outbox synchronization.
//!
//! When connectivity returns, queued operations are coalesced per
//! session into a minimal write plan (at most one create, one update,
//! one finish) and applied idempotently against the remote store. The
//! processed-operation set is the only replay guard: re-running the
//! whole flush over unchanged state — including after a reload that
//! interrupted a previous flush — issues zero additional remote calls.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::remote::SessionStore;
use crate::store::LocalStore;
use crate::types::{OpKind, OutboxOp, SessionId, SessionPatch, SessionStatus};

/// Minimal remote write plan for one session, plus the original
/// uncoalesced operations to restore if the group fails.
#[derive(Debug, Clone)]
pub struct OpGroup {
    pub session_id: SessionId,
    pub create: Option<OutboxOp>,
    pub update: Option<OutboxOp>,
    pub finish: Option<OutboxOp>,
    /// Every non-touch op originally queued for this session, in order
    pub original: Vec<OutboxOp>,
}

/// What a flush attempt accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote operations actually issued and recorded as processed
    pub applied_ops: usize,
    /// Session groups left in the outbox for the next attempt
    pub failed_groups: usize,
    /// True if anything was applied — the caller may surface a
    /// "synced" notification
    pub synced: bool,
}

/// Group queued operations by session and keep only the first `create`,
/// the last `update`, and the last `finish` per session. Touch
/// operations are dropped outright; they are never replayed.
pub fn coalesce(ops: &[OutboxOp]) -> Vec<OpGroup> {
    let mut order: Vec<SessionId> = Vec::new();
    let mut groups: HashMap<SessionId, OpGroup> = HashMap::new();

    for op in ops {
        if op.is_touch() {
            continue;
        }
        let group = groups.entry(op.session_id.clone()).or_insert_with(|| {
            order.push(op.session_id.clone());
            OpGroup {
                session_id: op.session_id.clone(),
                create: None,
                update: None,
                finish: None,
                original: Vec::new(),
            }
        });
        group.original.push(op.clone());
        match op.kind {
            OpKind::Create { .. } => {
                if group.create.is_none() {
                    group.create = Some(op.clone());
                }
            }
            OpKind::Update { .. } => group.update = Some(op.clone()),
            OpKind::Finish { .. } => group.finish = Some(op.clone()),
            OpKind::Touch => unreachable!("touch filtered above"),
        }
    }

    order
        .into_iter()
        .filter_map(|id| groups.remove(&id))
        .collect()
}

/// Drain the outbox against the remote store.
///
/// Groups are independent: one session's remote failure leaves that
/// group's original operations queued verbatim and does not block other
/// sessions. Afterwards the session index is pruned of every non-active
/// entry with no remaining queued work.
pub fn flush<R: SessionStore>(local: &mut LocalStore, remote: &mut R) -> Result<SyncReport> {
    let ops = local.outbox();
    if ops.is_empty() {
        return Ok(SyncReport::default());
    }

    let groups = coalesce(&ops);
    info!(
        "[sync] flushing {} queued ops across {} sessions",
        ops.len(),
        groups.len()
    );

    let mut report = SyncReport::default();
    let mut survivors: Vec<OutboxOp> = Vec::new();

    for group in &groups {
        match apply_group(local, remote, group) {
            Ok(applied) => {
                report.applied_ops += applied;
            }
            Err(e) => {
                warn!(
                    "[sync] session {} failed, keeping {} ops for retry: {}",
                    group.session_id,
                    group.original.len(),
                    e
                );
                report.failed_groups += 1;
                survivors.extend(group.original.iter().cloned());
            }
        }
    }

    // Touch ops and fully applied groups are gone; failed groups stay.
    local.replace_outbox(&survivors)?;

    prune_index(local, &survivors)?;

    report.synced = report.applied_ops > 0;
    if report.synced {
        info!(
            "[sync] flush complete: {} applied, {} groups pending",
            report.applied_ops, report.failed_groups
        );
    }
    Ok(report)
}

/// Apply one session's coalesced plan. Create always precedes
/// update/finish; each step is skipped when its op id is already in the
/// processed set.
fn apply_group<R: SessionStore>(
    local: &mut LocalStore,
    remote: &mut R,
    group: &OpGroup,
) -> Result<usize> {
    let mut applied = 0;

    // Effective target id: the remote id if the create lands now or
    // landed in an earlier partial flush, otherwise the id the ops were
    // queued under.
    let mut target = group.session_id.clone();
    if target.is_local() {
        if let Some(remote_id) = local.mapped_remote_id(&target) {
            target = SessionId::Remote(remote_id);
        }
    }

    if let Some(op) = &group.create {
        if local.is_processed(&op.op_id) {
            debug!("[sync] create {} already processed, skipping", op.op_id);
        } else {
            let OpKind::Create { doc } = &op.kind else {
                return Err(SyncError::Internal(format!(
                    "op {} grouped as create has wrong kind",
                    op.op_id
                )));
            };
            let remote_id = SessionId::Remote(remote.create_session(doc)?);
            local.migrate_session_id(&group.session_id, &remote_id)?;
            local.mark_processed(&op.op_id)?;
            debug!(
                "[sync] created session {} -> {}",
                group.session_id, remote_id
            );
            target = remote_id;
            applied += 1;
        }
    }

    if let Some(op) = &group.update {
        if local.is_processed(&op.op_id) {
            debug!("[sync] update {} already processed, skipping", op.op_id);
        } else {
            let OpKind::Update { timestamps } = &op.kind else {
                return Err(SyncError::Internal(format!(
                    "op {} grouped as update has wrong kind",
                    op.op_id
                )));
            };
            remote.update_session(target.as_str(), &SessionPatch::timestamps(timestamps.clone()))?;
            local.mark_processed(&op.op_id)?;
            applied += 1;
        }
    }

    if let Some(op) = &group.finish {
        if local.is_processed(&op.op_id) {
            debug!("[sync] finish {} already processed, skipping", op.op_id);
        } else {
            let OpKind::Finish { ended_at } = &op.kind else {
                return Err(SyncError::Internal(format!(
                    "op {} grouped as finish has wrong kind",
                    op.op_id
                )));
            };
            remote.update_session(target.as_str(), &SessionPatch::finish(*ended_at))?;
            local.mark_processed(&op.op_id)?;
            applied += 1;
        }
    }

    Ok(applied)
}

/// Remove every index entry that is past `active` and has no queued
/// work left — those sessions are fully synchronized.
fn prune_index(local: &mut LocalStore, remaining: &[OutboxOp]) -> Result<()> {
    let mut busy: HashSet<SessionId> = HashSet::new();
    for op in remaining {
        busy.insert(op.session_id.clone());
        // Ops queued under a placeholder keep their migrated index entry
        // alive as well.
        if op.session_id.is_local() {
            if let Some(remote_id) = local.mapped_remote_id(&op.session_id) {
                busy.insert(SessionId::Remote(remote_id));
            }
        }
    }

    for entry in local.index_entries() {
        if entry.status != SessionStatus::Active && !busy.contains(&entry.id) {
            debug!("[sync] pruning synchronized index entry {}", entry.id);
            local.remove_index_entry(&entry.id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemorySessionStore;
    use crate::session::tests_support::doc;
    use crate::types::{SessionIndexEntry, Stamp};
    use chrono::{TimeZone, Utc};

    fn ts(secs: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, secs).unwrap()
    }

    fn create_op(id: &SessionId, title: &str) -> OutboxOp {
        OutboxOp::new(
            id.clone(),
            OpKind::Create {
                doc: doc("u1", title),
            },
            Utc::now(),
        )
    }

    fn update_op(id: &SessionId, stamps: Vec<Stamp>) -> OutboxOp {
        OutboxOp::new(id.clone(), OpKind::Update { timestamps: stamps }, Utc::now())
    }

    fn finish_op(id: &SessionId) -> OutboxOp {
        OutboxOp::new(
            id.clone(),
            OpKind::Finish { ended_at: ts(30) },
            Utc::now(),
        )
    }

    #[test]
    fn test_coalesce_keeps_first_create_last_update() {
        let id = SessionId::from_token("local-1-1");
        let op1 = create_op(&id, "T1");
        let op2 = update_op(&id, vec![Stamp::lap_start(1, ts(1))]);
        let op3 = update_op(&id, vec![Stamp::lap_start(1, ts(1)), Stamp::lap_stop(1, ts(2))]);

        let groups = coalesce(&[op1.clone(), op2.clone(), op3.clone()]);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.create.as_ref().unwrap().op_id, op1.op_id);
        assert_eq!(group.update.as_ref().unwrap().op_id, op3.op_id);
        assert!(group.finish.is_none());
        assert_eq!(group.original.len(), 3);
    }

    #[test]
    fn test_coalesce_drops_touch_and_splits_sessions() {
        let a = SessionId::from_token("local-1-1");
        let b = SessionId::from_token("local-1-2");
        let ops = vec![
            OutboxOp::new(a.clone(), OpKind::Touch, Utc::now()),
            create_op(&a, "T1"),
            create_op(&b, "T2"),
            finish_op(&b),
        ];
        let groups = coalesce(&ops);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].session_id, a);
        assert_eq!(groups[1].session_id, b);
        assert!(groups[1].finish.is_some());
    }

    #[test]
    fn test_flush_empty_outbox_is_noop() {
        let mut local = LocalStore::in_memory().unwrap();
        let mut remote = MemorySessionStore::new();
        let report = flush(&mut local, &mut remote).unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(remote.create_calls, 0);
    }

    #[test]
    fn test_flush_applies_create_then_update_and_migrates() {
        let mut local = LocalStore::in_memory().unwrap();
        let mut remote = MemorySessionStore::new();
        let id = SessionId::from_token("local-1-1");

        let session = doc("u1", "T1");
        let entry = SessionIndexEntry::from_doc(
            id.clone(),
            &session,
            crate::types::SessionStatus::Active,
        );
        local.upsert_index_entry(&entry).unwrap();
        let stamps = vec![Stamp::lap_start(1, ts(1)), Stamp::lap_stop(1, ts(2))];
        local.put_stamps(&id, &stamps).unwrap();
        local.enqueue(&create_op(&id, "T1")).unwrap();
        local.enqueue(&update_op(&id, stamps.clone())).unwrap();

        let report = flush(&mut local, &mut remote).unwrap();
        assert!(report.synced);
        assert_eq!(report.applied_ops, 2);
        assert_eq!(remote.create_calls, 1);
        assert_eq!(remote.update_calls, 1);

        // Local state migrated off the placeholder id.
        assert!(local.index_entry(&id).is_none());
        let remote_id = SessionId::from_token(local.mapped_remote_id(&id).unwrap());
        assert_eq!(remote.doc(remote_id.as_str()).unwrap().timestamps, stamps);
        assert!(local.outbox().is_empty());
    }

    #[test]
    fn test_flush_twice_issues_no_extra_remote_calls() {
        let mut local = LocalStore::in_memory().unwrap();
        let mut remote = MemorySessionStore::new();
        let id = SessionId::from_token("local-1-1");
        local.enqueue(&create_op(&id, "T1")).unwrap();
        local.enqueue(&finish_op(&id)).unwrap();

        flush(&mut local, &mut remote).unwrap();
        let creates = remote.create_calls;
        let updates = remote.update_calls;

        let report = flush(&mut local, &mut remote).unwrap();
        assert_eq!(remote.create_calls, creates);
        assert_eq!(remote.update_calls, updates);
        assert!(!report.synced);
    }

    #[test]
    fn test_failed_group_keeps_original_ops_and_spares_others() {
        let mut local = LocalStore::in_memory().unwrap();
        let mut remote = MemorySessionStore::new();
        remote.fail_titles.insert("bad".to_string());

        let good = SessionId::from_token("local-1-1");
        let bad = SessionId::from_token("local-1-2");
        local.enqueue(&create_op(&bad, "bad")).unwrap();
        let bad_update = update_op(&bad, vec![Stamp::lap_start(1, ts(1))]);
        local.enqueue(&bad_update).unwrap();
        local.enqueue(&create_op(&good, "good")).unwrap();

        let report = flush(&mut local, &mut remote).unwrap();
        assert!(report.synced);
        assert_eq!(report.failed_groups, 1);
        assert_eq!(remote.doc_count(), 1);

        // Failed group preserved verbatim (both uncoalesced ops).
        let remaining = local.outbox();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|op| op.session_id == bad));

        // Retry succeeds once the remote recovers.
        remote.fail_titles.clear();
        let report = flush(&mut local, &mut remote).unwrap();
        assert_eq!(report.failed_groups, 0);
        assert_eq!(remote.doc_count(), 2);
        assert!(local.outbox().is_empty());
    }

    #[test]
    fn test_partial_flush_resumes_against_mapped_id() {
        // Create lands, then the update fails. The retry must resolve the
        // update against the remote id recorded during migration, and must
        // not create a second remote session.
        let mut local = LocalStore::in_memory().unwrap();
        let mut remote = MemorySessionStore::new();
        let id = SessionId::from_token("local-1-1");

        local.enqueue(&create_op(&id, "T1")).unwrap();
        let report = flush(&mut local, &mut remote).unwrap();
        assert_eq!(report.applied_ops, 1);
        let remote_id = local.mapped_remote_id(&id).unwrap();

        // An update queued after the create already flushed, still under
        // the placeholder id.
        let stamps = vec![Stamp::lap_start(1, ts(5))];
        local.enqueue(&update_op(&id, stamps.clone())).unwrap();
        let report = flush(&mut local, &mut remote).unwrap();
        assert_eq!(report.applied_ops, 1);
        assert_eq!(remote.create_calls, 1);
        assert_eq!(remote.doc(&remote_id).unwrap().timestamps, stamps);
    }

    #[test]
    fn test_prune_removes_synced_pending_finish_entries() {
        let mut local = LocalStore::in_memory().unwrap();
        let mut remote = MemorySessionStore::new();
        let id = SessionId::from_token("local-1-1");

        let session = doc("u1", "T1");
        let entry = SessionIndexEntry::from_doc(
            id.clone(),
            &session,
            crate::types::SessionStatus::FinishedPending,
        );
        local.upsert_index_entry(&entry).unwrap();
        local.enqueue(&create_op(&id, "T1")).unwrap();
        local.enqueue(&finish_op(&id)).unwrap();

        flush(&mut local, &mut remote).unwrap();
        assert!(local.index_entries().is_empty(), "entry fully synchronized");

        // Active entries are never pruned.
        let active = SessionId::from_token("local-1-2");
        let entry =
            SessionIndexEntry::from_doc(active.clone(), &session, crate::types::SessionStatus::Active);
        local.upsert_index_entry(&entry).unwrap();
        flush(&mut local, &mut remote).unwrap();
        assert_eq!(local.index_entries().len(), 1);
    }
}
