//! Session lifecycle control.
//!
//! [`SessionEngine`] orchestrates start / capture / undo / finish
//! operations against both local state and the sync machinery. Every
//! local write happens before any remote attempt, so a reload at any
//! instant never loses a stamp the user has already seen. Per operation
//! the engine decides whether to write directly to the remote store or
//! enqueue into the outbox, based on connectivity and on whether the
//! session still runs under a local placeholder id.
//!
//! All operations are non-throwing from the caller's perspective: they
//! resolve to an [`Outcome`] with a toast-ready message.

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::connectivity::{Connectivity, Transition};
use crate::error::{Outcome, Result, SyncError};
use crate::loopstate::derive_loop_state;
use crate::remote::SessionStore;
use crate::store::LocalStore;
use crate::sync::{SyncReport, flush};
use crate::types::{
    CountdownView, OpKind, OutboxOp, PendingCounts, Plan, SessionDoc, SessionId, SessionIndexEntry,
    SessionPatch, SessionStatus, SessionView, Stamp, ZuptPoint, next_local_session_id,
};

/// Duplicate-input debounce window: a capture or lap marker with the
/// same name within this window of the previous one is dropped.
const DEBOUNCE_MS: i64 = 2000;

/// Settle countdown for the most recent capture. Cancellation means
/// clearing this reference; there is no timer to destroy.
#[derive(Debug, Clone)]
struct Countdown {
    zupt_name: String,
    started: DateTime<Utc>,
    duration_secs: u32,
}

impl Countdown {
    fn remaining_secs(&self, now: DateTime<Utc>) -> u32 {
        let deadline = self.started + chrono::Duration::seconds(i64::from(self.duration_secs));
        (deadline - now).num_seconds().max(0) as u32
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining_secs(now) == 0
    }
}

/// In-flight session runtime state. Derived fields (lap, captures) are
/// recomputed from the stamp list, never stored here.
#[derive(Debug, Clone)]
struct ActiveSession {
    id: SessionId,
    doc: SessionDoc,
    countdown: Option<Countdown>,
}

/// What startup recovery found.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Locally known sessions (active and pending-finish)
    pub local_sessions: Vec<SessionIndexEntry>,
    /// Badge counts at startup
    pub pending: PendingCounts,
    /// The user's unfinished sessions on the remote store (empty while
    /// offline or when the query fails)
    pub remote_unfinished: Vec<(String, SessionDoc)>,
}

/// Offline-first session engine: lifecycle controller, outbox owner, and
/// connectivity gate in one stateful struct.
pub struct SessionEngine<R: SessionStore> {
    local: LocalStore,
    remote: R,
    connectivity: Connectivity,
    uid: String,
    active: Option<ActiveSession>,
    recovered: bool,
}

impl<R: SessionStore> SessionEngine<R> {
    /// Build an engine for an authenticated user. Call [`recover`] once
    /// before issuing operations.
    ///
    /// [`recover`]: SessionEngine::recover
    pub fn new(local: LocalStore, remote: R, uid: impl Into<String>, online: bool) -> Self {
        let mut remote = remote;
        remote.set_network_enabled(online);
        SessionEngine {
            local,
            remote,
            connectivity: Connectivity::new(online),
            uid: uid.into(),
            active: None,
            recovered: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn active_session_id(&self) -> Option<&SessionId> {
        self.active.as_ref().map(|a| &a.id)
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    /// Tear the engine down into its stores, discarding in-flight state.
    /// Lets a caller rebuild the engine over the same backing stores,
    /// the way a page reload would.
    pub fn into_parts(self) -> (LocalStore, R) {
        (self.local, self.remote)
    }

    // ========================================================================
    // Startup recovery
    // ========================================================================

    /// Load the index, outbox, and processed set, and reconcile before
    /// any new operation is allowed. Run once at startup; operations
    /// issued earlier are rejected, which closes the race between
    /// recovery and the first user action.
    pub fn recover(&mut self) -> RecoveryReport {
        let local_sessions = self.local.index_entries();
        let pending = self.pending_counts();

        let remote_unfinished = if self.connectivity.is_online() {
            match self.remote.unfinished_sessions(&self.uid) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("[session] unfinished-session query failed: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        info!(
            "[session] recovered: {} local sessions, {} queued ops",
            local_sessions.len(),
            pending.queued_ops
        );
        self.recovered = true;
        RecoveryReport {
            local_sessions,
            pending,
            remote_unfinished,
        }
    }

    fn guard_recovered(&self) -> Option<Outcome> {
        if self.recovered {
            None
        } else {
            Some(Outcome::failed("startup recovery has not run yet"))
        }
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Start a session from a plan. Online, the session is created
    /// directly on the remote store; offline (or when the direct create
    /// throws) it gets a local placeholder id and a queued `create`.
    pub fn start(&mut self, plan: &Plan, title: &str, timezone: &str) -> Outcome {
        self.start_at(plan, title, timezone, Utc::now())
    }

    pub(crate) fn start_at(
        &mut self,
        plan: &Plan,
        title: &str,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        if self.active.is_some() {
            return Outcome::failed("a session is already running");
        }
        if title.trim().is_empty() {
            return Outcome::failed("session title is required");
        }
        if let Err(e) = plan.validate() {
            return Outcome::failed(e.to_string());
        }

        let mut doc = SessionDoc {
            uid: self.uid.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            plan_snapshot: Some(plan.clone()),
            session_title: title.trim().to_string(),
            timezone: timezone.to_string(),
            started_at: now,
            ended_at: None,
            timestamps: Vec::new(),
            started_offline: false,
            is_merged: false,
            created_at: now,
        };

        if self.connectivity.is_online() {
            match self.remote.create_session(&doc) {
                Ok(remote_id) => {
                    let id = SessionId::Remote(remote_id);
                    if let Err(e) = self.local.put_stamps(&id, &[]) {
                        warn!("[session] failed to seed stamp cache: {}", e);
                    }
                    info!("[session] started '{}' online as {}", doc.session_title, id);
                    self.active = Some(ActiveSession {
                        id,
                        doc,
                        countdown: None,
                    });
                    return Outcome::ok("session started");
                }
                Err(e) => {
                    // The write did not durably land; treat exactly like
                    // offline for this session, end to end.
                    warn!("[session] direct create failed, queueing instead: {}", e);
                }
            }
        }

        doc.started_offline = true;
        let id = next_local_session_id(now);
        match self.start_offline(&id, &doc, now) {
            Ok(()) => {
                info!(
                    "[session] started '{}' offline as {}",
                    doc.session_title, id
                );
                self.active = Some(ActiveSession {
                    id,
                    doc,
                    countdown: None,
                });
                Outcome::ok("session started offline; it will sync when connectivity returns")
            }
            Err(e) => Outcome::failed(format!("could not start session: {}", e)),
        }
    }

    fn start_offline(&mut self, id: &SessionId, doc: &SessionDoc, now: DateTime<Utc>) -> Result<()> {
        let entry = SessionIndexEntry::from_doc(id.clone(), doc, SessionStatus::Active);
        self.local.upsert_index_entry(&entry)?;
        self.local.put_stamps(id, &[])?;
        // At most one queued create per local session, even if start races.
        if !self.local.has_queued_create(id) {
            let op = OutboxOp::new(id.clone(), OpKind::Create { doc: doc.clone() }, now);
            self.local.enqueue(&op)?;
        }
        Ok(())
    }

    /// Capture a ZUPT point in the open lap.
    pub fn capture(&mut self, point: &ZuptPoint) -> Outcome {
        self.capture_at(point, Utc::now())
    }

    pub(crate) fn capture_at(&mut self, point: &ZuptPoint, now: DateTime<Utc>) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        self.expire_countdown(now);
        let Some(active) = self.active.as_ref() else {
            return Outcome::failed("no active session");
        };

        let state = derive_loop_state(&active.doc.timestamps);
        if !state.loop_open {
            return Outcome::failed("lap not open");
        }
        // Debounce before the business-rule checks: a double tap within
        // the window is dropped silently, not reported as a violation.
        if self.is_duplicate_tap(&point.name, now) {
            return Outcome::ok("duplicate input ignored");
        }
        if state.captured.contains(&point.name) {
            return Outcome::failed(format!("{} already captured this lap", point.name));
        }
        if let Some(countdown) = &active.countdown {
            return Outcome::failed(format!(
                "countdown for {} still running",
                countdown.zupt_name
            ));
        }

        let stamp = Stamp::capture(point, now);
        let countdown = (point.wait_secs > 0).then(|| Countdown {
            zupt_name: point.name.clone(),
            started: now,
            duration_secs: point.wait_secs,
        });
        let active = self.active.as_mut().expect("checked above");
        active.doc.timestamps.push(stamp);
        active.countdown = countdown;

        match self.push_stamps(now) {
            Ok(()) => Outcome::ok(format!("captured {}", point.name)),
            Err(e) => Outcome::failed(format!("could not persist capture: {}", e)),
        }
    }

    /// Open the next lap, or close the current one. The lap index always
    /// comes from the stamp list, so this self-heals after a reload.
    pub fn toggle_lap(&mut self) -> Outcome {
        self.toggle_lap_at(Utc::now())
    }

    pub(crate) fn toggle_lap_at(&mut self, now: DateTime<Utc>) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        let Some(active) = self.active.as_ref() else {
            return Outcome::failed("no active session");
        };

        let state = derive_loop_state(&active.doc.timestamps);
        let stamp = if state.loop_open {
            Stamp::lap_stop(state.loop_index, now)
        } else {
            Stamp::lap_start(state.loop_index, now)
        };
        if self.is_duplicate_tap(&stamp.zupt_name, now) {
            return Outcome::ok("duplicate input ignored");
        }

        let message = if state.loop_open {
            format!("lap {} closed", state.loop_index)
        } else {
            format!("lap {} started", state.loop_index)
        };
        let active = self.active.as_mut().expect("checked above");
        active.doc.timestamps.push(stamp);
        active.countdown = None;

        match self.push_stamps(now) {
            Ok(()) => Outcome::ok(message),
            Err(e) => Outcome::failed(format!("could not persist lap marker: {}", e)),
        }
    }

    /// Append a free-form note stamp. Notes are excluded from capture
    /// bookkeeping.
    pub fn manual_note(&mut self, text: &str) -> Outcome {
        self.manual_note_at(text, Utc::now())
    }

    pub(crate) fn manual_note_at(&mut self, text: &str, now: DateTime<Utc>) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        let Some(active) = self.active.as_mut() else {
            return Outcome::failed("no active session");
        };
        let text = text.trim();
        if text.is_empty() {
            return Outcome::failed("note is empty");
        }

        active.doc.timestamps.push(Stamp::manual_note(text, now));
        match self.push_stamps(now) {
            Ok(()) => Outcome::ok("note added"),
            Err(e) => Outcome::failed(format!("could not persist note: {}", e)),
        }
    }

    /// Remove exactly the last stamp. Confirmation happens at the caller
    /// boundary, not here.
    pub fn undo(&mut self) -> Outcome {
        self.undo_at(Utc::now())
    }

    pub(crate) fn undo_at(&mut self, now: DateTime<Utc>) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        let Some(active) = self.active.as_mut() else {
            return Outcome::failed("no active session");
        };
        let Some(removed) = active.doc.timestamps.pop() else {
            return Outcome::failed("nothing to undo");
        };
        if active
            .countdown
            .as_ref()
            .is_some_and(|c| c.zupt_name == removed.zupt_name)
        {
            active.countdown = None;
        }

        match self.push_stamps(now) {
            Ok(()) => Outcome::ok(format!("removed '{}'", removed.zupt_name)),
            Err(e) => Outcome::failed(format!("could not persist undo: {}", e)),
        }
    }

    /// Finish the session. Terminal: the in-flight state is discarded and
    /// no further capture operations are valid.
    pub fn finish(&mut self) -> Outcome {
        self.finish_at(Utc::now())
    }

    pub(crate) fn finish_at(&mut self, now: DateTime<Utc>) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        let Some(mut active) = self.active.take() else {
            return Outcome::failed("no active session");
        };
        active.doc.ended_at = Some(now);

        // Stamps first: a reload right after this line still shows the run.
        if let Err(e) = self.local.put_stamps(&active.id, &active.doc.timestamps) {
            self.active = Some(active);
            return Outcome::failed(format!("could not persist session: {}", e));
        }

        if self.connectivity.is_online() && !active.id.is_local() {
            match self
                .remote
                .update_session(active.id.as_str(), &SessionPatch::finish(now))
            {
                Ok(()) => {
                    if let Err(e) = self.settle_finished_entry(&active.id) {
                        warn!("[session] index cleanup after finish failed: {}", e);
                    }
                    info!("[session] finished {} online", active.id);
                    return Outcome::ok("session finished");
                }
                Err(e) => {
                    warn!("[session] direct finish failed, queueing instead: {}", e);
                }
            }
        }

        match self.finish_offline(&active, now) {
            Ok(()) => {
                info!("[session] finished {} offline, queued", active.id);
                Outcome::ok("session finished; it will sync when connectivity returns")
            }
            Err(e) => Outcome::failed(format!("could not queue finish: {}", e)),
        }
    }

    fn finish_offline(&mut self, active: &ActiveSession, now: DateTime<Utc>) -> Result<()> {
        let op = OutboxOp::new(active.id.clone(), OpKind::Finish { ended_at: now }, now);
        self.local.enqueue(&op)?;
        let entry =
            SessionIndexEntry::from_doc(active.id.clone(), &active.doc, SessionStatus::FinishedPending);
        self.local.upsert_index_entry(&entry)?;
        Ok(())
    }

    /// Remove the index entry after a confirmed direct finish, unless
    /// queued ops still reference the session.
    fn settle_finished_entry(&mut self, id: &SessionId) -> Result<()> {
        if self.local.index_entry(id).is_none() {
            return Ok(());
        }
        if self.local.queued_ops_for(id) == 0 {
            self.local.remove_index_entry(id)
        } else {
            let mut entry = self.local.index_entry(id).expect("checked above");
            entry.status = SessionStatus::FinishedPending;
            self.local.upsert_index_entry(&entry)
        }
    }

    // ========================================================================
    // Resume
    // ========================================================================

    /// Resume a locally-known session from its index entry, rebuilding
    /// the document from the stamp cache and the plan cache (or, failing
    /// that, the snapshot embedded in the queued create).
    pub fn resume_local(&mut self, id: &SessionId) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        if self.active.is_some() {
            return Outcome::failed("a session is already running");
        }
        let Some(entry) = self.local.index_entry(id) else {
            return Outcome::failed("session not found locally");
        };
        if entry.status != SessionStatus::Active {
            return Outcome::failed("session is already finished and waiting to sync");
        }

        let stamps = self.local.stamps(id);
        let queued_doc = self.queued_create_doc(id);
        let plan_snapshot = self
            .local
            .get_plan(&entry.plan_id)
            .or_else(|| queued_doc.as_ref().and_then(|d| d.plan_snapshot.clone()));
        if plan_snapshot.is_none() {
            warn!(
                "[session] resuming {} without plan '{}' (cache miss, no snapshot)",
                id, entry.plan_id
            );
        }
        let timezone = queued_doc
            .as_ref()
            .map(|d| d.timezone.clone())
            .unwrap_or_else(|| "UTC".to_string());
        let created_at = queued_doc
            .as_ref()
            .map(|d| d.created_at)
            .unwrap_or(entry.started_at);

        let doc = SessionDoc {
            uid: entry.uid.clone(),
            plan_id: entry.plan_id.clone(),
            plan_name: entry.plan_name.clone(),
            plan_snapshot,
            session_title: entry.title.clone(),
            timezone,
            started_at: entry.started_at,
            ended_at: None,
            timestamps: stamps,
            started_offline: entry.started_offline,
            is_merged: false,
            created_at,
        };
        info!("[session] resumed {} from local state", id);
        self.active = Some(ActiveSession {
            id: id.clone(),
            doc,
            countdown: None,
        });
        Outcome::ok("session resumed")
    }

    /// Resume a session from a remote document already fetched by the
    /// caller. The stamp list is cached locally and the plan snapshot is
    /// backfilled from the plan cache when the document lacks one.
    pub fn resume_remote(&mut self, remote_id: &str, mut doc: SessionDoc) -> Outcome {
        if let Some(outcome) = self.guard_recovered() {
            return outcome;
        }
        if self.active.is_some() {
            return Outcome::failed("a session is already running");
        }
        if doc.ended_at.is_some() {
            return Outcome::failed("session is already finished");
        }

        let id = SessionId::Remote(remote_id.to_string());
        if let Err(e) = self.local.put_stamps(&id, &doc.timestamps) {
            warn!("[session] failed to cache stamps for {}: {}", id, e);
        }
        if doc.plan_snapshot.is_none() {
            doc.plan_snapshot = self.local.get_plan(&doc.plan_id);
        }
        info!("[session] resumed {} from remote document", id);
        self.active = Some(ActiveSession {
            id,
            doc,
            countdown: None,
        });
        Outcome::ok("session resumed")
    }

    // ========================================================================
    // Connectivity and sync
    // ========================================================================

    /// Feed in the platform online/offline signal. Coming online
    /// re-enables the remote network layer and drains the outbox; going
    /// offline suspends it so no call can hang in a retry loop.
    pub fn set_online(&mut self, online: bool) -> Outcome {
        match self.connectivity.set_online(online) {
            None => Outcome::ok("connectivity unchanged"),
            Some(Transition::WentOffline) => {
                self.remote.set_network_enabled(false);
                info!("[session] went offline; operations will be queued");
                Outcome::ok("offline; changes will be queued")
            }
            Some(Transition::CameOnline) => {
                self.remote.set_network_enabled(true);
                self.sync_now()
            }
        }
    }

    /// Drain the outbox immediately. Safe to call repeatedly; replaying
    /// over unchanged state issues no remote calls.
    pub fn sync_now(&mut self) -> Outcome {
        match flush(&mut self.local, &mut self.remote) {
            Ok(report) => {
                self.follow_migrated_id();
                self.sync_outcome(report)
            }
            Err(e) => Outcome::failed(format!("sync failed: {}", e)),
        }
    }

    fn sync_outcome(&self, report: SyncReport) -> Outcome {
        if report.synced && report.failed_groups == 0 {
            Outcome::ok(format!("synced {} change(s)", report.applied_ops))
        } else if report.synced {
            Outcome::ok(format!(
                "synced {} change(s); {} session(s) still pending",
                report.applied_ops, report.failed_groups
            ))
        } else if report.failed_groups > 0 {
            Outcome::failed("sync pending; will retry on next connection")
        } else {
            Outcome::ok("online")
        }
    }

    /// If the in-flight session's placeholder id was migrated during a
    /// flush, follow it so later direct writes target the remote id.
    fn follow_migrated_id(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.id.is_local() {
            return;
        }
        if let Some(remote_id) = self.local.mapped_remote_id(&active.id) {
            info!("[session] in-flight id migrated {} -> {}", active.id, remote_id);
            active.id = SessionId::Remote(remote_id);
        }
    }

    // ========================================================================
    // Derived views
    // ========================================================================

    /// Read-only view of the in-flight session, recomputed on demand.
    pub fn view_model(&self) -> Option<SessionView> {
        self.view_model_at(Utc::now())
    }

    pub(crate) fn view_model_at(&self, now: DateTime<Utc>) -> Option<SessionView> {
        let active = self.active.as_ref()?;
        let state = derive_loop_state(&active.doc.timestamps);
        let active_countdown = active
            .countdown
            .as_ref()
            .filter(|c| !c.expired(now))
            .map(|c| CountdownView {
                zupt_name: c.zupt_name.clone(),
                remaining_secs: c.remaining_secs(now),
            });
        Some(SessionView {
            session_id: active.id.clone(),
            loop_index: state.loop_index,
            loop_open: state.loop_open,
            captured: state.captured,
            elapsed_secs: (now - active.doc.started_at).num_seconds().max(0),
            stamps: active.doc.timestamps.clone(),
            active_countdown,
        })
    }

    /// Counts for status badges.
    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            queued_ops: self.local.queued_op_count(),
            pending_finish_sessions: self
                .local
                .index_entries()
                .iter()
                .filter(|e| e.status == SessionStatus::FinishedPending)
                .count(),
        }
    }

    /// Queue a `touch` operation: a badge signal with no payload. It is
    /// dropped unconditionally at the next flush.
    pub fn note_activity(&mut self, session_id: &SessionId) -> Outcome {
        let op = OutboxOp::new(session_id.clone(), OpKind::Touch, Utc::now());
        match self.local.enqueue(&op) {
            Ok(()) => Outcome::ok("noted"),
            Err(e) => Outcome::failed(format!("could not queue touch: {}", e)),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Payload of the queued `create` for a local session, if any. The
    /// embedded document is the authoritative copy of the plan snapshot
    /// and timezone while the session exists only locally.
    fn queued_create_doc(&self, id: &SessionId) -> Option<SessionDoc> {
        self.local.outbox().into_iter().find_map(|op| {
            if op.session_id == *id {
                if let OpKind::Create { doc } = op.kind {
                    return Some(doc);
                }
            }
            None
        })
    }

    fn expire_countdown(&mut self, now: DateTime<Utc>) {
        if let Some(active) = self.active.as_mut() {
            if active.countdown.as_ref().is_some_and(|c| c.expired(now)) {
                active.countdown = None;
            }
        }
    }

    /// True when the previous stamp of the same name is within the
    /// debounce window of `now`.
    fn is_duplicate_tap(&self, name: &str, now: DateTime<Utc>) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        active
            .doc
            .timestamps
            .iter()
            .rev()
            .find(|s| s.zupt_name == name)
            .is_some_and(|s| (now - s.time).num_milliseconds() < DEBOUNCE_MS)
    }

    /// Persist the in-flight stamp list locally, then write it remotely
    /// (online, remote id) or queue an update (everything else).
    fn push_stamps(&mut self, now: DateTime<Utc>) -> Result<()> {
        let (id, timestamps) = {
            let active = self.active.as_ref().ok_or(SyncError::NoActiveSession)?;
            (active.id.clone(), active.doc.timestamps.clone())
        };
        self.local.put_stamps(&id, &timestamps)?;

        if self.connectivity.is_online() && !id.is_local() {
            match self
                .remote
                .update_session(id.as_str(), &SessionPatch::timestamps(timestamps.clone()))
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // One transient flake must not lose the mutation.
                    warn!("[session] direct update failed, queueing instead: {}", e);
                }
            }
        }

        let op = OutboxOp::new(id, OpKind::Update { timestamps }, now);
        self.local.enqueue(&op)?;
        Ok(())
    }
}

// ============================================================================
// Session merge
// ============================================================================

/// Merge sessions recorded against the same plan into one document:
/// stamps concatenated and re-sorted ascending by time, earliest start
/// wins, end time is the latest `endedAt` — or `now` when none of the
/// inputs has finished, which silently finalizes a still-open session.
pub fn merge_sessions(sessions: &[SessionDoc], now: DateTime<Utc>) -> Result<SessionDoc> {
    let Some(first) = sessions.first() else {
        return Err(SyncError::Validation("nothing to merge".to_string()));
    };

    let mut timestamps: Vec<Stamp> = sessions
        .iter()
        .flat_map(|s| s.timestamps.iter().cloned())
        .collect();
    timestamps.sort_by_key(|s| s.time);

    let started_at = sessions
        .iter()
        .map(|s| s.started_at)
        .min()
        .unwrap_or(first.started_at);
    let ended_at = sessions
        .iter()
        .filter_map(|s| s.ended_at)
        .max()
        .unwrap_or(now);

    Ok(SessionDoc {
        uid: first.uid.clone(),
        plan_id: first.plan_id.clone(),
        plan_name: first.plan_name.clone(),
        plan_snapshot: first.plan_snapshot.clone(),
        session_title: format!("{} (merged)", first.session_title),
        timezone: first.timezone.clone(),
        started_at,
        ended_at: Some(ended_at),
        timestamps,
        started_offline: sessions.iter().any(|s| s.started_offline),
        is_merged: true,
        created_at: now,
    })
}
