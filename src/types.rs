//! Domain types for plans, sessions, stamps, and queued operations.
//!
//! These are the document shapes shared between the local durable store,
//! the outbox, and the remote document store. Everything here serializes
//! with camelCase field names so the JSON matches the remote collection
//! layout byte-for-byte.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SyncError;

/// Prefix carried by manual-note stamps. Notes are excluded from lap
/// capture bookkeeping.
pub const MANUAL_NOTE_PREFIX: &str = "Note: ";

/// Prefix of locally-generated placeholder session ids.
pub const LOCAL_ID_PREFIX: &str = "local-";

// ============================================================================
// Plans
// ============================================================================

/// Anchor parameter slots. The set is fixed; a plan stores one number per
/// slot it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AnchorKey {
    A1,
    A2,
    A3,
    B1,
    B2,
    B3,
}

impl AnchorKey {
    /// All slots in canonical order.
    pub const ALL: [AnchorKey; 6] = [
        AnchorKey::A1,
        AnchorKey::A2,
        AnchorKey::A3,
        AnchorKey::B1,
        AnchorKey::B2,
        AnchorKey::B3,
    ];
}

impl fmt::Display for AnchorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorKey::A1 => "A1",
            AnchorKey::A2 => "A2",
            AnchorKey::A3 => "A3",
            AnchorKey::B1 => "B1",
            AnchorKey::B2 => "B2",
            AnchorKey::B3 => "B3",
        };
        f.write_str(s)
    }
}

/// A named, geolocated capture point with a settle/wait duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZuptPoint {
    pub id: String,
    /// Unique within the plan, no whitespace
    pub name: String,
    /// Latitude in degrees, [-90, 90]
    pub lat: f64,
    /// Longitude in degrees, [-180, 180]
    pub lon: f64,
    /// Ellipsoidal height in meters
    pub height: f64,
    /// Settle duration in seconds before the point counts as captured
    #[serde(rename = "wait")]
    pub wait_secs: u32,
}

/// Reusable definition of capture points and anchor parameters for a
/// survey route. Immutable once a session snapshots it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub anchors: BTreeMap<AnchorKey, f64>,
    pub zupts: Vec<ZuptPoint>,
}

impl Plan {
    /// Validate field constraints: non-empty whitespace-free ZUPT names,
    /// unique within the plan, coordinates in range.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Validation("plan name is empty".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for zupt in &self.zupts {
            if zupt.name.is_empty() || zupt.name.chars().any(char::is_whitespace) {
                return Err(SyncError::Validation(format!(
                    "ZUPT name '{}' must be non-empty and contain no whitespace",
                    zupt.name
                )));
            }
            if !seen.insert(zupt.name.as_str()) {
                return Err(SyncError::Validation(format!(
                    "ZUPT name '{}' is duplicated within the plan",
                    zupt.name
                )));
            }
            if !(-90.0..=90.0).contains(&zupt.lat) {
                return Err(SyncError::Validation(format!(
                    "ZUPT '{}' latitude {} out of range [-90, 90]",
                    zupt.name, zupt.lat
                )));
            }
            if !(-180.0..=180.0).contains(&zupt.lon) {
                return Err(SyncError::Validation(format!(
                    "ZUPT '{}' longitude {} out of range [-180, 180]",
                    zupt.name, zupt.lon
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Stamps
// ============================================================================

/// One timed entry in a session: a ZUPT capture, a lap marker, or a
/// manual note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamp {
    /// ZUPT id for captures; None for lap markers and manual notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zupt_id: Option<String>,
    /// Display name: the ZUPT name, "L<N> Start"/"L<N> Stop", or a
    /// "Note: "-prefixed manual note
    pub zupt_name: String,
    /// Capture instant
    pub time: DateTime<Utc>,
    /// Settle duration in seconds (0 for markers and notes)
    #[serde(rename = "duration")]
    pub duration_secs: u32,
}

impl Stamp {
    pub fn capture(point: &ZuptPoint, time: DateTime<Utc>) -> Self {
        Stamp {
            zupt_id: Some(point.id.clone()),
            zupt_name: point.name.clone(),
            time,
            duration_secs: point.wait_secs,
        }
    }

    pub fn lap_start(lap: u32, time: DateTime<Utc>) -> Self {
        Stamp {
            zupt_id: None,
            zupt_name: format!("L{} Start", lap),
            time,
            duration_secs: 0,
        }
    }

    pub fn lap_stop(lap: u32, time: DateTime<Utc>) -> Self {
        Stamp {
            zupt_id: None,
            zupt_name: format!("L{} Stop", lap),
            time,
            duration_secs: 0,
        }
    }

    pub fn manual_note(text: &str, time: DateTime<Utc>) -> Self {
        Stamp {
            zupt_id: None,
            zupt_name: format!("{}{}", MANUAL_NOTE_PREFIX, text),
            time,
            duration_secs: 0,
        }
    }

    pub fn is_manual_note(&self) -> bool {
        self.zupt_name.starts_with(MANUAL_NOTE_PREFIX)
    }
}

// ============================================================================
// Session Ids
// ============================================================================

/// A session identifier: either issued by the remote store, or a local
/// placeholder allocated while the session's creation is queued.
///
/// The wire form is a plain string; the `local-` prefix is the
/// discriminator. Keeping the two apart at the type level means call
/// sites cannot pass a placeholder where a remote id is required — the
/// only Local→Remote conversion lives in the outbox synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionId {
    Local(String),
    Remote(String),
}

impl SessionId {
    /// Reconstruct from a persisted token.
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.starts_with(LOCAL_ID_PREFIX) {
            SessionId::Local(token)
        } else {
            SessionId::Remote(token)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SessionId::Local(t) | SessionId::Remote(t) => t,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SessionId::Local(_))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Ok(SessionId::from_token(token))
    }
}

static ID_COUNTER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

/// Allocate a fresh local placeholder session id.
pub fn next_local_session_id(now: DateTime<Utc>) -> SessionId {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    SessionId::Local(format!("{}{}-{}", LOCAL_ID_PREFIX, now.timestamp_millis(), n))
}

/// Allocate a globally unique client-side operation id.
pub fn next_op_id(now: DateTime<Utc>) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("op-{}-{}", now.timestamp_millis(), n)
}

// ============================================================================
// Sessions
// ============================================================================

/// One timed execution of a plan: the session document as stored in the
/// remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDoc {
    /// Owning user id
    pub uid: String,
    pub plan_id: String,
    pub plan_name: String,
    /// Immutable copy of the plan taken at start time, so offline runs
    /// retain ZUPT definitions even if the plan cache is unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_snapshot: Option<Plan>,
    pub session_title: String,
    /// IANA timezone name the run was recorded in
    pub timezone: String,
    pub started_at: DateTime<Utc>,
    /// None while the session is still running
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamps: Vec<Stamp>,
    /// True when the session was started without connectivity (or the
    /// direct create failed and was queued instead)
    #[serde(default)]
    pub started_offline: bool,
    /// True when this document is the result of merging sessions
    #[serde(default)]
    pub is_merged: bool,
    pub created_at: DateTime<Utc>,
}

/// Partial field merge applied by a remote update. Unset fields are left
/// untouched on the stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Vec<Stamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_merged: Option<bool>,
}

impl SessionPatch {
    pub fn timestamps(timestamps: Vec<Stamp>) -> Self {
        SessionPatch {
            timestamps: Some(timestamps),
            ..SessionPatch::default()
        }
    }

    pub fn finish(ended_at: DateTime<Utc>) -> Self {
        SessionPatch {
            ended_at: Some(ended_at),
            ..SessionPatch::default()
        }
    }
}

// ============================================================================
// Session Index
// ============================================================================

/// Local lifecycle state of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "finished-pending")]
    FinishedPending,
}

/// One entry per locally known session, active or pending-finish.
/// Removed once every queued operation for the session has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub id: SessionId,
    pub uid: String,
    pub title: String,
    pub plan_id: String,
    pub plan_name: String,
    pub started_at: DateTime<Utc>,
    pub started_offline: bool,
    pub status: SessionStatus,
}

impl SessionIndexEntry {
    pub fn from_doc(id: SessionId, doc: &SessionDoc, status: SessionStatus) -> Self {
        SessionIndexEntry {
            id,
            uid: doc.uid.clone(),
            title: doc.session_title.clone(),
            plan_id: doc.plan_id.clone(),
            plan_name: doc.plan_name.clone(),
            started_at: doc.started_at,
            started_offline: doc.started_offline,
            status,
        }
    }
}

// ============================================================================
// Outbox Operations
// ============================================================================

/// Payload of a queued remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum OpKind {
    /// Create the session remotely; the payload is the full document
    Create { doc: SessionDoc },
    /// Replace the stored stamp list with the full updated list
    Update { timestamps: Vec<Stamp> },
    /// Set the end instant; terminal
    Finish { ended_at: DateTime<Utc> },
    /// Badge signal only; carries no payload and is never replayed
    Touch,
}

/// A durable queued remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxOp {
    /// Globally unique, generated client-side; the replay guard
    pub op_id: String,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: OpKind,
}

impl OutboxOp {
    pub fn new(session_id: SessionId, kind: OpKind, now: DateTime<Utc>) -> Self {
        OutboxOp {
            op_id: next_op_id(now),
            session_id,
            kind,
        }
    }

    pub fn is_touch(&self) -> bool {
        matches!(self.kind, OpKind::Touch)
    }
}

// ============================================================================
// View Model
// ============================================================================

/// Remaining settle countdown for the most recent capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownView {
    pub zupt_name: String,
    pub remaining_secs: u32,
}

/// Read-only derived view of the in-flight session, recomputed after
/// every mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub loop_index: u32,
    pub loop_open: bool,
    pub captured: std::collections::BTreeSet<String>,
    pub elapsed_secs: i64,
    pub stamps: Vec<Stamp>,
    pub active_countdown: Option<CountdownView>,
}

/// Counts for status badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCounts {
    /// Queued outbox operations (touch included)
    pub queued_ops: usize,
    /// Index entries waiting for a finish to synchronize
    pub pending_finish_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn zupt(name: &str) -> ZuptPoint {
        ZuptPoint {
            id: format!("z-{}", name),
            name: name.to_string(),
            lat: 59.5,
            lon: 10.2,
            height: 120.0,
            wait_secs: 5,
        }
    }

    #[test]
    fn test_plan_validation() {
        let mut plan = Plan {
            id: "p1".to_string(),
            name: "Harbor survey".to_string(),
            anchors: BTreeMap::new(),
            zupts: vec![zupt("Z1"), zupt("Z2")],
        };
        assert!(plan.validate().is_ok());

        plan.zupts.push(zupt("Z1"));
        assert!(plan.validate().is_err(), "duplicate name must be rejected");

        plan.zupts.pop();
        plan.zupts[0].name = "Z 1".to_string();
        assert!(plan.validate().is_err(), "whitespace in name must be rejected");

        plan.zupts[0].name = "Z1".to_string();
        plan.zupts[0].lat = 91.0;
        assert!(plan.validate().is_err(), "latitude out of range");
    }

    #[test]
    fn test_session_id_round_trip() {
        let local = SessionId::from_token("local-1700000000000-7");
        assert!(local.is_local());
        let remote = SessionId::from_token("aF3kQ9x");
        assert!(!remote.is_local());

        let json = serde_json::to_string(&local).unwrap();
        assert_eq!(json, "\"local-1700000000000-7\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, local);
    }

    #[test]
    fn test_local_ids_unique() {
        let now = Utc::now();
        let a = next_local_session_id(now);
        let b = next_local_session_id(now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_outbox_op_serialization() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let op = OutboxOp {
            op_id: "op-1".to_string(),
            session_id: SessionId::from_token("local-1-1"),
            kind: OpKind::Update {
                timestamps: vec![Stamp::lap_start(1, now)],
            },
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"update\""));
        let back: OutboxOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);

        // Variant fields follow the camelCase wire convention too.
        let finish = OutboxOp {
            op_id: "op-2".to_string(),
            session_id: SessionId::from_token("local-1-1"),
            kind: OpKind::Finish { ended_at: now },
        };
        let json = serde_json::to_string(&finish).unwrap();
        assert!(json.contains("\"endedAt\""));
        assert!(!json.contains("\"ended_at\""));
    }

    #[test]
    fn test_manual_note_prefix() {
        let now = Utc::now();
        let note = Stamp::manual_note("windy at Z3", now);
        assert!(note.is_manual_note());
        assert_eq!(note.zupt_name, "Note: windy at Z3");
        assert!(!Stamp::lap_start(1, now).is_manual_note());
    }
}
