//! Local durable store.
//!
//! SQLite-backed persistence for the plan cache, the session index,
//! per-session stamp lists, the outbox, the processed-operation set, and
//! the local→remote id mapping. Documents are stored as JSON blobs in
//! TEXT columns.
//!
//! This storage is a best-effort cache, not a source of truth for
//! anything already confirmed remote: every read tolerates missing or
//! corrupt rows by logging a warning and returning an empty default.
//! Writes, by contrast, propagate errors — a stamp the user has already
//! seen must not be silently dropped.

use log::warn;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::types::{OutboxOp, Plan, SessionId, SessionIndexEntry, Stamp};

/// Key-namespaced persistence for the sync engine's local state.
pub struct LocalStore {
    db: Connection,
}

impl LocalStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Connection::open(path)?;
        Self::init_schema(&db)?;
        Ok(LocalStore { db })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- Cached plan definitions
            CREATE TABLE IF NOT EXISTS plan_cache (
                id TEXT PRIMARY KEY,
                doc_json TEXT NOT NULL
            );

            -- One entry per locally known session (active or pending-finish)
            CREATE TABLE IF NOT EXISTS session_index (
                session_id TEXT PRIMARY KEY,
                entry_json TEXT NOT NULL
            );

            -- Full stamp list per session, stored as a JSON array
            CREATE TABLE IF NOT EXISTS session_stamps (
                session_id TEXT PRIMARY KEY,
                stamps_json TEXT NOT NULL
            );

            -- Queued remote operations, in enqueue order
            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                op_json TEXT NOT NULL
            );

            -- Operation ids already applied remotely (the replay guard)
            CREATE TABLE IF NOT EXISTS processed_ops (
                op_id TEXT PRIMARY KEY
            );

            -- Local placeholder id -> remote id, written at migration time
            CREATE TABLE IF NOT EXISTS id_map (
                local_id TEXT PRIMARY KEY,
                remote_id TEXT NOT NULL
            );
            "#,
        )
    }

    // ========================================================================
    // Plan cache
    // ========================================================================

    pub fn put_plan(&mut self, plan: &Plan) -> Result<()> {
        let json = serde_json::to_string(plan)?;
        self.db.execute(
            "INSERT INTO plan_cache (id, doc_json) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET doc_json = excluded.doc_json",
            params![plan.id, json],
        )?;
        Ok(())
    }

    pub fn get_plan(&self, id: &str) -> Option<Plan> {
        self.read_json_row(
            "SELECT doc_json FROM plan_cache WHERE id = ?1",
            id,
            "plan_cache",
        )
    }

    pub fn delete_plan(&mut self, id: &str) -> Result<()> {
        self.db
            .execute("DELETE FROM plan_cache WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn plans(&self) -> Vec<Plan> {
        self.read_json_table("SELECT doc_json FROM plan_cache", "plan_cache")
    }

    // ========================================================================
    // Session index
    // ========================================================================

    pub fn upsert_index_entry(&mut self, entry: &SessionIndexEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        self.db.execute(
            "INSERT INTO session_index (session_id, entry_json) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET entry_json = excluded.entry_json",
            params![entry.id.as_str(), json],
        )?;
        Ok(())
    }

    pub fn index_entry(&self, id: &SessionId) -> Option<SessionIndexEntry> {
        self.read_json_row(
            "SELECT entry_json FROM session_index WHERE session_id = ?1",
            id.as_str(),
            "session_index",
        )
    }

    pub fn index_entries(&self) -> Vec<SessionIndexEntry> {
        self.read_json_table("SELECT entry_json FROM session_index", "session_index")
    }

    pub fn remove_index_entry(&mut self, id: &SessionId) -> Result<()> {
        self.db.execute(
            "DELETE FROM session_index WHERE session_id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Per-session stamps
    // ========================================================================

    pub fn put_stamps(&mut self, id: &SessionId, stamps: &[Stamp]) -> Result<()> {
        let json = serde_json::to_string(stamps)?;
        self.db.execute(
            "INSERT INTO session_stamps (session_id, stamps_json) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET stamps_json = excluded.stamps_json",
            params![id.as_str(), json],
        )?;
        Ok(())
    }

    pub fn stamps(&self, id: &SessionId) -> Vec<Stamp> {
        self.read_json_row(
            "SELECT stamps_json FROM session_stamps WHERE session_id = ?1",
            id.as_str(),
            "session_stamps",
        )
        .unwrap_or_default()
    }

    pub fn remove_stamps(&mut self, id: &SessionId) -> Result<()> {
        self.db.execute(
            "DELETE FROM session_stamps WHERE session_id = ?1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Id migration
    // ========================================================================

    /// Move every key from a local placeholder id to its remote-issued
    /// id: the index entry, the stamp cache, and the id mapping. After
    /// this call nothing remains keyed under the placeholder.
    pub fn migrate_session_id(&mut self, local: &SessionId, remote: &SessionId) -> Result<()> {
        let tx = self.db.transaction()?;

        if let Some(entry_json) = tx
            .query_row(
                "SELECT entry_json FROM session_index WHERE session_id = ?1",
                params![local.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            let mut entry: SessionIndexEntry = serde_json::from_str(&entry_json)?;
            entry.id = remote.clone();
            let updated = serde_json::to_string(&entry)?;
            tx.execute(
                "DELETE FROM session_index WHERE session_id = ?1",
                params![local.as_str()],
            )?;
            tx.execute(
                "INSERT INTO session_index (session_id, entry_json) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET entry_json = excluded.entry_json",
                params![remote.as_str(), updated],
            )?;
        }

        if let Some(stamps_json) = tx
            .query_row(
                "SELECT stamps_json FROM session_stamps WHERE session_id = ?1",
                params![local.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            tx.execute(
                "DELETE FROM session_stamps WHERE session_id = ?1",
                params![local.as_str()],
            )?;
            tx.execute(
                "INSERT INTO session_stamps (session_id, stamps_json) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET stamps_json = excluded.stamps_json",
                params![remote.as_str(), stamps_json],
            )?;
        }

        tx.execute(
            "INSERT INTO id_map (local_id, remote_id) VALUES (?1, ?2)
             ON CONFLICT(local_id) DO UPDATE SET remote_id = excluded.remote_id",
            params![local.as_str(), remote.as_str()],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Remote id previously recorded for a local placeholder, if the
    /// placeholder's create already landed in an earlier flush.
    pub fn mapped_remote_id(&self, local: &SessionId) -> Option<String> {
        match self
            .db
            .query_row(
                "SELECT remote_id FROM id_map WHERE local_id = ?1",
                params![local.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
        {
            Ok(row) => row,
            Err(e) => {
                warn!("[store] failed to read id_map: {}", e);
                None
            }
        }
    }

    // ========================================================================
    // Outbox
    // ========================================================================

    pub fn enqueue(&mut self, op: &OutboxOp) -> Result<()> {
        let json = serde_json::to_string(op)?;
        self.db.execute(
            "INSERT INTO outbox (op_id, op_json) VALUES (?1, ?2)",
            params![op.op_id, json],
        )?;
        Ok(())
    }

    /// All queued operations in enqueue order.
    pub fn outbox(&self) -> Vec<OutboxOp> {
        self.read_json_table("SELECT op_json FROM outbox ORDER BY seq", "outbox")
    }

    /// Replace the whole outbox with the given operations, preserving
    /// their order. Used by the synchronizer to drop applied and touch
    /// entries while keeping failed groups verbatim.
    pub fn replace_outbox(&mut self, ops: &[OutboxOp]) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM outbox", [])?;
        for op in ops {
            let json = serde_json::to_string(op)?;
            tx.execute(
                "INSERT INTO outbox (op_id, op_json) VALUES (?1, ?2)",
                params![op.op_id, json],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn queued_op_count(&self) -> usize {
        match self
            .db
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get::<_, i64>(0))
        {
            Ok(n) => n as usize,
            Err(e) => {
                warn!("[store] failed to count outbox: {}", e);
                0
            }
        }
    }

    /// Number of queued operations for one session.
    pub fn queued_ops_for(&self, id: &SessionId) -> usize {
        self.outbox()
            .iter()
            .filter(|op| op.session_id == *id)
            .count()
    }

    /// True if a `create` operation is already queued for the session.
    /// Guards against a racing `start` enqueueing a second create.
    pub fn has_queued_create(&self, id: &SessionId) -> bool {
        self.outbox().iter().any(|op| {
            op.session_id == *id && matches!(op.kind, crate::types::OpKind::Create { .. })
        })
    }

    // ========================================================================
    // Processed-operation set
    // ========================================================================

    pub fn mark_processed(&mut self, op_id: &str) -> Result<()> {
        self.db.execute(
            "INSERT OR IGNORE INTO processed_ops (op_id) VALUES (?1)",
            params![op_id],
        )?;
        Ok(())
    }

    pub fn is_processed(&self, op_id: &str) -> bool {
        match self
            .db
            .query_row(
                "SELECT 1 FROM processed_ops WHERE op_id = ?1",
                params![op_id],
                |_| Ok(()),
            )
            .optional()
        {
            Ok(row) => row.is_some(),
            Err(e) => {
                warn!("[store] failed to read processed_ops: {}", e);
                false
            }
        }
    }

    // ========================================================================
    // Tolerant read helpers
    // ========================================================================

    fn read_json_row<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        key: &str,
        table: &str,
    ) -> Option<T> {
        let json = match self
            .db
            .query_row(query, params![key], |row| row.get::<_, String>(0))
            .optional()
        {
            Ok(row) => row?,
            Err(e) => {
                warn!("[store] failed to read {}: {}", table, e);
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[store] corrupt {} entry '{}', ignoring: {}", table, key, e);
                None
            }
        }
    }

    fn read_json_table<T: serde::de::DeserializeOwned>(&self, query: &str, table: &str) -> Vec<T> {
        let mut stmt = match self.db.prepare(query) {
            Ok(s) => s,
            Err(e) => {
                warn!("[store] failed to prepare {} query: {}", table, e);
                return Vec::new();
            }
        };
        let rows = stmt.query_map([], |row| row.get::<_, String>(0));
        match rows {
            Ok(iter) => iter
                .filter_map(|r| r.ok())
                .filter_map(|json| match serde_json::from_str(&json) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("[store] corrupt {} entry, ignoring: {}", table, e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("[store] failed to read {}: {}", table, e);
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn corrupt_row(&mut self, table: &str, key: &str) {
        let sql = match table {
            "session_stamps" => {
                "UPDATE session_stamps SET stamps_json = 'not json' WHERE session_id = ?1"
            }
            "session_index" => {
                "UPDATE session_index SET entry_json = '{broken' WHERE session_id = ?1"
            }
            _ => panic!("unknown table {}", table),
        };
        self.db.execute(sql, params![key]).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OpKind, SessionStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        Plan {
            id: "p1".to_string(),
            name: "Harbor survey".to_string(),
            anchors: BTreeMap::new(),
            zupts: Vec::new(),
        }
    }

    fn entry(id: &SessionId) -> SessionIndexEntry {
        SessionIndexEntry {
            id: id.clone(),
            uid: "u1".to_string(),
            title: "T1".to_string(),
            plan_id: "p1".to_string(),
            plan_name: "Harbor survey".to_string(),
            started_at: Utc::now(),
            started_offline: true,
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn test_plan_cache_round_trip() {
        let mut store = LocalStore::in_memory().unwrap();
        assert!(store.get_plan("p1").is_none());
        store.put_plan(&plan()).unwrap();
        assert_eq!(store.get_plan("p1").unwrap().name, "Harbor survey");
        assert_eq!(store.plans().len(), 1);
        store.delete_plan("p1").unwrap();
        assert!(store.get_plan("p1").is_none());
    }

    #[test]
    fn test_index_and_stamps_migration() {
        let mut store = LocalStore::in_memory().unwrap();
        let local = SessionId::from_token("local-1-1");
        let remote = SessionId::from_token("remote-9");

        store.upsert_index_entry(&entry(&local)).unwrap();
        let stamps = vec![Stamp::lap_start(1, Utc::now())];
        store.put_stamps(&local, &stamps).unwrap();

        store.migrate_session_id(&local, &remote).unwrap();

        // Never duplicated under both ids.
        assert!(store.index_entry(&local).is_none());
        assert!(store.stamps(&local).is_empty());
        let migrated = store.index_entry(&remote).unwrap();
        assert_eq!(migrated.id, remote);
        assert_eq!(store.stamps(&remote), stamps);
        assert_eq!(store.mapped_remote_id(&local).as_deref(), Some("remote-9"));
    }

    #[test]
    fn test_outbox_order_and_replace() {
        let mut store = LocalStore::in_memory().unwrap();
        let id = SessionId::from_token("local-1-1");
        let now = Utc::now();
        let a = OutboxOp::new(id.clone(), OpKind::Touch, now);
        let b = OutboxOp::new(id.clone(), OpKind::Touch, now);
        store.enqueue(&a).unwrap();
        store.enqueue(&b).unwrap();

        let ops = store.outbox();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op_id, a.op_id);
        assert_eq!(ops[1].op_id, b.op_id);

        store.replace_outbox(&[b.clone()]).unwrap();
        let ops = store.outbox();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_id, b.op_id);
        assert_eq!(store.queued_op_count(), 1);
    }

    #[test]
    fn test_has_queued_create_guard() {
        let mut store = LocalStore::in_memory().unwrap();
        let id = SessionId::from_token("local-1-1");
        assert!(!store.has_queued_create(&id));
        let doc = crate::session::tests_support::doc("u1", "T1");
        let op = OutboxOp::new(id.clone(), OpKind::Create { doc }, Utc::now());
        store.enqueue(&op).unwrap();
        assert!(store.has_queued_create(&id));
    }

    #[test]
    fn test_processed_set() {
        let mut store = LocalStore::in_memory().unwrap();
        assert!(!store.is_processed("op-1"));
        store.mark_processed("op-1").unwrap();
        assert!(store.is_processed("op-1"));
        // Idempotent re-insert
        store.mark_processed("op-1").unwrap();
        assert!(store.is_processed("op-1"));
    }

    #[test]
    fn test_corrupt_rows_read_as_defaults() {
        let mut store = LocalStore::in_memory().unwrap();
        let id = SessionId::from_token("local-1-1");
        store.upsert_index_entry(&entry(&id)).unwrap();
        store
            .put_stamps(&id, &[Stamp::lap_start(1, Utc::now())])
            .unwrap();

        store.corrupt_row("session_stamps", id.as_str());
        store.corrupt_row("session_index", id.as_str());

        assert!(store.stamps(&id).is_empty());
        assert!(store.index_entry(&id).is_none());
        assert!(store.index_entries().is_empty());
    }
}
