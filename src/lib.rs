//! # Zuptsync
//!
//! Offline-first synchronization engine for GPS/ZUPT survey
//! timestamping sessions.
//!
//! A survey run ("session") is a sequence of timed captures against a
//! plan of ZUPT points. This crate lets a session be started, mutated,
//! and finished without connectivity: every mutation lands in a local
//! SQLite store first, queued remote operations are coalesced per
//! session, and the outbox is drained exactly once when connectivity
//! returns — without duplicating or losing sessions or stamps.
//!
//! ## Quick start
//!
//! ```rust
//! use zuptsync::{LocalStore, MemorySessionStore, SessionEngine};
//!
//! let local = LocalStore::in_memory().unwrap();
//! let mut engine = SessionEngine::new(local, MemorySessionStore::new(), "user-1", false);
//! engine.recover();
//!
//! let plan = zuptsync::Plan {
//!     id: "p1".into(),
//!     name: "Harbor survey".into(),
//!     anchors: Default::default(),
//!     zupts: vec![],
//! };
//! let outcome = engine.start(&plan, "Morning run", "Europe/Oslo");
//! assert!(outcome.ok);
//!
//! // Offline: the create is queued and drains on reconnect.
//! assert_eq!(engine.pending_counts().queued_ops, 1);
//! assert!(engine.set_online(true).ok);
//! assert_eq!(engine.pending_counts().queued_ops, 0);
//! ```

// Unified error handling
pub mod error;
pub use error::{Outcome, RemoteError, Result, SyncError};

// Domain data model
pub mod types;
pub use types::{
    AnchorKey, CountdownView, OpKind, OutboxOp, PendingCounts, Plan, SessionDoc, SessionId,
    SessionIndexEntry, SessionPatch, SessionStatus, SessionView, Stamp, ZuptPoint,
};

// Pure loop/capture state derivation
pub mod loopstate;
pub use loopstate::{LoopState, derive_loop_state};

// Local durable store (SQLite)
pub mod store;
pub use store::LocalStore;

// Remote document store seam
pub mod remote;
pub use remote::{MemorySessionStore, SessionStore};

// HTTP-backed remote store
pub mod http;
pub use http::HttpSessionStore;

// Outbox synchronization
pub mod sync;
pub use sync::{OpGroup, SyncReport, coalesce, flush};

// Connectivity tracking
pub mod connectivity;
pub use connectivity::{Connectivity, NetworkState, Transition};

// Session lifecycle control
pub mod session;
pub use session::{RecoveryReport, SessionEngine, merge_sessions};
