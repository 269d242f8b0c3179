//! Session directory backed by a TTL'd key-value store.
//!
//! The directory records which container serves which `(user, session)`
//! pair plus the reverse binding used by the reaper, and hosts the
//! fixed-window rate counters for the HTTP layer. It stores soft state
//! only; container labels remain the source of truth for cleanup.

mod memory;

pub use memory::MemoryKv;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Identity of a session: both parts are opaque, non-empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

/// Value stored under a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Engine id of the bound container.
    pub container_id: String,
    /// Named workspace volume, present only in persistence mode.
    pub volume_name: Option<String>,
    /// When the binding was first written.
    pub created_at: DateTime<Utc>,
    /// Bumped on every TTL refresh; the reaper consults this.
    pub last_used_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(container_id: impl Into<String>, volume_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            container_id: container_id.into(),
            volume_name,
            created_at: now,
            last_used_at: now,
        }
    }
}

/// Errors from the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The store is unreachable or rejected the operation.
    #[error("key-value store unavailable: {message}")]
    Unavailable { message: String },
}

/// Typed interface over the TTL'd key-value store.
///
/// `put_session` and `delete_session` must update the forward and reverse
/// bindings atomically. TTL refresh failures are treated as non-fatal by
/// callers; the reaper is the final authority on removal.
#[async_trait]
pub trait KvDirectory: Send + Sync {
    /// Looks up the record bound to a session, if any.
    async fn get_session(&self, key: &SessionKey) -> Result<Option<SessionRecord>, KvError>;

    /// Writes the session record and the container reverse index, both
    /// with the given TTL.
    async fn put_session(
        &self,
        key: &SessionKey,
        record: SessionRecord,
        ttl: Duration,
    ) -> Result<(), KvError>;

    /// Extends the TTL on both bindings and bumps `last_used_at`.
    /// Returns false if the session is absent (expired or deleted).
    async fn refresh_ttl(&self, key: &SessionKey, ttl: Duration) -> Result<bool, KvError>;

    /// Removes both bindings. Removing an absent session is not an error.
    async fn delete_session(&self, key: &SessionKey) -> Result<(), KvError>;

    /// Reverse lookup: which session owns this container?
    async fn get_owner(&self, container_id: &str) -> Result<Option<SessionKey>, KvError>;

    /// Snapshot of all live session bindings, for reconciliation.
    async fn list_sessions(&self) -> Result<Vec<(SessionKey, SessionRecord)>, KvError>;

    /// Marks a session as explicitly destroyed for the given TTL, so a
    /// later resolve reports it missing instead of recreating it.
    async fn mark_destroyed(&self, key: &SessionKey, ttl: Duration) -> Result<(), KvError>;

    /// True while a destroy marker is live for the session.
    async fn is_destroyed(&self, key: &SessionKey) -> Result<bool, KvError>;

    /// Clears the destroy marker (explicit session re-creation).
    async fn clear_destroyed(&self, key: &SessionKey) -> Result<(), KvError>;

    /// Increments the caller's rate counter for the current fixed window
    /// and returns the new count. The counter expires with the window.
    async fn incr_rate_counter(&self, user_id: &str, window: Duration) -> Result<u64, KvError>;
}
