//! Session registry: authoritative state machine for session lifecycle.
//!
//! Resolves `(user, session_id)` to a running, hardened container with
//! per-session mutual exclusion, so racing requests produce exactly one
//! container. Bindings live in the KV directory under a sliding TTL;
//! container labels remain the source of truth the reaper enumerates.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::driver::{with_engine_retry, ContainerDriver, ContainerSpec};
use crate::error::ServiceError;
use crate::kv::{KvDirectory, KvError, SessionKey, SessionRecord};

/// Label marking containers owned by this service.
pub const LABEL_MANAGED: &str = "sandbox.managed";
/// Label carrying the owning user id.
pub const LABEL_USER_ID: &str = "sandbox.user_id";
/// Label carrying the session id.
pub const LABEL_SESSION_ID: &str = "sandbox.session_id";
/// Label carrying the creation time as unix seconds.
pub const LABEL_CREATED_AT: &str = "sandbox.created_at";
/// Filter expression selecting every managed container.
pub const MANAGED_FILTER: &str = "sandbox.managed=true";

struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

type LockTable = Arc<Mutex<HashMap<SessionKey, LockEntry>>>;

/// Holds a session's mutual exclusion until dropped. Dropping also prunes
/// the lock table entry once no other task references it.
pub struct SessionGuard {
    key: SessionKey,
    table: LockTable,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().expect("lock table mutex poisoned");
        if let Some(entry) = table.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                table.remove(&self.key);
            }
        }
    }
}

/// Orchestrates the session-to-container mapping.
pub struct SessionRegistry {
    driver: Arc<dyn ContainerDriver>,
    kv: Arc<dyn KvDirectory>,
    config: Config,
    mem_limit_bytes: i64,
    session_ttl: Duration,
    locks: LockTable,
}

impl SessionRegistry {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        kv: Arc<dyn KvDirectory>,
        config: Config,
    ) -> anyhow::Result<Self> {
        let mem_limit_bytes = config.mem_limit_bytes()?;
        let session_ttl = config.session.ttl();
        Ok(Self {
            driver,
            kv,
            config,
            mem_limit_bytes,
            session_ttl,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Acquires the per-session lock, creating the table entry on demand.
    ///
    /// The table itself is guarded by a plain mutex with short critical
    /// sections; the per-session lock is an async mutex held across
    /// engine calls.
    pub async fn lock_session(&self, key: &SessionKey) -> SessionGuard {
        let lock = {
            let mut table = self.locks.lock().expect("lock table mutex poisoned");
            let entry = table.entry(key.clone()).or_insert_with(|| LockEntry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };
        let permit = lock.lock_owned().await;
        SessionGuard {
            key: key.clone(),
            table: Arc::clone(&self.locks),
            _permit: permit,
        }
    }

    /// Returns a running container bound to the session, creating one if
    /// none exists or the recorded one is missing or dead. Sessions that
    /// were explicitly destroyed report `SessionNotFound` until re-opened.
    pub async fn resolve_or_create(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<String, ServiceError> {
        let key = validated_key(user_id, session_id)?;
        let _guard = self.lock_session(&key).await;
        if self.kv.is_destroyed(&key).await.map_err(kv_internal)? {
            return Err(ServiceError::session_not_found(session_id));
        }
        self.resolve_locked(&key).await
    }

    /// Explicit session creation: clears any destroy marker, then behaves
    /// like [`Self::resolve_or_create`]. Idempotent.
    pub async fn open_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<String, ServiceError> {
        let key = validated_key(user_id, session_id)?;
        let _guard = self.lock_session(&key).await;
        self.kv.clear_destroyed(&key).await.map_err(kv_internal)?;
        self.resolve_locked(&key).await
    }

    async fn resolve_locked(&self, key: &SessionKey) -> Result<String, ServiceError> {
        if let Some(record) = self.kv.get_session(key).await.map_err(kv_internal)? {
            match self.driver.inspect(&record.container_id).await {
                Ok(status) if status.running => {
                    if let Err(e) = self.kv.refresh_ttl(key, self.session_ttl).await {
                        warn!(session = %key, "failed to refresh session ttl: {e}");
                    }
                    return Ok(record.container_id);
                }
                Ok(_) => {
                    debug!(session = %key, "recorded container is not running, recreating");
                    self.remove_best_effort(&record.container_id).await;
                    self.kv.delete_session(key).await.map_err(kv_internal)?;
                }
                Err(e) if e.is_not_found() => {
                    debug!(session = %key, "recorded container is gone, recreating");
                    self.kv.delete_session(key).await.map_err(kv_internal)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.create_locked(key).await
    }

    async fn create_locked(&self, key: &SessionKey) -> Result<String, ServiceError> {
        let volume_name = if self.config.workspace.persist_volumes {
            let name = volume_name(key);
            with_engine_retry(|| self.driver.volume_create(&name)).await?;
            Some(name)
        } else {
            None
        };

        let spec = self.container_spec(key, volume_name.clone());
        let container_id = with_engine_retry(|| self.driver.create(&spec)).await?;

        if let Err(e) = self.driver.start(&container_id).await {
            self.remove_best_effort(&container_id).await;
            return Err(e.into());
        }

        // The KV must never hold a binding to a container no caller was
        // handed, so a failed write tears the container down again.
        let record = SessionRecord::new(container_id.clone(), volume_name);
        if let Err(e) = self
            .kv
            .put_session(key, record, self.session_ttl)
            .await
        {
            self.remove_best_effort(&container_id).await;
            return Err(ServiceError::internal(format!(
                "failed to record session binding: {e}"
            )));
        }

        info!(
            session = %key,
            container_id = %short_id(&container_id),
            "created session container"
        );
        Ok(container_id)
    }

    /// Refreshes the session TTL. Failures are logged, never fatal; the
    /// reaper has the final say on expiry.
    pub async fn touch(&self, user_id: &str, session_id: &str) {
        let key = SessionKey::new(user_id, session_id);
        match self.kv.refresh_ttl(&key, self.session_ttl).await {
            Ok(true) => {}
            Ok(false) => debug!(session = %key, "touch on absent session"),
            Err(e) => warn!(session = %key, "failed to refresh session ttl: {e}"),
        }
    }

    /// Tears a session down: removes the container, both KV bindings, and
    /// (in persistence mode) the workspace volume. Leaves a destroy marker
    /// so the session id reads as gone until explicitly re-opened.
    pub async fn destroy(&self, user_id: &str, session_id: &str) -> Result<(), ServiceError> {
        let key = validated_key(user_id, session_id)?;
        let _guard = self.lock_session(&key).await;

        let record = self
            .kv
            .get_session(&key)
            .await
            .map_err(kv_internal)?
            .ok_or_else(|| ServiceError::session_not_found(session_id))?;

        if let Some(owner) = self
            .kv
            .get_owner(&record.container_id)
            .await
            .map_err(kv_internal)?
        {
            if owner != key {
                return Err(ServiceError::Forbidden);
            }
        }

        match self.driver.remove(&record.container_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.kv.delete_session(&key).await.map_err(kv_internal)?;
        if let Err(e) = self.kv.mark_destroyed(&key, self.session_ttl).await {
            warn!(session = %key, "failed to mark session destroyed: {e}");
        }

        if self.config.workspace.persist_volumes {
            let name = record
                .volume_name
                .unwrap_or_else(|| volume_name(&key));
            match self.driver.volume_remove(&name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(session = %key, volume = %name, "failed to remove volume: {e}"),
            }
        }

        info!(session = %key, "destroyed session");
        Ok(())
    }

    async fn remove_best_effort(&self, container_id: &str) {
        if let Err(e) = self.driver.remove(container_id).await {
            if !e.is_not_found() {
                warn!(
                    container_id = %short_id(container_id),
                    "best-effort container removal failed: {e}"
                );
            }
        }
    }

    fn container_spec(&self, key: &SessionKey, volume_name: Option<String>) -> ContainerSpec {
        let container = &self.config.container;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "sandbox-{}-{}-{}",
            sanitize_name(&key.user_id),
            sanitize_name(&key.session_id),
            &suffix[..8]
        );

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_USER_ID.to_string(), key.user_id.clone()),
            (LABEL_SESSION_ID.to_string(), key.session_id.clone()),
            (
                LABEL_CREATED_AT.to_string(),
                chrono::Utc::now().timestamp().to_string(),
            ),
        ]);

        ContainerSpec {
            image: container.image.clone(),
            name,
            labels,
            env: Vec::new(),
            workspace_volume: volume_name,
            tmpfs_workspace_size: container.tmpfs_workspace_size.clone(),
            tmpfs_tmp_size: container.tmpfs_tmp_size.clone(),
            mem_limit_bytes: self.mem_limit_bytes,
            cpu_quota_percent: container.cpu_quota_percent,
            pids_limit: container.pids_limit,
            ulimit_nofile: (
                container.ulimit_nofile_soft,
                container.ulimit_nofile_hard,
            ),
        }
    }

    #[cfg(test)]
    pub fn lock_table_len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Deterministic workspace volume name for a session. Hashing the pair
/// keeps equal session ids under different users from colliding.
pub fn volume_name(key: &SessionKey) -> String {
    let digest = Sha256::digest(format!("{}|{}", key.user_id, key.session_id).as_bytes());
    format!("sandbox-ws-{}", hex::encode(digest))
}

/// Session ids are restricted to `[A-Za-z0-9_.-]{1,64}`.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn validated_key(user_id: &str, session_id: &str) -> Result<SessionKey, ServiceError> {
    if user_id.is_empty() {
        return Err(ServiceError::AuthRequired);
    }
    if !is_valid_session_id(session_id) {
        return Err(ServiceError::invalid_session_id(session_id));
    }
    Ok(SessionKey::new(user_id, session_id))
}

fn kv_internal(err: KvError) -> ServiceError {
    ServiceError::internal(err.to_string())
}

/// Allow only alphanumeric and hyphen in engine container names.
fn sanitize_name(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    cleaned.chars().take(24).collect()
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}
