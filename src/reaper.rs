//! Cleanup worker: removes expired containers and reconciles the KV
//! directory.
//!
//! Container labels are the source of truth here; the KV directory is
//! soft state. Removals take the same per-session lock as the registry so
//! a reap never races a live request, and sessions touched within the
//! age limit are skipped. Workspace volumes are never removed by the
//! reaper; they only go away on explicit session delete.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::driver::ContainerDriver;
use crate::kv::{KvDirectory, SessionKey};
use crate::registry::{
    SessionRegistry, LABEL_CREATED_AT, LABEL_SESSION_ID, LABEL_USER_ID, MANAGED_FILTER,
};

/// Periodically removes managed containers past their maximum age.
pub struct Reaper {
    driver: Arc<dyn ContainerDriver>,
    kv: Arc<dyn KvDirectory>,
    registry: Arc<SessionRegistry>,
    interval: Duration,
    max_age_secs: i64,
}

impl Reaper {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        kv: Arc<dyn KvDirectory>,
        registry: Arc<SessionRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            driver,
            kv,
            registry,
            interval: Duration::from_secs(config.cleanup.interval_seconds),
            max_age_secs: config.cleanup.max_container_age_seconds as i64,
        }
    }

    /// Runs cleanup passes forever at the configured interval.
    pub async fn run_loop(&self) {
        info!(
            interval_seconds = self.interval.as_secs(),
            max_container_age_seconds = self.max_age_secs,
            "cleanup worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = self.run_once().await;
            if removed > 0 {
                info!(removed, "cleanup pass complete");
            }
        }
    }

    /// One cleanup pass. Individual failures are logged and never abort
    /// the cycle; returns the number of containers removed.
    pub async fn run_once(&self) -> u32 {
        let containers = match self.driver.list(MANAGED_FILTER).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("cleanup listing failed: {e}");
                return 0;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut removed = 0;

        for summary in &containers {
            let mut created_at: Option<i64> = summary
                .labels
                .get(LABEL_CREATED_AT)
                .and_then(|v| v.parse().ok());
            if created_at.is_none() {
                // Label missing or unreadable; fall back to the engine's
                // own creation record.
                created_at = match self.driver.inspect(&summary.id).await {
                    Ok(status) => status.created_at.map(|dt| dt.timestamp()),
                    Err(_) => None,
                };
            }

            // A managed container whose age cannot be established at all
            // is unaccounted for; remove it rather than let it linger.
            let expired = match created_at {
                Some(ts) => now.saturating_sub(ts) > self.max_age_secs,
                None => true,
            };
            if !expired {
                continue;
            }

            let key = match (
                summary.labels.get(LABEL_USER_ID),
                summary.labels.get(LABEL_SESSION_ID),
            ) {
                (Some(user), Some(session)) => Some(SessionKey::new(user, session)),
                _ => None,
            };

            let _guard = match &key {
                Some(key) => Some(self.registry.lock_session(key).await),
                None => None,
            };

            // A session that saw traffic recently stays, whatever the
            // container's age label says.
            if let Some(key) = &key {
                match self.kv.get_session(key).await {
                    Ok(Some(record)) => {
                        let idle = now.saturating_sub(record.last_used_at.timestamp());
                        if idle < self.max_age_secs {
                            debug!(session = %key, "skipping recently used session");
                            continue;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(session = %key, "cleanup session lookup failed: {e}"),
                }
            }

            match self.driver.remove(&summary.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(container_id = %summary.id, "cleanup removal failed: {e}");
                    continue;
                }
            }

            if let Some(key) = &key {
                if let Err(e) = self.kv.delete_session(key).await {
                    warn!(session = %key, "cleanup binding removal failed: {e}");
                }
            }

            removed += 1;
            info!(container_id = %summary.id, "removed expired container");
        }

        self.reconcile().await;
        removed
    }

    /// Drops KV bindings whose container no longer exists in the engine.
    async fn reconcile(&self) {
        let sessions = match self.kv.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("cleanup reconcile listing failed: {e}");
                return;
            }
        };

        for (key, _) in sessions {
            let _guard = self.registry.lock_session(&key).await;
            // Re-read under the lock; the binding may have changed.
            let record = match self.kv.get_session(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(session = %key, "cleanup reconcile lookup failed: {e}");
                    continue;
                }
            };
            match self.driver.inspect(&record.container_id).await {
                Err(e) if e.is_not_found() => {
                    debug!(session = %key, "dropping binding to vanished container");
                    if let Err(e) = self.kv.delete_session(&key).await {
                        warn!(session = %key, "cleanup binding removal failed: {e}");
                    }
                }
                Err(e) => warn!(session = %key, "cleanup reconcile inspect failed: {e}"),
                Ok(_) => {}
            }
        }
    }
}
