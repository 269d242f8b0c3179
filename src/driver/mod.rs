//! Container engine driver for isolated command execution.
//!
//! Provides a typed interface over the container engine (create, exec,
//! inspect, remove, list-by-label, volumes, and archive transfer) and
//! hides engine-specific error shapes behind [`DriverError`].

mod docker;
mod mock;

pub use docker::DockerDriver;
#[allow(unused_imports)] // Exercised by unit tests across the crate
pub use mock::MockDriver;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Backoff before the single retry on a transient engine failure.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Request to create a session container.
///
/// Only the knobs that vary per deployment live here; the hardening
/// profile (read-only rootfs, no network, dropped capabilities,
/// unprivileged user, no-new-privileges) is fixed by the driver.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference, taken verbatim from configuration.
    pub image: String,
    /// Engine-level container name.
    pub name: String,
    /// Labels identifying the owning session; the reaper keys off these.
    pub labels: HashMap<String, String>,
    /// Extra environment variables, `KEY=value` form.
    pub env: Vec<String>,
    /// Named volume mounted at `/workspace`. When absent, `/workspace`
    /// is a size-capped tmpfs instead.
    pub workspace_volume: Option<String>,
    /// Size cap for the `/workspace` tmpfs (ignored with a volume).
    pub tmpfs_workspace_size: String,
    /// Size cap for the `/tmp` tmpfs.
    pub tmpfs_tmp_size: String,
    /// Memory limit in bytes.
    pub mem_limit_bytes: i64,
    /// CPU quota as a percentage of one CPU.
    pub cpu_quota_percent: u64,
    /// Process count limit.
    pub pids_limit: i64,
    /// nofile ulimit as (soft, hard).
    pub ulimit_nofile: (i64, i64),
}

/// Outcome of one command execution inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Process exit code; 124 on timeout, -1 when the engine reported none.
    pub exit_code: i64,
    /// Captured stdout, truncated to the configured cap.
    pub stdout: Vec<u8>,
    /// Captured stderr, truncated to the configured cap.
    pub stderr: Vec<u8>,
    /// Wall-clock duration of the exec.
    pub duration_ms: u64,
    /// True when the wall-clock timeout expired and the exec was killed.
    pub timed_out: bool,
    /// True when either stream overflowed its cap.
    pub truncated: bool,
}

/// Container state snapshot from inspect.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub running: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// One entry from a label-filtered container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Result of a workspace file read.
#[derive(Debug, Clone)]
pub enum FileRead {
    /// Full file contents.
    Contents(Vec<u8>),
    /// The file exceeds the caller's size limit; contents were not fetched.
    TooLarge { size: u64 },
    /// The path names a directory or other non-regular file.
    NotAFile,
}

/// Errors that can occur during container engine operations.
///
/// These five kinds are the only shapes the upper layers handle.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Container, exec, or volume does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Name or state conflict reported by the engine.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// An engine RPC exceeded its deadline.
    #[error("engine operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Engine unreachable or failing at the transport level.
    #[error("engine unavailable: {message}")]
    EngineUnavailable { message: String },

    /// Anything else the engine reported.
    #[error("engine error: {message}")]
    Other { message: String },
}

impl DriverError {
    /// Creates a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an `EngineUnavailable` error.
    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `Other` error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for transient failures worth a single retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EngineUnavailable { .. })
    }
}

/// Typed interface over the container engine.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Checks the engine is reachable.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Creates a container with the fixed security profile applied on top
    /// of the spec. Returns the engine container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError>;

    /// Starts a created container.
    async fn start(&self, container_id: &str) -> Result<(), DriverError>;

    /// Runs `argv` inside the container with a hard wall-clock timeout.
    ///
    /// On expiry the exec's process group is killed and the result carries
    /// `timed_out=true, exit_code=124`. Output is capped at
    /// `max_output_bytes` per stream; overflow drops the tail and sets
    /// `truncated`.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        working_dir: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecResult, DriverError>;

    /// Reports whether the container is running and when it was created.
    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, DriverError>;

    /// Force-removes a container.
    async fn remove(&self, container_id: &str) -> Result<(), DriverError>;

    /// Lists containers (running or not) carrying the given label.
    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerSummary>, DriverError>;

    /// Creates a named volume. Idempotent by name.
    async fn volume_create(&self, name: &str) -> Result<(), DriverError>;

    /// Removes a named volume.
    async fn volume_remove(&self, name: &str) -> Result<(), DriverError>;

    /// Copies a single file out of the container via the archive API.
    /// `max_size` of 0 disables the size check.
    async fn read_file(
        &self,
        container_id: &str,
        path: &str,
        max_size: u64,
    ) -> Result<FileRead, DriverError>;

    /// Streams a tar archive into the container at `path`.
    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), DriverError>;
}

/// Runs an engine call, retrying exactly once after a short backoff when
/// the failure is transient.
pub async fn with_engine_retry<T, Fut, F>(mut call: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    match call().await {
        Err(err) if err.is_transient() => {
            tracing::debug!("transient engine error, retrying once: {err}");
            tokio::time::sleep(RETRY_BACKOFF).await;
            call().await
        }
        other => other,
    }
}
