//! Docker-backed container driver.
//!
//! Applies the fixed hardening profile to every container it creates:
//! read-only root filesystem, no network, all capabilities dropped,
//! no-new-privileges, unprivileged user, tmpfs mounts with `noexec,nosuid`,
//! and memory/CPU/pids/nofile limits. The entrypoint is a minimal shell
//! sleep loop so the container stays alive between execs.

use async_trait::async_trait;
use bollard::container::{
    Config as EngineConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, Mount, MountTypeEnum, ResourcesUlimits};
use bollard::service::HostConfig;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    ContainerDriver, ContainerSpec, ContainerStatus, ContainerSummary, DriverError, ExecResult,
    FileRead,
};

/// User every container process runs as.
const CONTAINER_USER: &str = "1000:1000";

/// Default working directory inside the container.
const WORKSPACE_DIR: &str = "/workspace";

/// Deadline for the engine liveness probe.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack added to archive downloads on top of the file size limit to
/// account for tar headers and block padding.
const ARCHIVE_OVERHEAD: u64 = 8 * 1024;

/// Runs containers and execs against a Docker daemon.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connects with the local daemon defaults and verifies it responds.
    pub async fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::engine_unavailable(e.to_string()))?;
        let driver = Self { docker };
        driver.ping().await?;
        Ok(driver)
    }

    fn engine_config(spec: &ContainerSpec) -> EngineConfig<String> {
        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}", spec.tmpfs_tmp_size),
        );

        let mut mounts = None;
        if let Some(volume) = &spec.workspace_volume {
            mounts = Some(vec![Mount {
                target: Some(WORKSPACE_DIR.to_string()),
                source: Some(volume.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]);
        } else {
            tmpfs.insert(
                WORKSPACE_DIR.to_string(),
                format!("rw,noexec,nosuid,size={}", spec.tmpfs_workspace_size),
            );
        }

        let cpu_quota = (spec.cpu_quota_percent as i64) * 1_000;

        EngineConfig {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            env: Some(spec.env.clone()),
            user: Some(CONTAINER_USER.to_string()),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            entrypoint: Some(vec!["/bin/sh".to_string()]),
            cmd: Some(vec![
                "-c".to_string(),
                "while :; do sleep 3600; done".to_string(),
            ]),
            host_config: Some(HostConfig {
                readonly_rootfs: Some(true),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                memory: Some(spec.mem_limit_bytes),
                cpu_period: Some(100_000),
                cpu_quota: Some(cpu_quota),
                pids_limit: Some(spec.pids_limit),
                tmpfs: Some(tmpfs),
                mounts,
                ulimits: Some(vec![ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(spec.ulimit_nofile.0),
                    hard: Some(spec.ulimit_nofile.1),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Best-effort kill of a timed-out exec's process group, addressed via
    /// the pid file the exec wrapper wrote.
    async fn kill_exec(&self, container_id: &str, pidfile: &str) {
        let script = format!(
            "p=$(cat {pidfile} 2>/dev/null); \
             if [ -n \"$p\" ]; then kill -KILL -\"$p\" 2>/dev/null || kill -KILL \"$p\" 2>/dev/null; fi; \
             rm -f {pidfile}"
        );
        let options = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
            user: Some(CONTAINER_USER.to_string()),
            ..Default::default()
        };
        let result = async {
            let exec = self.docker.create_exec(container_id, options).await?;
            self.docker.start_exec(&exec.id, None).await
        }
        .await;
        if let Err(e) = result {
            warn!(container_id, "failed to kill timed-out exec: {e}");
        }
    }
}

fn map_engine_error(err: bollard::errors::Error) -> DriverError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => DriverError::NotFound { message },
            409 => DriverError::Conflict { message },
            code if code >= 500 => DriverError::EngineUnavailable { message },
            _ => DriverError::Other { message },
        },
        other => DriverError::EngineUnavailable {
            message: other.to_string(),
        },
    }
}

/// Appends a chunk to a capped buffer, reporting whether anything was cut.
fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    if room >= chunk.len() {
        buf.extend_from_slice(chunk);
        false
    } else {
        buf.extend_from_slice(&chunk[..room]);
        true
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn ping(&self) -> Result<(), DriverError> {
        match tokio::time::timeout(PING_TIMEOUT, self.docker.ping()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(map_engine_error(e)),
            Err(_) => Err(DriverError::Timeout {
                timeout_secs: PING_TIMEOUT.as_secs(),
            }),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        debug!(name = %spec.name, image = %spec.image, "creating container");
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                Self::engine_config(spec),
            )
            .await
            .map_err(map_engine_error)?;
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(map_engine_error)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        working_dir: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecResult, DriverError> {
        // Wrapper records the shell's pid so a timed-out exec can be
        // killed by group; the pid file self-cleans on normal exit.
        let pidfile = format!(
            "/tmp/.exec-{}.pid",
            uuid::Uuid::new_v4().simple().to_string().split_at(8).0
        );
        let mut cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {pidfile}; \"$@\"; rc=$?; rm -f {pidfile}; exit $rc"),
            "sh".to_string(),
        ];
        cmd.extend(argv.iter().cloned());

        let started = Instant::now();
        let run = async {
            let exec = self
                .docker
                .create_exec(
                    container_id,
                    CreateExecOptions {
                        cmd: Some(cmd),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        working_dir: Some(working_dir.to_string()),
                        user: Some(CONTAINER_USER.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(map_engine_error)?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut truncated = false;

            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(map_engine_error)?
            {
                StartExecResults::Attached {
                    output: mut stream, ..
                } => {
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                truncated |= push_capped(&mut stdout, &message, max_output_bytes);
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                truncated |= push_capped(&mut stderr, &message, max_output_bytes);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("error reading exec output: {e}");
                            }
                        }
                    }
                }
                StartExecResults::Detached => {}
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(map_engine_error)?;
            let exit_code = inspect.exit_code.unwrap_or(-1);

            Ok::<_, DriverError>((exit_code, stdout, stderr, truncated))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok((exit_code, stdout, stderr, truncated))) => Ok(ExecResult {
                exit_code,
                stdout,
                stderr,
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
                truncated,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.kill_exec(container_id, &pidfile).await;
                Ok(ExecResult {
                    exit_code: 124,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                    truncated: false,
                })
            }
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_engine_error)?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| *s == ContainerStateStatusEnum::RUNNING)
            .unwrap_or(false);

        let created_at = info
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(ContainerStatus {
            running,
            created_at,
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_engine_error)
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerSummary>, DriverError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_filter.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_engine_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn volume_create(&self, name: &str) -> Result<(), DriverError> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_engine_error)
    }

    async fn volume_remove(&self, name: &str) -> Result<(), DriverError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(map_engine_error)
    }

    async fn read_file(
        &self,
        container_id: &str,
        path: &str,
        max_size: u64,
    ) -> Result<FileRead, DriverError> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );

        let budget = if max_size == 0 {
            u64::MAX
        } else {
            max_size + ARCHIVE_OVERHEAD
        };
        let mut archive_bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_engine_error)?;
            archive_bytes.extend_from_slice(&chunk);
            if archive_bytes.len() as u64 > budget {
                return Ok(FileRead::TooLarge {
                    size: archive_bytes.len() as u64,
                });
            }
        }

        let mut archive = tar::Archive::new(archive_bytes.as_slice());
        let entries = archive
            .entries()
            .map_err(|e| DriverError::other(format!("invalid archive: {e}")))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| DriverError::other(format!("invalid archive: {e}")))?;
            let kind = entry.header().entry_type();
            if kind.is_dir() {
                return Ok(FileRead::NotAFile);
            }
            if !kind.is_file() {
                continue;
            }
            let size = entry.header().size().unwrap_or(0);
            if max_size > 0 && size > max_size {
                return Ok(FileRead::TooLarge { size });
            }
            let mut contents = Vec::with_capacity(size as usize);
            entry
                .read_to_end(&mut contents)
                .map_err(|e| DriverError::other(format!("invalid archive: {e}")))?;
            return Ok(FileRead::Contents(contents));
        }

        Err(DriverError::not_found(format!("no such file: {path}")))
    }

    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), DriverError> {
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(map_engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ContainerSpec {
        ContainerSpec {
            image: "python:3.12-slim".to_string(),
            name: "sandbox-test".to_string(),
            labels: HashMap::from([("sandbox.managed".to_string(), "true".to_string())]),
            env: vec![],
            workspace_volume: None,
            tmpfs_workspace_size: "64m".to_string(),
            tmpfs_tmp_size: "64m".to_string(),
            mem_limit_bytes: 256 * 1024 * 1024,
            cpu_quota_percent: 50,
            pids_limit: 128,
            ulimit_nofile: (1024, 2048),
        }
    }

    #[test]
    fn test_engine_config_security_profile() {
        let config = DockerDriver::engine_config(&sample_spec());
        let host = config.host_config.unwrap();

        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
    }

    #[test]
    fn test_engine_config_tmpfs_workspace_without_volume() {
        let config = DockerDriver::engine_config(&sample_spec());
        let host = config.host_config.unwrap();
        let tmpfs = host.tmpfs.unwrap();

        assert_eq!(
            tmpfs.get("/workspace").map(String::as_str),
            Some("rw,noexec,nosuid,size=64m")
        );
        assert_eq!(
            tmpfs.get("/tmp").map(String::as_str),
            Some("rw,noexec,nosuid,size=64m")
        );
        assert!(host.mounts.is_none());
    }

    #[test]
    fn test_engine_config_volume_replaces_workspace_tmpfs() {
        let mut spec = sample_spec();
        spec.workspace_volume = Some("sandbox-ws-abc".to_string());

        let config = DockerDriver::engine_config(&spec);
        let host = config.host_config.unwrap();
        let tmpfs = host.tmpfs.unwrap();

        assert!(!tmpfs.contains_key("/workspace"));
        assert!(tmpfs.contains_key("/tmp"));

        let mounts = host.mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target.as_deref(), Some("/workspace"));
        assert_eq!(mounts[0].source.as_deref(), Some("sandbox-ws-abc"));
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::VOLUME));
    }

    #[test]
    fn test_engine_config_sleep_entrypoint() {
        let config = DockerDriver::engine_config(&sample_spec());
        assert_eq!(config.entrypoint, Some(vec!["/bin/sh".to_string()]));
        let cmd = config.cmd.unwrap();
        assert_eq!(cmd[0], "-c");
        assert!(cmd[1].contains("sleep 3600"));
    }

    #[test]
    fn test_engine_config_nofile_ulimit() {
        let config = DockerDriver::engine_config(&sample_spec());
        let ulimits = config.host_config.unwrap().ulimits.unwrap();
        assert_eq!(ulimits.len(), 1);
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));
        assert_eq!(ulimits[0].soft, Some(1024));
        assert_eq!(ulimits[0].hard, Some(2048));
    }

    #[test]
    fn test_map_engine_error_statuses() {
        let err = map_engine_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        });
        assert!(err.is_not_found());

        let err = map_engine_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        });
        assert!(matches!(err, DriverError::Conflict { .. }));

        let err = map_engine_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon error".to_string(),
        });
        assert!(err.is_transient());

        let err = map_engine_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message: "bad parameter".to_string(),
        });
        assert!(matches!(err, DriverError::Other { .. }));
    }

    #[test]
    fn test_push_capped_within_limit() {
        let mut buf = Vec::new();
        assert!(!push_capped(&mut buf, b"hello", 16));
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_push_capped_truncates_tail() {
        let mut buf = Vec::new();
        assert!(push_capped(&mut buf, b"hello world", 5));
        assert_eq!(buf, b"hello");

        // Later chunks are dropped entirely once the cap is reached.
        assert!(push_capped(&mut buf, b"more", 5));
        assert_eq!(buf, b"hello");
    }

    // Integration tests below require a reachable Docker daemon and skip
    // themselves otherwise.

    #[tokio::test]
    async fn test_connect_and_ping() {
        match DockerDriver::connect().await {
            Ok(driver) => {
                assert!(driver.ping().await.is_ok());
            }
            Err(e) => {
                // Docker not available in this environment.
                assert!(e.is_transient() || matches!(e, DriverError::Timeout { .. }));
            }
        }
    }

    #[tokio::test]
    async fn test_inspect_missing_container() {
        let Ok(driver) = DockerDriver::connect().await else {
            return;
        };
        let err = driver
            .inspect("sandboxd-does-not-exist")
            .await
            .expect_err("inspect of a missing container should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_missing_container() {
        let Ok(driver) = DockerDriver::connect().await else {
            return;
        };
        let err = driver
            .remove("sandboxd-does-not-exist")
            .await
            .expect_err("remove of a missing container should fail");
        assert!(err.is_not_found());
    }
}
