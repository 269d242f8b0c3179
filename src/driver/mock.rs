//! In-memory driver implementation for tests.
//!
//! Simulates just enough of the engine for the registry, executor,
//! workspace gateway, and reaper to be exercised without a daemon:
//! containers with labels and running state, named volumes, a byte-level
//! workspace filesystem fed through real tar archives, scripted exec
//! results, and failure injection.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    ContainerDriver, ContainerSpec, ContainerStatus, ContainerSummary, DriverError, ExecResult,
    FileRead,
};

#[derive(Debug, Clone)]
struct MockContainer {
    labels: HashMap<String, String>,
    running: bool,
    created_at: DateTime<Utc>,
    /// Workspace-relative path -> contents.
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    volumes: HashSet<String>,
    next_id: u64,
    create_count: u32,
    exec_log: Vec<(String, Vec<String>)>,
    scripted_execs: VecDeque<ExecResult>,
    fail_creates: u32,
    fail_starts: u32,
    fail_puts: u32,
    transient_execs: u32,
}

/// A driver that fakes the engine in memory.
#[derive(Debug, Default)]
#[allow(dead_code)] // Constructed by tests across the crate
pub struct MockDriver {
    state: Mutex<MockState>,
    create_delay: Option<Duration>,
}

#[allow(dead_code)] // Test-support surface; not every test uses every knob
impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artificial delay to `create`, widening race windows.
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::default(),
            create_delay: Some(delay),
        }
    }

    /// Total number of containers ever created.
    pub fn create_count(&self) -> u32 {
        self.state.lock().unwrap().create_count
    }

    /// Ids of containers currently known to the engine.
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Volumes currently known to the engine.
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().volumes.iter().cloned().collect();
        names.sort();
        names
    }

    /// Every exec dispatched so far, as (container_id, argv).
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().exec_log.clone()
    }

    /// Queues a canned result for the next non-builtin exec.
    pub fn script_exec(&self, result: ExecResult) {
        self.state.lock().unwrap().scripted_execs.push_back(result);
    }

    /// Makes the next `n` creates fail with a transient engine error.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().fail_creates = n;
    }

    /// Makes the next `n` starts fail.
    pub fn fail_next_starts(&self, n: u32) {
        self.state.lock().unwrap().fail_starts = n;
    }

    /// Makes the next `n` archive uploads fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.state.lock().unwrap().fail_puts = n;
    }

    /// Makes the next `n` execs fail transiently (exercises the retry).
    pub fn fail_next_execs_transient(&self, n: u32) {
        self.state.lock().unwrap().transient_execs = n;
    }

    /// Flips a container's running state, simulating a crash.
    pub fn set_running(&self, container_id: &str, running: bool) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.running = running;
        }
    }

    /// Backdates a container's creation time, for age-based reaping. The
    /// creation label is rewritten only when the container carries one.
    pub fn backdate(&self, container_id: &str, age: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(container_id) {
            let created = Utc::now() - chrono::Duration::from_std(age).unwrap();
            c.created_at = created;
            if let Some(label) = c.labels.get_mut("sandbox.created_at") {
                *label = created.timestamp().to_string();
            }
        }
    }

    /// Drops a container without going through `remove`, simulating
    /// out-of-band deletion.
    pub fn forget(&self, container_id: &str) {
        self.state.lock().unwrap().containers.remove(container_id);
    }

    /// Seeds a workspace file directly.
    pub fn seed_file(&self, container_id: &str, path: &str, contents: &[u8]) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.files.insert(path.to_string(), contents.to_vec());
        }
    }

    /// Reads a workspace file back out, for assertions.
    pub fn file(&self, container_id: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)?
            .files
            .get(path)
            .cloned()
    }

    fn strip_workspace(path: &str) -> String {
        path.strip_prefix("/workspace/")
            .unwrap_or(path.strip_prefix("/workspace").unwrap_or(path))
            .to_string()
    }

    /// Builtin handling for the exec shapes the gateway issues.
    fn builtin_exec(container: &mut MockContainer, argv: &[String]) -> ExecResult {
        let ok = |stdout: Vec<u8>| ExecResult {
            exit_code: 0,
            stdout,
            ..Default::default()
        };

        match argv.first().map(String::as_str) {
            Some("ls") if argv.len() == 3 && argv[1] == "-1Ap" => {
                let dir = Self::strip_workspace(&argv[2]);
                let prefix = if dir.is_empty() {
                    String::new()
                } else {
                    format!("{dir}/")
                };
                if !dir.is_empty()
                    && !container.files.keys().any(|k| k.starts_with(&prefix))
                {
                    return ExecResult {
                        exit_code: 1,
                        stderr: format!("ls: {}: No such file or directory", argv[2]).into_bytes(),
                        ..Default::default()
                    };
                }
                let mut entries: Vec<String> = Vec::new();
                for key in container.files.keys() {
                    let Some(rest) = key.strip_prefix(&prefix) else {
                        continue;
                    };
                    match rest.split_once('/') {
                        Some((dir_name, _)) => {
                            let entry = format!("{dir_name}/");
                            if !entries.contains(&entry) {
                                entries.push(entry);
                            }
                        }
                        None => entries.push(rest.to_string()),
                    }
                }
                entries.sort();
                ok(entries.join("\n").into_bytes())
            }
            Some("rm") => {
                let target = Self::strip_workspace(argv.last().unwrap());
                let prefix = format!("{target}/");
                container
                    .files
                    .retain(|k, _| k != &target && !k.starts_with(&prefix));
                ok(Vec::new())
            }
            Some("echo") => {
                let mut out = argv[1..].join(" ");
                out.push('\n');
                ok(out.into_bytes())
            }
            _ => ok(Vec::new()),
        }
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn ping(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(DriverError::engine_unavailable("injected create failure"));
        }
        state.next_id += 1;
        state.create_count += 1;
        let id = format!("mock-container-{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                labels: spec.labels.clone(),
                running: false,
                created_at: Utc::now(),
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(DriverError::other("injected start failure"));
        }
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(DriverError::not_found(container_id)),
        }
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        _working_dir: &str,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<ExecResult, DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.transient_execs > 0 {
            state.transient_execs -= 1;
            return Err(DriverError::engine_unavailable("injected exec failure"));
        }
        state
            .exec_log
            .push((container_id.to_string(), argv.to_vec()));
        let scripted = state.scripted_execs.pop_front();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::not_found(container_id))?;
        if !container.running {
            return Err(DriverError::conflict("container is not running"));
        }

        let mut result = match scripted {
            Some(result) => result,
            None => Self::builtin_exec(container, argv),
        };
        if result.duration_ms as u128 >= timeout.as_millis() {
            result.timed_out = true;
            result.exit_code = 124;
        }
        if result.stdout.len() > max_output_bytes {
            result.stdout.truncate(max_output_bytes);
            result.truncated = true;
        }
        if result.stderr.len() > max_output_bytes {
            result.stderr.truncate(max_output_bytes);
            result.truncated = true;
        }
        Ok(result)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        let state = self.state.lock().unwrap();
        match state.containers.get(container_id) {
            Some(c) => Ok(ContainerStatus {
                running: c.running,
                created_at: Some(c.created_at),
            }),
            None => Err(DriverError::not_found(container_id)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        match state.containers.remove(container_id) {
            Some(_) => Ok(()),
            None => Err(DriverError::not_found(container_id)),
        }
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerSummary>, DriverError> {
        let state = self.state.lock().unwrap();
        let (key, value) = label_filter.split_once('=').unwrap_or((label_filter, ""));
        let mut summaries: Vec<ContainerSummary> = state
            .containers
            .iter()
            .filter(|(_, c)| {
                c.labels
                    .get(key)
                    .map(|v| value.is_empty() || v == value)
                    .unwrap_or(false)
            })
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                labels: c.labels.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn volume_create(&self, name: &str) -> Result<(), DriverError> {
        self.state.lock().unwrap().volumes.insert(name.to_string());
        Ok(())
    }

    async fn volume_remove(&self, name: &str) -> Result<(), DriverError> {
        if self.state.lock().unwrap().volumes.remove(name) {
            Ok(())
        } else {
            Err(DriverError::not_found(name))
        }
    }

    async fn read_file(
        &self,
        container_id: &str,
        path: &str,
        max_size: u64,
    ) -> Result<FileRead, DriverError> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| DriverError::not_found(container_id))?;
        let rel = Self::strip_workspace(path);

        if let Some(contents) = container.files.get(&rel) {
            if max_size > 0 && contents.len() as u64 > max_size {
                return Ok(FileRead::TooLarge {
                    size: contents.len() as u64,
                });
            }
            return Ok(FileRead::Contents(contents.clone()));
        }
        let prefix = format!("{rel}/");
        if rel.is_empty() || container.files.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(FileRead::NotAFile);
        }
        Err(DriverError::not_found(format!("no such file: {path}")))
    }

    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_puts > 0 {
            state.fail_puts -= 1;
            return Err(DriverError::engine_unavailable("injected upload failure"));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::not_found(container_id))?;

        let base = Self::strip_workspace(path);
        let mut tar = tar::Archive::new(archive.as_ref());
        let entries = tar
            .entries()
            .map_err(|e| DriverError::other(format!("invalid archive: {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| DriverError::other(format!("invalid archive: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| DriverError::other(format!("invalid archive: {e}")))?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            let full = if base.is_empty() {
                name
            } else {
                format!("{base}/{name}")
            };
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| DriverError::other(format!("invalid archive: {e}")))?;
            container.files.insert(full, contents);
        }
        Ok(())
    }
}
