//! Command execution against a session's container.
//!
//! Validates the command against the whitelist, resolves the session
//! container, and runs the exec with a hard wall-clock timeout. Timeouts
//! surface as a successful result with `exit_code=124, timed_out=true`,
//! matching shell conventions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::driver::{with_engine_retry, ContainerDriver, ExecResult};
use crate::error::ServiceError;
use crate::registry::SessionRegistry;

/// Default working directory for execs.
pub const DEFAULT_WORKING_DIR: &str = "/workspace";

/// Runs whitelisted commands inside session containers.
pub struct Executor {
    registry: Arc<SessionRegistry>,
    driver: Arc<dyn ContainerDriver>,
    allowed_commands: HashSet<String>,
    default_timeout: Duration,
    max_timeout: Duration,
    max_output_bytes: usize,
}

impl Executor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        driver: Arc<dyn ContainerDriver>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            driver,
            allowed_commands: config.exec.allowed_command_set(),
            default_timeout: Duration::from_secs(config.exec.default_timeout_seconds),
            max_timeout: Duration::from_secs(config.exec.max_timeout_seconds),
            max_output_bytes: config.exec.max_output_bytes,
        }
    }

    /// Executes `command_line` in the session's container.
    ///
    /// The command is lexed with POSIX shell rules (quoting honored) and
    /// its binary must be whitelisted. `working_dir` defaults to
    /// `/workspace` and must stay under `/workspace` or `/tmp`.
    pub async fn execute(
        &self,
        user_id: &str,
        session_id: &str,
        command_line: &str,
        timeout_secs: Option<u64>,
        working_dir: Option<&str>,
    ) -> Result<ExecResult, ServiceError> {
        let argv = parse_command(command_line)?;
        self.ensure_command_allowed(&argv)?;

        let working_dir = working_dir.unwrap_or(DEFAULT_WORKING_DIR);
        validate_working_dir(working_dir)?;

        let timeout = self.clamp_timeout(timeout_secs);

        let container_id = self.registry.resolve_or_create(user_id, session_id).await?;

        let result = with_engine_retry(|| {
            self.driver.exec(
                &container_id,
                &argv,
                working_dir,
                timeout,
                self.max_output_bytes,
            )
        })
        .await?;

        self.registry.touch(user_id, session_id).await;

        info!(
            user_id,
            session_id,
            command = %truncate_for_log(command_line),
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            timed_out = result.timed_out,
            "command executed"
        );

        Ok(result)
    }

    fn ensure_command_allowed(&self, argv: &[String]) -> Result<(), ServiceError> {
        let binary = argv
            .first()
            .ok_or_else(|| ServiceError::command_not_allowed(""))?;
        // Whitelist on the basename, so "/bin/ls" and "ls" agree.
        let name = binary.rsplit('/').next().unwrap_or(binary).to_lowercase();
        if self.allowed_commands.contains(&name) {
            Ok(())
        } else {
            Err(ServiceError::command_not_allowed(binary.clone()))
        }
    }

    fn clamp_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let requested = requested_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        requested.clamp(Duration::from_secs(1), self.max_timeout)
    }
}

/// Splits a command line into argv with POSIX shell lexing rules.
fn parse_command(command_line: &str) -> Result<Vec<String>, ServiceError> {
    let argv = shell_words::split(command_line)
        .map_err(|_| ServiceError::command_not_allowed(command_line))?;
    if argv.is_empty() {
        return Err(ServiceError::command_not_allowed(command_line));
    }
    Ok(argv)
}

/// Working directories are confined to the writable mounts.
fn validate_working_dir(dir: &str) -> Result<(), ServiceError> {
    let allowed = dir == "/workspace"
        || dir.starts_with("/workspace/")
        || dir == "/tmp"
        || dir.starts_with("/tmp/");
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::path_invalid(format!(
            "working directory must be under /workspace or /tmp: {dir}"
        )))
    }
}

fn truncate_for_log(command: &str) -> &str {
    let end = command
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(command.len());
    &command[..end]
}
