//! Configuration file parsing for `sandboxd.toml`.
//!
//! Handles loading and parsing of service configuration including session
//! TTLs, container resource limits, the command whitelist, cleanup cadence,
//! and workspace policy. Every option can also be overridden through an
//! environment variable so deployments can run without a config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "sandboxd.toml";

/// Top-level sandboxd configuration loaded from `sandboxd.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Per-user rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Session lifetime settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Container image and resource limits.
    #[serde(default)]
    pub container: ContainerConfig,
    /// Command execution settings.
    #[serde(default)]
    pub exec: ExecConfig,
    /// Cleanup worker settings.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Workspace file access settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the API listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Authentication configuration: static API keys and/or JWT bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Comma-separated API keys accepted in the `X-API-Key` header.
    /// Empty disables API-key auth.
    #[serde(default)]
    pub api_keys: String,

    /// HMAC secret for verifying `Authorization: Bearer` JWTs (HS256).
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_keys: String::new(),
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl AuthConfig {
    /// Parses the comma-separated key list into a set.
    pub fn api_key_set(&self) -> HashSet<String> {
        self.api_keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn default_jwt_secret() -> String {
    "change-me-in-production".to_string()
}

/// Fixed-window per-user rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    #[serde(default = "default_rate_requests")]
    pub requests: u64,

    /// Window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_rate_requests(),
            window_seconds: default_rate_window(),
        }
    }
}

fn default_rate_requests() -> u64 {
    100
}

fn default_rate_window() -> u64 {
    60
}

/// Session lifetime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding TTL in seconds for session-to-container bindings.
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

fn default_session_ttl() -> u64 {
    600
}

/// Container image and resource limit configuration.
///
/// The hardening profile itself (read-only rootfs, dropped capabilities,
/// no network, unprivileged user) is not configurable; only the knobs
/// below are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image reference used for session containers, taken verbatim.
    #[serde(default = "default_image")]
    pub image: String,

    /// Memory limit (e.g. "256m", "1g").
    #[serde(default = "default_mem_limit")]
    pub mem_limit: String,

    /// CPU quota as a percentage of one CPU (50 = half a core).
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota_percent: u64,

    /// Maximum number of processes inside the container.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Size cap for the `/tmp` tmpfs (e.g. "64m").
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_tmp_size: String,

    /// Size cap for the `/workspace` tmpfs when volumes are not persisted.
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_workspace_size: String,

    /// Soft limit for open file descriptors.
    #[serde(default = "default_nofile_soft")]
    pub ulimit_nofile_soft: i64,

    /// Hard limit for open file descriptors.
    #[serde(default = "default_nofile_hard")]
    pub ulimit_nofile_hard: i64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            mem_limit: default_mem_limit(),
            cpu_quota_percent: default_cpu_quota(),
            pids_limit: default_pids_limit(),
            tmpfs_tmp_size: default_tmpfs_size(),
            tmpfs_workspace_size: default_tmpfs_size(),
            ulimit_nofile_soft: default_nofile_soft(),
            ulimit_nofile_hard: default_nofile_hard(),
        }
    }
}

fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_mem_limit() -> String {
    "256m".to_string()
}

fn default_cpu_quota() -> u64 {
    50
}

fn default_pids_limit() -> i64 {
    128
}

fn default_tmpfs_size() -> String {
    "64m".to_string()
}

fn default_nofile_soft() -> i64 {
    1024
}

fn default_nofile_hard() -> i64 {
    2048
}

/// Command execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Timeout applied when the request does not specify one.
    #[serde(default = "default_exec_timeout")]
    pub default_timeout_seconds: u64,

    /// Upper bound for per-request timeouts.
    #[serde(default = "default_max_exec_timeout")]
    pub max_timeout_seconds: u64,

    /// Comma-separated binaries allowed as `argv[0]`.
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: String,

    /// Per-stream cap on captured stdout/stderr bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_exec_timeout(),
            max_timeout_seconds: default_max_exec_timeout(),
            allowed_commands: default_allowed_commands(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl ExecConfig {
    /// Parses the whitelist into a lowercase set of binary names.
    pub fn allowed_command_set(&self) -> HashSet<String> {
        self.allowed_commands
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_max_exec_timeout() -> u64 {
    120
}

fn default_allowed_commands() -> String {
    "ls,cat,echo,pwd,id,whoami,sh,bash,\
     python,python3,pip,pip3,\
     git,curl,wget,\
     mkdir,cp,mv,rm,grep,find,head,tail,sort,uniq,xargs,env,basename,dirname,\
     test,diff,patch,tar"
        .to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

/// Cleanup worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between reaper passes.
    #[serde(default = "default_cleanup_interval")]
    pub interval_seconds: u64,

    /// Containers older than this are removed.
    #[serde(default = "default_max_container_age")]
    pub max_container_age_seconds: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_cleanup_interval(),
            max_container_age_seconds: default_max_container_age(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_max_container_age() -> u64 {
    900
}

/// Workspace file access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Maximum bytes per workspace read/write. 0 disables the limit.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Mount `/workspace` from a named volume that outlives the container.
    #[serde(default)]
    pub persist_volumes: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            persist_volumes: false,
        }
    }
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}

impl Config {
    /// Load configuration: `sandboxd.toml` in the given directory if present,
    /// then environment variable overrides on top.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(dir)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn load_file(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Applies environment-style overrides from the given lookup function.
    ///
    /// Unparseable values are ignored so a stray variable cannot take the
    /// service down; the file/default value stays in effect.
    pub fn apply_overrides<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn set_u64(target: &mut u64, value: Option<String>) {
            if let Some(v) = value.and_then(|v| v.parse().ok()) {
                *target = v;
            }
        }
        fn set_i64(target: &mut i64, value: Option<String>) {
            if let Some(v) = value.and_then(|v| v.parse().ok()) {
                *target = v;
            }
        }
        fn set_string(target: &mut String, value: Option<String>) {
            if let Some(v) = value {
                *target = v;
            }
        }

        set_u64(&mut self.session.ttl_seconds, get("SESSION_TTL_SECONDS"));
        set_string(&mut self.container.image, get("CONTAINER_IMAGE"));
        set_string(&mut self.container.mem_limit, get("CONTAINER_MEM_LIMIT"));
        set_u64(
            &mut self.container.cpu_quota_percent,
            get("CONTAINER_CPU_QUOTA"),
        );
        set_i64(&mut self.container.pids_limit, get("CONTAINER_PIDS_LIMIT"));
        set_u64(
            &mut self.exec.default_timeout_seconds,
            get("DEFAULT_EXEC_TIMEOUT_SECONDS"),
        );
        set_string(&mut self.exec.allowed_commands, get("ALLOWED_COMMANDS"));
        set_u64(
            &mut self.cleanup.interval_seconds,
            get("CLEANUP_INTERVAL_SECONDS"),
        );
        set_u64(
            &mut self.cleanup.max_container_age_seconds,
            get("CLEANUP_MAX_CONTAINER_AGE_SECONDS"),
        );
        set_u64(
            &mut self.workspace.max_file_size_bytes,
            get("WORKSPACE_MAX_FILE_SIZE_BYTES"),
        );
        if let Some(v) = get("WORKSPACE_PERSIST_VOLUMES") {
            match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.workspace.persist_volumes = true,
                "0" | "false" | "no" | "off" => self.workspace.persist_volumes = false,
                _ => {}
            }
        }
        set_string(&mut self.auth.api_keys, get("API_KEYS"));
        set_string(&mut self.auth.jwt_secret, get("JWT_SECRET"));
        set_u64(&mut self.rate_limit.requests, get("RATE_LIMIT_REQUESTS"));
        set_u64(
            &mut self.rate_limit.window_seconds,
            get("RATE_LIMIT_WINDOW_SECONDS"),
        );
        set_string(&mut self.server.bind_addr, get("BIND_ADDR"));
    }

    /// Parse the memory limit string (e.g. "256m", "1g") to bytes.
    pub fn mem_limit_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.container.mem_limit)
    }
}

/// Parse memory limit string (e.g. "8g", "512m") to bytes.
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        let kilos: i64 = num.parse().context("Invalid memory limit")?;
        Ok(kilos * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.ttl_seconds, 600);
        assert_eq!(config.container.image, "python:3.12-slim");
        assert_eq!(config.container.pids_limit, 128);
        assert_eq!(config.exec.default_timeout_seconds, 30);
        assert_eq!(config.cleanup.max_container_age_seconds, 900);
        assert_eq!(config.workspace.max_file_size_bytes, 1024 * 1024);
        assert!(!config.workspace.persist_volumes);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[session]
ttl_seconds = 120

[container]
image = "alpine:3.20"
mem_limit = "128m"
cpu_quota_percent = 25

[exec]
allowed_commands = "echo,ls"

[workspace]
persist_volumes = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.session.ttl_seconds, 120);
        assert_eq!(config.container.image, "alpine:3.20");
        assert_eq!(config.container.cpu_quota_percent, 25);
        assert!(config.workspace.persist_volumes);
        let allowed = config.exec.allowed_command_set();
        assert_eq!(allowed.len(), 2);
        assert!(allowed.contains("echo"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "SESSION_TTL_SECONDS" => Some("42".to_string()),
            "CONTAINER_IMAGE" => Some("alpine:latest".to_string()),
            "WORKSPACE_PERSIST_VOLUMES" => Some("true".to_string()),
            "ALLOWED_COMMANDS" => Some("echo".to_string()),
            _ => None,
        });
        assert_eq!(config.session.ttl_seconds, 42);
        assert_eq!(config.container.image, "alpine:latest");
        assert!(config.workspace.persist_volumes);
        assert_eq!(config.exec.allowed_command_set().len(), 1);
    }

    #[test]
    fn test_env_override_bad_value_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "SESSION_TTL_SECONDS" => Some("not-a-number".to_string()),
            "WORKSPACE_PERSIST_VOLUMES" => Some("maybe".to_string()),
            _ => None,
        });
        assert_eq!(config.session.ttl_seconds, 600);
        assert!(!config.workspace.persist_volumes);
    }

    #[test]
    fn test_allowed_command_set_lowercases() {
        let exec = ExecConfig {
            allowed_commands: "Echo, LS ,cat".to_string(),
            ..ExecConfig::default()
        };
        let set = exec.allowed_command_set();
        assert!(set.contains("echo"));
        assert!(set.contains("ls"));
        assert!(set.contains("cat"));
    }

    #[test]
    fn test_api_key_set() {
        let auth = AuthConfig {
            api_keys: "key-one, key-two,,".to_string(),
            ..AuthConfig::default()
        };
        let keys = auth.api_key_set();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("key-one"));
    }

    #[test]
    fn test_parse_memory_limit_gigabytes() {
        assert_eq!(parse_memory_limit("8g").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_limit_megabytes() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256M").unwrap(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_limit_bytes() {
        assert_eq!(parse_memory_limit("1073741824").unwrap(), 1_073_741_824);
    }

    #[test]
    fn test_parse_memory_limit_invalid() {
        assert!(parse_memory_limit("invalid").is_err());
        assert!(parse_memory_limit("abc").is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_file(dir.path()).unwrap();
        assert_eq!(config.session.ttl_seconds, 600);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sandboxd.toml"),
            "[session]\nttl_seconds = 7\n",
        )
        .unwrap();
        let config = Config::load_file(dir.path()).unwrap();
        assert_eq!(config.session.ttl_seconds, 7);
    }
}
