//! Workspace file access scoped to `/workspace` inside session containers.
//!
//! Every supplied path is canonicalized before any engine call: absolute
//! paths and `..` components are rejected outright, so a request can never
//! name anything outside the workspace mount. Listings and deletes go
//! through execs; reads and writes go through the engine's archive API.

use base64::Engine as _;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::driver::{ContainerDriver, DriverError, FileRead};
use crate::error::ServiceError;
use crate::registry::SessionRegistry;

/// Workspace mount point inside the container.
const WORKSPACE_ROOT: &str = "/workspace";

/// Deadline for the short execs (`ls`, `rm`) the gateway issues.
const WORKSPACE_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Output cap for workspace exec listings.
const WORKSPACE_EXEC_OUTPUT: usize = 1024 * 1024;

/// Owner for files written into the workspace, matching the container user.
const FILE_UID: u64 = 1000;
const FILE_GID: u64 = 1000;

/// One directory entry from a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// File contents with the encoding the bytes required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContent {
    pub content: String,
    pub encoding: ContentEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Utf8,
    Base64,
}

/// File operations against a session's `/workspace`.
pub struct WorkspaceGateway {
    registry: Arc<SessionRegistry>,
    driver: Arc<dyn ContainerDriver>,
    max_file_size: u64,
}

impl WorkspaceGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        driver: Arc<dyn ContainerDriver>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            driver,
            max_file_size: config.workspace.max_file_size_bytes,
        }
    }

    /// Lists entries at `path` (relative to the workspace root; empty
    /// means the root itself).
    pub async fn list(
        &self,
        user_id: &str,
        session_id: &str,
        path: &str,
    ) -> Result<Vec<WorkspaceEntry>, ServiceError> {
        let rel = normalize_path(path)?;
        let abs = absolute_path(&rel);
        let container_id = self.registry.resolve_or_create(user_id, session_id).await?;

        let argv: Vec<String> = ["ls", "-1Ap", &abs].iter().map(|s| s.to_string()).collect();
        let result = self
            .driver
            .exec(
                &container_id,
                &argv,
                WORKSPACE_ROOT,
                WORKSPACE_EXEC_TIMEOUT,
                WORKSPACE_EXEC_OUTPUT,
            )
            .await?;

        if result.exit_code != 0 {
            return Err(map_exec_failure(&result.stderr, &rel, "list failed"));
        }

        let listing = String::from_utf8_lossy(&result.stdout);
        let mut entries: Vec<WorkspaceEntry> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.strip_suffix('/') {
                Some(name) => WorkspaceEntry {
                    name: name.to_string(),
                    kind: EntryKind::Dir,
                },
                None => WorkspaceEntry {
                    name: line.to_string(),
                    kind: EntryKind::File,
                },
            })
            .collect();
        entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(entries)
    }

    /// Reads the file at `path`, returning UTF-8 text when possible and
    /// base64 otherwise.
    pub async fn read(
        &self,
        user_id: &str,
        session_id: &str,
        path: &str,
    ) -> Result<FileContent, ServiceError> {
        let rel = normalize_path(path)?;
        if rel.is_empty() {
            return Err(ServiceError::path_invalid("a file path is required"));
        }
        let container_id = self.registry.resolve_or_create(user_id, session_id).await?;

        let read = self
            .driver
            .read_file(&container_id, &absolute_path(&rel), self.max_file_size)
            .await
            .map_err(|e| match e {
                DriverError::NotFound { .. } => ServiceError::path_not_found(rel.clone()),
                other => other.into(),
            })?;

        match read {
            FileRead::Contents(bytes) => Ok(encode_content(bytes)),
            FileRead::TooLarge { size } => Err(ServiceError::SizeLimitExceeded {
                size,
                limit: self.max_file_size,
            }),
            FileRead::NotAFile => Err(ServiceError::path_invalid(format!(
                "path is a directory: {rel}"
            ))),
        }
    }

    /// Writes `data` to the file at `path`, creating parent directories.
    pub async fn write(
        &self,
        user_id: &str,
        session_id: &str,
        path: &str,
        data: &[u8],
    ) -> Result<(), ServiceError> {
        let rel = normalize_path(path)?;
        if rel.is_empty() {
            return Err(ServiceError::path_invalid("a file path is required"));
        }
        if self.max_file_size > 0 && data.len() as u64 > self.max_file_size {
            return Err(ServiceError::SizeLimitExceeded {
                size: data.len() as u64,
                limit: self.max_file_size,
            });
        }

        let container_id = self.registry.resolve_or_create(user_id, session_id).await?;
        let archive = build_file_archive(&rel, data)
            .map_err(|e| ServiceError::internal(format!("failed to build archive: {e}")))?;
        self.driver
            .put_archive(&container_id, WORKSPACE_ROOT, archive)
            .await?;
        Ok(())
    }

    /// Deletes the file or directory at `path`. The workspace root itself
    /// cannot be deleted.
    pub async fn delete(
        &self,
        user_id: &str,
        session_id: &str,
        path: &str,
    ) -> Result<(), ServiceError> {
        let rel = normalize_path(path)?;
        if rel.is_empty() {
            return Err(ServiceError::path_invalid("cannot delete the workspace root"));
        }
        let abs = absolute_path(&rel);
        let container_id = self.registry.resolve_or_create(user_id, session_id).await?;

        let argv: Vec<String> = ["rm", "-rf", "--one-file-system", &abs]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = self
            .driver
            .exec(
                &container_id,
                &argv,
                WORKSPACE_ROOT,
                WORKSPACE_EXEC_TIMEOUT,
                WORKSPACE_EXEC_OUTPUT,
            )
            .await?;

        if result.exit_code != 0 {
            return Err(map_exec_failure(&result.stderr, &rel, "delete failed"));
        }
        Ok(())
    }
}

/// Normalizes a workspace-relative path.
///
/// Absolute paths and any `..` component are rejected; `.` and empty
/// components are dropped. Returns the cleaned relative path, empty for
/// the workspace root.
pub fn normalize_path(path: &str) -> Result<String, ServiceError> {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        return Err(ServiceError::path_invalid(format!(
            "path must be relative to the workspace: {path}"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in trimmed.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(ServiceError::path_invalid(format!(
                    "path escapes the workspace: {path}"
                )))
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

fn absolute_path(rel: &str) -> String {
    if rel.is_empty() {
        WORKSPACE_ROOT.to_string()
    } else {
        format!("{WORKSPACE_ROOT}/{rel}")
    }
}

fn encode_content(bytes: Vec<u8>) -> FileContent {
    match String::from_utf8(bytes) {
        Ok(text) => FileContent {
            content: text,
            encoding: ContentEncoding::Utf8,
        },
        Err(err) => FileContent {
            content: base64::engine::general_purpose::STANDARD.encode(err.into_bytes()),
            encoding: ContentEncoding::Base64,
        },
    }
}

fn map_exec_failure(stderr: &[u8], rel: &str, fallback: &str) -> ServiceError {
    let message = String::from_utf8_lossy(stderr);
    let lower = message.to_lowercase();
    if lower.contains("no such file") || lower.contains("not found") {
        ServiceError::path_not_found(rel.to_string())
    } else {
        let detail = message.trim();
        ServiceError::internal(if detail.is_empty() {
            fallback.to_string()
        } else {
            detail.to_string()
        })
    }
}

/// Builds an in-memory tar containing the single file plus headers for
/// its parent directories (dirs 0755, file 0644, owner 1000:1000).
pub fn build_file_archive(rel: &str, data: &[u8]) -> std::io::Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;

    let components: Vec<&str> = rel.split('/').collect();
    let mut prefix = String::new();
    for dir in &components[..components.len() - 1] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(dir);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_uid(FILE_UID);
        header.set_gid(FILE_GID);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.append_data(&mut header, format!("{prefix}/"), std::io::empty())?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(FILE_UID);
    header.set_gid(FILE_GID);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, rel, data)?;

    builder.finish()?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// Strips path components and special characters from a client-supplied
/// upload filename, falling back to "upload".
pub fn sanitize_upload_filename(filename: &str) -> String {
    let base = filename
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .to_string();
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "upload".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::kv::MemoryKv;

    fn gateway() -> (WorkspaceGateway, Arc<MockDriver>) {
        gateway_with_limit(1024 * 1024)
    }

    fn gateway_with_limit(limit: u64) -> (WorkspaceGateway, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new());
        let kv = Arc::new(MemoryKv::new());
        let mut config = Config::default();
        config.workspace.max_file_size_bytes = limit;
        let registry = Arc::new(
            SessionRegistry::new(
                Arc::clone(&driver) as Arc<dyn ContainerDriver>,
                kv,
                config.clone(),
            )
            .unwrap(),
        );
        let gateway = WorkspaceGateway::new(registry, Arc::clone(&driver) as _, &config);
        (gateway, driver)
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        for path in ["../x", "a/../../b", "/etc/passwd", "./../"] {
            let err = normalize_path(path).unwrap_err();
            assert!(
                matches!(err, ServiceError::PathInvalid { .. }),
                "expected rejection for {path:?}"
            );
        }
    }

    #[test]
    fn test_normalize_cleans_components() {
        assert_eq!(normalize_path("").unwrap(), "");
        assert_eq!(normalize_path("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(normalize_path("./a/./b").unwrap(), "a/b");
        assert_eq!(normalize_path("a//b/").unwrap(), "a/b");
        assert_eq!(normalize_path("  a/b  ").unwrap(), "a/b");
    }

    #[test]
    fn test_absolute_path() {
        assert_eq!(absolute_path(""), "/workspace");
        assert_eq!(absolute_path("a/b"), "/workspace/a/b");
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (gateway, _driver) = gateway();
        gateway
            .write("alice", "s1", "a/b.txt", b"data")
            .await
            .unwrap();

        let content = gateway.read("alice", "s1", "a/b.txt").await.unwrap();
        assert_eq!(content.content, "data");
        assert_eq!(content.encoding, ContentEncoding::Utf8);
    }

    #[tokio::test]
    async fn test_read_binary_returns_base64() {
        let (gateway, driver) = gateway();
        // Resolve the session container first, then seed raw bytes.
        gateway.write("alice", "s1", "seed.txt", b"x").await.unwrap();
        let cid = driver.container_ids().remove(0);
        let raw = [0xffu8, 0xfe, 0x00, 0x41];
        driver.seed_file(&cid, "blob.bin", &raw);

        let content = gateway.read("alice", "s1", "blob.bin").await.unwrap();
        assert_eq!(content.encoding, ContentEncoding::Base64);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(content.content)
            .unwrap();
        assert_eq!(decoded, raw);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let (gateway, _driver) = gateway();
        let err = gateway.read("alice", "s1", "missing.txt").await.unwrap_err();
        assert!(matches!(err, ServiceError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_read_directory_is_invalid() {
        let (gateway, _driver) = gateway();
        gateway
            .write("alice", "s1", "dir/file.txt", b"x")
            .await
            .unwrap();
        let err = gateway.read("alice", "s1", "dir").await.unwrap_err();
        assert!(matches!(err, ServiceError::PathInvalid { .. }));
    }

    #[tokio::test]
    async fn test_write_over_limit_rejected() {
        let (gateway, driver) = gateway_with_limit(8);
        let err = gateway
            .write("alice", "s1", "big.txt", b"way too much data")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SizeLimitExceeded { .. }));
        // Rejected before the engine was asked to do anything.
        assert_eq!(driver.create_count(), 0);
    }

    #[tokio::test]
    async fn test_read_over_limit_rejected() {
        let (gateway, driver) = gateway_with_limit(8);
        gateway.write("alice", "s1", "ok.txt", b"fine").await.unwrap();
        let cid = driver.container_ids().remove(0);
        driver.seed_file(&cid, "big.bin", &[0u8; 64]);

        let err = gateway.read("alice", "s1", "big.bin").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::SizeLimitExceeded { size: 64, limit: 8 }
        ));
    }

    #[tokio::test]
    async fn test_zero_limit_disables_size_check() {
        let (gateway, _driver) = gateway_with_limit(0);
        let big = vec![b'x'; 4 * 1024 * 1024];
        gateway.write("alice", "s1", "big.txt", &big).await.unwrap();
        let content = gateway.read("alice", "s1", "big.txt").await.unwrap();
        assert_eq!(content.content.len(), big.len());
    }

    #[tokio::test]
    async fn test_list_after_write() {
        let (gateway, _driver) = gateway();
        gateway
            .write("alice", "s4", "a/b.txt", b"data")
            .await
            .unwrap();

        let entries = gateway.list("alice", "s4", "a").await.unwrap();
        assert_eq!(
            entries,
            vec![WorkspaceEntry {
                name: "b.txt".to_string(),
                kind: EntryKind::File,
            }]
        );

        let root = gateway.list("alice", "s4", "").await.unwrap();
        assert_eq!(
            root,
            vec![WorkspaceEntry {
                name: "a".to_string(),
                kind: EntryKind::Dir,
            }]
        );
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_not_found() {
        let (gateway, _driver) = gateway();
        gateway.write("alice", "s1", "x.txt", b"x").await.unwrap();
        let err = gateway.list("alice", "s1", "nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::PathNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let (gateway, driver) = gateway();
        gateway.write("alice", "s1", "a/b.txt", b"x").await.unwrap();
        gateway.delete("alice", "s1", "a").await.unwrap();

        let cid = driver.container_ids().remove(0);
        assert!(driver.file(&cid, "a/b.txt").is_none());
    }

    #[tokio::test]
    async fn test_delete_root_rejected() {
        let (gateway, _driver) = gateway();
        for path in ["", ".", "./"] {
            let err = gateway.delete("alice", "s1", path).await.unwrap_err();
            assert!(matches!(err, ServiceError::PathInvalid { .. }));
        }
    }

    #[test]
    fn test_archive_layout() {
        let archive = build_file_archive("a/b/c.txt", b"hello").unwrap();
        let mut tar = tar::Archive::new(archive.as_ref());

        let mut seen = Vec::new();
        for entry in tar.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            assert_eq!(header.uid().unwrap(), 1000);
            assert_eq!(header.gid().unwrap(), 1000);
            if header.entry_type().is_dir() {
                assert_eq!(header.mode().unwrap() & 0o777, 0o755);
            } else {
                assert_eq!(header.mode().unwrap() & 0o777, 0o644);
                assert_eq!(header.size().unwrap(), 5);
            }
            seen.push(path);
        }
        assert_eq!(seen, vec!["a/", "a/b/", "a/b/c.txt"]);
    }

    #[test]
    fn test_sanitize_upload_filename() {
        assert_eq!(sanitize_upload_filename("report.txt"), "report.txt");
        assert_eq!(sanitize_upload_filename("dir/report.txt"), "report.txt");
        assert_eq!(sanitize_upload_filename("c:\\x\\evil.sh"), "evil.sh");
        assert_eq!(sanitize_upload_filename("we ird$name"), "we_ird_name");
        assert_eq!(sanitize_upload_filename(""), "upload");
        assert_eq!(sanitize_upload_filename("///"), "upload");
    }
}
