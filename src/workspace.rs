//! Workspace file storage and access checks
//!
//! Hosted sites serve local mappings out of a user's workspace. The hosting
//! pipeline only needs two things from the storage layer: find a readable
//! file for a workspace-relative path, and tell whether a user may read a
//! workspace. Both are traits so the router can be driven by other backends.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File served for a directory request
const WELCOME_FILE: &str = "index.html";

/// Errors that can occur while locating workspace files
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A workspace file ready to be served
#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    /// Full path on disk
    pub path: PathBuf,
    /// MIME type derived from the extension
    pub content_type: &'static str,
    /// Size in bytes
    pub size: u64,
}

/// File-storage collaborator
pub trait WorkspaceStore: Send + Sync {
    /// Locate `path` (workspace-relative, `/`-separated) inside `workspace_id`.
    ///
    /// Directories resolve to their welcome file.
    fn locate(&self, workspace_id: &str, path: &str) -> Result<WorkspaceFile, WorkspaceError>;
}

/// Authorization collaborator
pub trait AccessControl: Send + Sync {
    /// Whether `user_id` may read the resource at `location`
    /// (as produced by [`resource_location`])
    fn can_read(&self, user_id: &str, location: &str) -> bool;
}

/// Kinds of server resource a workspace path can be addressed as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// A file or folder: `/file/<workspace path>`
    File,
    /// A whole workspace: `/workspace/<workspace id>`
    Workspace,
}

impl LocationKind {
    fn marker(self) -> &'static str {
        match self {
            LocationKind::File => "file",
            LocationKind::Workspace => "workspace",
        }
    }

    /// Leading segments of the path that identify the resource; `None` keeps all
    fn kept_segments(self) -> Option<usize> {
        match self {
            LocationKind::File => None,
            LocationKind::Workspace => Some(1),
        }
    }
}

/// Server location of `path` addressed as `kind`.
///
/// `resource_location(File, "/projA/index.html")` is `/file/projA/index.html`,
/// `resource_location(Workspace, "ws1/projA")` is `/workspace/ws1`.
pub fn resource_location(kind: LocationKind, path: &str) -> String {
    let segments = path.split('/').filter(|s| !s.is_empty());
    let segments: Vec<&str> = match kind.kept_segments() {
        Some(n) => segments.take(n).collect(),
        None => segments.collect(),
    };
    if segments.is_empty() {
        format!("/{}", kind.marker())
    } else {
        format!("/{}/{}", kind.marker(), segments.join("/"))
    }
}

/// Workspaces stored as directories on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsWorkspaceStore {
    roots: HashMap<String, PathBuf>,
}

impl FsWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workspace root (builder pattern)
    pub fn with_workspace(mut self, workspace_id: &str, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(workspace_id.to_string(), root.into());
        self
    }

    pub fn root(&self, workspace_id: &str) -> Option<&Path> {
        self.roots.get(workspace_id).map(PathBuf::as_path)
    }
}

impl WorkspaceStore for FsWorkspaceStore {
    fn locate(&self, workspace_id: &str, path: &str) -> Result<WorkspaceFile, WorkspaceError> {
        let root = self
            .roots
            .get(workspace_id)
            .ok_or_else(|| WorkspaceError::UnknownWorkspace(workspace_id.to_string()))?;

        let relative = relative_path(path)?;
        let root_canonical = root.canonicalize()?;
        let canonical = root_canonical
            .join(&relative)
            .canonicalize()
            .map_err(|_| WorkspaceError::NotFound(path.to_string()))?;

        // Symlinks may still point outside the workspace
        if !canonical.starts_with(&root_canonical) {
            return Err(WorkspaceError::PathTraversal(path.to_string()));
        }

        let target = if canonical.is_dir() {
            let welcome = canonical.join(WELCOME_FILE);
            if !welcome.is_file() {
                return Err(WorkspaceError::NotFound(path.to_string()));
            }
            welcome
        } else if canonical.is_file() {
            canonical
        } else {
            return Err(WorkspaceError::NotFound(path.to_string()));
        };

        let size = std::fs::metadata(&target)?.len();
        let content_type = target
            .extension()
            .and_then(|e| e.to_str())
            .map(content_type_for)
            .unwrap_or(DEFAULT_CONTENT_TYPE);

        Ok(WorkspaceFile {
            path: target,
            content_type,
            size,
        })
    }
}

/// Turn a `/`-separated workspace path into a relative filesystem path
fn relative_path(path: &str) -> Result<PathBuf, WorkspaceError> {
    if path.contains('\0') {
        return Err(WorkspaceError::PathTraversal(path.to_string()));
    }
    let mut relative = PathBuf::new();
    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment == ".." || segment.contains('\\') {
            return Err(WorkspaceError::PathTraversal(path.to_string()));
        }
        relative.push(segment);
    }
    Ok(relative)
}

/// Read access per workspace, as configured
#[derive(Debug, Clone, Default)]
pub struct WorkspaceAccess {
    readers: HashMap<String, HashSet<String>>,
}

impl WorkspaceAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `user_id` read access to `workspace_id`
    pub fn grant(&mut self, workspace_id: &str, user_id: &str) {
        self.readers
            .entry(workspace_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }
}

impl AccessControl for WorkspaceAccess {
    fn can_read(&self, user_id: &str, location: &str) -> bool {
        let mut segments = location.split('/').filter(|s| !s.is_empty());
        let workspace_id = match (segments.next(), segments.next()) {
            (Some("workspace"), Some(id)) => id,
            _ => return false,
        };
        self.readers
            .get(workspace_id)
            .is_some_and(|users| users.contains(user_id))
    }
}

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// MIME type for a file extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, FsWorkspaceStore) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("projA/docs")).unwrap();
        fs::write(dir.path().join("projA/index.html"), "<h1>hi</h1>").unwrap();
        fs::write(dir.path().join("projA/docs/readme.md"), "# readme").unwrap();
        let store = FsWorkspaceStore::new().with_workspace("ws1", dir.path());
        (dir, store)
    }

    #[test]
    fn test_locate_file() {
        let (_dir, store) = workspace();
        let file = store.locate("ws1", "/projA/docs/readme.md").unwrap();

        assert!(file.path.ends_with("projA/docs/readme.md"));
        assert_eq!(file.content_type, "text/plain; charset=utf-8");
        assert_eq!(file.size, 8);
    }

    #[test]
    fn test_locate_directory_serves_welcome_file() {
        let (_dir, store) = workspace();
        let file = store.locate("ws1", "/projA").unwrap();

        assert!(file.path.ends_with("projA/index.html"));
        assert_eq!(file.content_type, "text/html; charset=utf-8");
    }

    #[test]
    fn test_locate_directory_without_welcome_file() {
        let (_dir, store) = workspace();
        assert!(matches!(
            store.locate("ws1", "/projA/docs"),
            Err(WorkspaceError::NotFound(_))
        ));
    }

    #[test]
    fn test_locate_missing() {
        let (_dir, store) = workspace();
        assert!(matches!(
            store.locate("ws1", "/projA/nope.html"),
            Err(WorkspaceError::NotFound(_))
        ));
        assert!(matches!(
            store.locate("ws2", "/projA/index.html"),
            Err(WorkspaceError::UnknownWorkspace(_))
        ));
    }

    #[test]
    fn test_locate_rejects_traversal() {
        let (_dir, store) = workspace();
        assert!(matches!(
            store.locate("ws1", "/projA/../../etc/passwd"),
            Err(WorkspaceError::PathTraversal(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_rejects_symlink_escape() {
        let (dir, store) = workspace();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        assert!(matches!(
            store.locate("ws1", "/link/secret.txt"),
            Err(WorkspaceError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_resource_location() {
        assert_eq!(
            resource_location(LocationKind::File, "/projA/index.html"),
            "/file/projA/index.html"
        );
        assert_eq!(resource_location(LocationKind::Workspace, "ws1"), "/workspace/ws1");
        assert_eq!(
            resource_location(LocationKind::Workspace, "/ws1/projA/x"),
            "/workspace/ws1"
        );
        assert_eq!(resource_location(LocationKind::File, "/"), "/file");
    }

    #[test]
    fn test_workspace_access() {
        let mut access = WorkspaceAccess::new();
        access.grant("ws1", "alice");

        assert!(access.can_read("alice", "/workspace/ws1"));
        assert!(!access.can_read("bob", "/workspace/ws1"));
        assert!(!access.can_read("alice", "/workspace/ws2"));
        assert!(!access.can_read("alice", "/file/ws1"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("HTML"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("unknown"), "application/octet-stream");
    }
}
