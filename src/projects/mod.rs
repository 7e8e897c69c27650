//! Project discovery
//!
//! A project is a directory under the configured projects root. It may or
//! may not have a live session whose id matches the directory name.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::registry::SessionRegistry;

/// Windows reserved device names, rejected in project names on every
/// platform so a registry synced across machines stays portable.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub name: String,
    pub path: PathBuf,
    pub has_session: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FolderInfo {
    pub name: String,
    pub path: PathBuf,
}

/// Validate a project/folder name: `[A-Za-z0-9_-]`, 1..=50 chars, not a
/// reserved device name. Returns the accepted name unchanged.
pub fn sanitize_project_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.len() > 50 {
        return None;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    if RESERVED_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
    {
        return None;
    }
    Some(name)
}

/// List directories under the projects root.
pub fn list_folders(root: &Path) -> Vec<FolderInfo> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut folders: Vec<FolderInfo> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            Some(FolderInfo {
                name,
                path: e.path(),
            })
        })
        .collect();
    folders.sort_by(|a, b| a.name.cmp(&b.name));
    folders
}

/// List folders annotated with live-session state from the registry.
pub fn list_projects(root: &Path, registry: &SessionRegistry) -> Vec<ProjectInfo> {
    let live: std::collections::HashSet<String> =
        registry.scan().into_iter().map(|r| r.id).collect();
    list_folders(root)
        .into_iter()
        .map(|f| ProjectInfo {
            has_session: live.contains(&f.name),
            name: f.name,
            path: f.path,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_simple_names() {
        assert_eq!(sanitize_project_name("my-project_2"), Some("my-project_2"));
        assert_eq!(sanitize_project_name("a"), Some("a"));
    }

    #[test]
    fn sanitize_rejects_bad_names() {
        assert_eq!(sanitize_project_name(""), None);
        assert_eq!(sanitize_project_name("has space"), None);
        assert_eq!(sanitize_project_name("dots.not.ok"), None);
        assert_eq!(sanitize_project_name("../escape"), None);
        assert_eq!(sanitize_project_name(&"x".repeat(51)), None);
    }

    #[test]
    fn sanitize_rejects_reserved_device_names() {
        assert_eq!(sanitize_project_name("CON"), None);
        assert_eq!(sanitize_project_name("con"), None);
        assert_eq!(sanitize_project_name("lpt1"), None);
        assert_eq!(sanitize_project_name("console"), Some("console"));
    }

    #[test]
    fn list_folders_skips_files_and_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();

        let folders = list_folders(dir.path());
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "web");
    }

    #[test]
    fn list_projects_marks_live_sessions() {
        use crate::protocol::SessionState;
        use crate::registry::{pipe_path, SessionRecord};
        use crate::util::now_ms;

        let projects = tempfile::tempdir().unwrap();
        std::fs::create_dir(projects.path().join("web")).unwrap();
        std::fs::create_dir(projects.path().join("api")).unwrap();

        let reg_dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(reg_dir.path().to_path_buf());
        registry
            .publish(&SessionRecord {
                id: "web".to_string(),
                cwd: projects.path().join("web"),
                pid: 1,
                pipe: pipe_path("web"),
                started: now_ms(),
                last_seen: now_ms(),
                client_count: 1,
                preview: String::new(),
                status: SessionState::Connected,
            })
            .unwrap();

        let listed = list_projects(projects.path(), &registry);
        assert_eq!(listed.len(), 2);
        let web = listed.iter().find(|p| p.name == "web").unwrap();
        let api = listed.iter().find(|p| p.name == "api").unwrap();
        assert!(web.has_session);
        assert!(!api.has_session);
    }
}
