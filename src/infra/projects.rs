use dirs::home_dir;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ResolveProjectsDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

/// Root of the on-disk session archive: `~/.claude/projects/`, one
/// subdirectory per project, one `<sessionId>.jsonl` per session.
pub fn resolve_projects_dir() -> Result<PathBuf, ResolveProjectsDirError> {
    if let Some(override_dir) = std::env::var_os("CLAUDE_PROJECTS_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let Some(home) = home_dir() else {
        return Err(ResolveProjectsDirError::HomeDirNotFound);
    };

    Ok(home.join(".claude").join("projects"))
}

#[derive(Debug, Error)]
pub enum ResolveDataDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

/// Where the metadata store lives: `~/.cui/`. The literal value
/// `":memory:"` selects a non-persistent store.
pub fn resolve_data_dir() -> Result<PathBuf, ResolveDataDirError> {
    if let Some(override_dir) = std::env::var_os("CUI_DATA_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let Some(home) = home_dir() else {
        return Err(ResolveDataDirError::HomeDirNotFound);
    };

    Ok(home.join(".cui"))
}

pub const DB_FILE_NAME: &str = "session-info.db";
pub const IN_MEMORY_DATA_DIR: &str = ":memory:";

/// Session logs live one level under the projects dir. Sub-task logs
/// (`agent-*.jsonl`) are excluded from indexing.
pub fn is_session_log(path: &Path) -> bool {
    if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
        return false;
    }
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    !file_name.starts_with("agent-")
}

#[derive(Clone, Debug, Default)]
pub struct SessionFileListing {
    pub files: Vec<PathBuf>,
    pub warnings: usize,
}

/// Enumerate candidate session logs: every non-`agent-` `*.jsonl` directly
/// inside each project subdirectory. Unreadable entries count as warnings
/// and do not abort the listing.
pub fn list_session_files(projects_dir: &Path) -> SessionFileListing {
    let mut listing = SessionFileListing::default();

    let entries = match fs::read_dir(projects_dir) {
        Ok(entries) => entries,
        Err(_) => {
            listing.warnings = 1;
            return listing;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else {
            listing.warnings += 1;
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            listing.warnings += 1;
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }

        let project_dir = entry.path();
        let files = match fs::read_dir(&project_dir) {
            Ok(files) => files,
            Err(_) => {
                listing.warnings += 1;
                continue;
            }
        };

        for file in files {
            let Ok(file) = file else {
                listing.warnings += 1;
                continue;
            };
            let path = file.path();
            if is_session_log(&path) {
                listing.files.push(path);
            }
        }
    }

    listing
}

/// Last-resort lookup for a session whose cached path is gone: walk the
/// projects tree for `<sessionId>.jsonl`.
pub fn find_session_file(projects_dir: &Path, session_id: &str) -> Option<PathBuf> {
    let wanted = format!("{session_id}.jsonl");
    let walker = WalkDir::new(projects_dir).follow_links(false).into_iter();
    for entry in walker {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_str() == Some(wanted.as_str()) && is_session_log(entry.path()) {
            return Some(entry.path().to_path_buf());
        }
    }
    None
}
