use crate::domain::{
    ConversationMessage, filter_visible_messages, reconstruct_chain,
};
use crate::infra::projects::find_session_file;
use crate::infra::store::{SessionStore, StoreError};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationReadError {
    #[error("no session or log file for id: {0}")]
    NotFound(String),

    #[error("session log file is gone: {0}")]
    FileMissing(String),

    #[error("failed to read session file: {0}")]
    Io(#[from] io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Detail read for one session: locate the log (index-cached path first,
/// directory walk as fallback), parse its user/assistant entries, rebuild
/// the conversation order and drop tool-result plumbing.
///
/// Nothing is cached across calls; callers who need caching layer it on top.
pub fn fetch_conversation(
    store: &SessionStore,
    projects_dir: &Path,
    session_id: &str,
) -> Result<Vec<ConversationMessage>, ConversationReadError> {
    let record = store.get(session_id)?;

    let cached_path = record.as_ref().and_then(|r| r.file_path.clone());
    let path = match cached_path {
        Some(path) if path.is_file() => path,
        _ => match find_session_file(projects_dir, session_id) {
            Some(path) => path,
            None if record.is_some() => {
                return Err(ConversationReadError::FileMissing(session_id.to_string()));
            }
            None => return Err(ConversationReadError::NotFound(session_id.to_string())),
        },
    };

    let entries = read_entries(&path)?;
    Ok(filter_visible_messages(reconstruct_chain(entries)))
}

/// All user/assistant entries of a session log, in file order. Same
/// line-stream tolerance as the scanner: malformed lines and a truncated
/// tail are skipped, never fatal.
pub fn read_entries(path: &Path) -> io::Result<Vec<ConversationMessage>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    for line_result in reader.lines() {
        let Ok(line) = line_result else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if !matches!(
            value.get("type").and_then(Value::as_str),
            Some("user") | Some("assistant")
        ) {
            continue;
        }
        let Ok(message) = serde_json::from_value::<ConversationMessage>(value) else {
            continue;
        };
        entries.push(message);
    }

    Ok(entries)
}
