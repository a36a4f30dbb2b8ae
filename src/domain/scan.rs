use crate::domain::IndexedMetadata;
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const FALLBACK_SUMMARY_MAX_CHARS: usize = 100;

/// Streaming scan of one session log.
///
/// Reads the file line by line; malformed lines are skipped (the writer may
/// be mid-append), a truncated tail ends the scan without error. Entries
/// with `isSidechain: true` are ignored entirely. Returns `None` when the
/// file yields no user/assistant messages and no summary entry.
pub fn scan_session_file(path: &Path, mtime_ms: i64) -> io::Result<Option<IndexedMetadata>> {
    let Some(session_id) = file_stem_string(path) else {
        return Ok(None);
    };

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut summary: Option<String> = None;
    let mut fallback_summary: Option<String> = None;
    let mut project_path: Option<String> = None;
    let mut model: Option<String> = None;
    let mut first_timestamp: Option<String> = None;
    let mut last_timestamp: Option<String> = None;
    let mut message_count = 0u64;
    let mut total_duration_ms = 0u64;

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

        if value.get("isSidechain").and_then(Value::as_bool) == Some(true) {
            continue;
        }

        if let Some(timestamp) = value.get("timestamp").and_then(Value::as_str) {
            if first_timestamp.is_none() {
                first_timestamp = Some(timestamp.to_string());
            }
            last_timestamp = Some(timestamp.to_string());
        }

        if project_path.is_none() {
            if let Some(cwd) = value.get("cwd").and_then(Value::as_str) {
                if !cwd.trim().is_empty() {
                    project_path = Some(cwd.to_string());
                }
            }
        }

        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "summary" => {
                if let Some(text) = value.get("summary").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        summary = Some(text.to_string());
                    }
                }
            }
            "user" | "assistant" => {
                message_count = message_count.saturating_add(1);

                if let Some(duration) = value.get("durationMs").and_then(Value::as_u64) {
                    total_duration_ms = total_duration_ms.saturating_add(duration);
                }

                if model.is_none() {
                    let candidate = value
                        .get("message")
                        .and_then(|m| m.get("model"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if !candidate.trim().is_empty() {
                        model = Some(candidate.to_string());
                    }
                }

                if kind == "user" && fallback_summary.is_none() {
                    let text = extract_message_text(&value);
                    if !text.trim().is_empty() {
                        fallback_summary = Some(truncate_summary(&text));
                    }
                }
            }
            _ => {}
        }
    }

    if message_count == 0 && summary.is_none() {
        return Ok(None);
    }

    // The folder name encodes the workspace path with '/' flattened to '-'.
    // Only a last resort: the first `cwd` in the file is authoritative.
    let project_path = project_path.or_else(|| {
        path.parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .filter(|name| name.starts_with('-'))
            .map(|name| name.replace('-', "/"))
    });

    Ok(Some(IndexedMetadata {
        session_id,
        file_path: path.to_path_buf(),
        summary: summary.or(fallback_summary),
        project_path: project_path.map(Into::into),
        message_count,
        total_duration_ms,
        model,
        first_timestamp,
        last_timestamp,
        last_scanned_at_ms: mtime_ms,
    }))
}

/// Textual content of a message line: a plain string, or the `text` fields
/// of `type == "text"` blocks joined with newlines.
fn extract_message_text(value: &Value) -> String {
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .unwrap_or(&Value::Null);
    match content {
        Value::String(text) => text.to_string(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    return block.get("text").and_then(Value::as_str);
                }
                None
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn truncate_summary(text: &str) -> String {
    let flattened = text.replace('\n', " ");
    let flattened = flattened.trim();
    let mut out: String = flattened.chars().take(FALLBACK_SUMMARY_MAX_CHARS).collect();
    if flattened.chars().count() > FALLBACK_SUMMARY_MAX_CHARS {
        out.push_str("...");
    }
    out
}

fn file_stem_string(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_log(dir: &Path, name: &str, lines: &[String]) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, lines.join("\n")).expect("write log");
        path
    }

    fn user_line(uuid: &str, ts: &str, text: &str) -> String {
        serde_json::json!({
            "type": "user",
            "uuid": uuid,
            "timestamp": ts,
            "cwd": "/p",
            "message": {"content": text},
            "durationMs": 100,
        })
        .to_string()
    }

    fn assistant_line(uuid: &str, parent: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "uuid": uuid,
            "parentUuid": parent,
            "timestamp": ts,
            "message": {"model": "m-1", "content": "ok"},
            "durationMs": 200,
        })
        .to_string()
    }

    #[test]
    fn scans_fresh_session() {
        let dir = tempdir().expect("tempdir");
        let path = write_log(
            dir.path(),
            "a.jsonl",
            &[
                user_line("u1", "2024-01-01T00:00:00Z", "hi"),
                assistant_line("a1", "u1", "2024-01-01T00:00:01Z"),
            ],
        );

        let meta = scan_session_file(&path, 1_000)
            .expect("scan")
            .expect("some metadata");
        assert_eq!(meta.session_id, "a");
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.total_duration_ms, 300);
        assert_eq!(meta.model.as_deref(), Some("m-1"));
        assert_eq!(meta.project_path.as_deref(), Some(Path::new("/p")));
        assert_eq!(meta.summary.as_deref(), Some("hi"));
        assert_eq!(meta.first_timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(meta.last_timestamp.as_deref(), Some("2024-01-01T00:00:01Z"));
        assert_eq!(meta.last_scanned_at_ms, 1_000);
    }

    #[test]
    fn sidechain_entries_are_invisible() {
        let dir = tempdir().expect("tempdir");
        let sidechain = serde_json::json!({
            "type": "assistant",
            "uuid": "side1",
            "isSidechain": true,
            "timestamp": "2024-01-01T00:00:09Z",
            "message": {"model": "m-2", "content": "internal"},
            "durationMs": 999,
        })
        .to_string();
        let path = write_log(
            dir.path(),
            "a.jsonl",
            &[
                user_line("u1", "2024-01-01T00:00:00Z", "hi"),
                assistant_line("a1", "u1", "2024-01-01T00:00:01Z"),
                sidechain,
            ],
        );

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.total_duration_ms, 300);
        assert_eq!(meta.model.as_deref(), Some("m-1"));
        assert_eq!(meta.last_timestamp.as_deref(), Some("2024-01-01T00:00:01Z"));
    }

    #[test]
    fn sidechain_only_file_yields_nothing() {
        let dir = tempdir().expect("tempdir");
        let lines: Vec<String> = (0..3)
            .map(|i| {
                serde_json::json!({
                    "type": "user",
                    "uuid": format!("u{i}"),
                    "isSidechain": true,
                    "timestamp": "2024-01-01T00:00:00Z",
                    "message": {"content": "chatter"},
                })
                .to_string()
            })
            .collect();
        let path = write_log(dir.path(), "only-side.jsonl", &lines);

        assert!(scan_session_file(&path, 0).expect("scan").is_none());
    }

    #[test]
    fn summary_entry_overrides_fallback() {
        let dir = tempdir().expect("tempdir");
        let summary = serde_json::json!({"type": "summary", "summary": "S"}).to_string();
        let path = write_log(
            dir.path(),
            "a.jsonl",
            &[
                user_line("u1", "2024-01-01T00:00:00Z", "hi"),
                assistant_line("a1", "u1", "2024-01-01T00:00:01Z"),
                summary,
            ],
        );

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(meta.summary.as_deref(), Some("S"));
    }

    #[test]
    fn fallback_summary_is_truncated_and_flattened() {
        let dir = tempdir().expect("tempdir");
        let long_text = format!("first line\n{}", "x".repeat(150));
        let path = write_log(
            dir.path(),
            "a.jsonl",
            &[user_line("u1", "2024-01-01T00:00:00Z", &long_text)],
        );

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        let summary = meta.summary.expect("summary");
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), FALLBACK_SUMMARY_MAX_CHARS + 3);
        assert!(!summary.contains('\n'));
        assert!(summary.starts_with("first line x"));
    }

    #[test]
    fn malformed_lines_are_tolerated() {
        let dir = tempdir().expect("tempdir");
        let path = write_log(
            dir.path(),
            "a.jsonl",
            &[
                "not-json".to_string(),
                user_line("u1", "2024-01-01T00:00:00Z", "hi"),
                r#"{"type": "user", "truncated"#.to_string(),
            ],
        );

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(meta.message_count, 1);
        assert_eq!(meta.summary.as_deref(), Some("hi"));
    }

    #[test]
    fn folder_name_is_a_last_resort_project_path() {
        let dir = tempdir().expect("tempdir");
        let key_dir = dir.path().join("-home-me-proj");
        fs::create_dir_all(&key_dir).expect("create");
        let line = serde_json::json!({
            "type": "user",
            "uuid": "u1",
            "timestamp": "2024-01-01T00:00:00Z",
            "message": {"content": "hi"},
        })
        .to_string();
        let path = key_dir.join("a.jsonl");
        fs::write(&path, line).expect("write");

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(
            meta.project_path.as_deref(),
            Some(Path::new("/home/me/proj"))
        );
    }

    #[test]
    fn cwd_beats_the_folder_name_heuristic() {
        let dir = tempdir().expect("tempdir");
        let key_dir = dir.path().join("-home-me-proj");
        fs::create_dir_all(&key_dir).expect("create");
        let path = key_dir.join("a.jsonl");
        fs::write(&path, user_line("u1", "2024-01-01T00:00:00Z", "hi")).expect("write");

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(meta.project_path.as_deref(), Some(Path::new("/p")));
    }

    #[test]
    fn summary_only_file_is_still_emitted() {
        let dir = tempdir().expect("tempdir");
        let summary = serde_json::json!({"type": "summary", "summary": "S"}).to_string();
        let path = write_log(dir.path(), "a.jsonl", &[summary]);

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(meta.message_count, 0);
        assert_eq!(meta.summary.as_deref(), Some("S"));
    }

    #[test]
    fn text_blocks_feed_the_fallback_summary() {
        let dir = tempdir().expect("tempdir");
        let line = serde_json::json!({
            "type": "user",
            "uuid": "u1",
            "timestamp": "2024-01-01T00:00:00Z",
            "message": {"content": [
                {"type": "text", "text": "part one"},
                {"type": "image", "source": "ignored"},
                {"type": "text", "text": "part two"},
            ]},
        })
        .to_string();
        let path = write_log(dir.path(), "a.jsonl", &[line]);

        let meta = scan_session_file(&path, 0).expect("scan").expect("some");
        assert_eq!(meta.summary.as_deref(), Some("part one part two"));
    }
}
