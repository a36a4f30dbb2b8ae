use crate::infra::projects::is_session_log;
use notify::event::EventKind;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone, Debug)]
pub enum WatchSignal {
    Changed(std::path::PathBuf),
    Error(String),
}

#[derive(Debug, Error)]
pub enum WatchProjectsDirError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Recursive watch over the projects tree. Only non-`agent-` `*.jsonl`
/// paths are forwarded; access events are noise and dropped. The returned
/// watcher stops delivering when dropped.
pub fn watch_projects_dir(
    path: &Path,
    tx: UnboundedSender<WatchSignal>,
) -> Result<RecommendedWatcher, WatchProjectsDirError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for path in changed_session_logs(&event) {
                    let _ = tx.send(WatchSignal::Changed(path));
                }
            }
            Err(error) => {
                let _ = tx.send(WatchSignal::Error(error.to_string()));
            }
        },
        Config::default(),
    )?;

    watcher.watch(path, RecursiveMode::Recursive)?;

    Ok(watcher)
}

fn changed_session_logs(event: &notify::Event) -> Vec<std::path::PathBuf> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| is_session_log(path))
        .cloned()
        .collect()
}
