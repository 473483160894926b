//! Filesystem watcher feeding the change coalescer.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use remotesync_common::{Error, Result};

/// Kind of local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "created",
            ChangeKind::Changed => "changed",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// One raw change notification for an absolute local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Watch `root` recursively.
///
/// Events arrive on the returned channel until the watcher is dropped.
///
/// # Errors
/// - `Io` when the platform watcher cannot be created or `root` cannot be watched
pub fn start_watcher(
    root: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<ChangeEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in map_event(event) {
                let _ = tx.send(change);
            }
        }
        Err(e) => warn!("Watcher error: {}", e),
    })
    .map_err(watch_err)?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(watch_err)?;
    debug!(root = %root.display(), "Watching for changes");
    Ok((watcher, rx))
}

fn watch_err(err: notify::Error) -> Error {
    match err.kind {
        notify::ErrorKind::Io(io) => Error::Io(io),
        notify::ErrorKind::PathNotFound => Error::NotFound(format!("{:?}", err.paths)),
        other => Error::InvalidInput(format!("Cannot watch: {:?}", other)),
    }
}

fn map_event(event: Event) -> Vec<ChangeEvent> {
    let paths = event.paths;
    let all = |kind: ChangeKind| -> Vec<ChangeEvent> {
        paths.iter().map(|p| ChangeEvent::new(p.clone(), kind)).collect()
    };
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => all(ChangeKind::Deleted),
            RenameMode::To => all(ChangeKind::Created),
            RenameMode::Both if paths.len() >= 2 => vec![
                ChangeEvent::new(paths[0].clone(), ChangeKind::Deleted),
                ChangeEvent::new(paths[1].clone(), ChangeKind::Created),
            ],
            // Unpaired rename: the path may now exist or not.
            _ => paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Deleted
                    };
                    ChangeEvent::new(p.clone(), kind)
                })
                .collect(),
        },
        EventKind::Create(_) => all(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Any) => all(ChangeKind::Changed),
        EventKind::Remove(_) => all(ChangeKind::Deleted),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_maps_basic_kinds() {
        let created = map_event(event(EventKind::Create(CreateKind::File), &["/site/a.html"]));
        assert_eq!(created, vec![ChangeEvent::new("/site/a.html", ChangeKind::Created)]);

        let changed = map_event(event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/site/a.html"],
        ));
        assert_eq!(changed[0].kind, ChangeKind::Changed);

        let removed = map_event(event(EventKind::Remove(RemoveKind::File), &["/site/a.html"]));
        assert_eq!(removed[0].kind, ChangeKind::Deleted);

        let access = map_event(event(
            EventKind::Access(notify::event::AccessKind::Any),
            &["/site/a.html"],
        ));
        assert!(access.is_empty());
    }

    #[test]
    fn test_rename_is_delete_then_create() {
        let mapped = map_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/site/old.css", "/site/new.css"],
        ));
        assert_eq!(
            mapped,
            vec![
                ChangeEvent::new("/site/old.css", ChangeKind::Deleted),
                ChangeEvent::new("/site/new.css", ChangeKind::Created),
            ]
        );
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let (_watcher, mut rx) = start_watcher(&root).unwrap();

        let file = root.join("new.txt");
        std::fs::write(&file, b"hello").unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(event) if event.path == file => return Some(event),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .expect("no event within 5s")
        .expect("watcher channel closed");
        assert_ne!(event.kind, ChangeKind::Deleted);
    }
}
