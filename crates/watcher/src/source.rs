//! Raw change source backed by `notify`
//!
//! Translates notify events into add/change/unlink/addDir/unlinkDir
//! changes relative to the workspace root, drops excluded paths and forwards
//! the rest over a tokio channel.

use crate::patterns::WatchFilter;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use relocale_core::{ChangeKind, FileChangeEvent, FileStat, WatchError};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Change(FileChangeEvent),
    Error(WatchError),
}

pub struct NotifySource {
    watcher: RecommendedWatcher,
    root: PathBuf,
    watched: Vec<PathBuf>,
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource")
            .field("root", &self.root)
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}

impl NotifySource {
    /// Create a source; nothing is watched until [`NotifySource::watch`]
    pub fn new(filter: WatchFilter) -> Result<(Self, mpsc::UnboundedReceiver<SourceEvent>), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let root = filter.root().to_path_buf();

        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let outgoing = match res {
                    Ok(event) => translate_event(&event, &filter)
                        .into_iter()
                        .map(SourceEvent::Change)
                        .collect(),
                    Err(e) => vec![SourceEvent::Error(notify_error(&e))],
                };
                for event in outgoing {
                    if tx.send(event).is_err() {
                        trace!("Change receiver dropped");
                        return;
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| {
            WatchError::file_system(format!("Failed to initialize file watcher: {e}")).unrecoverable()
        })?;

        Ok((
            Self {
                watcher,
                root,
                watched: Vec::new(),
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watch `path` recursively; relative paths resolve against the root
    pub fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        if self.watched.contains(&target) {
            return Ok(());
        }

        self.watcher
            .watch(&target, RecursiveMode::Recursive)
            .map_err(|e| {
                WatchError::file_system(format!(
                    "Failed to add watch path '{}': {e}",
                    target.display()
                ))
                .with_path(&target)
            })?;
        info!("Watching path: {}", target.display());
        self.watched.push(target);
        Ok(())
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<(), WatchError> {
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let Some(index) = self.watched.iter().position(|p| *p == target) else {
            return Ok(());
        };

        self.watcher.unwatch(&target).map_err(|e| {
            WatchError::file_system(format!(
                "Failed to remove watch path '{}': {e}",
                target.display()
            ))
            .with_path(&target)
        })?;
        self.watched.remove(index);
        debug!("Stopped watching {}", target.display());
        Ok(())
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched
    }
}

/// Smallest set of directories covering every file in `files`
///
/// `files` are relative to `root`. An empty set watches `root` itself.
pub fn watch_roots(root: &Path, files: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = files
        .iter()
        .map(|file| {
            root.join(file)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf())
        })
        .collect();
    if dirs.is_empty() {
        return vec![root.to_path_buf()];
    }
    // Component order puts every ancestor before its descendants
    dirs.sort();
    dirs.dedup();

    let mut roots: Vec<PathBuf> = Vec::new();
    for dir in dirs {
        if !roots.iter().any(|r| dir.starts_with(r)) {
            roots.push(dir);
        }
    }
    roots
}

fn notify_error(err: &notify::Error) -> WatchError {
    let error = WatchError::file_system(format!("Watch error: {err}"));
    match err.paths.first() {
        Some(path) => error.with_path(path),
        None => error,
    }
}

fn stat(path: &Path) -> Option<FileStat> {
    std::fs::metadata(path).ok().map(|m| FileStat::from_metadata(&m))
}

fn appeared(path: &Path) -> Option<(ChangeKind, Option<FileStat>)> {
    let stat = stat(path)?;
    let kind = if stat.is_dir { ChangeKind::AddDir } else { ChangeKind::Add };
    Some((kind, Some(stat)))
}

/// Map one notify event onto zero or more change events
///
/// Paths under the filter root come out relative to it.
pub fn translate_event(event: &Event, filter: &WatchFilter) -> Vec<FileChangeEvent> {
    let mut raw: Vec<(ChangeKind, &Path, Option<FileStat>)> = Vec::new();

    match event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let stat = stat(path);
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => stat.is_some_and(|s| s.is_dir),
                };
                let change = if is_dir { ChangeKind::AddDir } else { ChangeKind::Add };
                raw.push((change, path, stat));
            }
        }
        EventKind::Remove(kind) => {
            let change = if kind == RemoveKind::Folder {
                ChangeKind::UnlinkDir
            } else {
                ChangeKind::Unlink
            };
            raw.extend(event.paths.iter().map(|p| (change, p.as_path(), None)));
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                raw.extend(event.paths.iter().map(|p| (ChangeKind::Unlink, p.as_path(), None)));
            }
            RenameMode::Both if event.paths.len() == 2 => {
                raw.push((ChangeKind::Unlink, &event.paths[0], None));
                if let Some((kind, stat)) = appeared(&event.paths[1]) {
                    raw.push((kind, &event.paths[1], stat));
                }
            }
            _ => {
                for path in &event.paths {
                    match appeared(path) {
                        Some((kind, stat)) => raw.push((kind, path, stat)),
                        None => raw.push((ChangeKind::Unlink, path, None)),
                    }
                }
            }
        },
        EventKind::Modify(_) => {
            for path in &event.paths {
                match stat(path) {
                    // Directory metadata churn is not a content change
                    Some(s) if s.is_dir => {}
                    Some(s) => raw.push((ChangeKind::Change, path, Some(s))),
                    None => raw.push((ChangeKind::Unlink, path, None)),
                }
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }

    raw.into_iter()
        .filter(|(kind, path, _)| {
            if kind.is_dir() {
                !filter.is_excluded(path, true)
            } else {
                filter.matches(path)
            }
        })
        .map(|(kind, path, stat)| {
            let relative = path.strip_prefix(filter.root()).unwrap_or(path);
            let event = FileChangeEvent::new(kind, relative);
            match stat {
                Some(stat) => event.with_stat(stat),
                None => event,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn filter(root: &Path, include: &[&str]) -> WatchFilter {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        WatchFilter::new(root, &include, &["**/.git/**".to_string(), "*.tmp".to_string()])
    }

    fn kinds(events: &[FileChangeEvent]) -> Vec<(ChangeKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.path.to_string_lossy().replace('\\', "/")))
            .collect()
    }

    #[test]
    fn test_create_modify_remove() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("locales")).unwrap();
        fs::write(root.join("locales/en.json"), "{}").unwrap();
        let filter = filter(root, &[]);

        let created = Event::new(EventKind::Create(CreateKind::Any)).add_path(root.join("locales/en.json"));
        let events = translate_event(&created, &filter);
        assert_eq!(kinds(&events), vec![(ChangeKind::Add, "locales/en.json".to_string())]);
        assert_eq!(events[0].stat.map(|s| s.size), Some(2));

        let folder = Event::new(EventKind::Create(CreateKind::Any)).add_path(root.join("locales"));
        assert_eq!(kinds(&translate_event(&folder, &filter))[0].0, ChangeKind::AddDir);

        let modified = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(root.join("locales/en.json"));
        assert_eq!(kinds(&translate_event(&modified, &filter))[0].0, ChangeKind::Change);

        // Modified directories are dropped
        let touched_dir = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(root.join("locales"));
        assert!(translate_event(&touched_dir, &filter).is_empty());

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(root.join("locales/de.json"));
        assert_eq!(
            kinds(&translate_event(&removed, &filter)),
            vec![(ChangeKind::Unlink, "locales/de.json".to_string())]
        );
    }

    #[test]
    fn test_rename_both() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("new.json"), "{}").unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("old.json"))
            .add_path(root.join("new.json"));
        assert_eq!(
            kinds(&translate_event(&event, &filter(root, &[]))),
            vec![
                (ChangeKind::Unlink, "old.json".to_string()),
                (ChangeKind::Add, "new.json".to_string()),
            ]
        );
    }

    #[test]
    fn test_filtering() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let filter = filter(root, &["locales/**"]);

        let event = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(root.join("locales/en.json"))
            .add_path(root.join("src/main.rs"))
            .add_path(root.join("locales/cache.tmp"))
            .add_path(root.join(".git/index"));
        assert_eq!(
            kinds(&translate_event(&event, &filter)),
            vec![(ChangeKind::Unlink, "locales/en.json".to_string())]
        );

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(root.join("locales/en.json"));
        assert!(translate_event(&access, &filter).is_empty());
    }

    #[test]
    fn test_watch_roots_collapse_nested_dirs() {
        let root = Path::new("/ws");
        let files = vec![
            PathBuf::from("locales/en/app.json"),
            PathBuf::from("locales/app.json"),
            PathBuf::from("locales/de/app.json"),
            PathBuf::from("src/i18n/keys.ts"),
            PathBuf::from("README.md"),
        ];
        assert_eq!(watch_roots(root, &files), vec![PathBuf::from("/ws")]);

        let files = vec![
            PathBuf::from("locales/en/app.json"),
            PathBuf::from("locales/app.json"),
            PathBuf::from("src/i18n/keys.ts"),
        ];
        assert_eq!(
            watch_roots(root, &files),
            vec![PathBuf::from("/ws/locales"), PathBuf::from("/ws/src/i18n")]
        );
        assert_eq!(watch_roots(root, &[]), vec![PathBuf::from("/ws")]);
    }

    #[tokio::test]
    async fn test_live_watcher_delivers_changes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (mut source, mut rx) = NotifySource::new(filter(&root, &[])).unwrap();
        source.watch(&root).unwrap();
        assert_eq!(source.watched_paths().len(), 1);

        fs::write(root.join("en.json"), "{\"hello\": \"world\"}").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                if let SourceEvent::Change(change) = event {
                    if change.path == Path::new("en.json") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen);

        let watched = source.watched_paths()[0].clone();
        source.unwatch(&watched).unwrap();
        assert!(source.watched_paths().is_empty());
    }
}
