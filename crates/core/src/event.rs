//! Change events, pending change sets and emitted batches

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Current wall-clock time in unix milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Kind of change reported by the raw watch source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

impl ChangeKind {
    /// Whether the change removed something from disk
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Unlink | ChangeKind::UnlinkDir)
    }

    pub fn is_dir(self) -> bool {
        matches!(self, ChangeKind::AddDir | ChangeKind::UnlinkDir)
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeKind::Add => "add",
            ChangeKind::Change => "change",
            ChangeKind::Unlink => "unlink",
            ChangeKind::AddDir => "addDir",
            ChangeKind::UnlinkDir => "unlinkDir",
        };
        f.write_str(name)
    }
}

/// Optional stat snapshot attached by the watch source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub modified_ms: Option<u64>,
    pub is_dir: bool,
}

impl FileStat {
    /// Capture a stat from filesystem metadata
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);

        Self {
            size: metadata.len(),
            modified_ms,
            is_dir: metadata.is_dir(),
        }
    }
}

/// A single observed change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Unix milliseconds
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<FileStat>,
}

impl FileChangeEvent {
    /// Create an event stamped with the current time
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self::at(kind, path, now_ms())
    }

    /// Create an event with an explicit timestamp
    pub fn at(kind: ChangeKind, path: impl Into<PathBuf>, timestamp: u64) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp,
            stat: None,
        }
    }

    pub fn with_stat(mut self, stat: FileStat) -> Self {
        self.stat = Some(stat);
        self
    }
}

/// Path-keyed set of pending changes
///
/// Holds at most one event per path, always the one with the greatest
/// timestamp. Iteration follows first-insertion order of each path.
#[derive(Debug, Clone, Default)]
pub struct PendingChangeSet {
    entries: Vec<FileChangeEvent>,
    index: AHashMap<PathBuf, usize>,
}

impl PendingChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, keeping the newer of it and any existing entry
    ///
    /// Returns true if the set changed.
    pub fn insert(&mut self, event: FileChangeEvent) -> bool {
        match self.index.get(&event.path) {
            Some(&slot) => {
                if event.timestamp > self.entries[slot].timestamp {
                    self.entries[slot] = event;
                    true
                } else {
                    false
                }
            }
            None => {
                self.index.insert(event.path.clone(), self.entries.len());
                self.entries.push(event);
                true
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = FileChangeEvent>>(&mut self, events: I) {
        for event in events {
            self.insert(event);
        }
    }

    pub fn get(&self, path: &Path) -> Option<&FileChangeEvent> {
        self.index.get(path).map(|&slot| &self.entries[slot])
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.index.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileChangeEvent> {
        self.entries.iter()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    /// Take every pending event, leaving the set empty
    pub fn drain(&mut self) -> Vec<FileChangeEvent> {
        self.index.clear();
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

impl FromIterator<FileChangeEvent> for PendingChangeSet {
    fn from_iter<I: IntoIterator<Item = FileChangeEvent>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Collapse a list of events to one per path, latest timestamp wins
pub fn dedup_latest(events: impl IntoIterator<Item = FileChangeEvent>) -> Vec<FileChangeEvent> {
    events.into_iter().collect::<PendingChangeSet>().drain()
}

/// Scheduling priority of an emitted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPriority {
    High,
    Medium,
    Low,
}

/// Version-control operation inferred from repository metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitOperation {
    BranchSwitch,
    Pull,
    Merge,
    Rebase,
    Checkout,
    Reset,
}

impl std::fmt::Display for GitOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GitOperation::BranchSwitch => "branch_switch",
            GitOperation::Pull => "pull",
            GitOperation::Merge => "merge",
            GitOperation::Rebase => "rebase",
            GitOperation::Checkout => "checkout",
            GitOperation::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Description of a version-control operation in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOperationInfo {
    pub operation: GitOperation,
    pub timestamp: u64,
    pub affected_files: Vec<PathBuf>,
    pub branch: Option<String>,
    pub is_bulk: bool,
}

/// A coalesced group of changes ready for debouncing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeBatch {
    pub id: Ulid,
    pub changes: Vec<FileChangeEvent>,
    pub git_operation: Option<GitOperationInfo>,
    pub timestamp: u64,
    pub priority: BatchPriority,
}

impl FileChangeBatch {
    pub fn new(
        changes: Vec<FileChangeEvent>,
        git_operation: Option<GitOperationInfo>,
        priority: BatchPriority,
    ) -> Self {
        Self {
            id: Ulid::new(),
            changes,
            git_operation,
            timestamp: now_ms(),
            priority,
        }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_set_keeps_latest_timestamp() {
        let mut set = PendingChangeSet::new();
        assert!(set.insert(FileChangeEvent::at(ChangeKind::Add, "a.json", 10)));
        assert!(set.insert(FileChangeEvent::at(ChangeKind::Change, "a.json", 30)));
        // Older event does not replace the newer one
        assert!(!set.insert(FileChangeEvent::at(ChangeKind::Unlink, "a.json", 20)));

        assert_eq!(set.len(), 1);
        let entry = set.get(Path::new("a.json")).unwrap();
        assert_eq!(entry.timestamp, 30);
        assert_eq!(entry.kind, ChangeKind::Change);
    }

    #[test]
    fn test_pending_set_preserves_first_seen_order() {
        let set: PendingChangeSet = vec![
            FileChangeEvent::at(ChangeKind::Change, "b", 1),
            FileChangeEvent::at(ChangeKind::Change, "a", 2),
            FileChangeEvent::at(ChangeKind::Change, "b", 3),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.paths(), vec![PathBuf::from("b"), PathBuf::from("a")]);
    }

    #[test]
    fn test_dedup_latest_many_same_path() {
        let events: Vec<_> = (0..50)
            .map(|i| FileChangeEvent::at(ChangeKind::Change, "locales/en.json", (i * 7) % 50))
            .collect();
        let max = events.iter().map(|e| e.timestamp).max().unwrap();

        let deduped = dedup_latest(events);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].timestamp, max);
    }

    #[test]
    fn test_drain_empties_set() {
        let mut set = PendingChangeSet::new();
        set.insert(FileChangeEvent::at(ChangeKind::Add, "x", 1));
        let drained = set.drain();
        assert_eq!(drained.len(), 1);
        assert!(set.is_empty());
        assert!(!set.contains(Path::new("x")));
    }

    #[test]
    fn test_change_kind_serde_names() {
        let json = serde_json::to_string(&ChangeKind::UnlinkDir).unwrap();
        assert_eq!(json, "\"unlinkDir\"");
        assert_eq!(ChangeKind::AddDir.to_string(), "addDir");
    }
}
