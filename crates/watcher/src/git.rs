//! Git-aware batching
//!
//! Changes arriving while a version-control operation rewrites the working
//! tree are grouped into one batch tagged with the inferred operation and
//! branch. Repository state is read through a [`VcsProbe`] so the batching
//! logic does not depend on how `.git` is inspected.

use crate::schedule::ScheduledTask;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use parking_lot::Mutex;
use relocale_core::config::GitConfig;
use relocale_core::{
    now_ms, BatchPriority, FileChangeBatch, FileChangeEvent, GitOperation, GitOperationInfo,
    PendingChangeSet, WatchError,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Paths that never produce a batch: VCS internals, editor droppings, lock files
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git/**",
    "**/.git/**",
    "*.tmp",
    "*.temp",
    "*~",
    ".#*",
    "#*#",
    "*.swp",
    "*.swo",
    ".DS_Store",
    "Thumbs.db",
    "*.lock",
    "node_modules/**",
    ".vscode/**",
    ".idea/**",
];

/// Repository state observed by a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsState {
    pub operation: GitOperation,
    pub branch: Option<String>,
    /// When the operation touched the repository (ms since epoch)
    pub timestamp: u64,
}

/// Reads version-control metadata to spot an operation in progress
pub trait VcsProbe: Send + Sync {
    /// Report an operation that touched `repo_root` within `window_ms` of `now_ms`
    fn detect(&self, repo_root: &Path, now_ms: u64, window_ms: u64) -> Result<Option<VcsState>, WatchError>;
}

/// Probe that inspects `.git` on disk
#[derive(Debug, Default, Clone, Copy)]
pub struct FsGitProbe;

impl FsGitProbe {
    fn operation(git_dir: &Path) -> GitOperation {
        if git_dir.join("MERGE_HEAD").exists() {
            GitOperation::Merge
        } else if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
            GitOperation::Rebase
        } else if git_dir.join("CHERRY_PICK_HEAD").exists() {
            GitOperation::Checkout
        } else {
            GitOperation::BranchSwitch
        }
    }
}

fn parse_branch(head: &str) -> String {
    head.lines()
        .next()
        .and_then(|line| line.trim().strip_prefix("ref: refs/heads/"))
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|| "detached".to_string())
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl VcsProbe for FsGitProbe {
    fn detect(&self, repo_root: &Path, now_ms: u64, window_ms: u64) -> Result<Option<VcsState>, WatchError> {
        let git_dir = repo_root.join(".git");
        let head = git_dir.join("HEAD");

        let metadata = match std::fs::metadata(&head) {
            Ok(m) => m,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(WatchError::from_io(&e, &head)),
        };
        let modified = metadata
            .modified()
            .map(system_time_ms)
            .map_err(|e| WatchError::from_io(&e, &head))?;

        if now_ms.saturating_sub(modified) > window_ms {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&head).map_err(|e| WatchError::from_io(&e, &head))?;
        Ok(Some(VcsState {
            operation: Self::operation(&git_dir),
            branch: Some(parse_branch(&content)),
            timestamp: modified,
        }))
    }
}

/// Walk up from `start` to the directory holding `.git`
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|dir| dir.join(".git").is_dir())
        .map(Path::to_path_buf)
}

fn build_ignore_set(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in DEFAULT_IGNORE_PATTERNS {
        // A leading '#' starts a comment in gitignore syntax
        let line = if pattern.starts_with('#') {
            format!("\\{}", pattern)
        } else {
            (*pattern).to_string()
        };
        if let Err(e) = builder.add_line(None, &line) {
            warn!("Skipping ignore pattern {}: {}", pattern, e);
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!("Failed to build git ignore set: {}", e);
        Gitignore::empty()
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatistics {
    pub enabled: bool,
    pub repository_root: Option<PathBuf>,
    pub operation_history: Vec<GitOperationInfo>,
    pub pending_changes: usize,
    pub current_batch_size: Option<usize>,
    pub batches_emitted: u64,
    pub ignored_changes: u64,
}

struct GitState {
    config: GitConfig,
    workspace_root: PathBuf,
    repo_root: Option<PathBuf>,
    ignore: Gitignore,
    pending: PendingChangeSet,
    current: Option<FileChangeBatch>,
    history: VecDeque<GitOperationInfo>,
    timer: ScheduledTask,
    batches_emitted: u64,
    ignored: u64,
    destroyed: bool,
}

impl GitState {
    fn enabled(&self) -> bool {
        self.config.enabled && self.repo_root.is_some()
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.operation_time_window)
    }

    fn regular_window(&self) -> Duration {
        Duration::from_millis((self.config.operation_time_window / 2).min(1000))
    }

    fn is_bulk(&self, count: usize) -> bool {
        count >= self.config.bulk_operation_threshold
    }

    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let root = self.repo_root.as_deref().unwrap_or(&self.workspace_root);
        // Changes arrive relative to the workspace, which may sit below the repository
        let absolute = self.workspace_root.join(path);
        let relative = absolute.strip_prefix(root).unwrap_or(path);
        self.ignore.matched(relative, is_dir).is_ignore()
    }

    /// Move pending changes into the current batch, latest timestamp wins
    fn merge_pending(&mut self) {
        let Some(batch) = self.current.as_mut() else {
            return;
        };
        for change in self.pending.drain() {
            match batch.changes.iter_mut().find(|c| c.path == change.path) {
                Some(existing) if existing.timestamp <= change.timestamp => *existing = change,
                Some(_) => {}
                None => batch.changes.push(change),
            }
        }
    }

    /// Close the current batch, folding in anything still pending
    fn finalize(&mut self) -> Option<FileChangeBatch> {
        self.timer.cancel();

        if self.current.is_none() && !self.pending.is_empty() {
            let changes = self.pending.drain();
            let priority = if self.is_bulk(changes.len()) {
                BatchPriority::Low
            } else {
                BatchPriority::Medium
            };
            self.current = Some(FileChangeBatch::new(changes, None, priority));
        }
        self.merge_pending();

        let mut batch = self.current.take()?;
        let bulk = self.is_bulk(batch.changes.len());
        if let Some(op) = batch.git_operation.as_mut() {
            op.affected_files = batch.changes.iter().map(|c| c.path.clone()).collect();
            op.is_bulk = bulk;
            if bulk {
                batch.priority = BatchPriority::Low;
            }
            self.history.push_back(op.clone());

            let cutoff = now_ms().saturating_sub(self.config.operation_time_window * 10);
            self.history.retain(|op| op.timestamp > cutoff);
        }
        Some(batch)
    }
}

struct Shared {
    state: Mutex<GitState>,
    probe: Arc<dyn VcsProbe>,
    batches: mpsc::UnboundedSender<FileChangeBatch>,
}

impl Shared {
    fn emit(&self, batch: FileChangeBatch) {
        debug!(
            "Emitting batch {} with {} changes ({:?})",
            batch.id,
            batch.changes.len(),
            batch.priority
        );
        self.state.lock().batches_emitted += 1;
        if self.batches.send(batch).is_err() {
            debug!("Batch receiver dropped");
        }
    }
}

/// Groups changes by version-control operation and emits batches
#[derive(Clone)]
pub struct GitAwareness {
    shared: Arc<Shared>,
}

impl GitAwareness {
    /// Create the layer for `workspace_root`; batches arrive on the returned receiver
    pub fn new(
        config: GitConfig,
        workspace_root: &Path,
        probe: Arc<dyn VcsProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<FileChangeBatch>) {
        let repo_root = find_repo_root(workspace_root);
        match (&repo_root, config.enabled) {
            (Some(root), true) => info!("Git-awareness enabled for repository {}", root.display()),
            (None, true) => info!("No git repository found, git-awareness disabled"),
            _ => debug!("Git-awareness disabled by configuration"),
        }

        let ignore_root = repo_root.clone().unwrap_or_else(|| workspace_root.to_path_buf());
        let (tx, rx) = mpsc::unbounded_channel();
        let state = GitState {
            config,
            workspace_root: workspace_root.to_path_buf(),
            ignore: build_ignore_set(&ignore_root),
            repo_root,
            pending: PendingChangeSet::new(),
            current: None,
            history: VecDeque::new(),
            timer: ScheduledTask::new(),
            batches_emitted: 0,
            ignored: 0,
            destroyed: false,
        };

        let layer = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                probe,
                batches: tx,
            }),
        };
        (layer, rx)
    }

    pub fn should_ignore(&self, path: &Path) -> bool {
        self.shared.state.lock().is_ignored(path, false)
    }

    /// Feed one raw change
    ///
    /// A probe failure is returned as a recoverable error; the change is
    /// still batched as a regular change.
    pub fn process_file_change(&self, event: FileChangeEvent) -> Result<(), WatchError> {
        let (repo_root, window_ms) = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Ok(());
            }
            if state.is_ignored(&event.path, event.kind.is_dir()) {
                state.ignored += 1;
                debug!("Ignoring change to {}", event.path.display());
                return Ok(());
            }
            if !state.enabled() {
                drop(state);
                self.shared
                    .emit(FileChangeBatch::new(vec![event], None, BatchPriority::Medium));
                return Ok(());
            }
            (state.repo_root.clone(), state.config.operation_time_window)
        };

        let detected = match repo_root {
            Some(root) => self.shared.probe.detect(&root, now_ms(), window_ms),
            None => Ok(None),
        };
        let (operation, failure) = match detected {
            Ok(Some(vcs)) if event.timestamp.saturating_sub(vcs.timestamp) <= window_ms => (Some(vcs), None),
            Ok(_) => (None, None),
            Err(e) => (
                None,
                Some(WatchError::file_system(format!("Failed to detect git operation: {}", e.message))
                    .with_path(&event.path)),
            ),
        };

        let flushed = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Ok(());
            }
            state.pending.insert(event);
            match operation {
                Some(vcs) => self.handle_operation(&mut state, vcs),
                None => {
                    let delay = state.regular_window();
                    self.arm(&mut state, delay);
                    None
                }
            }
        };
        if let Some(batch) = flushed {
            self.shared.emit(batch);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns a batch for a different operation that had to be closed first
    fn handle_operation(&self, state: &mut GitState, vcs: VcsState) -> Option<FileChangeBatch> {
        let window = state.window();
        let same_operation = state
            .current
            .as_ref()
            .and_then(|b| b.git_operation.as_ref())
            .is_some_and(|op| op.operation == vcs.operation);

        if same_operation {
            state.merge_pending();
            self.arm(state, window);
            return None;
        }

        // Keep the earlier operation's changes separate
        let previous = if state.current.is_some() {
            let pending = std::mem::take(&mut state.pending);
            let closed = state.finalize();
            state.pending = pending;
            closed
        } else {
            None
        };

        let changes = state.pending.drain();
        let bulk = state.is_bulk(changes.len());
        info!("Detected {} operation affecting {} files", vcs.operation, changes.len());

        let info = GitOperationInfo {
            operation: vcs.operation,
            timestamp: vcs.timestamp,
            affected_files: changes.iter().map(|c| c.path.clone()).collect(),
            branch: vcs.branch,
            is_bulk: bulk,
        };
        let priority = if bulk { BatchPriority::Low } else { BatchPriority::Medium };
        state.current = Some(FileChangeBatch::new(changes, Some(info), priority));
        self.arm(state, window);
        previous
    }

    fn arm(&self, state: &mut GitState, delay: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        state.timer.schedule(delay, move |generation| async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let batch = {
                let mut state = shared.state.lock();
                if !state.timer.claim(generation) {
                    return;
                }
                state.finalize()
            };
            if let Some(batch) = batch {
                shared.emit(batch);
            }
        });
    }

    /// Emit whatever is pending now
    pub fn flush(&self) {
        let batch = self.shared.state.lock().finalize();
        if let Some(batch) = batch {
            self.shared.emit(batch);
        }
    }

    /// Flush, then stop accepting changes
    pub fn destroy(&self) {
        self.flush();
        let mut state = self.shared.state.lock();
        state.destroyed = true;
        state.history.clear();
        state.pending.clear();
    }

    pub fn update_config(&self, config: GitConfig) {
        let mut state = self.shared.state.lock();
        if config.enabled != state.config.enabled {
            state.repo_root = find_repo_root(&state.workspace_root);
            info!(
                "Git-awareness {}",
                if config.enabled && state.repo_root.is_some() { "enabled" } else { "disabled" }
            );
        }
        state.config = config;
    }

    pub fn statistics(&self) -> GitStatistics {
        let state = self.shared.state.lock();
        GitStatistics {
            enabled: state.enabled(),
            repository_root: state.repo_root.clone(),
            operation_history: state.history.iter().cloned().collect(),
            pending_changes: state.pending.len(),
            current_batch_size: state.current.as_ref().map(|b| b.changes.len()),
            batches_emitted: state.batches_emitted,
            ignored_changes: state.ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relocale_core::ChangeKind;
    use tempfile::TempDir;
    use tokio::time::Instant;

    struct FixedProbe(Mutex<Result<Option<VcsState>, WatchError>>);

    impl FixedProbe {
        fn none() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Ok(None))))
        }

        fn operation(operation: GitOperation, branch: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Ok(Some(VcsState {
                operation,
                branch: Some(branch.to_string()),
                timestamp: now_ms(),
            })))))
        }
    }

    impl VcsProbe for FixedProbe {
        fn detect(&self, _: &Path, _: u64, _: u64) -> Result<Option<VcsState>, WatchError> {
            self.0.lock().clone()
        }
    }

    fn repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        dir
    }

    fn change(root: &Path, name: &str) -> FileChangeEvent {
        FileChangeEvent::new(ChangeKind::Change, root.join(name))
    }

    #[tokio::test]
    async fn test_ignore_set() {
        let dir = repo();
        let (git, _rx) = GitAwareness::new(GitConfig::default(), dir.path(), FixedProbe::none());
        let root = dir.path().canonicalize().unwrap();

        for ignored in [
            ".git/HEAD",
            "src/.git/config",
            "locales/en.json.tmp",
            "notes.temp",
            "en.json~",
            "locales/.#en.json",
            "#en.json#",
            "locales/en.json.swp",
            ".DS_Store",
            "Cargo.lock",
            "node_modules/pkg/index.js",
            ".idea/workspace.xml",
        ] {
            assert!(git.should_ignore(&root.join(ignored)), "{ignored} should be ignored");
        }
        for watched in ["locales/en.json", "src/app.ts", "lock.md"] {
            assert!(!git.should_ignore(&root.join(watched)), "{watched} should be watched");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_change_never_emits() {
        let dir = repo();
        let (git, mut rx) = GitAwareness::new(GitConfig::default(), dir.path(), FixedProbe::none());
        let root = dir.path().canonicalize().unwrap();

        git.process_file_change(change(&root, ".git/HEAD")).unwrap();
        git.process_file_change(change(&root, "scratch.tmp")).unwrap();
        git.flush();

        assert!(rx.try_recv().is_err());
        assert_eq!(git.statistics().ignored_changes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_changes_batch_on_short_window() {
        let dir = repo();
        let (git, mut rx) = GitAwareness::new(GitConfig::default(), dir.path(), FixedProbe::none());
        let root = dir.path().canonicalize().unwrap();
        let start = Instant::now();

        git.process_file_change(change(&root, "locales/en.json")).unwrap();
        git.process_file_change(change(&root, "locales/de.json")).unwrap();
        git.process_file_change(change(&root, "locales/en.json")).unwrap();

        let early = tokio::time::timeout(Duration::from_millis(999), rx.recv()).await;
        assert!(early.is_err());

        let batch = rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.priority, BatchPriority::Medium);
        assert!(batch.git_operation.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_git_operation_groups_bulk_batch() {
        let dir = repo();
        let probe = FixedProbe::operation(GitOperation::BranchSwitch, "feature/de");
        let (git, mut rx) = GitAwareness::new(GitConfig::default(), dir.path(), probe);
        let root = dir.path().canonicalize().unwrap();

        for i in 0..6 {
            git.process_file_change(change(&root, &format!("locales/f{i}.json"))).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(git.statistics().current_batch_size, Some(6));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.changes.len(), 6);
        assert_eq!(batch.priority, BatchPriority::Low);
        let op = batch.git_operation.unwrap();
        assert_eq!(op.operation, GitOperation::BranchSwitch);
        assert_eq!(op.branch.as_deref(), Some("feature/de"));
        assert!(op.is_bulk);
        assert_eq!(op.affected_files.len(), 6);

        assert!(rx.try_recv().is_err());
        assert_eq!(git.statistics().operation_history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_emits_each_change() {
        let dir = repo();
        let config = GitConfig {
            enabled: false,
            ..GitConfig::default()
        };
        let (git, mut rx) = GitAwareness::new(config, dir.path(), FixedProbe::none());
        let root = dir.path().canonicalize().unwrap();

        git.process_file_change(change(&root, "a.json")).unwrap();
        git.process_file_change(change(&root, "b.json")).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.changes.len(), 1);
        assert_eq!(second.changes[0].path, root.join("b.json"));
        assert_eq!(first.priority, BatchPriority::Medium);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_still_batches() {
        let dir = repo();
        let probe = Arc::new(FixedProbe(Mutex::new(Err(WatchError::file_system("EACCES")))));
        let (git, mut rx) = GitAwareness::new(GitConfig::default(), dir.path(), probe);
        let root = dir.path().canonicalize().unwrap();

        let err = git.process_file_change(change(&root, "locales/en.json")).unwrap_err();
        assert!(err.recoverable);
        assert!(err.message.contains("Failed to detect git operation"));
        assert_eq!(err.path, Some(root.join("locales/en.json")));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.changes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_and_destroy() {
        let dir = repo();
        let (git, mut rx) = GitAwareness::new(GitConfig::default(), dir.path(), FixedProbe::none());
        let root = dir.path().canonicalize().unwrap();

        git.process_file_change(change(&root, "locales/en.json")).unwrap();
        git.flush();
        assert_eq!(rx.try_recv().unwrap().changes.len(), 1);

        git.destroy();
        git.process_file_change(change(&root, "locales/fr.json")).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(git.statistics().batches_emitted, 1);
    }

    #[test]
    fn test_fs_probe_reads_head_and_markers() {
        let dir = repo();
        let probe = FsGitProbe;

        let state = probe.detect(dir.path(), now_ms(), 2000).unwrap().unwrap();
        assert_eq!(state.operation, GitOperation::BranchSwitch);
        assert_eq!(state.branch.as_deref(), Some("main"));

        std::fs::write(dir.path().join(".git/MERGE_HEAD"), "abc\n").unwrap();
        let state = probe.detect(dir.path(), now_ms(), 2000).unwrap().unwrap();
        assert_eq!(state.operation, GitOperation::Merge);
        std::fs::remove_file(dir.path().join(".git/MERGE_HEAD")).unwrap();

        std::fs::create_dir(dir.path().join(".git/rebase-apply")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "0123456789abcdef\n").unwrap();
        let state = probe.detect(dir.path(), now_ms(), 2000).unwrap().unwrap();
        assert_eq!(state.operation, GitOperation::Rebase);
        assert_eq!(state.branch.as_deref(), Some("detached"));
    }

    #[test]
    fn test_fs_probe_ignores_stale_head() {
        let dir = repo();
        let head = dir.path().join(".git/HEAD");
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&head, filetime::FileTime::from_system_time(hour_ago)).unwrap();

        assert_eq!(FsGitProbe.detect(dir.path(), now_ms(), 2000).unwrap(), None);

        let bare = TempDir::new().unwrap();
        assert_eq!(FsGitProbe.detect(bare.path(), now_ms(), 2000).unwrap(), None);
    }

    #[test]
    fn test_find_repo_root_walks_up() {
        let dir = repo();
        let nested = dir.path().join("packages/app/locales");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_repo_root(&nested).unwrap();
        assert_eq!(found, dir.path().canonicalize().unwrap());
    }
}
