/*!
Change detection loop.

Registers a non-recursive watch on every directory under the base path, then turns
content-affecting notifications into staged file copies and debounce resets.
Directories created while the loop is running are adopted on their creation event:
they get a watch of their own and anything already inside them is staged.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::scheduler::FlushScheduler;
use crate::staging::StagingBuffer;
use crate::Result;

/// What the notifier delivers: an event or a backend error
pub type WatchMessage = notify::Result<Event>;

/// Per-directory watch registration
pub trait DirectoryWatch: Send {
    fn watch_dir(&mut self, dir: &Path) -> Result<()>;
}

/// `notify`-backed watch registration
///
/// Events and errors are forwarded into an unbounded channel consumed by
/// [`ChangeWatcher::run`]. Dropping this value stops delivery.
pub struct NotifyWatch {
    watcher: RecommendedWatcher,
}

impl NotifyWatch {
    pub fn new() -> Result<(Self, UnboundedReceiver<WatchMessage>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |message: WatchMessage| {
            // The receiver is gone only once the loop has stopped.
            let _ = events_tx.send(message);
        })?;
        Ok((Self { watcher }, events_rx))
    }
}

impl DirectoryWatch for NotifyWatch {
    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }
}

/// How an event affects the staged content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A path appeared (created, or renamed into a watched directory)
    Created,
    /// Existing file content changed
    Modified,
    /// A directory appeared
    DirectoryCreated,
}

/// Map a notifier event kind to the change it represents, if any
///
/// Deletions, metadata-only updates, renames away and plain reads are ignored.
pub fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(CreateKind::Folder) => Some(ChangeKind::DirectoryCreated),
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Some(ChangeKind::Modified)
        }
        // kqueue and FSEvents report both ends of a rename as `Any`; a source that
        // no longer exists is dropped when staging.
        EventKind::Modify(ModifyKind::Name(RenameMode::To))
        | EventKind::Modify(ModifyKind::Name(RenameMode::Both))
        | EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => Some(ChangeKind::Created),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(ChangeKind::Modified),
        _ => None,
    }
}

/// Watches the base tree and feeds the staging buffer
pub struct ChangeWatcher {
    base: PathBuf,
    buffer: Arc<StagingBuffer>,
    scheduler: FlushScheduler,
}

impl ChangeWatcher {
    pub fn new(base: PathBuf, buffer: Arc<StagingBuffer>, scheduler: FlushScheduler) -> Self {
        Self {
            base,
            buffer,
            scheduler,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Register a watch on every directory currently under the base path
    ///
    /// Returns the number of directories registered. Registration failures are
    /// logged and skipped.
    pub fn register_tree<W: DirectoryWatch>(&self, watch: &mut W) -> usize {
        let (directories, _) = scan_tree(&self.base);
        register_all(watch, &directories)
    }

    /// Consume notifier messages until `shutdown` fires or the notifier goes away
    pub async fn run<W: DirectoryWatch>(
        &self,
        mut watch: W,
        mut events: UnboundedReceiver<WatchMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Change watcher received shutdown");
                    break;
                }
                message = events.recv() => match message {
                    Some(Ok(event)) => self.handle_event(&mut watch, event).await,
                    Some(Err(err)) => warn!(error = %err, "Watcher error"),
                    None => {
                        warn!("Change notifier closed, stopping watcher");
                        break;
                    }
                },
            }
        }
    }

    /// Process one notifier event
    pub async fn handle_event<W: DirectoryWatch>(&self, watch: &mut W, event: Event) {
        let Some(kind) = classify(&event.kind) else {
            return;
        };

        // A full rename carries [from, to]; only the destination has content.
        let paths: &[PathBuf] = match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                event.paths.last().map(std::slice::from_ref).unwrap_or(&[])
            }
            _ => &event.paths,
        };

        let mut reset = kind != ChangeKind::DirectoryCreated;
        for path in paths {
            match kind {
                ChangeKind::DirectoryCreated => {
                    reset |= self.adopt_directory(watch, path).await > 0;
                }
                ChangeKind::Created | ChangeKind::Modified => {
                    if kind == ChangeKind::Created && is_dir(path).await {
                        self.adopt_directory(watch, path).await;
                    } else {
                        self.stage_file(path).await;
                    }
                }
            }
        }

        if reset {
            self.scheduler.on_qualifying_change();
        }
    }

    /// Copy the current content of `path` into the buffer
    ///
    /// Best effort: a path that vanished, is not a regular file or cannot be
    /// read is dropped without a trace.
    pub async fn stage_file(&self, path: &Path) -> bool {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return false,
        }
        let Ok(content) = fs::read(path).await else {
            return false;
        };

        self.buffer.put(path.to_path_buf(), content);
        #[cfg(feature = "metrics")]
        crate::observability::record(|m| m.staged_events_total.inc());
        true
    }

    /// Watch a directory that appeared after startup and stage what is already in it
    ///
    /// Files written between the directory's creation and the watch registration
    /// produce no events of their own, hence the scan. Returns the number of files
    /// staged.
    async fn adopt_directory<W: DirectoryWatch>(&self, watch: &mut W, dir: &Path) -> usize {
        let (directories, files) = scan_tree(dir);
        let registered = register_all(watch, &directories);
        info!(dir = %dir.display(), registered, "Watching new directory");

        let mut staged = 0;
        for file in files {
            if self.stage_file(&file).await {
                staged += 1;
            }
        }
        staged
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}

/// Walk `root` without following symlinks, splitting directories from files.
/// Unreadable entries are skipped.
fn scan_tree(root: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|entry| entry.ok()) {
        if entry.file_type().is_dir() {
            directories.push(entry.into_path());
        } else if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    (directories, files)
}

fn register_all<W: DirectoryWatch>(watch: &mut W, directories: &[PathBuf]) -> usize {
    let mut registered = 0;
    for dir in directories {
        match watch.watch_dir(dir) {
            Ok(()) => registered += 1,
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to watch directory"),
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{FlushTarget, SchedulerState};
    use async_trait::async_trait;
    use notify::event::DataChange;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingWatch {
        dirs: Vec<PathBuf>,
    }

    impl DirectoryWatch for RecordingWatch {
        fn watch_dir(&mut self, dir: &Path) -> Result<()> {
            self.dirs.push(dir.to_path_buf());
            Ok(())
        }
    }

    struct NoopTarget;

    #[async_trait]
    impl FlushTarget for NoopTarget {
        async fn flush_due(&self) {}
    }

    fn watcher_for(base: &Path) -> (ChangeWatcher, Arc<StagingBuffer>, FlushScheduler) {
        let buffer = Arc::new(StagingBuffer::new());
        let scheduler = FlushScheduler::new(Duration::from_secs(3600), Arc::new(NoopTarget));
        let watcher = ChangeWatcher::new(base.to_path_buf(), buffer.clone(), scheduler.clone());
        (watcher, buffer, scheduler)
    }

    fn modified(path: &Path) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(path.to_path_buf())
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::Folder)),
            Some(ChangeKind::DirectoryCreated)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Any))),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Close(AccessMode::Write))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(classify(&EventKind::Remove(notify::event::RemoveKind::File)), None);
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            None
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(
                notify::event::MetadataKind::Permissions
            ))),
            None
        );
        assert_eq!(classify(&EventKind::Access(AccessKind::Read)), None);
    }

    #[tokio::test]
    async fn test_register_tree_watches_every_directory() {
        let base = TempDir::new().unwrap();
        std::fs::create_dir_all(base.path().join("a/b")).unwrap();
        std::fs::create_dir_all(base.path().join("c")).unwrap();
        std::fs::write(base.path().join("a/file.txt"), b"x").unwrap();

        let (watcher, _, _) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        let registered = watcher.register_tree(&mut watch);

        assert_eq!(registered, 4);
        assert!(watch.dirs.contains(&base.path().to_path_buf()));
        assert!(watch.dirs.contains(&base.path().join("a/b")));
        assert!(!watch.dirs.contains(&base.path().join("a/file.txt")));
    }

    #[tokio::test]
    async fn test_modify_event_stages_content_and_arms_timer() {
        let base = TempDir::new().unwrap();
        let file = base.path().join("state.json");
        std::fs::write(&file, b"{\"n\":1}").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        watcher.handle_event(&mut watch, modified(&file)).await;

        assert_eq!(buffer.get(&file), Some(b"{\"n\":1}".to_vec()));
        assert_eq!(scheduler.state(), SchedulerState::Pending);
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_content_is_copied_at_event_time() {
        let base = TempDir::new().unwrap();
        let file = base.path().join("a.txt");
        std::fs::write(&file, b"first").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        watcher.handle_event(&mut watch, modified(&file)).await;
        std::fs::write(&file, b"second").unwrap();

        assert_eq!(buffer.get(&file), Some(b"first".to_vec()));

        watcher.handle_event(&mut watch, modified(&file)).await;
        assert_eq!(buffer.get(&file), Some(b"second".to_vec()));
        assert_eq!(buffer.len(), 1);
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_unreadable_paths_are_dropped_silently() {
        let base = TempDir::new().unwrap();
        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();

        watcher
            .handle_event(&mut watch, modified(&base.path().join("vanished.txt")))
            .await;

        assert!(buffer.is_empty());
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_remove_events_are_ignored() {
        let base = TempDir::new().unwrap();
        let file = base.path().join("a.txt");
        std::fs::write(&file, b"still here").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(file.clone());
        watcher.handle_event(&mut watch, event).await;

        assert!(buffer.is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_new_directory_is_adopted() {
        let base = TempDir::new().unwrap();
        let dir = base.path().join("late");
        std::fs::create_dir_all(dir.join("inner")).unwrap();
        std::fs::write(dir.join("inner/early.txt"), b"written before the watch").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(dir.clone());
        watcher.handle_event(&mut watch, event).await;

        assert_eq!(watch.dirs, vec![dir.clone(), dir.join("inner")]);
        assert_eq!(
            buffer.get(&dir.join("inner/early.txt")),
            Some(b"written before the watch".to_vec())
        );
        assert_eq!(scheduler.state(), SchedulerState::Pending);
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_empty_new_directory_does_not_arm_timer() {
        let base = TempDir::new().unwrap();
        let dir = base.path().join("empty");
        std::fs::create_dir(&dir).unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        let event = Event::new(EventKind::Create(CreateKind::Folder)).add_path(dir.clone());
        watcher.handle_event(&mut watch, event).await;

        assert_eq!(watch.dirs, vec![dir]);
        assert!(buffer.is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_rename_stages_destination_only() {
        let base = TempDir::new().unwrap();
        let from = base.path().join("tmp-write");
        let to = base.path().join("final.txt");
        std::fs::write(&to, b"atomic").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(from.clone())
            .add_path(to.clone());
        watcher.handle_event(&mut watch, event).await;

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&to), Some(b"atomic".to_vec()));
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_untyped_rename_stages_destination_and_ignores_source() {
        let base = TempDir::new().unwrap();
        let from = base.path().join("draft.txt");
        let to = base.path().join("published.txt");
        std::fs::write(&to, b"moved in").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let mut watch = RecordingWatch::default();
        for path in [&from, &to] {
            let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
                .add_path(path.clone());
            watcher.handle_event(&mut watch, event).await;
        }

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&to), Some(b"moved in".to_vec()));
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_run_survives_notifier_errors_and_stops_when_closed() {
        let base = TempDir::new().unwrap();
        let file = base.path().join("a.txt");
        std::fs::write(&file, b"1").unwrap();

        let (watcher, buffer, scheduler) = watcher_for(base.path());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Err(notify::Error::generic("queue overflow"))).unwrap();
        tx.send(Ok(modified(&file))).unwrap();
        drop(tx);

        watcher
            .run(RecordingWatch::default(), rx, CancellationToken::new())
            .await;

        assert_eq!(buffer.get(&file), Some(b"1".to_vec()));
        scheduler.cancel();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let base = TempDir::new().unwrap();
        let (watcher, _, _) = watcher_for(base.path());
        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            watcher.run(RecordingWatch::default(), rx, shutdown),
        )
        .await
        .expect("watcher loop should stop once cancelled");
    }
}
