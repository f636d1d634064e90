//! Live/poll change observer.
//!
//! In the foreground every enabled folder gets one recursive watch handle and
//! raw events are queued into [`PendingChanges`]. One driver thread owns the
//! debounce: when the queue has been quiet for the configured window it drains
//! the whole batch through the scanner and publishes a single
//! `LibraryChanged` event. In the background the handles are closed and a
//! ticker asks the driver for a full rescan instead.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};
use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;

use super::library_scanner::LibraryScanner;
use crate::catalog_store::CatalogStore;
use crate::config::WatcherConfig;
use crate::error::{LibraryError, Result};
use crate::media_file_discovery::is_hidden_below;
use crate::protocol::{ChangeType, LibraryChange, LibraryEvent, PendingChange, ScanSummary};

const SCAN_PROGRESS_INTERVAL: usize = 25;
const FORGET_SCAN_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverMode {
    /// Foreground: one watch handle per enabled folder.
    Live,
    /// Background: no handles, periodic full rescans.
    Polling,
}

/// Queue of raw changes waiting for the debounce window to elapse.
#[derive(Debug, Default)]
pub struct PendingChanges {
    entries: Vec<PendingChange>,
    last_event_at: Option<Instant>,
    drain_count: usize,
}

impl PendingChanges {
    pub fn push(&mut self, change_type: ChangeType, path: PathBuf) {
        self.push_at(change_type, path, Instant::now());
    }

    pub fn push_at(&mut self, change_type: ChangeType, path: PathBuf, enqueued_at: Instant) {
        self.entries.push(PendingChange {
            change_type,
            path,
            enqueued_at,
        });
        self.last_event_at = Some(enqueued_at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaining quiet time before the queue may drain. `None` when empty.
    pub fn time_until_quiet(&self, debounce: Duration, now: Instant) -> Option<Duration> {
        if self.entries.is_empty() {
            return None;
        }
        let last_event_at = self.last_event_at?;
        Some(debounce.saturating_sub(now.saturating_duration_since(last_event_at)))
    }

    pub fn is_quiet(&self, debounce: Duration, now: Instant) -> bool {
        self.time_until_quiet(debounce, now) == Some(Duration::ZERO)
    }

    /// Takes every queued entry at once.
    pub fn drain(&mut self) -> Vec<PendingChange> {
        if !self.entries.is_empty() {
            self.drain_count += 1;
        }
        self.last_event_at = None;
        std::mem::take(&mut self.entries)
    }

    /// Drops queued entries at or below `folder`. Returns how many went.
    pub fn discard_under(&mut self, folder: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.path.starts_with(folder));
        if self.entries.is_empty() {
            self.last_event_at = None;
        }
        before - self.entries.len()
    }

    /// Number of non-empty drains performed so far.
    pub fn drain_count(&self) -> usize {
        self.drain_count
    }
}

/// Keeps one entry per path in first-seen order; the latest change type wins.
fn coalesce_by_path(batch: Vec<PendingChange>) -> Vec<(PathBuf, ChangeType)> {
    let mut order: Vec<PathBuf> = Vec::with_capacity(batch.len());
    let mut latest: HashMap<PathBuf, ChangeType> = HashMap::with_capacity(batch.len());
    for entry in batch {
        if latest.insert(entry.path.clone(), entry.change_type).is_none() {
            order.push(entry.path);
        }
    }
    order
        .into_iter()
        .filter_map(|path| latest.remove(&path).map(|change_type| (path, change_type)))
        .collect()
}

/// Drops additions below a directory that is itself added in the same batch;
/// walking the directory already indexes them.
fn drop_covered_by_directories(
    entries: Vec<(PathBuf, ChangeType)>,
) -> Vec<(PathBuf, ChangeType)> {
    let directories: Vec<PathBuf> = entries
        .iter()
        .filter(|(path, change_type)| *change_type != ChangeType::Remove && path.is_dir())
        .map(|(path, _)| path.clone())
        .collect();
    if directories.is_empty() {
        return entries;
    }
    entries
        .into_iter()
        .filter(|(path, change_type)| {
            *change_type == ChangeType::Remove
                || !directories
                    .iter()
                    .any(|directory| path != directory && path.starts_with(directory))
        })
        .collect()
}

/// Translates one notify event into queue entries, dropping hidden paths.
fn changes_from_event(root: &Path, event: &Event) -> Vec<(ChangeType, PathBuf)> {
    let paths = &event.paths;
    let each = |change_type: ChangeType| -> Vec<(ChangeType, PathBuf)> {
        paths.iter().map(|path| (change_type, path.clone())).collect()
    };
    let changes = match event.kind {
        EventKind::Create(_) => each(ChangeType::Add),
        EventKind::Remove(_) => each(ChangeType::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeType::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeType::Add),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => paths
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let change_type = if index == 0 {
                    ChangeType::Remove
                } else {
                    ChangeType::Add
                };
                (change_type, path.clone())
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|path| {
                let change_type = if path.exists() {
                    ChangeType::Add
                } else {
                    ChangeType::Remove
                };
                (change_type, path.clone())
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => {
            each(ChangeType::Change)
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(ChangeType::Change),
        EventKind::Any | EventKind::Access(_) | EventKind::Other => Vec::new(),
    };
    changes
        .into_iter()
        .filter(|(_, path)| !is_hidden_below(root, path))
        .collect()
}

/// True once a file's modification time has been still for `settle`.
fn is_write_settled(path: &Path, settle: Duration) -> bool {
    if settle.is_zero() {
        return true;
    }
    let Ok(modified) = fs::metadata(path).and_then(|metadata| metadata.modified()) else {
        return true;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age >= settle,
        // Modification time in the future; nothing to wait for.
        Err(_) => true,
    }
}

enum ObserverCommand {
    Wake,
    ScanFolder(PathBuf),
    RescanAll,
    ForgetFolder {
        folder: PathBuf,
        done: Sender<std::result::Result<usize, rusqlite::Error>>,
    },
    Shutdown,
}

/// State shared with the driver thread and the watch callbacks.
struct ObserverCore {
    store: Arc<CatalogStore>,
    scanner: Arc<LibraryScanner>,
    events: broadcast::Sender<LibraryEvent>,
    settings: WatcherConfig,
    pending: Mutex<PendingChanges>,
}

impl ObserverCore {
    fn pending(&self) -> MutexGuard<'_, PendingChanges> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: LibraryEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn flush_pending(&self) -> Vec<LibraryChange> {
        let batch = self.pending().drain();
        if batch.is_empty() {
            return Vec::new();
        }
        let settle = self.settings.write_settle();
        let (ready, unsettled): (Vec<_>, Vec<_>) = batch.into_iter().partition(|entry| {
            entry.change_type == ChangeType::Remove || is_write_settled(&entry.path, settle)
        });
        if !unsettled.is_empty() {
            debug!(
                "Library watch: {} path(s) still being written, requeued",
                unsettled.len()
            );
            let mut pending = self.pending();
            for entry in unsettled {
                pending.push(entry.change_type, entry.path);
            }
        }

        let mut changes = Vec::new();
        for (path, change_type) in drop_covered_by_directories(coalesce_by_path(ready)) {
            changes.extend(self.scanner.process_file_change(&path, change_type));
        }
        if !changes.is_empty() {
            self.refresh_folder_counts(&changes);
            info!("Library watch: applied {} change(s)", changes.len());
            self.publish(LibraryEvent::LibraryChanged {
                changes: changes.clone(),
            });
        }
        changes
    }

    fn refresh_folder_counts(&self, changes: &[LibraryChange]) {
        let folders = match self.store.list_watch_folders() {
            Ok(folders) => folders,
            Err(err) => {
                warn!("Library watch: failed to list folders: {}", err);
                return;
            }
        };
        let touched: HashSet<&str> = folders
            .iter()
            .map(|folder| folder.path.as_str())
            .filter(|folder| {
                changes
                    .iter()
                    .any(|change| Path::new(change.path()).starts_with(folder))
            })
            .collect();
        for folder in touched {
            if let Err(err) = self.store.refresh_folder_count(folder) {
                warn!("Library watch: failed to refresh count for {}: {}", folder, err);
            }
        }
    }

    fn scan_and_publish(&self, folder: &Path) -> Result<ScanSummary> {
        let folder_label = folder.to_string_lossy().to_string();
        let on_progress = |processed: usize, total: usize, current_path: &Path| {
            if processed % SCAN_PROGRESS_INTERVAL == 0 || processed == total {
                self.publish(LibraryEvent::ScanProgress {
                    folder: folder_label.clone(),
                    processed,
                    total,
                    current_path: current_path.to_string_lossy().to_string(),
                });
            }
        };
        let summary = self.scanner.scan_folder(folder, Some(&on_progress))?;
        self.publish(LibraryEvent::ScanCompleted {
            folder: folder_label.clone(),
            summary,
        });
        Ok(summary)
    }

    fn is_enabled_folder(&self, folder: &Path) -> bool {
        match self.store.get_watch_folder(&folder.to_string_lossy()) {
            Ok(Some(registered)) => registered.enabled,
            Ok(None) => false,
            Err(err) => {
                warn!("Library scan: failed to look up {}: {}", folder.display(), err);
                false
            }
        }
    }

    fn scan_logged(&self, folder: &Path) {
        if !self.is_enabled_folder(folder) {
            debug!("Library scan: {} skipped, folder is not enabled", folder.display());
            return;
        }
        match self.scan_and_publish(folder) {
            Ok(_) => {}
            Err(LibraryError::ScanInProgress) => {
                debug!("Library scan: {} skipped, another scan is running", folder.display());
            }
            Err(err) => warn!("Library scan: {} failed: {}", folder.display(), err),
        }
    }

    /// Unregisters `folder` and deletes its tracks once no scan or queued
    /// change can write below it again.
    fn forget_folder(&self, folder: &Path) -> std::result::Result<usize, rusqlite::Error> {
        let discarded = self.pending().discard_under(folder);
        if discarded > 0 {
            debug!(
                "Library watch: dropped {} queued change(s) under {}",
                discarded,
                folder.display()
            );
        }
        self.scanner.abort_scan_under(folder);
        if !self.scanner.wait_for_scan_under(folder, FORGET_SCAN_WAIT) {
            warn!(
                "Library scan: {} still scanning after abort, removing anyway",
                folder.display()
            );
        }
        self.store.remove_watch_folder(&folder.to_string_lossy())
    }

    fn rescan_enabled_folders(&self) {
        let folders = match self.store.enabled_watch_folders() {
            Ok(folders) => folders,
            Err(err) => {
                warn!("Library poll: failed to list folders: {}", err);
                return;
            }
        };
        debug!("Library poll: rescanning {} folder(s)", folders.len());
        for folder in folders {
            self.scan_logged(Path::new(&folder.path));
        }
    }
}

fn run_driver(core: Arc<ObserverCore>, commands: Receiver<ObserverCommand>) {
    let debounce = core.settings.debounce();
    loop {
        let wait = core.pending().time_until_quiet(debounce, Instant::now());
        let received = match wait {
            Some(wait) => commands.recv_timeout(wait),
            None => commands
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(ObserverCommand::Wake) => {}
            Ok(ObserverCommand::ScanFolder(folder)) => core.scan_logged(&folder),
            Ok(ObserverCommand::RescanAll) => core.rescan_enabled_folders(),
            Ok(ObserverCommand::ForgetFolder { folder, done }) => {
                let _ = done.send(core.forget_folder(&folder));
            }
            Ok(ObserverCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if core.pending().is_quiet(debounce, Instant::now()) {
                    core.flush_pending();
                }
            }
        }
    }
    debug!("Library observer driver stopped");
}

/// Repeating ticker that asks the driver for a full rescan.
struct PollTimer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl PollTimer {
    fn start(interval: Duration, commands: Sender<ObserverCommand>) -> std::io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("library-poll".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if commands.send(ObserverCommand::RescanAll).is_err() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Library poll timer thread panicked");
        }
    }
}

struct ObserverState {
    mode: ObserverMode,
    watchers: HashMap<PathBuf, RecommendedWatcher>,
    poll_timer: Option<PollTimer>,
    driver: Option<JoinHandle<()>>,
    command_rx: Option<Receiver<ObserverCommand>>,
}

/// Owns the watch handles, the poll timer, and the pending-change queue.
pub struct ChangeObserver {
    core: Arc<ObserverCore>,
    state: Mutex<ObserverState>,
    commands: Sender<ObserverCommand>,
}

impl ChangeObserver {
    /// Creates an observer in live mode. Nothing is watched until [`start`](Self::start).
    pub fn new(
        store: Arc<CatalogStore>,
        scanner: Arc<LibraryScanner>,
        events: broadcast::Sender<LibraryEvent>,
        settings: WatcherConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel();
        Self {
            core: Arc::new(ObserverCore {
                store,
                scanner,
                events,
                settings,
                pending: Mutex::new(PendingChanges::default()),
            }),
            state: Mutex::new(ObserverState {
                mode: ObserverMode::Live,
                watchers: HashMap::new(),
                poll_timer: None,
                driver: None,
                command_rx: Some(command_rx),
            }),
            commands,
        }
    }

    fn state(&self) -> MutexGuard<'_, ObserverState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns the driver thread and, in live mode, opens a handle per enabled folder.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        let Some(command_rx) = state.command_rx.take() else {
            return Ok(());
        };
        let core = Arc::clone(&self.core);
        let driver = std::thread::Builder::new()
            .name("library-observer".to_string())
            .spawn(move || run_driver(core, command_rx))?;
        state.driver = Some(driver);
        if state.mode == ObserverMode::Live {
            self.open_enabled_folders(&mut state);
        }
        Ok(())
    }

    pub fn mode(&self) -> ObserverMode {
        self.state().mode
    }

    pub fn live_handle_count(&self) -> usize {
        self.state().watchers.len()
    }

    pub fn has_poll_timer(&self) -> bool {
        self.state().poll_timer.is_some()
    }

    fn open_watcher(&self, root: &Path) -> Result<RecommendedWatcher> {
        let core = Arc::clone(&self.core);
        let commands = self.commands.clone();
        let root_path = root.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let changes = changes_from_event(&root_path, &event);
                    if changes.is_empty() {
                        return;
                    }
                    {
                        let mut pending = core.pending();
                        for (change_type, path) in changes {
                            pending.push(change_type, path);
                        }
                    }
                    let _ = commands.send(ObserverCommand::Wake);
                }
                Err(err) => warn!("Library watch error under {}: {}", root_path.display(), err),
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    fn open_enabled_folders(&self, state: &mut ObserverState) {
        let folders = match self.core.store.enabled_watch_folders() {
            Ok(folders) => folders,
            Err(err) => {
                warn!("Library watch: failed to list folders: {}", err);
                return;
            }
        };
        for folder in folders {
            let path = PathBuf::from(&folder.path);
            if state.watchers.contains_key(&path) {
                continue;
            }
            match self.open_watcher(&path) {
                Ok(watcher) => {
                    state.watchers.insert(path, watcher);
                }
                Err(err) => warn!("Library watch: cannot watch {}: {}", folder.path, err),
            }
        }
    }

    /// Opens a live handle for `folder`. Returns false when already watched or
    /// when the observer is polling.
    pub fn watch_folder(&self, folder: &Path) -> Result<bool> {
        let mut state = self.state();
        if state.mode != ObserverMode::Live || state.watchers.contains_key(folder) {
            return Ok(false);
        }
        let watcher = self.open_watcher(folder)?;
        state.watchers.insert(folder.to_path_buf(), watcher);
        debug!("Library watch: watching {}", folder.display());
        Ok(true)
    }

    /// Closes the live handle for `folder`, if any.
    pub fn unwatch_folder(&self, folder: &Path) -> bool {
        let mut state = self.state();
        if state.mode != ObserverMode::Live {
            return false;
        }
        state.watchers.remove(folder).is_some()
    }

    /// Closes the handle for `folder`, cancels its scan and queued changes,
    /// then unregisters it and deletes its tracks. Runs on the driver when it
    /// is alive so nothing queued before this call can write below `folder`
    /// afterwards. Returns the number of tracks deleted.
    pub fn remove_folder(&self, folder: &Path) -> Result<usize> {
        let driver_running = {
            let mut state = self.state();
            state.watchers.remove(folder);
            state.driver.is_some()
        };
        self.core.pending().discard_under(folder);
        self.core.scanner.abort_scan_under(folder);
        if driver_running {
            let (done, done_rx) = mpsc::channel();
            let command = ObserverCommand::ForgetFolder {
                folder: folder.to_path_buf(),
                done,
            };
            if self.commands.send(command).is_ok() {
                if let Ok(result) = done_rx.recv() {
                    return Ok(result?);
                }
            }
        }
        Ok(self.core.forget_folder(folder)?)
    }

    pub fn on_background(&self) {
        let mut state = self.state();
        if state.mode == ObserverMode::Polling {
            return;
        }
        let closed = state.watchers.len();
        state.watchers.clear();
        state.mode = ObserverMode::Polling;
        match PollTimer::start(self.core.settings.poll_interval(), self.commands.clone()) {
            Ok(timer) => state.poll_timer = Some(timer),
            Err(err) => warn!("Library poll: failed to start timer: {}", err),
        }
        info!(
            "Library observer: backgrounded, closed {} handle(s), polling every {}s",
            closed, self.core.settings.poll_interval_secs
        );
    }

    pub fn on_foreground(&self) {
        let mut state = self.state();
        if state.mode == ObserverMode::Live {
            return;
        }
        if let Some(timer) = state.poll_timer.take() {
            timer.stop();
        }
        state.mode = ObserverMode::Live;
        self.open_enabled_folders(&mut state);
        info!(
            "Library observer: foregrounded, {} live handle(s)",
            state.watchers.len()
        );
    }

    /// Queues a change as if a watch handle had reported it.
    pub fn enqueue(&self, change_type: ChangeType, path: PathBuf) {
        self.core.pending().push(change_type, path);
        let _ = self.commands.send(ObserverCommand::Wake);
    }

    /// Drains the queue now, regardless of the debounce window.
    pub fn flush_pending(&self) -> Vec<LibraryChange> {
        self.core.flush_pending()
    }

    pub fn pending_len(&self) -> usize {
        self.core.pending().len()
    }

    pub fn drain_count(&self) -> usize {
        self.core.pending().drain_count()
    }

    /// Schedules a scan of `folder` on the driver thread.
    pub fn request_scan(&self, folder: &Path) {
        let _ = self
            .commands
            .send(ObserverCommand::ScanFolder(folder.to_path_buf()));
    }

    pub fn request_rescan_all(&self) {
        let _ = self.commands.send(ObserverCommand::RescanAll);
    }

    /// Scans `folder` on the calling thread, publishing progress and completion.
    pub fn scan_now(&self, folder: &Path) -> Result<ScanSummary> {
        self.core.scan_and_publish(folder)
    }

    /// Closes every handle, stops the timer, and joins the driver. Idempotent.
    pub fn shutdown(&self) {
        let driver = {
            let mut state = self.state();
            state.watchers.clear();
            if let Some(timer) = state.poll_timer.take() {
                timer.stop();
            }
            state.driver.take()
        };
        let Some(driver) = driver else {
            return;
        };
        self.core.scanner.abort_scan();
        let _ = self.commands.send(ObserverCommand::Shutdown);
        if driver.join().is_err() {
            warn!("Library observer driver panicked");
        }
    }
}

impl Drop for ChangeObserver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
