//! # Synchronization Engine
//!
//! Turns local filesystem changes into mutations committed by the
//! authority, applies remote `syncEvent`s to the local tree, and (on the
//! storage node) applies client mutations to the authoritative tree.
//!
//! ## Work Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SyncEngine                                    │
//! │                                                                         │
//! │  watcher ──LocalChange──┐                                               │
//! │  relay   ──SyncEvent────┼──► bounded queue ──► engine loop              │
//! │  queries ──Mutation─────┘                        │                      │
//! │                                                  ▼                      │
//! │                                          PathTracker (per-path order)   │
//! │                                                  │ start                │
//! │                                                  ▼                      │
//! │         ┌────────────────────┬───────────────────┴──────────────┐       │
//! │         ▼                    ▼                                  ▼       │
//! │   local::apply_local   replica::apply_remote           Committer::commit│
//! │   (plan → authority    (fetch → write → mirror)        (store → fs →    │
//! │    → mirror)                                             broadcast)     │
//! │                                                                         │
//! │  Finished items release their keys; waiting items start in order.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only `Transient` failures are retried (exponential backoff bounded by
//! [`EngineConfig::retry_max_elapsed`]); every other failure goes to the
//! [`SyncObserver`] and the path returns to idle.

pub mod authority;
pub mod bootstrap;
pub mod echo;
pub mod fsops;
mod local;
mod replica;
pub mod storage;
pub mod tracker;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use gobox_core::{FileNode, Mutation, NodeId, Origin, SyncEvent};
use gobox_db::FileTreeRepository;

use crate::error::{SyncError, SyncResult};

pub use authority::{Authority, LocalAuthority, RelayAuthority};
pub use echo::EchoGuard;
pub use storage::{Committer, EventPublisher};
pub use tracker::PathState;

use fsops::{key_of, relative_segments, INTERNAL_DIR};
use tracker::{PathTracker, Ticket};

/// How long shutdown waits for running work before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sync root on the local filesystem.
    pub root: PathBuf,
    /// How long the footprint of an engine write is kept for echo checks.
    pub echo_window: Duration,
    /// Upper bound on the time spent retrying one transient failure.
    pub retry_max_elapsed: Duration,
    /// Capacity of the submission queue.
    pub queue_capacity: usize,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            echo_window: Duration::from_secs(2),
            retry_max_elapsed: Duration::from_secs(60),
            queue_capacity: 1024,
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR).join("staging")
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Receives engine outcomes (status displays, tests).
pub trait SyncObserver: Send + Sync {
    /// A local change was committed by the authority.
    fn on_local_committed(&self, _node: &FileNode) {}

    /// A remote event changed the local tree.
    fn on_remote_applied(&self, _event: &SyncEvent) {}

    /// Work for `path` failed for good.
    fn on_failure(&self, _path: &Path, _error: &SyncError) {}

    /// `path` changed state.
    fn on_state(&self, _path: &Path, _state: PathState) {}
}

/// Default observer that ignores everything.
pub struct NoOpObserver;

impl SyncObserver for NoOpObserver {}

// =============================================================================
// Work Items
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChangeKind {
    Created,
    Modified,
    Removed,
    Renamed { from: PathBuf },
}

/// A change observed on the local filesystem. `path` is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub kind: LocalChangeKind,
    pub path: PathBuf,
}

impl LocalChange {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        LocalChange {
            kind: LocalChangeKind::Created,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        LocalChange {
            kind: LocalChangeKind::Modified,
            path: path.into(),
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        LocalChange {
            kind: LocalChangeKind::Removed,
            path: path.into(),
        }
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        LocalChange {
            kind: LocalChangeKind::Renamed { from: from.into() },
            path: to.into(),
        }
    }
}

enum Work {
    Local(LocalChange),
    Remote(SyncEvent),
    Commit {
        mutation: Mutation,
        reply: oneshot::Sender<SyncResult<FileNode>>,
    },
}

impl Work {
    fn describe(&self) -> &'static str {
        match self {
            Work::Local(_) => "local change",
            Work::Remote(_) => "remote event",
            Work::Commit { .. } => "commit",
        }
    }
}

enum Command {
    Submit {
        keys: Vec<PathBuf>,
        state: PathState,
        work: Work,
    },
    State {
        key: PathBuf,
        reply: oneshot::Sender<PathState>,
    },
    Shutdown,
}

/// Everything a running work item needs.
struct Context {
    root: PathBuf,
    staging_dir: PathBuf,
    store: FileTreeRepository,
    authority: Arc<dyn Authority>,
    committer: Option<Arc<Committer>>,
    echo: Arc<EchoGuard>,
    observer: Arc<dyn SyncObserver>,
    retry_max_elapsed: Duration,
}

/// Releases the item's keys when the work finishes, panics or is aborted.
struct Release {
    ticket: Ticket,
    done: mpsc::UnboundedSender<Ticket>,
}

impl Drop for Release {
    fn drop(&mut self) {
        let _ = self.done.send(self.ticket);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Engine under construction.
///
/// ```rust,ignore
/// let handle = SyncEngine::new(config, store, authority)
///     .with_committer(committer)
///     .with_echo(echo)
///     .with_observer(Arc::new(MyObserver))
///     .spawn();
/// ```
pub struct SyncEngine {
    config: EngineConfig,
    store: FileTreeRepository,
    authority: Arc<dyn Authority>,
    committer: Option<Arc<Committer>>,
    echo: Arc<EchoGuard>,
    observer: Arc<dyn SyncObserver>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: FileTreeRepository, authority: Arc<dyn Authority>) -> Self {
        let echo = Arc::new(EchoGuard::new(config.echo_window));
        SyncEngine {
            config,
            store,
            authority,
            committer: None,
            echo,
            observer: Arc::new(NoOpObserver),
        }
    }

    /// Storage nodes: commits client mutations submitted via
    /// [`EngineHandle::commit`].
    pub fn with_committer(mut self, committer: Arc<Committer>) -> Self {
        self.committer = Some(committer);
        self
    }

    /// Shares an echo guard with other writers (the committer).
    pub fn with_echo(mut self, echo: Arc<EchoGuard>) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn echo(&self) -> Arc<EchoGuard> {
        self.echo.clone()
    }

    /// Starts the engine loop.
    pub fn spawn(self) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = watch::channel(0usize);

        let ctx = Arc::new(Context {
            root: self.config.root.clone(),
            staging_dir: self.config.staging_dir(),
            store: self.store.clone(),
            authority: self.authority,
            committer: self.committer.clone(),
            echo: self.echo.clone(),
            observer: self.observer,
            retry_max_elapsed: self.config.retry_max_elapsed,
        });

        let task = tokio::spawn(run_loop(ctx, commands_rx, done_tx, done_rx, pending_tx));
        info!(root = %self.config.root.display(), "Sync engine started");

        EngineHandle {
            commands: commands_tx,
            pending: pending_rx,
            echo: self.echo,
            store: self.store,
            root: self.config.root,
            has_committer: self.committer.is_some(),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

// =============================================================================
// Engine Loop
// =============================================================================

async fn run_loop(
    ctx: Arc<Context>,
    mut commands: mpsc::Receiver<Command>,
    done_tx: mpsc::UnboundedSender<Ticket>,
    mut done_rx: mpsc::UnboundedReceiver<Ticket>,
    pending: watch::Sender<usize>,
) {
    let mut tracker: PathTracker<Work> = PathTracker::new();
    let mut workers = JoinSet::new();

    let start = |workers: &mut JoinSet<()>, ticket: Ticket, work: Work| {
        let release = Release {
            ticket,
            done: done_tx.clone(),
        };
        let ctx = ctx.clone();
        workers.spawn(async move {
            let _release = release;
            execute(&ctx, work).await;
        });
    };

    loop {
        tokio::select! {
            biased;

            Some(ticket) = done_rx.recv() => {
                for (ticket, work) in tracker.complete(ticket) {
                    start(&mut workers, ticket, work);
                }
            }

            Some(_) = workers.join_next(), if !workers.is_empty() => {}

            command = commands.recv() => match command {
                Some(Command::Submit { keys, state, work }) => {
                    let kind = work.describe();
                    match tracker.submit(keys, state, work) {
                        Some((ticket, work)) => start(&mut workers, ticket, work),
                        None => debug!(kind, "Work waits for a busy path"),
                    }
                }
                Some(Command::State { key, reply }) => {
                    let _ = reply.send(tracker.state(&key));
                }
                Some(Command::Shutdown) | None => break,
            },
        }
        pending.send_replace(tracker.pending());
    }

    for work in tracker.drain_waiting() {
        if let Work::Commit { reply, .. } = work {
            let _ = reply.send(Err(SyncError::ShuttingDown));
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(running = workers.len(), "Aborting engine work still running at shutdown");
        workers.abort_all();
    }
    pending.send_replace(0);
    info!("Sync engine stopped");
}

async fn execute(ctx: &Context, work: Work) {
    match work {
        Work::Local(change) => {
            // Runs after any earlier remote apply on the same path, so the
            // guard compares against what that apply left on disk.
            if is_own_echo(ctx, &change).await {
                debug!(path = %change.path.display(), "Dropping echo of our own write");
                return;
            }
            let path = change.path.clone();
            ctx.observer.on_state(&path, PathState::LocalChangePending);
            if let Err(e) = local::apply_local(ctx, change).await {
                warn!(path = %path.display(), error = %e, "Local change failed");
                ctx.observer.on_failure(&path, &e);
            }
            ctx.observer.on_state(&path, PathState::Idle);
        }
        Work::Remote(event) => {
            let path = fsops::absolute(&ctx.root, &event.path);
            ctx.observer.on_state(&path, PathState::RemoteApplyInFlight);
            match replica::apply_remote(ctx, &event).await {
                Ok(true) => ctx.observer.on_remote_applied(&event),
                Ok(false) => debug!(id = event.node.id, token = event.token, "Remote event already applied"),
                Err(e) => {
                    warn!(id = event.node.id, path = %path.display(), error = %e, "Remote event failed");
                    ctx.observer.on_failure(&path, &e);
                }
            }
            ctx.observer.on_state(&path, PathState::Idle);
        }
        Work::Commit { mutation, reply } => {
            let result = match &ctx.committer {
                Some(committer) => committer.commit(mutation, Origin::Remote).await,
                None => Err(SyncError::InvalidState(
                    "this node does not commit mutations".to_string(),
                )),
            };
            let _ = reply.send(result);
        }
    }
}

async fn is_own_echo(ctx: &Context, change: &LocalChange) -> bool {
    if !ctx.echo.is_echo(&change.path).await {
        return false;
    }
    match &change.kind {
        LocalChangeKind::Renamed { from } => ctx.echo.is_echo(from).await,
        _ => true,
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Runs `op`, retrying only transient failures with exponential backoff
/// until `max_elapsed` has passed.
pub async fn with_retry<T, F, Fut>(max_elapsed: Duration, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };

    backoff::future::retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_retryable() {
                    debug!(error = %e, "Transient failure, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    pending: watch::Receiver<usize>,
    echo: Arc<EchoGuard>,
    store: FileTreeRepository,
    root: PathBuf,
    has_committer: bool,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn echo(&self) -> &Arc<EchoGuard> {
        &self.echo
    }

    /// Queues a local change. Changes outside the root, inside the internal
    /// directory, or caused by the engine's own writes are dropped.
    pub async fn local_change(&self, change: LocalChange) -> SyncResult<()> {
        match self.local_command(change) {
            Some(command) => self
                .commands
                .send(command)
                .await
                .map_err(|_| SyncError::ShuttingDown),
            None => Ok(()),
        }
    }

    /// Same as [`local_change`](Self::local_change) for non-async callers
    /// (the watcher thread).
    pub fn local_change_blocking(&self, change: LocalChange) -> SyncResult<()> {
        match self.local_command(change) {
            Some(command) => self
                .commands
                .blocking_send(command)
                .map_err(|_| SyncError::ShuttingDown),
            None => Ok(()),
        }
    }

    fn local_command(&self, change: LocalChange) -> Option<Command> {
        let mut keys = vec![key_of(&relative_segments(&self.root, &change.path)?)];
        if let LocalChangeKind::Renamed { from } = &change.kind {
            if let Some(segments) = relative_segments(&self.root, from) {
                keys.push(key_of(&segments));
            }
        }
        if keys[0].as_os_str().is_empty() {
            return None;
        }
        Some(Command::Submit {
            keys,
            state: PathState::LocalChangePending,
            work: Work::Local(change),
        })
    }

    /// Queues a `syncEvent` received from the storage node.
    pub async fn remote_event(&self, event: SyncEvent) -> SyncResult<()> {
        let mut keys = vec![key_of(&event.path)];
        if let Some(previous) = &event.previous_path {
            keys.push(key_of(previous));
        }
        self.commands
            .send(Command::Submit {
                keys,
                state: PathState::RemoteApplyInFlight,
                work: Work::Remote(event.into_remote()),
            })
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Commits a client mutation on the storage node, ordered with every
    /// other piece of work touching the same paths.
    pub async fn commit(&self, mutation: Mutation) -> SyncResult<FileNode> {
        if !self.has_committer {
            return Err(SyncError::InvalidState(
                "this node does not commit mutations".to_string(),
            ));
        }

        let keys = self.mutation_keys(&mutation).await;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                keys,
                state: PathState::RemoteApplyInFlight,
                work: Work::Commit { mutation, reply },
            })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        response.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Paths a mutation touches. Unknown nodes fall back to the root key,
    /// which orders the mutation behind everything; the commit itself then
    /// reports the missing node.
    async fn mutation_keys(&self, mutation: &Mutation) -> Vec<PathBuf> {
        let keys = match mutation {
            Mutation::Create {
                parent_id, name, ..
            } => vec![self.child_key(*parent_id, name).await],
            Mutation::Update { id, .. } | Mutation::Trash { id } => vec![self.node_key(*id).await],
            Mutation::Move {
                id,
                new_parent_id,
                new_name,
            } => vec![
                self.node_key(*id).await,
                self.child_key(*new_parent_id, new_name).await,
            ],
        };
        keys.into_iter().map(Option::unwrap_or_default).collect()
    }

    async fn node_key(&self, id: NodeId) -> Option<PathBuf> {
        let segments = self.store.ancestor_path(id).await.ok()?;
        Some(key_of(&segments))
    }

    async fn child_key(&self, parent_id: NodeId, name: &str) -> Option<PathBuf> {
        let mut segments = self.store.ancestor_path(parent_id).await.ok()?;
        segments.push(name.to_string());
        Some(key_of(&segments))
    }

    /// State of an absolute path.
    pub async fn path_state(&self, path: &Path) -> PathState {
        let Some(segments) = relative_segments(&self.root, path) else {
            return PathState::Idle;
        };
        let (reply, response) = oneshot::channel();
        let command = Command::State {
            key: key_of(&segments),
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return PathState::Idle;
        }
        response.await.unwrap_or(PathState::Idle)
    }

    /// Running plus waiting work items.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Waits until no work is pending, including work queued before the
    /// call that the loop has not picked up yet.
    pub async fn wait_idle(&self, limit: Duration) -> SyncResult<()> {
        // Round-trip through the queue so earlier submissions are counted.
        let _ = self.path_state(&self.root).await;
        let mut pending = self.pending.clone();
        let drained = async move {
            let idle = pending.wait_for(|count| *count == 0).await;
            idle.map(|_| ())
        };
        tokio::time::timeout(limit, drained)
            .await
            .map_err(|_| SyncError::timeout(limit))?
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Stops accepting work, fails waiting commits and waits for running
    /// work. Idempotent.
    pub async fn shutdown(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(task) = task else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = task.await {
            warn!(error = %e, "Engine loop ended abnormally");
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("root", &self.root)
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gobox_core::{normalize_timestamp, timestamp_now, SyncEventKind, ROOT_ID};
    use gobox_db::{Database, DbConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves fixed content and keeps every submitted mutation.
    struct RecordingAuthority {
        node: FileNode,
        content: Vec<u8>,
        submitted: Mutex<Vec<Mutation>>,
    }

    #[async_trait]
    impl Authority for RecordingAuthority {
        async fn submit(&self, mutation: Mutation) -> SyncResult<FileNode> {
            let mut node = self.node.clone();
            if let Mutation::Update {
                modified_at,
                content,
                ..
            } = &mutation
            {
                node.modified_at = *modified_at;
                node.size = content.as_ref().map_or(node.size, |c| c.len() as u64);
            }
            self.submitted.lock().unwrap().push(mutation);
            Ok(node)
        }

        async fn fetch_content(&self, _node: &FileNode) -> SyncResult<Vec<u8>> {
            Ok(self.content.clone())
        }
    }

    #[tokio::test]
    async fn test_user_edit_right_after_remote_write_is_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let written_at = normalize_timestamp(timestamp_now() - chrono::Duration::hours(1));
        let node = FileNode {
            id: 5,
            parent_id: ROOT_ID,
            name: "a.txt".to_string(),
            is_directory: false,
            visible: true,
            size: 6,
            created_at: written_at,
            modified_at: written_at,
            mime: None,
        };
        let authority = Arc::new(RecordingAuthority {
            node: node.clone(),
            content: b"remote".to_vec(),
            submitted: Mutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(EngineConfig::new(&root), db.tree(), authority.clone()).spawn();

        let event = SyncEvent::new(SyncEventKind::Created, node, vec!["a.txt".into()], 1, Origin::Remote);
        engine.remote_event(event).await.unwrap();
        engine.wait_idle(Duration::from_secs(5)).await.unwrap();
        let path = root.join("a.txt");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"remote");

        // The watcher reporting our own write changes nothing.
        engine.local_change(LocalChange::modified(&path)).await.unwrap();
        engine.wait_idle(Duration::from_secs(5)).await.unwrap();
        assert!(authority.submitted.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::fs::write(&path, b"user edited this file").await.unwrap();
        engine.local_change(LocalChange::modified(&path)).await.unwrap();
        engine.wait_idle(Duration::from_secs(5)).await.unwrap();

        let submitted = authority.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        match &submitted[0] {
            Mutation::Update { id, content, .. } => {
                assert_eq!(*id, 5);
                assert_eq!(content.as_deref(), Some(&b"user edited this file"[..]));
            }
            other => panic!("expected an update, got {:?}", other),
        }

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(Duration::from_secs(5), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(SyncError::ConnectionFailed("relay busy".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_failures() {
        let calls = AtomicUsize::new(0);
        let result: SyncResult<()> = with_retry(Duration::from_secs(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::remote(gobox_core::ErrorKind::Conflict, "taken")) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Remote { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_change_constructors() {
        let change = LocalChange::renamed("/sync/a.txt", "/sync/b.txt");
        assert_eq!(change.path, PathBuf::from("/sync/b.txt"));
        assert_eq!(
            change.kind,
            LocalChangeKind::Renamed {
                from: PathBuf::from("/sync/a.txt")
            }
        );
        assert_eq!(LocalChange::removed("/x").kind, LocalChangeKind::Removed);
    }
}
