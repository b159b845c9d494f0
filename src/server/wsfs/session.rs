//! One protocol session: the per-client context that outlives a single
//! WebSocket connection.
//!
//! A session owns the file-descriptor table and a connection lock. While
//! a connection is attached, a read loop parses and dispatches command
//! frames and a write loop drains the shared response queue; when either
//! loop dies the session goes dormant with its descriptors intact, ready
//! for a resume attachment.

use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::buffer::Frame;
use crate::link::{Incoming, LinkError, LinkReader, LinkWriter, SplitLink};
use crate::server::storage::Storage;
use crate::server::wsfs::dispatch;

/// Depth of the per-connection response queue. Handlers block sending
/// into a full queue until the write loop catches up.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Configured principal ids used for the two-bit owner encoding.
/// A `-1` in the configuration wraps to a uid/gid no real file carries.
#[derive(Debug, Clone, Copy)]
pub struct OwnerIds {
    pub uid: u32,
    pub gid: u32,
    pub other_uid: u32,
    pub other_gid: u32,
}

impl OwnerIds {
    pub fn from_config(uid: i64, gid: i64, other_uid: i64, other_gid: i64) -> Self {
        Self {
            uid: uid as u32,
            gid: gid as u32,
            other_uid: other_uid as u32,
            other_gid: other_gid as u32,
        }
    }
}

/// Counts in-flight command handlers so teardown can wait for them.
struct Gate {
    active: AtomicUsize,
    drained: Notify,
}

impl Gate {
    fn new() -> Self {
        Self { active: AtomicUsize::new(0), drained: Notify::new() }
    }

    fn enter(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct Session {
    id: u64,
    storage: Arc<Storage>,
    owner: OwnerIds,
    fds: DashMap<u32, Arc<File>>,
    fd_last: AtomicU32,
    conn_lock: Arc<Mutex<()>>,
    strikes: AtomicU32,
    gate: Gate,
    cancel: StdMutex<CancellationToken>,
}

impl Session {
    pub(crate) fn new(id: u64, storage: Arc<Storage>, owner: OwnerIds) -> Arc<Self> {
        Arc::new(Self {
            id,
            storage,
            owner,
            fds: DashMap::new(),
            fd_last: AtomicU32::new(0),
            conn_lock: Arc::new(Mutex::new(())),
            strikes: AtomicU32::new(0),
            gate: Gate::new(),
            cancel: StdMutex::new(CancellationToken::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn owner(&self) -> OwnerIds {
        self.owner
    }

    /// Registers a host file and hands out its opaque handle. Allocation
    /// is monotonic; on the rare wraparound collision the next free
    /// handle is probed.
    pub(crate) fn new_fd(&self, file: File) -> u32 {
        let file = Arc::new(file);
        loop {
            let fd = self.fd_last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Entry::Vacant(slot) = self.fds.entry(fd) {
                slot.insert(Arc::clone(&file));
                return fd;
            }
        }
    }

    pub(crate) fn fd(&self, fd: u32) -> Option<Arc<File>> {
        self.fds.get(&fd).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a handle from the table. The host descriptor closes when
    /// the last in-flight operation drops its reference.
    pub(crate) fn remove_fd(&self, fd: u32) -> Option<Arc<File>> {
        self.fds.remove(&fd).map(|(_, file)| file)
    }

    pub(crate) fn open_fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Best-effort close of every remaining descriptor, used at session
    /// destruction.
    pub(crate) fn close_fds(&self) {
        self.fds.clear();
    }

    /// Tries to become the session's single attached connection.
    /// Succeeds only while the session is dormant.
    pub(crate) fn try_attach_lock(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.conn_lock).try_lock_owned().ok()
    }

    pub(crate) fn add_strike(&self) -> u32 {
        self.strikes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn gate_enter(&self) {
        self.gate.enter();
    }

    pub(crate) fn gate_leave(&self) {
        self.gate.leave();
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|poison| poison.into_inner()).clone()
    }

    fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap_or_else(|poison| poison.into_inner()) = token;
    }

    /// Binds a connection to this session and spawns its two loops. The
    /// caller must hold the connection lock; the guard is released by the
    /// write loop when the connection dies.
    pub(crate) fn attach(self: &Arc<Self>, link: SplitLink, guard: OwnedMutexGuard<()>) {
        let (reader, writer) = link;
        let cancel = CancellationToken::new();
        self.set_cancel(cancel.clone());
        let (tx, rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);

        tokio::spawn(read_loop(Arc::clone(self), reader, tx, cancel.clone()));
        tokio::spawn(write_loop(Arc::clone(self), writer, rx, cancel, guard));
    }

    /// Cancels the attached connection, if any, and waits until every
    /// in-flight handler has finished.
    pub(crate) async fn stop(&self) {
        self.current_cancel().cancel();
        self.gate.wait().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

async fn read_loop(
    session: Arc<Session>,
    mut reader: Box<dyn LinkReader>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = reader.recv() => incoming,
        };
        match incoming {
            Ok(Incoming::Frame(frame)) => dispatch::dispatch(&session, frame, &tx).await,
            Ok(Incoming::Ignored) => {
                tracing::warn!(id = session.id, "message type is not binary");
            }
            Err(LinkError::Closed) => {
                if !cancel.is_cancelled() {
                    tracing::info!(id = session.id, "peer disconnected");
                }
                break;
            }
            Err(err) => {
                if !cancel.is_cancelled() {
                    tracing::error!(id = session.id, error = %err, "failed to read message");
                }
                break;
            }
        }
    }
    cancel.cancel();
    // Handlers still hold clones of the response sender; wait them out so
    // nothing writes into a closed queue.
    session.gate.wait().await;
    drop(tx);
}

async fn write_loop(
    session: Arc<Session>,
    mut writer: Box<dyn LinkWriter>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    guard: OwnedMutexGuard<()>,
) {
    loop {
        let maybe = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => maybe,
        };
        match maybe {
            Some(frame) => {
                if let Err(err) = writer.send(frame).await {
                    if !cancel.is_cancelled() {
                        match err {
                            LinkError::Closed => tracing::info!(id = session.id, "peer disconnected"),
                            err => {
                                tracing::error!(id = session.id, error = %err, "failed to write message")
                            }
                        }
                    }
                    break;
                }
            }
            None => break,
        }
    }
    cancel.cancel();
    // Closing the connection is the write loop's job, exactly once.
    writer.close().await;
    // Drain the queue until every sender is gone so no handler blocks on
    // a full queue nobody reads.
    while rx.recv().await.is_some() {}
    session.strikes.store(0, Ordering::Relaxed);
    tracing::info!(id = session.id, "session hibernated");
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_session() -> Arc<Session> {
        let storage =
            Arc::new(Storage::new(std::path::Path::new("/tmp"), false).expect("storage"));
        Session::new(1, storage, OwnerIds::from_config(-1, -1, -1, -1))
    }

    fn null_file() -> File {
        File::open("/dev/null").expect("open /dev/null")
    }

    #[test]
    fn fd_handles_are_unique_and_monotonic() {
        let session = test_session();
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..64 {
            let fd = session.new_fd(null_file());
            assert!(seen.insert(fd));
            assert!(fd > last);
            last = fd;
        }
        assert_eq!(session.open_fd_count(), 64);
    }

    #[test]
    fn closed_fds_are_not_recycled() {
        let session = test_session();
        let first = session.new_fd(null_file());
        assert!(session.remove_fd(first).is_some());
        assert!(session.remove_fd(first).is_none());
        let second = session.new_fd(null_file());
        assert_ne!(first, second);
    }

    #[test]
    fn wraparound_probes_past_live_handles() {
        let session = test_session();
        let first = session.new_fd(null_file());
        assert_eq!(first, 1);
        // Force the counter to collide with the live handle.
        session.fd_last.store(0, Ordering::Relaxed);
        let second = session.new_fd(null_file());
        assert_eq!(second, 2);
    }

    #[test]
    fn attach_lock_is_exclusive() {
        let session = test_session();
        let guard = session.try_attach_lock().expect("first lock");
        assert!(session.try_attach_lock().is_none());
        drop(guard);
        assert!(session.try_attach_lock().is_some());
    }

    #[tokio::test]
    async fn gate_waits_for_inflight_handlers() {
        let session = test_session();
        session.gate_enter();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.gate.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        session.gate_leave();
        waiter.await.expect("gate wait");
    }
}
