//! The client session mirror.
//!
//! A [`Session`] multiplexes up to 256 concurrent requests over one
//! WebSocket connection, tying responses to requests by the one-byte
//! client mark alone. On connection loss it enters error mode: pending
//! and new requests fail fast with `IO` while a background task redials
//! on the same resume id.

mod commands;
pub mod dial;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::buffer::{self, Frame};
use crate::link::{Incoming, LinkError, LinkReader, LinkWriter, SplitLink};
use crate::protocol::ErrorCode;

pub use commands::TreeNode;

/// Result of one protocol command: the decoded payload or the error
/// status reported by the server (or `IO` for local session failures).
pub type CmdResult<T> = Result<T, ErrorCode>;

/// Re-establishes a connection for a session in error mode. The
/// implementation owns its retry policy; an error is terminal for the
/// session.
#[async_trait]
pub trait Redial: Send + Sync + 'static {
    async fn redial(&self) -> Result<SplitLink, LinkError>;
}

const MARKS: usize = 256;
const WRITE_QUEUE_DEPTH: usize = 16;

/// The 256 mark slots. A slot's mutex guards both mark ownership and
/// the single-slot mailbox the read loop delivers responses into.
struct MarkSlots {
    slots: Vec<Mutex<mpsc::Receiver<Frame>>>,
    senders: Vec<mpsc::Sender<Frame>>,
    last: AtomicUsize,
}

impl MarkSlots {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(MARKS);
        let mut senders = Vec::with_capacity(MARKS);
        for _ in 0..MARKS {
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            slots.push(Mutex::new(rx));
        }
        Self { slots, senders, last: AtomicUsize::new(0) }
    }

    /// Claims a free mark, scanning from the last claimed one. Waits by
    /// yielding when all 256 are in flight.
    async fn acquire(&self) -> (u8, MutexGuard<'_, mpsc::Receiver<Frame>>) {
        let start = self.last.load(Ordering::Relaxed);
        loop {
            for i in 0..MARKS {
                let mark = (start + i) % MARKS;
                if let Ok(mut mailbox) = self.slots[mark].try_lock() {
                    self.last.store(mark, Ordering::Relaxed);
                    // Flush anything a dead connection left behind.
                    while mailbox.try_recv().is_ok() {}
                    return (mark as u8, mailbox);
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

struct Inner {
    write_tx: mpsc::Sender<Frame>,
    marks: MarkSlots,
    redial: Option<Box<dyn Redial>>,
    failure: StdMutex<Option<String>>,
}

pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Builds a session over an established link. `redial` drives error
    /// mode recovery; without one the first connection loss is terminal.
    pub fn with_link(link: SplitLink, redial: Option<Box<dyn Redial>>) -> Self {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let inner = Arc::new(Inner {
            write_tx,
            marks: MarkSlots::new(),
            redial,
            failure: StdMutex::new(None),
        });
        attach_link(Arc::clone(&inner), write_rx, link);
        Session { inner }
    }

    /// The terminal failure recorded when reconnecting gave up, if any.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().unwrap_or_else(|poison| poison.into_inner()).clone()
    }

    /// Sends one command frame and waits for its single response.
    pub(crate) async fn roundtrip(&self, build: impl FnOnce(u8) -> Frame) -> Frame {
        let (mark, mut mailbox) = self.inner.marks.acquire().await;
        if self.inner.write_tx.send(build(mark)).await.is_err() {
            return io_response(mark);
        }
        match mailbox.recv().await {
            Some(response) => response,
            None => io_response(mark),
        }
    }

    /// Sends one command frame and hands back the mark's mailbox for
    /// multi-frame reassembly.
    pub(crate) async fn begin_stream(
        &self,
        build: impl FnOnce(u8) -> Frame,
    ) -> Result<(u8, MutexGuard<'_, mpsc::Receiver<Frame>>), ErrorCode> {
        let (mark, mailbox) = self.inner.marks.acquire().await;
        if self.inner.write_tx.send(build(mark)).await.is_err() {
            return Err(ErrorCode::Io);
        }
        Ok((mark, mailbox))
    }
}

fn io_response(mark: u8) -> Frame {
    let mut frame = buffer::take();
    frame.put_u8(mark);
    frame.put_u8(ErrorCode::Io as u8);
    frame.put_str("session error mode");
    frame
}

fn attach_link(inner: Arc<Inner>, write_rx: mpsc::Receiver<Frame>, link: SplitLink) {
    let (reader, writer) = link;
    let cancel = CancellationToken::new();
    tokio::spawn(read_loop(Arc::clone(&inner), reader, cancel.clone()));
    // Boxed so the write loop, which re-attaches through error mode, has
    // a finite future type.
    let write: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(write_loop(inner, writer, write_rx, cancel));
    tokio::spawn(write);
}

async fn read_loop(inner: Arc<Inner>, mut reader: Box<dyn LinkReader>, cancel: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = reader.recv() => incoming,
        };
        match incoming {
            Ok(Incoming::Frame(frame)) => {
                if frame.is_empty() {
                    tracing::error!("response frame too short");
                    continue;
                }
                let mark = frame.read_u8(0) as usize;
                if inner.marks.senders[mark].send(frame).await.is_err() {
                    break;
                }
            }
            Ok(Incoming::Ignored) => tracing::warn!("message type is not binary"),
            Err(LinkError::Closed) => {
                if !cancel.is_cancelled() {
                    tracing::error!("disconnected");
                }
                break;
            }
            Err(err) => {
                if !cancel.is_cancelled() {
                    tracing::error!(error = %err, "failed to read message");
                }
                break;
            }
        }
    }
    cancel.cancel();
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: Box<dyn LinkWriter>,
    mut write_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let maybe = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = write_rx.recv() => maybe,
        };
        match maybe {
            Some(frame) => {
                if let Err(err) = writer.send(frame).await {
                    if !cancel.is_cancelled() {
                        tracing::error!(error = %err, "failed to write message");
                    }
                    break;
                }
            }
            None => break,
        }
    }
    cancel.cancel();
    writer.close().await;
    error_mode(inner, write_rx).await;
}

/// Fails fast while a reconnect is attempted in the background.
async fn error_mode(inner: Arc<Inner>, mut write_rx: mpsc::Receiver<Frame>) {
    tracing::warn!("error mode activated");

    // Every pending request completes with IO immediately; the
    // application layer retries after the resume.
    for mark in 0..MARKS {
        if inner.marks.slots[mark].try_lock().is_err() {
            let _ = inner.marks.senders[mark].try_send(io_response(mark as u8));
        }
    }

    if inner.redial.is_none() {
        record_failure(&inner, "session resume not configured");
        bounce_forever(inner, write_rx).await;
        return;
    }

    // Commands keep bouncing while the redial runs in the background.
    let outcome = {
        let redial = match inner.redial.as_ref() {
            Some(redial) => redial,
            None => return,
        };
        let mut redial_call = std::pin::pin!(redial.redial());
        loop {
            tokio::select! {
                maybe = write_rx.recv() => match maybe {
                    Some(frame) => bounce(&inner, &frame),
                    None => return,
                },
                outcome = &mut redial_call => break outcome,
            }
        }
    };
    match outcome {
        Ok(link) => {
            tracing::warn!("reconnected to server");
            attach_link(inner, write_rx, link);
        }
        Err(err) => {
            record_failure(&inner, &err.to_string());
            bounce_forever(inner, write_rx).await;
        }
    }
}

/// Answers an outbound command with an immediate IO response.
fn bounce(inner: &Inner, frame: &Frame) {
    if frame.is_empty() {
        return;
    }
    let mark = frame.read_u8(0);
    let _ = inner.marks.senders[mark as usize].try_send(io_response(mark));
}

async fn bounce_forever(inner: Arc<Inner>, mut write_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = write_rx.recv().await {
        bounce(&inner, &frame);
    }
}

fn record_failure(inner: &Inner, reason: &str) {
    tracing::error!(reason, "session failed");
    let mut slot = inner.failure.lock().unwrap_or_else(|poison| poison.into_inner());
    if slot.is_none() {
        *slot = Some(reason.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_are_reused_after_release() {
        let slots = MarkSlots::new();
        let (first, guard) = slots.acquire().await;
        let (second, _second_guard) = slots.acquire().await;
        assert_ne!(first, second);
        drop(guard);
        // The scan starts from the last claimed slot, so the released
        // mark comes around again.
        let (third, _) = slots.acquire().await;
        assert!(third == first || third > second);
    }

    #[tokio::test]
    async fn all_marks_can_be_claimed() {
        let slots = MarkSlots::new();
        let mut guards = Vec::new();
        for _ in 0..MARKS {
            guards.push(slots.acquire().await);
        }
        let marks: std::collections::HashSet<u8> = guards.iter().map(|(m, _)| *m).collect();
        assert_eq!(marks.len(), MARKS);
    }

    #[tokio::test]
    async fn stale_mailbox_frames_are_flushed_on_acquire() {
        let slots = MarkSlots::new();
        let (mark, guard) = slots.acquire().await;
        drop(guard);
        slots.senders[mark as usize].try_send(io_response(mark)).unwrap();

        // Force re-acquisition of the same slot.
        slots.last.store(mark as usize, Ordering::Relaxed);
        let (again, mut mailbox) = slots.acquire().await;
        assert_eq!(again, mark);
        assert!(mailbox.try_recv().is_err());
    }
}
