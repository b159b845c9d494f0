//! The WSFS session protocol engine.
//!
//! [`WsfsHandler`] owns the process-wide session registry: it binds
//! upgraded WebSocket connections to new or dormant sessions by resume
//! id, enforces at-most-one connection per session, and collects
//! sessions abandoned for too many scan periods.

pub(crate) mod commands;
pub(crate) mod dispatch;
pub(crate) mod errno;
pub mod path;
pub mod resume;
pub mod session;
pub(crate) mod treedir;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;

use crate::link::{frame_from_bytes, Incoming, LinkError, LinkReader, LinkWriter, SplitLink};
use crate::buffer::Frame;
use crate::protocol::{MAX_FRAME, RESUME_HEADER, SUBPROTOCOL};
use crate::server::storage::Storage;
use resume::{CodecError, ResumeCodec};
use session::{OwnerIds, Session};

/// How often the collector sweeps for abandoned sessions.
const SCAN_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Dormant scan periods a session survives before destruction.
const MAX_STRIKES: u32 = 5;

/// Why a connection could not be attached to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachError {
    /// No session with that id; the client gets HTTP 400.
    NotFound,
    /// The session already has a live connection; HTTP 412, the client
    /// retries after the other connection dies.
    Busy,
}

pub struct WsfsHandler {
    sessions: DashMap<u64, Arc<Session>>,
    session_last: AtomicU64,
    codec: ResumeCodec,
    owner: OwnerIds,
}

impl WsfsHandler {
    pub fn new(owner: OwnerIds) -> Result<Self, CodecError> {
        Ok(Self {
            sessions: DashMap::new(),
            session_last: AtomicU64::new(0),
            codec: ResumeCodec::new()?,
            owner,
        })
    }

    /// Creates a session bound to `storage` and returns its id with the
    /// resume id for the response header. Session ids are never reused.
    pub fn open_session(&self, storage: Arc<Storage>) -> Option<(u64, String)> {
        let id = loop {
            let id = self.session_last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Entry::Vacant(slot) = self.sessions.entry(id) {
                slot.insert(Session::new(id, Arc::clone(&storage), self.owner));
                break id;
            }
        };
        match self.codec.encode(id) {
            Some(resume_id) => {
                tracing::info!(id, "session created");
                Some((id, resume_id))
            }
            None => {
                tracing::error!(id, "resume id encode failed");
                self.destroy_session(id);
                None
            }
        }
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn decode_resume(&self, resume_id: &str) -> Option<u64> {
        self.codec.decode(resume_id)
    }

    /// Attaches a connection to the session, enforcing at-most-one live
    /// connection.
    pub fn attach(&self, id: u64, link: SplitLink) -> Result<Arc<Session>, AttachError> {
        let Some(session) = self.session(id) else {
            return Err(AttachError::NotFound);
        };
        let Some(guard) = session.try_attach_lock() else {
            return Err(AttachError::Busy);
        };
        session.attach(link, guard);
        Ok(session)
    }

    fn destroy_session(&self, id: u64) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            let open_fds = session.open_fd_count();
            session.close_fds();
            tracing::info!(id, open_fds, "session destroyed");
        }
    }

    /// One collector sweep: every dormant session earns a strike, and a
    /// session at [`MAX_STRIKES`] is destroyed with its descriptors.
    /// Attached sessions are skipped; their strikes reset when the write
    /// loop exits.
    pub fn collect_once(&self) {
        let mut doomed = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if let Some(guard) = session.try_attach_lock() {
                if session.add_strike() >= MAX_STRIKES {
                    // Hold the lock through destruction so a concurrent
                    // resume cannot slip in.
                    doomed.push((*entry.key(), guard));
                }
            }
        }
        for (id, guard) in doomed {
            self.destroy_session(id);
            drop(guard);
        }
    }

    pub fn spawn_collector(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCAN_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would strike fresh sessions.
            tick.tick().await;
            loop {
                tick.tick().await;
                handler.collect_once();
            }
        })
    }

    /// Cancels every session and waits for handler drain, then destroys
    /// them. Used by server shutdown.
    pub async fn stop(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();
        for session in sessions {
            session.stop().await;
            self.destroy_session(session.id());
        }
    }

    /// Serves one upgrade request that already passed authentication.
    pub fn serve_upgrade(
        self: &Arc<Self>,
        ws: WebSocketUpgrade,
        headers: &HeaderMap,
        storage: Arc<Storage>,
    ) -> Response {
        let (id, new_resume_id) = match headers.get(RESUME_HEADER) {
            Some(value) => {
                let Some(id) = value.to_str().ok().and_then(|v| self.decode_resume(v)) else {
                    return StatusCode::BAD_REQUEST.into_response();
                };
                (id, None)
            }
            None => match self.open_session(storage) {
                Some((id, resume_id)) => (id, Some(resume_id)),
                None => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            },
        };

        let Some(session) = self.session(id) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let Some(guard) = session.try_attach_lock() else {
            return StatusCode::PRECONDITION_FAILED.into_response();
        };

        let mut response = ws
            .protocols([SUBPROTOCOL])
            .max_message_size(MAX_FRAME)
            .on_failed_upgrade(move |err| {
                tracing::error!(id, error = %err, "websocket upgrade failed");
            })
            .on_upgrade(move |socket| async move {
                let negotiated = socket
                    .protocol()
                    .is_some_and(|proto| proto.as_bytes() == SUBPROTOCOL.as_bytes());
                if !negotiated {
                    tracing::warn!(id, "subprotocol mismatch, dropping connection");
                    return;
                }
                tracing::info!(id, "session running");
                session.attach(split_socket(socket), guard);
            });

        if let Some(resume_id) = new_resume_id {
            match HeaderValue::from_str(&resume_id) {
                Ok(value) => {
                    response
                        .headers_mut()
                        .insert(HeaderName::from_static(RESUME_HEADER), value);
                }
                Err(_) => tracing::error!(id, "resume id is not a valid header value"),
            }
        }
        response
    }
}

struct WsReader {
    stream: SplitStream<WebSocket>,
}

struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl LinkReader for WsReader {
    async fn recv(&mut self) -> Result<Incoming, LinkError> {
        match self.stream.next().await {
            None => Err(LinkError::Closed),
            Some(Err(err)) => Err(LinkError::Io(err.to_string())),
            Some(Ok(Message::Binary(data))) => frame_from_bytes(&data).map(Incoming::Frame),
            Some(Ok(Message::Close(_))) => Err(LinkError::Closed),
            Some(Ok(_)) => Ok(Incoming::Ignored),
        }
    }
}

#[async_trait::async_trait]
impl LinkWriter for WsWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), LinkError> {
        self.sink
            .send(Message::Binary(frame.to_vec().into()))
            .await
            .map_err(|err| LinkError::Io(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

fn split_socket(socket: WebSocket) -> SplitLink {
    let (sink, stream) = socket.split();
    (Box::new(WsReader { stream }), Box::new(WsWriter { sink }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::duplex;

    fn handler() -> Arc<WsfsHandler> {
        Arc::new(WsfsHandler::new(OwnerIds::from_config(-1, -1, -1, -1)).expect("handler"))
    }

    fn storage() -> Arc<Storage> {
        Arc::new(Storage::new(std::path::Path::new("/tmp"), false).expect("storage"))
    }

    #[test]
    fn session_ids_are_never_reused() {
        let handler = handler();
        let (first, _) = handler.open_session(storage()).expect("session");
        handler.destroy_session(first);
        let (second, _) = handler.open_session(storage()).expect("session");
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn resume_ids_round_trip_through_the_handler() {
        let handler = handler();
        let (id, resume_id) = handler.open_session(storage()).expect("session");
        assert_eq!(handler.decode_resume(&resume_id), Some(id));
        assert_eq!(handler.decode_resume("garbage-id-value"), None);
    }

    #[tokio::test]
    async fn attach_rejects_unknown_and_busy_sessions() {
        let handler = handler();
        let (id, _) = handler.open_session(storage()).expect("session");

        let (link, _peer) = duplex::pair();
        assert_eq!(handler.attach(9999, link).unwrap_err(), AttachError::NotFound);

        let (link, _peer_a) = duplex::pair();
        handler.attach(id, link).expect("first attach");
        let (link, _peer_b) = duplex::pair();
        assert_eq!(handler.attach(id, link).unwrap_err(), AttachError::Busy);
    }

    #[tokio::test]
    async fn collector_destroys_abandoned_sessions() {
        let handler = handler();
        let (id, _) = handler.open_session(storage()).expect("session");
        for _ in 0..MAX_STRIKES {
            handler.collect_once();
        }
        assert!(handler.session(id).is_none());
    }

    #[tokio::test]
    async fn collector_skips_attached_sessions() {
        let handler = handler();
        let (id, _) = handler.open_session(storage()).expect("session");
        let (link, _peer) = duplex::pair();
        handler.attach(id, link).expect("attach");
        for _ in 0..MAX_STRIKES {
            handler.collect_once();
        }
        assert!(handler.session(id).is_some());
    }
}
