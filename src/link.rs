//! The binary-message seam between a session engine and its transport.
//!
//! Server sessions, the client mirror, and the protocol tests all speak
//! through [`LinkReader`]/[`LinkWriter`] halves, so the same engines run
//! over an axum server socket, a tungstenite client socket, or the
//! in-memory [`duplex`] pair.

use async_trait::async_trait;

use crate::buffer::{self, Frame};
use crate::protocol::MAX_FRAME;

/// One received WebSocket message.
pub enum Incoming {
    /// A binary message copied into a pooled frame.
    Frame(Frame),
    /// A non-binary message; logged and skipped by the read loops.
    Ignored,
}

/// Transport failure observed by a link half.
#[derive(Debug)]
pub enum LinkError {
    /// The peer closed the connection.
    Closed,
    /// Any other transport error.
    Io(String),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Closed => f.write_str("connection closed"),
            LinkError::Io(reason) => write!(f, "link error: {reason}"),
        }
    }
}

impl std::error::Error for LinkError {}

#[async_trait]
pub trait LinkReader: Send + 'static {
    async fn recv(&mut self) -> Result<Incoming, LinkError>;
}

#[async_trait]
pub trait LinkWriter: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<(), LinkError>;

    /// Closes the connection. Safe to call once per link.
    async fn close(&mut self);
}

/// A connected pair of link halves.
pub type SplitLink = (Box<dyn LinkReader>, Box<dyn LinkWriter>);

/// Copies raw message bytes into a pooled frame, refusing oversized
/// messages.
pub fn frame_from_bytes(data: &[u8]) -> Result<Frame, LinkError> {
    if data.len() > MAX_FRAME {
        return Err(LinkError::Io(format!("message of {} bytes exceeds frame limit", data.len())));
    }
    let mut frame = buffer::take();
    frame.put_bytes(data);
    Ok(frame)
}

/// In-memory link transport connecting two session engines directly.
pub mod duplex {
    use tokio::sync::mpsc;

    use super::{Incoming, LinkError, LinkReader, LinkWriter, SplitLink};
    use crate::buffer::Frame;
    use async_trait::async_trait;

    const DEPTH: usize = 32;

    pub struct DuplexReader {
        rx: mpsc::Receiver<Frame>,
    }

    pub struct DuplexWriter {
        tx: Option<mpsc::Sender<Frame>>,
    }

    #[async_trait]
    impl LinkReader for DuplexReader {
        async fn recv(&mut self) -> Result<Incoming, LinkError> {
            match self.rx.recv().await {
                Some(frame) => Ok(Incoming::Frame(frame)),
                None => Err(LinkError::Closed),
            }
        }
    }

    #[async_trait]
    impl LinkWriter for DuplexWriter {
        async fn send(&mut self, frame: Frame) -> Result<(), LinkError> {
            match &self.tx {
                Some(tx) => tx.send(frame).await.map_err(|_| LinkError::Closed),
                None => Err(LinkError::Closed),
            }
        }

        async fn close(&mut self) {
            self.tx = None;
        }
    }

    /// Builds two connected links: frames sent on one side arrive on the
    /// other.
    pub fn pair() -> (SplitLink, SplitLink) {
        let (a_tx, a_rx) = mpsc::channel(DEPTH);
        let (b_tx, b_rx) = mpsc::channel(DEPTH);
        let left: SplitLink =
            (Box::new(DuplexReader { rx: a_rx }), Box::new(DuplexWriter { tx: Some(b_tx) }));
        let right: SplitLink =
            (Box::new(DuplexReader { rx: b_rx }), Box::new(DuplexWriter { tx: Some(a_tx) }));
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_delivers_frames_both_ways() {
        let ((mut left_rd, mut left_wr), (mut right_rd, mut right_wr)) = duplex::pair();

        let mut frame = buffer::take();
        frame.put_u8(1);
        frame.put_u8(2);
        left_wr.send(frame).await.unwrap();
        match right_rd.recv().await.unwrap() {
            Incoming::Frame(frame) => assert_eq!(frame.as_slice(), &[1, 2]),
            Incoming::Ignored => panic!("expected a frame"),
        }

        let mut frame = buffer::take();
        frame.put_u8(3);
        right_wr.send(frame).await.unwrap();
        match left_rd.recv().await.unwrap() {
            Incoming::Frame(frame) => assert_eq!(frame.as_slice(), &[3]),
            Incoming::Ignored => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn closed_duplex_reports_closed() {
        let ((mut left_rd, mut left_wr), (right_rd, mut right_wr)) = duplex::pair();
        drop(right_rd);
        right_wr.close().await;

        assert!(matches!(left_rd.recv().await, Err(LinkError::Closed)));
        let frame = buffer::take();
        assert!(matches!(left_wr.send(frame).await, Err(LinkError::Closed)));
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let data = vec![0u8; MAX_FRAME + 1];
        assert!(frame_from_bytes(&data).is_err());
        let data = vec![0u8; MAX_FRAME];
        assert!(frame_from_bytes(&data).is_ok());
    }
}
