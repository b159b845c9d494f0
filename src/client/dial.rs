//! WebSocket dialing: the initial connection and the capped-retry
//! redial used by error mode.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::{self, http};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::client::{Redial, Session};
use crate::link::{frame_from_bytes, Incoming, LinkError, LinkReader, LinkWriter, SplitLink};
use crate::buffer::Frame;
use crate::protocol::{RESUME_HEADER, SUBPROTOCOL};

const REDIAL_ATTEMPTS: u32 = 6;
const REDIAL_DELAY: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub enum DialError {
    /// The URL did not form a valid upgrade request.
    Request(String),
    /// The connection or handshake failed.
    Connect(String),
    /// The server did not accept the exact subprotocol string.
    Subprotocol,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::Request(reason) => write!(f, "bad server url: {reason}"),
            DialError::Connect(reason) => write!(f, "unable to connect to server: {reason}"),
            DialError::Subprotocol => f.write_str("subprotocol mismatch"),
        }
    }
}

impl std::error::Error for DialError {}

/// Connects and builds a client session. The resume id announced by the
/// server arms the automatic reconnect; credentials are sent as HTTP
/// Basic.
pub async fn connect(url: &str, credentials: Option<(&str, &str)>) -> Result<Session, DialError> {
    let auth = credentials
        .map(|(username, password)| format!("Basic {}", BASE64.encode(format!("{username}:{password}"))));
    let (link, resume_id) = dial(url, auth.as_deref(), None).await?;
    if resume_id.is_none() {
        tracing::warn!("session resume not available");
    }
    let redial = resume_id.map(|resume_id| {
        Box::new(WsRedial { url: url.to_owned(), auth: auth.clone(), resume_id }) as Box<dyn Redial>
    });
    Ok(Session::with_link(link, redial))
}

async fn dial(
    url: &str,
    auth: Option<&str>,
    resume_id: Option<&str>,
) -> Result<(SplitLink, Option<String>), DialError> {
    let mut request =
        url.into_client_request().map_err(|err| DialError::Request(err.to_string()))?;
    let headers = request.headers_mut();
    headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
    if let Some(auth) = auth {
        let value =
            HeaderValue::from_str(auth).map_err(|err| DialError::Request(err.to_string()))?;
        headers.insert(http::header::AUTHORIZATION, value);
    }
    if let Some(resume_id) = resume_id {
        let value =
            HeaderValue::from_str(resume_id).map_err(|err| DialError::Request(err.to_string()))?;
        headers.insert(RESUME_HEADER, value);
    }

    let (stream, response) =
        connect_async(request).await.map_err(|err| DialError::Connect(err.to_string()))?;

    let negotiated = response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .is_some_and(|value| value.as_bytes() == SUBPROTOCOL.as_bytes());
    if !negotiated {
        return Err(DialError::Subprotocol);
    }
    let resume_id = response
        .headers()
        .get(RESUME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let (sink, stream) = stream.split();
    let link: SplitLink = (Box::new(WsReader { stream }), Box::new(WsWriter { sink }));
    Ok((link, resume_id))
}

struct WsRedial {
    url: String,
    auth: Option<String>,
    resume_id: String,
}

#[async_trait]
impl Redial for WsRedial {
    async fn redial(&self) -> Result<SplitLink, LinkError> {
        for attempt in 1..=REDIAL_ATTEMPTS {
            match dial(&self.url, self.auth.as_deref(), Some(&self.resume_id)).await {
                Ok((link, _)) => return Ok(link),
                Err(err) => {
                    tracing::error!(attempt, error = %err, "reconnect failed");
                }
            }
            tokio::time::sleep(REDIAL_DELAY).await;
        }
        Err(LinkError::Io("reconnect attempts exhausted".to_owned()))
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl LinkReader for WsReader {
    async fn recv(&mut self) -> Result<Incoming, LinkError> {
        match self.stream.next().await {
            None => Err(LinkError::Closed),
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                Err(LinkError::Closed)
            }
            Some(Err(err)) => Err(LinkError::Io(err.to_string())),
            Some(Ok(Message::Binary(data))) => frame_from_bytes(&data).map(Incoming::Frame),
            Some(Ok(Message::Close(_))) => Err(LinkError::Closed),
            Some(Ok(_)) => Ok(Incoming::Ignored),
        }
    }
}

#[async_trait]
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
