//! The WSFS server shell: an axum router exposing the upgrade endpoint,
//! HTTP Basic authentication in front of it, and graceful shutdown that
//! drains every session.

pub mod config;
pub mod storage;
pub mod users;
pub mod wsfs;

use std::io;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{RawQuery, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

use config::{Config, ConfigError};
use users::{User, UserTable};
use wsfs::session::OwnerIds;
use wsfs::WsfsHandler;

/// A startup failure: bad configuration or an unusable environment.
/// The CLI exits with code 2 on these.
#[derive(Debug)]
pub enum SetupError {
    Config(ConfigError),
    Resume(wsfs::resume::CodecError),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::Config(err) => err.fmt(f),
            SetupError::Resume(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for SetupError {}

struct AppState {
    users: UserTable,
    wsfs: Arc<WsfsHandler>,
}

pub struct Server {
    state: Arc<AppState>,
    address: String,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, SetupError> {
        let users = UserTable::build(&config).map_err(SetupError::Config)?;
        let owner = OwnerIds::from_config(
            config.wsfs.uid,
            config.wsfs.gid,
            config.wsfs.other_uid,
            config.wsfs.other_gid,
        );
        let wsfs = Arc::new(WsfsHandler::new(owner).map_err(SetupError::Resume)?);
        Ok(Self {
            state: Arc::new(AppState { users, wsfs }),
            address: config.listener.address,
        })
    }

    /// Serves until interrupted, then cancels every session and waits
    /// for handler drain.
    pub async fn run(self) -> io::Result<()> {
        let collector = self.state.wsfs.spawn_collector();
        let router = Router::new()
            .route("/", any(wsfs_endpoint))
            .with_state(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        tracing::warn!(address = %self.address, "listening");
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        collector.abort();
        self.state.wsfs.stop().await;
        served
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("cannot listen for the interrupt signal");
        std::future::pending::<()>().await;
    }
    tracing::warn!("shutting down");
}

fn must_login(query: Option<&str>) -> bool {
    query.is_some_and(|query| {
        query.split('&').any(|pair| pair == "must-login" || pair.starts_with("must-login="))
    })
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Arc<User>, Response> {
    let challenge = || {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"wsfs\"")],
            "Unauthorized",
        )
            .into_response()
    };

    match headers.get(header::AUTHORIZATION) {
        Some(value) => {
            let Ok(value) = value.to_str() else {
                return Err(challenge());
            };
            match state.users.authenticate_basic(value).await {
                Ok(user) => Ok(user),
                Err(err) => {
                    tracing::info!(error = %err, "authentication failed");
                    Err(challenge())
                }
            }
        }
        None => {
            if must_login(query) {
                return Err(challenge());
            }
            state.users.anonymous().ok_or_else(challenge)
        }
    }
}

async fn wsfs_endpoint(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user = match authenticate(&state, &headers, query.as_deref()).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Ok(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "This is WSFS endpoint.").into_response();
    };
    if user.read_only {
        return (StatusCode::FORBIDDEN, "Access Denied").into_response();
    }
    state.wsfs.serve_upgrade(ws, &headers, Arc::clone(&user.storage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_login_matches_query_forms() {
        assert!(!must_login(None));
        assert!(!must_login(Some("foo=1")));
        assert!(must_login(Some("must-login")));
        assert!(must_login(Some("must-login=1")));
        assert!(must_login(Some("a=b&must-login")));
    }
}
