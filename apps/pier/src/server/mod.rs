//! WebSocket listener hosting one [`Session`] per connection.

mod registry;

pub use registry::{SessionGuard, SessionRegistration, SessionRegistry, SessionRemoval};

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::command::CommandExecutor;
use crate::session::{Session, SessionConfig};
use crate::telemetry::describe_wire;

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const WS_PATH: &str = "/ws";

const INBOUND_BUFFER: usize = 64;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Slack on top of a session's own teardown budget before close gives up on it.
const CLOSE_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("address {addr} is already in use")]
    AddressInUse { addr: SocketAddr },
    #[error("listener i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    pub port: u16,
    pub host: IpAddr,
}

impl ListenerOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: DEFAULT_HOST,
        }
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        if self.port == 0 {
            return Err(ServerError::InvalidArgument(
                "port must be between 1 and 65535".into(),
            ));
        }
        Ok(SocketAddr::new(self.host, self.port))
    }
}

struct AppState {
    registry: SessionRegistry,
    executor: Arc<dyn CommandExecutor>,
    config: Arc<SessionConfig>,
}

/// A bound, serving listener. Call [`ListenerHandle::close`] to stop it.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    session_deadline: Duration,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<io::Result<()>>>,
}

/// Binds `options` and starts serving sessions backed by `executor`.
///
/// Fails with [`ServerError::InvalidArgument`] before touching the network when the
/// options are unusable, and with [`ServerError::AddressInUse`] when the port is taken.
pub async fn listen(
    options: ListenerOptions,
    executor: Arc<dyn CommandExecutor>,
    config: SessionConfig,
) -> Result<ListenerHandle, ServerError> {
    let addr = options.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| match err.kind() {
            io::ErrorKind::AddrInUse => ServerError::AddressInUse { addr },
            _ => ServerError::Io(err),
        })?;
    let local_addr = listener.local_addr()?;

    let registry = SessionRegistry::new();
    // A session may spend the whole grace on its invocation, then drain its writer.
    let session_deadline = config.termination_grace + WRITER_DRAIN_TIMEOUT + CLOSE_MARGIN;
    let state = Arc::new(AppState {
        registry: registry.clone(),
        executor,
        config: Arc::new(config),
    });

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route(WS_PATH, get(ws_handler))
        .with_state(state);

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stopped.await;
            })
            .await
    });

    info!(addr = %local_addr, "pier listening");
    Ok(ListenerHandle {
        local_addr,
        registry,
        session_deadline,
        stop: Some(stop),
        server: Some(server),
    })
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}{WS_PATH}", self.local_addr)
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Stops accepting, closes every session and waits for the server task.
    pub async fn close(mut self) -> Result<(), ServerError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        let stragglers = self.registry.shutdown_all(self.session_deadline).await;
        if stragglers > 0 {
            warn!(stragglers, "sessions still running at listener close");
        }

        if let Some(mut server) = self.server.take() {
            match tokio::time::timeout(self.session_deadline, &mut server).await {
                Ok(Ok(result)) => result?,
                Ok(Err(err)) => warn!(error = %err, "listener task failed"),
                Err(_) => {
                    warn!("listener did not stop in time; aborting");
                    server.abort();
                }
            }
        }
        info!(addr = %self.local_addr, "pier listener closed");
        Ok(())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            self.registry.signal_all();
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len(),
        "total_sessions": state.registry.total_sessions(),
    }))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.registry.register() {
        Some(registration) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, registration))
            .into_response(),
        None => {
            debug!("rejecting connection during shutdown");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, registration: SessionRegistration) {
    let SessionRegistration {
        id,
        shutdown,
        guard,
    } = registration;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(state.config.outbound_buffer.max(1));
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(INBOUND_BUFFER);

    info!(session_id = %id, "session connected");

    let mut writer = tokio::spawn(async move {
        while let Some(chunk) = outbound_rx.recv().await {
            trace!(session_id = %id, wire = %describe_wire(&chunk), "outbound");
            if ws_tx.send(Message::Binary(chunk.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        debug!(session_id = %id, "writer task finished");
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            let data = match message {
                Ok(Message::Binary(data)) => Bytes::from(data),
                Ok(Message::Text(text)) => Bytes::from(text),
                Ok(Message::Close(frame)) => {
                    debug!(
                        session_id = %id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(session_id = %id, error = %err, "error receiving message");
                    break;
                }
            };
            if inbound_tx.send(data).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(id, Arc::clone(&state.executor), Arc::clone(&state.config), outbound_tx);
    let summary = session.run(inbound_rx, shutdown).await;
    reader.abort();

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(
        session_id = %id,
        commands = summary.commands_run,
        last_exit_code = ?summary.last_exit_code,
        "session disconnected"
    );
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinCommands;

    #[test_timeout::timeout]
    async fn port_zero_is_rejected_before_binding() {
        let err = listen(
            ListenerOptions::new(0),
            Arc::new(BuiltinCommands::new()),
            SessionConfig::default(),
        )
        .await
        .err()
        .expect("port 0 must fail");
        assert!(matches!(err, ServerError::InvalidArgument(_)));
    }

    #[test_timeout::timeout]
    fn options_default_to_loopback() {
        let options = ListenerOptions::new(4100);
        assert_eq!(options.socket_addr().unwrap(), "127.0.0.1:4100".parse().unwrap());
        let any = options.with_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(any.socket_addr().unwrap().port(), 4100);
    }
}
