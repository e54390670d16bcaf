//! WebSocket transport for the hub.
//!
//! Each upgraded socket gets one reader loop (this task) and one writer task.
//! The writer drains the connection's outbox into the socket sink, so a slow
//! socket only ever backs up its own outbox.

use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::mpsc,
};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    cli::HubArgs,
    error::RelayError,
    hub::{Delivery, Hub},
    protocol::{ClientId, Frame},
};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub outbox_capacity: usize,
    pub public_dir: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            public_dir: None,
        }
    }
}

impl From<&HubArgs> for HubConfig {
    fn from(args: &HubArgs) -> Self {
        Self {
            outbox_capacity: args.outbox_capacity,
            public_dir: args.public_dir.clone(),
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    hub: Hub,
    config: HubConfig,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self {
            listener,
            hub: Hub::new(),
            config,
        }
    }

    pub fn hub(&self) -> Hub {
        self.hub.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer {
            listener,
            hub,
            config,
        } = self;

        axum::serve(listener, router(hub, &config))
            .with_graceful_shutdown(shutdown)
            .await
            .context("relay server stopped with an error")?;

        info!("hub shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct AppState {
    hub: Hub,
    outbox_capacity: usize,
}

/// `/ws` upgrades to a relay connection; everything else falls through to
/// `public_dir` when one is configured.
pub fn router(hub: Hub, config: &HubConfig) -> Router {
    let state = AppState {
        hub,
        outbox_capacity: config.outbox_capacity,
    };

    let router = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let router = match &config.public_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router.layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state.hub, state.outbox_capacity))
}

async fn run_connection(socket: WebSocket, hub: Hub, outbox_capacity: usize) {
    let (sink, mut stream) = socket.split();
    let (outbox, frames) = mpsc::channel(outbox_capacity);

    let client_id = hub.connect(outbox).await;
    let writer = tokio::spawn(write_frames(client_id, sink, frames));

    while let Some(message) = stream.next().await {
        let outcome = match message {
            Ok(Message::Text(text)) => hub.handle_text(client_id, &text).await,
            Ok(Message::Binary(bytes)) => hub.handle_binary(client_id, bytes).await,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                debug!(client_id, reason = ?frame, "client initiated close");
                break;
            }
            Err(err) => {
                warn!(client_id, error = %err, "websocket receive error");
                break;
            }
        };

        if !keep_reading(client_id, outcome) {
            break;
        }
    }

    writer.abort();
    hub.disconnect(client_id).await;
}

fn keep_reading(client_id: ClientId, outcome: Result<Delivery, RelayError>) -> bool {
    match outcome {
        Ok(delivery) => {
            debug!(client_id, recipients = delivery.recipients, "frame routed");
            true
        }
        Err(RelayError::MalformedEnvelope(error)) => {
            warn!(client_id, %error, "dropping malformed envelope");
            true
        }
        Err(RelayError::UnknownTarget(target)) => {
            debug!(client_id, ?target, "dropping frame for unknown target");
            true
        }
        Err(RelayError::TransportClosed(_)) => false,
        Err(error) => {
            warn!(client_id, %error, "failed to route frame");
            true
        }
    }
}

async fn write_frames(
    client_id: ClientId,
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.to_string()),
            Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };
        if let Err(err) = sink.send(message).await {
            // Dropping the receiver closes the outbox; the hub reaps us on
            // its next send.
            debug!(client_id, error = %err, "failed to deliver frame to client");
            return;
        }
    }
    let _ = sink.close().await;
}

/// Address of the interface that routes off-host, found by "connecting" a
/// UDP socket. No packet is sent.
pub async fn discover_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

pub async fn log_banner(addr: SocketAddr) {
    let port = addr.port();
    info!("Local: http://localhost:{port}");
    match discover_lan_ip().await {
        Some(ip) => info!("Network: http://{ip}:{port}"),
        None => info!("Network: http://localhost:{port}"),
    }
}
