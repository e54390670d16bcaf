//! Connection registry and routing rules for the relay hub.
//!
//! Every connection task talks to one shared [`Hub`]. The registry sits
//! behind a single async mutex, so id assignment, insertion, removal and the
//! iteration behind each broadcast are serialized. Frames are pushed into
//! per-connection outboxes with `try_send`, which never waits on a slow peer.
//!
//! Delivery is at-most-once with no confirmation. A peer whose outbox is full
//! or closed when a frame is pushed is marked dead. Dead peers are reaped
//! before the lock is released and every reap triggers one membership
//! broadcast.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    protocol::{
        CONNECTED_GREETING, ClientEnvelope, ClientId, Frame, ServerEnvelope, TargetClient,
        decode_client, timestamp,
    },
};

/// Sending half of a connection's outbox; the writer task owns the receiver.
pub type Outbox = mpsc::Sender<Frame>;

/// Recipients of a routed envelope or binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Every live connection except the sender.
    Broadcast,
    /// Exactly one live connection.
    Direct(ClientId),
    /// Private request whose target could not be read as a client id.
    Unroutable,
}

impl Route {
    fn for_request(is_private: bool, target: &TargetClient) -> Self {
        if !is_private {
            return Route::Broadcast;
        }
        match target.resolve() {
            Some(id) => Route::Direct(id),
            None => Route::Unroutable,
        }
    }
}

/// Metadata from the last `file_info` a connection sent, waiting for the
/// binary frame that carries the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub filename: String,
    pub size: u64,
    pub route: Route,
}

/// How many recipients accepted a frame into their outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub recipients: usize,
}

struct Connection {
    outbox: Outbox,
    live: bool,
    pending: Option<PendingFile>,
}

impl Connection {
    fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            live: true,
            pending: None,
        }
    }
}

struct Registry {
    next_id: ClientId,
    connections: BTreeMap<ClientId, Connection>,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_id: 1,
            connections: BTreeMap::new(),
        }
    }

    fn assign_id(&mut self) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn is_live(&self, id: ClientId) -> bool {
        self.connections.get(&id).is_some_and(|conn| conn.live)
    }

    fn live_ids(&self) -> Vec<ClientId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.live)
            .map(|(id, _)| *id)
            .collect()
    }

    fn sender_mut(&mut self, id: ClientId) -> Result<&mut Connection, RelayError> {
        self.connections
            .get_mut(&id)
            .filter(|conn| conn.live)
            .ok_or(RelayError::TransportClosed(id))
    }

    fn push(&mut self, id: ClientId, frame: Frame) -> Result<(), RelayError> {
        let Some(conn) = self.connections.get_mut(&id).filter(|conn| conn.live) else {
            return Err(RelayError::UnknownTarget(Some(id)));
        };

        match conn.outbox.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // Peers are dropped whole, never single frames, so a
                // file_info is never separated from its bytes.
                warn!(client_id = id, "outbox full, disconnecting slow client");
                conn.live = false;
                Err(RelayError::TransportSendFailure(id))
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client_id = id, "outbox closed, treating as disconnect");
                conn.live = false;
                Err(RelayError::TransportSendFailure(id))
            }
        }
    }

    fn fan_out(
        &mut self,
        sender: ClientId,
        route: Route,
        frame: Frame,
    ) -> Result<Delivery, RelayError> {
        match route {
            Route::Broadcast => {
                let mut delivery = Delivery::default();
                for id in self.live_ids() {
                    if id != sender && self.push(id, frame.clone()).is_ok() {
                        delivery.recipients += 1;
                    }
                }
                Ok(delivery)
            }
            Route::Direct(target) if self.is_live(target) => {
                let recipients = usize::from(self.push(target, frame).is_ok());
                Ok(Delivery { recipients })
            }
            Route::Direct(target) => Err(RelayError::UnknownTarget(Some(target))),
            Route::Unroutable => Err(RelayError::UnknownTarget(None)),
        }
    }

    fn broadcast_membership(&mut self) {
        let clients = self.live_ids();
        let frame = match Frame::envelope(&ServerEnvelope::ClientList {
            clients: clients.clone(),
        }) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(?error, "failed to encode client list");
                return;
            }
        };

        for id in clients {
            let _ = self.push(id, frame.clone());
        }
    }

    /// Removes connections whose outbox turned out to be closed. Each batch
    /// of removals is followed by one membership broadcast, which may in turn
    /// expose more dead peers.
    fn reap(&mut self) {
        loop {
            let dead: Vec<ClientId> = self
                .connections
                .iter()
                .filter(|(_, conn)| !conn.live)
                .map(|(id, _)| *id)
                .collect();
            if dead.is_empty() {
                return;
            }

            for id in dead {
                self.connections.remove(&id);
                info!(client_id = id, "client dropped after failed send");
            }
            self.broadcast_membership();
        }
    }
}

/// Shared handle to the registry of live connections.
///
/// Cloning is cheap; every clone refers to the same registry.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<Mutex<Registry>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::new())),
        }
    }

    /// Registers a new connection and returns its id.
    ///
    /// Ids start at 1, strictly increase and are never reused. The new
    /// connection receives a `connected` envelope first, then every live
    /// connection (itself included) receives the updated `client_list`.
    pub async fn connect(&self, outbox: Outbox) -> ClientId {
        let mut registry = self.registry.lock().await;
        let id = registry.assign_id();
        registry.connections.insert(id, Connection::new(outbox));
        info!(client_id = id, "client connected");

        match Frame::envelope(&ServerEnvelope::Connected {
            client_id: id,
            message: CONNECTED_GREETING.to_string(),
        }) {
            Ok(frame) => {
                let _ = registry.push(id, frame);
            }
            Err(error) => warn!(client_id = id, ?error, "failed to encode greeting"),
        }

        registry.broadcast_membership();
        registry.reap();
        id
    }

    /// Removes a connection and rebroadcasts membership.
    ///
    /// Returns `false` without broadcasting when the id is already gone.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        let mut registry = self.registry.lock().await;
        if registry.connections.remove(&id).is_none() {
            return false;
        }

        info!(client_id = id, "client disconnected");
        registry.broadcast_membership();
        registry.reap();
        true
    }

    /// Sends the current `client_list` to every live connection.
    pub async fn broadcast_membership(&self) {
        let mut registry = self.registry.lock().await;
        registry.broadcast_membership();
        registry.reap();
    }

    /// Live client ids in ascending order.
    pub async fn members(&self) -> Vec<ClientId> {
        self.registry.lock().await.live_ids()
    }

    pub async fn pending_file(&self, id: ClientId) -> Option<PendingFile> {
        let registry = self.registry.lock().await;
        registry.connections.get(&id)?.pending.clone()
    }

    /// Decodes a text frame from `sender` and routes it.
    pub async fn handle_text(&self, sender: ClientId, text: &str) -> Result<Delivery, RelayError> {
        let envelope = decode_client(text)?;
        self.handle_envelope(sender, envelope).await
    }

    /// Routes one envelope from `sender`.
    ///
    /// A private envelope for a target that is not live returns
    /// [`RelayError::UnknownTarget`]; nothing is sent back to the sender.
    pub async fn handle_envelope(
        &self,
        sender: ClientId,
        envelope: ClientEnvelope,
    ) -> Result<Delivery, RelayError> {
        let mut registry = self.registry.lock().await;
        registry.sender_mut(sender)?;

        let result = match envelope {
            ClientEnvelope::Text {
                content,
                is_private,
                target_client,
            } => {
                let route = Route::for_request(is_private, &target_client);
                let frame = Frame::envelope(&ServerEnvelope::Text {
                    from: sender,
                    message: content,
                    is_private,
                    timestamp: timestamp(),
                })?;
                registry.fan_out(sender, route, frame)
            }
            ClientEnvelope::FileInfo {
                filename,
                size,
                is_private,
                target_client,
            } => {
                let route = Route::for_request(is_private, &target_client);
                let frame = Frame::envelope(&ServerEnvelope::FileInfo {
                    from: sender,
                    filename: filename.clone(),
                    size,
                    is_private,
                    timestamp: timestamp(),
                })?;

                // Recorded even when the target is unknown so the bytes that
                // follow are dropped too instead of falling back to broadcast.
                let conn = registry.sender_mut(sender)?;
                if let Some(previous) = conn.pending.replace(PendingFile {
                    filename,
                    size,
                    route,
                }) {
                    debug!(
                        client_id = sender,
                        filename = %previous.filename,
                        "file_info replaced an announcement that never got its bytes"
                    );
                }

                registry.fan_out(sender, route, frame)
            }
            ClientEnvelope::Ping => {
                let frame = Frame::envelope(&ServerEnvelope::Pong)?;
                registry.fan_out(sender, Route::Direct(sender), frame)
            }
        };

        registry.reap();
        result
    }

    /// Routes a binary frame from `sender` using the route recorded by its
    /// most recent `file_info`, consuming that record.
    ///
    /// Without a preceding `file_info` the bytes are broadcast as an
    /// anonymous file.
    pub async fn handle_binary(
        &self,
        sender: ClientId,
        bytes: Vec<u8>,
    ) -> Result<Delivery, RelayError> {
        let mut registry = self.registry.lock().await;
        let pending = registry.sender_mut(sender)?.pending.take();

        let route = match pending {
            Some(PendingFile {
                filename,
                size,
                route,
            }) => {
                if size != bytes.len() as u64 {
                    warn!(
                        client_id = sender,
                        %filename,
                        announced = size,
                        received = bytes.len(),
                        "file size differs from announcement"
                    );
                }
                debug!(client_id = sender, %filename, ?route, "forwarding file bytes");
                route
            }
            None => {
                warn!(
                    client_id = sender,
                    bytes = bytes.len(),
                    "binary frame without file_info, broadcasting as anonymous file"
                );
                Route::Broadcast
            }
        };

        let result = registry.fan_out(sender, route, Frame::binary(bytes));
        registry.reap();
        result
    }
}
