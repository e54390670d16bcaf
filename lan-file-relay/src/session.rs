//! Client-side view of one hub connection.
//!
//! [`Session`] holds no transport. The terminal client feeds it every frame
//! it reads and asks it to build every envelope it writes, which keeps the
//! mode/target rules and the file correlation testable without a socket.

use nanoid::nanoid;

use crate::{
    error::SessionError,
    protocol::{ClientEnvelope, ClientId, ServerEnvelope, TargetClient},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingMode {
    #[default]
    Broadcast,
    Private,
}

/// Announcement from the last `file_info`, waiting for its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFile {
    pub filename: String,
    pub size: u64,
    pub from: ClientId,
}

/// A binary frame matched with its announcement, if there was one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: String,
    pub from: Option<ClientId>,
    pub bytes: Vec<u8>,
}

/// What a text frame from the hub meant for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Welcome {
        client_id: ClientId,
    },
    Text {
        from: ClientId,
        message: String,
        is_private: bool,
    },
    FileAnnounced {
        from: ClientId,
        filename: String,
        size: u64,
        is_private: bool,
    },
    Membership {
        others: Vec<ClientId>,
    },
    Pong,
}

#[derive(Debug, Default)]
pub struct Session {
    state: ConnectionState,
    client_id: Option<ClientId>,
    mode: RoutingMode,
    selected_target: Option<ClientId>,
    members: Vec<ClientId>,
    expected_file: Option<ExpectedFile>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn selected_target(&self) -> Option<ClientId> {
        self.selected_target
    }

    pub fn expected_file(&self) -> Option<&ExpectedFile> {
        self.expected_file.as_ref()
    }

    /// Members from the last `client_list`, excluding this session.
    pub fn others(&self) -> Vec<ClientId> {
        self.members
            .iter()
            .copied()
            .filter(|id| Some(*id) != self.client_id)
            .collect()
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Close and error both land here. Nothing from the old connection
    /// survives except the chosen mode.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.client_id = None;
        self.members.clear();
        self.selected_target = None;
        self.expected_file = None;
    }

    /// Switching to broadcast forgets the selected target.
    pub fn set_mode(&mut self, mode: RoutingMode) {
        self.mode = mode;
        if mode == RoutingMode::Broadcast {
            self.selected_target = None;
        }
    }

    pub fn select_target(&mut self, id: ClientId) -> Result<(), SessionError> {
        if !self.others().contains(&id) {
            return Err(SessionError::UnknownPeer(id));
        }
        self.selected_target = Some(id);
        Ok(())
    }

    pub fn text_request(&self, content: &str) -> Result<ClientEnvelope, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let (is_private, target_client) = self.routing()?;
        Ok(ClientEnvelope::Text {
            content: content.to_string(),
            is_private,
            target_client,
        })
    }

    /// The envelope to send right before the file's binary frame.
    pub fn file_request(&self, filename: &str, size: u64) -> Result<ClientEnvelope, SessionError> {
        let (is_private, target_client) = self.routing()?;
        Ok(ClientEnvelope::FileInfo {
            filename: filename.to_string(),
            size,
            is_private,
            target_client,
        })
    }

    /// A `ping` while connected. Replies are never awaited.
    pub fn keepalive(&self) -> Option<ClientEnvelope> {
        (self.state == ConnectionState::Connected).then_some(ClientEnvelope::Ping)
    }

    fn routing(&self) -> Result<(bool, TargetClient), SessionError> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        match self.mode {
            RoutingMode::Broadcast => Ok((false, TargetClient::none())),
            RoutingMode::Private => {
                let target = self.selected_target.ok_or(SessionError::NoTargetSelected)?;
                Ok((true, TargetClient::id(target)))
            }
        }
    }

    pub fn on_text_frame(&mut self, text: &str) -> Result<SessionEvent, SessionError> {
        let envelope: ServerEnvelope =
            serde_json::from_str(text).map_err(SessionError::UnexpectedFrame)?;
        Ok(self.on_envelope(envelope))
    }

    pub fn on_envelope(&mut self, envelope: ServerEnvelope) -> SessionEvent {
        match envelope {
            ServerEnvelope::Connected { client_id, .. } => {
                self.client_id = Some(client_id);
                SessionEvent::Welcome { client_id }
            }
            ServerEnvelope::Text {
                from,
                message,
                is_private,
                ..
            } => SessionEvent::Text {
                from,
                message,
                is_private,
            },
            ServerEnvelope::FileInfo {
                from,
                filename,
                size,
                is_private,
                ..
            } => {
                // A second announcement before the bytes replaces the first.
                self.expected_file = Some(ExpectedFile {
                    filename: filename.clone(),
                    size,
                    from,
                });
                SessionEvent::FileAnnounced {
                    from,
                    filename,
                    size,
                    is_private,
                }
            }
            ServerEnvelope::ClientList { clients } => {
                self.members = clients;
                SessionEvent::Membership {
                    others: self.others(),
                }
            }
            ServerEnvelope::Pong => SessionEvent::Pong,
        }
    }

    /// Consumes the pending announcement; bytes with none are named
    /// `file_<random>`.
    pub fn on_binary_frame(&mut self, bytes: Vec<u8>) -> ReceivedFile {
        match self.expected_file.take() {
            Some(ExpectedFile { filename, from, .. }) => ReceivedFile {
                filename,
                from: Some(from),
                bytes,
            },
            None => ReceivedFile {
                filename: placeholder_name(),
                from: None,
                bytes,
            },
        }
    }
}

pub fn placeholder_name() -> String {
    format!("file_{}", nanoid!(10))
}
