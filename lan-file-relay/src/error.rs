use thiserror::Error;

use crate::protocol::ClientId;

/// Failures observed by the hub while handling a single connection.
///
/// None of these are fatal to the hub. The connection task logs them and
/// keeps reading, except for [`RelayError::TransportClosed`] which ends it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("private target {0:?} is not a live connection")]
    UnknownTarget(Option<ClientId>),

    #[error("failed to deliver frame to client {0}")]
    TransportSendFailure(ClientId),

    #[error("client {0} is no longer connected")]
    TransportClosed(ClientId),
}

/// Requests the session client refuses to build, plus frames it cannot read.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to a hub")]
    NotConnected,

    #[error("please select a client")]
    NoTargetSelected,

    #[error("client {0} is not online")]
    UnknownPeer(ClientId),

    #[error("message is empty")]
    EmptyMessage,

    #[error("unreadable frame from hub: {0}")]
    UnexpectedFrame(#[source] serde_json::Error),
}
