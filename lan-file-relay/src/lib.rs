//! LAN relay for chat messages and files, one machine acting as the hub.
//!
//! Peers connect over WebSocket, receive a numeric client id, and then
//! exchange JSON envelopes (text frames) and raw file bytes (binary frames)
//! either with everyone or privately with a single peer. Each module focuses
//! on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for hub and client modes.
//! - [`protocol`] defines the JSON envelopes plus encode/decode helpers.
//! - [`hub`] owns the registry of live connections and routes every frame.
//! - [`server`] wires the hub to axum's WebSocket upgrade and runs one
//!   reader and one writer task per connection.
//! - [`session`] is the client-side state machine: routing mode, selected
//!   peer, and correlation of `file_info` with the binary frame after it.
//! - [`console`] parses the slash commands typed into the terminal client.
//! - [`client`] connects to a hub, multiplexing stdin, keep-alives and
//!   server frames for a terminal user.
//! - [`error`] holds the typed errors shared by hub and session.
//!
//! Integration and unit tests use this crate directly to exercise the hub
//! routing rules and the wire protocol.

pub mod cli;
pub mod client;
pub mod console;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
