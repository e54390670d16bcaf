//! Slash commands typed into the terminal client.
//!
//! Anything that does not start with `/` is a chat message for the current
//! routing mode. Commands are case-insensitive.

use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::{protocol::ClientId, session::RoutingMode};

pub const HELP: &str = "commands: /mode broadcast|private, /select <id>, /file <path>, /who, /help, /quit";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Message(String),
    Mode(RoutingMode),
    Select(ClientId),
    SendFile(PathBuf),
    Who,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one line of input. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let Some(rest) = trimmed.strip_prefix('/') else {
            return Ok(Some(ConsoleCommand::Message(trimmed.to_string())));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        let command = match (name.to_lowercase().as_str(), argument) {
            ("quit" | "q", "") => ConsoleCommand::Quit,
            ("help" | "h", "") => ConsoleCommand::Help,
            ("who" | "w", "") => ConsoleCommand::Who,
            ("mode" | "m", mode) => ConsoleCommand::Mode(parse_mode(mode)?),
            ("select" | "s", id) if !id.is_empty() => ConsoleCommand::Select(
                id.parse()
                    .map_err(|_| anyhow!("invalid client id '{id}'"))?,
            ),
            ("file" | "f", path) if !path.is_empty() => ConsoleCommand::SendFile(PathBuf::from(path)),
            ("select" | "s", _) => return Err(anyhow!("/select requires a client id")),
            ("file" | "f", _) => return Err(anyhow!("/file requires a path")),
            _ => return Err(anyhow!("unknown command '/{rest}'. {HELP}")),
        };
        Ok(Some(command))
    }
}

fn parse_mode(mode: &str) -> Result<RoutingMode> {
    match mode.to_lowercase().as_str() {
        "broadcast" | "b" | "all" => Ok(RoutingMode::Broadcast),
        "private" | "p" => Ok(RoutingMode::Private),
        _ => Err(anyhow!("/mode expects 'broadcast' or 'private'")),
    }
}
