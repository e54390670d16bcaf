use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::RelayError;

pub type ClientId = u64;

/// Greeting carried by every `connected` envelope.
pub const CONNECTED_GREETING: &str = "Connected to WebSocket server";

/// Envelopes a peer sends to the hub over the text channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEnvelope {
    Text {
        content: String,
        #[serde(default)]
        is_private: bool,
        #[serde(default)]
        target_client: TargetClient,
    },
    FileInfo {
        filename: String,
        size: u64,
        #[serde(default)]
        is_private: bool,
        #[serde(default)]
        target_client: TargetClient,
    },
    Ping,
}

/// Envelopes the hub sends to peers over the text channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEnvelope {
    Connected {
        client_id: ClientId,
        message: String,
    },
    Text {
        from: ClientId,
        message: String,
        is_private: bool,
        timestamp: String,
    },
    #[serde(alias = "file")]
    FileInfo {
        from: ClientId,
        filename: String,
        size: u64,
        is_private: bool,
        timestamp: String,
    },
    ClientList {
        clients: Vec<ClientId>,
    },
    Pong,
}

/// The `targetClient` field exactly as the peer sent it.
///
/// Browsers send numbers, strings or `null` here, so the raw JSON value is
/// kept and only turned into a [`ClientId`] by [`TargetClient::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetClient(Option<Value>);

impl TargetClient {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn id(id: ClientId) -> Self {
        Self(Some(Value::from(id)))
    }

    /// Non-numeric, negative or fractional targets resolve to `None`.
    pub fn resolve(&self) -> Option<ClientId> {
        match self.0.as_ref()? {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<Option<ClientId>> for TargetClient {
    fn from(target: Option<ClientId>) -> Self {
        target.map_or_else(Self::none, Self::id)
    }
}

/// One outbound WebSocket frame, cheap to clone across many recipients.
///
/// Only the hub side shares the payload. axum's `Message::Binary` owns a
/// `Vec<u8>`, so every writer task still copies a binary payload once; a
/// broadcast file near the frame size limit costs one copy per recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Frame {
    pub fn envelope(envelope: &ServerEnvelope) -> Result<Self, RelayError> {
        Ok(Self::Text(encode(envelope)?.into()))
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes.into())
    }
}

pub fn decode_client(text: &str) -> Result<ClientEnvelope, RelayError> {
    decode(text)
}

pub fn decode<T>(text: &str) -> Result<T, RelayError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(text).map_err(RelayError::MalformedEnvelope)
}

pub fn encode<T>(envelope: &T) -> Result<String, RelayError>
where
    T: Serialize,
{
    serde_json::to_string(envelope).map_err(RelayError::Encode)
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-05-01T09:30:00.123Z`.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_browser_text_request() {
        let envelope = decode_client(
            r#"{"type":"text","content":"hi","isPrivate":true,"targetClient":"2"}"#,
        )
        .expect("valid text envelope");

        match envelope {
            ClientEnvelope::Text {
                content,
                is_private,
                target_client,
            } => {
                assert_eq!(content, "hi");
                assert!(is_private);
                assert_eq!(target_client.resolve(), Some(2));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn missing_optional_fields_default_to_broadcast() {
        let envelope = decode_client(r#"{"type":"file_info","filename":"a.txt","size":3}"#)
            .expect("valid file_info envelope");

        assert_eq!(
            envelope,
            ClientEnvelope::FileInfo {
                filename: "a.txt".into(),
                size: 3,
                is_private: false,
                target_client: TargetClient::none(),
            }
        );
    }

    #[test]
    fn target_coercion_is_explicit() {
        let resolve = |value: Value| TargetClient(Some(value)).resolve();

        assert_eq!(resolve(json!(7)), Some(7));
        assert_eq!(resolve(json!(" 12 ")), Some(12));
        assert_eq!(resolve(json!("abc")), None);
        assert_eq!(resolve(json!(-1)), None);
        assert_eq!(resolve(json!(2.5)), None);
        assert_eq!(resolve(json!(true)), None);
        assert_eq!(TargetClient::none().resolve(), None);
    }

    #[test]
    fn rejects_unknown_and_server_only_tags() {
        assert!(matches!(
            decode_client(r#"{"type":"shout","content":"hi"}"#),
            Err(RelayError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_client(r#"{"type":"pong"}"#),
            Err(RelayError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_client(r#"{"type":"text"}"#),
            Err(RelayError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_client("not json"),
            Err(RelayError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn server_envelopes_use_camel_case_fields() {
        let connected = serde_json::to_value(ServerEnvelope::Connected {
            client_id: 4,
            message: CONNECTED_GREETING.into(),
        })
        .expect("serialize");
        assert_eq!(
            connected,
            json!({"type": "connected", "clientId": 4, "message": CONNECTED_GREETING})
        );

        let list = serde_json::to_value(ServerEnvelope::ClientList {
            clients: vec![1, 3],
        })
        .expect("serialize");
        assert_eq!(list, json!({"type": "client_list", "clients": [1, 3]}));

        let pong = serde_json::to_value(ServerEnvelope::Pong).expect("serialize");
        assert_eq!(pong, json!({"type": "pong"}));
    }

    #[test]
    fn legacy_file_tag_reads_as_file_info() {
        let envelope: ServerEnvelope = decode(
            r#"{"type":"file","from":1,"filename":"a","size":1,"isPrivate":false,"timestamp":"t"}"#,
        )
        .expect("legacy file envelope");
        assert!(matches!(envelope, ServerEnvelope::FileInfo { from: 1, .. }));
    }

    #[test]
    fn timestamp_is_utc_millis() {
        let stamp = timestamp();
        assert!(stamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    #[test]
    fn frame_clones_share_one_payload() {
        let frame = Frame::binary(vec![0; 1024]);
        let copy = frame.clone();
        match (&frame, &copy) {
            (Frame::Binary(a), Frame::Binary(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected binary frames"),
        }
    }
}
