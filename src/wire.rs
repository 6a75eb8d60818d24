//! Wire shapes shared by server and client.
//!
//! Diffs travel as JSON. A stream first carries a `connectionId` event, then
//! `message` events of the form `{channel, data}`, where `data` is
//! `[DiffMessage, ...]` on live query channels. Control notices go to the
//! subscribe/unsubscribe endpoints.

use crate::error::Result;
use crate::types::{Identity, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path of the event stream endpoint.
pub const STREAM_PATH: &str = "stream";

/// Path receiving subscribe notices.
pub const SUBSCRIBE_PATH: &str = "stream/subscribe";

/// Path receiving unsubscribe notices.
pub const UNSUBSCRIBE_PATH: &str = "stream/unsubscribe";

/// How a result set changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum DiffMessage {
    /// Full snapshot of the result set.
    All(Vec<Record>),

    /// A row started matching.
    Add(Record),

    /// A row that matched before still matches but changed, possibly
    /// including its identity.
    #[serde(rename_all = "camelCase")]
    Replace { old_identity: Identity, item: Record },

    /// A row stopped matching.
    Remove { identity: Identity },
}

impl DiffMessage {
    pub fn replace(old_identity: Identity, item: Record) -> Self {
        DiffMessage::Replace { old_identity, item }
    }

    pub fn remove(identity: Identity) -> Self {
        DiffMessage::Remove { identity }
    }

    /// Short name matching the wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DiffMessage::All(_) => "all",
            DiffMessage::Add(_) => "add",
            DiffMessage::Replace { .. } => "replace",
            DiffMessage::Remove { .. } => "remove",
        }
    }
}

/// One payload sent on a channel.
///
/// Live query channels carry the array of diffs produced by one publish;
/// plain message channels carry whatever JSON the sender chose.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub data: Value,
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }

    pub fn from_diffs(channel: impl Into<String>, diffs: &[DiffMessage]) -> Result<Self> {
        Ok(Self::new(channel, serde_json::to_value(diffs)?))
    }

    pub fn into_diffs(self) -> Result<Vec<DiffMessage>> {
        Ok(serde_json::from_value(self.data)?)
    }
}

/// Events sent over the transport stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum TransportEvent {
    /// First event of every physical connection.
    ConnectionId(String),
    Message(ChannelMessage),
}

impl TransportEvent {
    /// SSE event name for this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            TransportEvent::ConnectionId(_) => "connectionId",
            TransportEvent::Message(_) => "message",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Body of a subscribe or unsubscribe notice.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelNotice {
    pub channel: String,
    pub client_id: String,
}

impl ChannelNotice {
    pub fn new(channel: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            client_id: client_id.into(),
        }
    }
}

/// Response of a live fetch: the channel to listen on and the current rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResult {
    pub id: String,
    #[serde(rename = "result")]
    pub items: Vec<Record>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_message_wire_shape() {
        let msg = DiffMessage::replace(1.into(), json!({"id": 99, "title": "noam"}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "replace", "data": {"oldIdentity": 1, "item": {"id": 99, "title": "noam"}}})
        );

        let msg = DiffMessage::remove("abc".into());
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "remove", "data": {"identity": "abc"}})
        );

        let msg: DiffMessage =
            serde_json::from_value(json!({"type": "add", "data": {"id": 4}})).unwrap();
        assert_eq!(msg, DiffMessage::Add(json!({"id": 4})));
        assert_eq!(msg.kind(), "add");
    }

    #[test]
    fn test_transport_event_json() {
        let diffs = vec![DiffMessage::All(vec![json!({"id": 1})])];
        let ev = TransportEvent::Message(ChannelMessage::from_diffs("c1", &diffs).unwrap());
        let text = ev.to_json().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"event": "message", "data": {"channel": "c1", "data": [{"type": "all", "data": [{"id": 1}]}]}})
        );
        match TransportEvent::from_json(&text).unwrap() {
            TransportEvent::Message(message) => assert_eq!(message.into_diffs().unwrap(), diffs),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_payload_is_not_a_diff_batch() {
        let message = ChannelMessage::new("chat", json!({"text": "hello"}));
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"channel": "chat", "data": {"text": "hello"}})
        );
        assert!(message.into_diffs().is_err());
    }

    #[test]
    fn test_notice_camel_case() {
        let notice = ChannelNotice::new("c1", "client-1");
        assert_eq!(
            serde_json::to_value(&notice).unwrap(),
            json!({"channel": "c1", "clientId": "client-1"})
        );
    }
}
