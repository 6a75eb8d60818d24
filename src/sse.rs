//! Server-sent events framing for [`TransportEvent`]s.
//!
//! The connection id goes out as a named `connectionId` event whose data is
//! the bare id; channel messages use the default `message` event with the
//! JSON `{channel, data}` body.

use crate::error::Result;
use crate::wire::{ChannelMessage, TransportEvent};
use tracing::{debug, warn};

/// Comment frame servers send to keep idle streams open.
pub const KEEPALIVE: &str = ": keepalive\n\n";

/// Encode one event as an SSE frame.
pub fn encode(event: &TransportEvent) -> Result<String> {
    match event {
        TransportEvent::ConnectionId(id) => Ok(format!("event: connectionId\ndata: {}\n\n", id)),
        TransportEvent::Message(message) => {
            let body = serde_json::to_string(message)?;
            Ok(format!("data: {}\n\n", body))
        }
    }
}

/// Incremental SSE parser. Chunks may split lines and frames anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the stream, returning every event it completed.
    /// A frame that does not decode is logged and skipped.
    pub fn feed(&mut self, chunk: &str) -> Vec<TransportEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.find(':') {
                Some(idx) => {
                    let value = &line[idx + 1..];
                    (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
                }
                None => (line.as_str(), ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<TransportEvent> {
        let name = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();

        match name.as_deref().unwrap_or("message") {
            "connectionId" => Some(TransportEvent::ConnectionId(data)),
            "message" => match serde_json::from_str::<ChannelMessage>(&data) {
                Ok(message) => Some(TransportEvent::Message(message)),
                Err(e) => {
                    warn!(error = %e, bytes = data.len(), "skipping malformed sse message");
                    None
                }
            },
            other => {
                debug!(event = other, "ignoring unknown sse event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DiffMessage;
    use serde_json::json;

    fn sample_message() -> TransportEvent {
        let diffs = [DiffMessage::Add(json!({"id": 4, "title": "maayan"}))];
        TransportEvent::Message(ChannelMessage::from_diffs("c1", &diffs).unwrap())
    }

    #[test]
    fn test_encode_decode_stream() {
        let mut stream = encode(&TransportEvent::ConnectionId("abc".into())).unwrap();
        stream.push_str(KEEPALIVE);
        stream.push_str(&encode(&sample_message()).unwrap());

        let mut decoder = SseDecoder::new();
        let events = decoder.feed(&stream);
        assert_eq!(
            events,
            vec![TransportEvent::ConnectionId("abc".into()), sample_message()]
        );
    }

    #[test]
    fn test_decode_split_chunks_and_crlf() {
        let frame = encode(&sample_message()).unwrap().replace('\n', "\r\n");
        let (a, b) = frame.split_at(7);

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(a).is_empty());
        assert_eq!(decoder.feed(b), vec![sample_message()]);
    }

    #[test]
    fn test_decode_ignores_unknown_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .feed("event: ping\ndata: 1\n\nevent: connectionId\ndata: z\n\n");
        assert_eq!(events, vec![TransportEvent::ConnectionId("z".into())]);
    }

    #[test]
    fn test_malformed_frame_keeps_rest_of_chunk() {
        let mut chunk = encode(&TransportEvent::ConnectionId("abc".into())).unwrap();
        chunk.push_str("data: {not json\n\n");
        chunk.push_str(&encode(&sample_message()).unwrap());

        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.feed(&chunk),
            vec![TransportEvent::ConnectionId("abc".into()), sample_message()]
        );
    }
}
