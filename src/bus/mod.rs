//! Message bus: transport-agnostic fan-out of channel messages to attached
//! listeners. Live query diffs and plain channel payloads share it.
//!
//! Delivery is best effort to whoever is attached at publish time. There is
//! no replay buffer; a client that missed diffs recovers with a full fetch.
//!
//! # Example
//!
//! ```ignore
//! let bus = SubscriptionServer::new(BusConfig::default());
//! let stream = bus.open_connection();
//! bus.subscribe(&ChannelNotice::new("c1", stream.client_id.clone()))?;
//!
//! bus.publish_message("c1", vec![DiffMessage::Add(json!({"id": 1}))]);
//! bus.send_message("c1", json!({"text": "hello"}));
//!
//! match stream.recv() {
//!     Ok(TransportEvent::ConnectionId(id)) => println!("connected as {}", id),
//!     Ok(TransportEvent::Message(m)) => println!("{} changed", m.channel),
//!     Err(_) => {}
//! }
//! ```

mod server;

pub use server::{StreamHandle, SubscriptionServer};

use crate::wire::DiffMessage;
use serde_json::Value;
use tracing::warn;

/// Anything channel messages can be published to.
pub trait MessageBus: Send + Sync {
    /// Deliver `data` to every listener attached to `channel`. Returns how
    /// many listeners received it.
    fn send_message(&self, channel: &str, data: Value) -> usize;

    /// Deliver a live query's diffs as one message.
    fn publish_message(&self, channel: &str, messages: Vec<DiffMessage>) -> usize {
        match serde_json::to_value(&messages) {
            Ok(data) => self.send_message(channel, data),
            Err(e) => {
                warn!(channel = %channel, error = %e, "could not encode diffs");
                0
            }
        }
    }
}

/// Configuration for the subscription server.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Max buffered events per connection before it is dropped.
    /// Default: 1000
    pub buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}
