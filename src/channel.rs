//! Plain named channels for application messages.
//!
//! A [`MessageChannel`] rides the same bus, stream and notice endpoints as
//! live queries but carries whatever the sender chooses instead of diffs.
//! Clients attach with
//! [`LiveQueryClient::subscribe_channel`](crate::client::LiveQueryClient::subscribe_channel).
//!
//! # Example
//!
//! ```ignore
//! let alerts = server.message_channel::<Alert>("alerts", Arc::new(AllowAll));
//! let delivered = alerts.send(&Alert { text: "deploy done".into() })?;
//! ```

use crate::bus::MessageBus;
use crate::error::Result;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Sending side of one named channel.
pub struct MessageChannel<T> {
    key: String,
    bus: Arc<dyn MessageBus>,
    _message: PhantomData<fn(&T)>,
}

impl<T: Serialize> MessageChannel<T> {
    pub fn new(key: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            key: key.into(),
            bus,
            _message: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Deliver `message` to every connection attached to the channel.
    /// Returns how many received it.
    pub fn send(&self, message: &T) -> Result<usize> {
        let data = serde_json::to_value(message)?;
        let delivered = self.bus.send_message(&self.key, data);
        debug!(channel = %self.key, delivered, "channel message sent");
        Ok(delivered)
    }
}

impl<T> Clone for MessageChannel<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            bus: Arc::clone(&self.bus),
            _message: PhantomData,
        }
    }
}
