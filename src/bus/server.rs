//! Per-connection fan-out of channel messages.

use super::{BusConfig, MessageBus};
use crate::error::{LiveQueryError, Result};
use crate::wire::{ChannelMessage, ChannelNotice, TransportEvent};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Called with each channel that just lost its last listener.
type IdleListener = Box<dyn Fn(&str) + Send + Sync>;

/// Internal connection state.
struct Connection {
    sender: Sender<TransportEvent>,
    channels: HashSet<String>,
}

impl Connection {
    /// Try to queue an event. Returns false if the buffer is full or the
    /// receiving side is gone.
    fn try_send(&self, event: TransportEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Open connections by client id.
    connections: HashMap<String, Connection>,
    /// Channel to attached client ids.
    channels: HashMap<String, HashSet<String>>,
}

impl Inner {
    /// Detach a client from a channel. Returns true when the channel has no
    /// listener left.
    fn detach(&mut self, channel: &str, client_id: &str) -> bool {
        match self.channels.get_mut(channel) {
            Some(clients) => {
                clients.remove(client_id);
                if clients.is_empty() {
                    self.channels.remove(channel);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Remove a connection, returning the channels it left without listeners.
    fn drop_connection(&mut self, client_id: &str) -> Vec<String> {
        let Some(connection) = self.connections.remove(client_id) else {
            return Vec::new();
        };
        connection
            .channels
            .iter()
            .filter(|channel| self.detach(channel, client_id))
            .cloned()
            .collect()
    }
}

/// Receiving end of one connection's event stream.
pub struct StreamHandle {
    pub client_id: String,
    pub receiver: Receiver<TransportEvent>,
}

impl StreamHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<TransportEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<TransportEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<TransportEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Tracks connections and which channels each listens to.
pub struct SubscriptionServer {
    inner: RwLock<Inner>,
    /// Counter for generating client ids.
    next_id: AtomicU64,
    /// Distinguishes client ids across server restarts.
    instance: String,
    config: BusConfig,
    idle_listener: RwLock<Option<IdleListener>>,
}

impl SubscriptionServer {
    pub fn new(config: BusConfig) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            instance: format!("{:x}", started),
            config,
            idle_listener: RwLock::new(None),
        }
    }

    /// Register a callback for channels that lose their last listener.
    pub fn set_idle_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        *self.idle_listener.write() = Some(Box::new(listener));
    }

    /// Open a new connection. Its first event carries the client id.
    pub fn open_connection(&self) -> StreamHandle {
        let client_id = format!(
            "{}-{}",
            self.instance,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let (sender, receiver) = bounded(self.config.buffer_size.max(1));
        let _ = sender.try_send(TransportEvent::ConnectionId(client_id.clone()));

        self.inner.write().connections.insert(
            client_id.clone(),
            Connection {
                sender,
                channels: HashSet::new(),
            },
        );
        info!(client_id = %client_id, "stream opened");

        StreamHandle {
            client_id,
            receiver,
        }
    }

    /// Close a connection and detach it from all its channels.
    pub fn close_connection(&self, client_id: &str) {
        let idle = self.inner.write().drop_connection(client_id);
        info!(client_id = %client_id, "stream closed");
        self.notify_idle(&idle);
    }

    /// Attach a connection to a channel. Repeating it is harmless.
    pub fn subscribe(&self, notice: &ChannelNotice) -> Result<()> {
        let mut inner = self.inner.write();
        let connection = inner
            .connections
            .get_mut(&notice.client_id)
            .ok_or_else(|| LiveQueryError::UnknownConnection(notice.client_id.clone()))?;
        connection.channels.insert(notice.channel.clone());
        inner
            .channels
            .entry(notice.channel.clone())
            .or_default()
            .insert(notice.client_id.clone());
        debug!(channel = %notice.channel, client_id = %notice.client_id, "listener attached");
        Ok(())
    }

    /// Detach a connection from a channel. Returns true when the channel
    /// has no listener left.
    ///
    /// Notices from closed connections are ignored: closing already
    /// detached them, and the channel may since belong to a newer one.
    pub fn unsubscribe(&self, notice: &ChannelNotice) -> bool {
        let idle = {
            let mut inner = self.inner.write();
            match inner.connections.get_mut(&notice.client_id) {
                Some(connection) => {
                    connection.channels.remove(&notice.channel);
                }
                None => {
                    debug!(channel = %notice.channel, client_id = %notice.client_id, "unsubscribe from closed connection");
                    return false;
                }
            }
            let was_attached = inner.channels.contains_key(&notice.channel);
            inner.detach(&notice.channel, &notice.client_id) || !was_attached
        };
        debug!(channel = %notice.channel, client_id = %notice.client_id, "listener detached");
        if idle {
            self.notify_idle(std::slice::from_ref(&notice.channel));
        }
        idle
    }

    /// Number of connections attached to a channel.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner
            .read()
            .channels
            .get(channel)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.read().connections.contains_key(client_id)
    }

    fn notify_idle(&self, channels: &[String]) {
        if channels.is_empty() {
            return;
        }
        if let Some(listener) = self.idle_listener.read().as_ref() {
            for channel in channels {
                listener(channel);
            }
        }
    }
}

impl MessageBus for SubscriptionServer {
    fn send_message(&self, channel: &str, data: Value) -> usize {
        let event = TransportEvent::Message(ChannelMessage::new(channel, data));

        let mut delivered = 0;
        let mut to_remove = Vec::new();
        {
            let inner = self.inner.read();
            if let Some(clients) = inner.channels.get(channel) {
                for client_id in clients {
                    let sent = inner
                        .connections
                        .get(client_id)
                        .map(|c| c.try_send(event.clone()))
                        .unwrap_or(false);
                    if sent {
                        delivered += 1;
                    } else {
                        to_remove.push(client_id.clone());
                    }
                }
            }
        }

        // Drop connections that could not take the event
        if !to_remove.is_empty() {
            let mut idle = Vec::new();
            {
                let mut inner = self.inner.write();
                for client_id in &to_remove {
                    warn!(client_id = %client_id, channel = %channel, "dropping unresponsive connection");
                    idle.extend(inner.drop_connection(client_id));
                }
            }
            self.notify_idle(&idle);
        }

        delivered
    }
}

impl Default for SubscriptionServer {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
