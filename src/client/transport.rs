//! Seams between the subscription manager and the network.
//!
//! A [`Transport`] opens the single event stream; a [`LiveQueryProvider`]
//! performs request/response calls (live fetch and channel notices).

use super::manager::Command;
use crate::error::Result;
use crate::sse::SseDecoder;
use crate::types::{EntityDescriptor, QuerySpec};
use crate::wire::{ChannelNotice, SubscribeResult, TransportEvent};
use crossbeam_channel::Sender;

/// Opens physical connections.
pub trait Transport: Send + Sync {
    /// Open a connection that reports into `sink`.
    ///
    /// The connection counts as open once it delivers a
    /// [`TransportEvent::ConnectionId`]. An `Err` here, or a later
    /// [`TransportSink::closed`], sends the client into reconnect.
    fn connect(&self, sink: TransportSink) -> Result<Box<dyn TransportConnection>>;
}

/// An open physical connection.
pub trait TransportConnection: Send {
    /// Close the connection. Must not report back through the sink.
    fn close(&mut self);
}

/// Request/response calls to the server.
pub trait LiveQueryProvider: Send + Sync {
    /// Fetch a query's rows and register it for live updates.
    fn fetch(&self, entity: &EntityDescriptor, query: &QuerySpec) -> Result<SubscribeResult>;

    fn subscribe(&self, notice: &ChannelNotice) -> Result<()>;

    fn unsubscribe(&self, notice: &ChannelNotice) -> Result<()>;
}

/// What a connection reports.
#[derive(Debug)]
pub(crate) enum TransportSignal {
    Event(TransportEvent),
    Closed(String),
}

/// Where a connection delivers its events. Each connection attempt gets its
/// own sink so reports from stale connections are ignored.
#[derive(Clone)]
pub struct TransportSink {
    attempt: u64,
    commands: Sender<Command>,
}

impl TransportSink {
    pub(crate) fn new(attempt: u64, commands: Sender<Command>) -> Self {
        Self { attempt, commands }
    }

    /// Deliver one event. Returns false once the client is gone.
    pub fn event(&self, event: TransportEvent) -> bool {
        self.send(TransportSignal::Event(event))
    }

    /// Report that the connection dropped.
    pub fn closed(&self, reason: impl Into<String>) {
        self.send(TransportSignal::Closed(reason.into()));
    }

    /// Decode a chunk of an SSE stream and deliver the events it completes.
    /// Returns false once the client is gone.
    pub fn feed_sse(&self, decoder: &mut SseDecoder, chunk: &str) -> bool {
        decoder.feed(chunk).into_iter().all(|event| self.event(event))
    }

    fn send(&self, signal: TransportSignal) -> bool {
        self.commands
            .send(Command::Transport {
                attempt: self.attempt,
                signal,
            })
            .is_ok()
    }
}
