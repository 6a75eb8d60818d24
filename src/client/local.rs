//! In-process connector between a [`LiveQueryClient`](super::LiveQueryClient)
//! and a [`LiveQueryServer`].
//!
//! Events travel through the SSE encoder and decoder, as they would over
//! HTTP. The transport can be switched offline to simulate an outage.

use super::transport::{LiveQueryProvider, Transport, TransportConnection, TransportSink};
use crate::error::{LiveQueryError, Result};
use crate::server::LiveQueryServer;
use crate::sse::{self, SseDecoder};
use crate::types::{EntityDescriptor, QuerySpec, SecurityContext};
use crate::wire::{ChannelNotice, SubscribeResult};
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Opens event streams directly on a server.
pub struct LocalTransport {
    server: Arc<LiveQueryServer>,
    online: Arc<AtomicBool>,
    /// Client ids of streams currently open through this transport.
    active: Arc<Mutex<HashSet<String>>>,
    connects: AtomicUsize,
}

impl LocalTransport {
    pub fn new(server: Arc<LiveQueryServer>) -> Self {
        Self {
            server,
            online: Arc::new(AtomicBool::new(true)),
            active: Arc::new(Mutex::new(HashSet::new())),
            connects: AtomicUsize::new(0),
        }
    }

    /// Provider acting as `context`, sharing this transport's online switch.
    pub fn provider(&self, context: SecurityContext) -> LocalProvider {
        LocalProvider {
            server: Arc::clone(&self.server),
            context,
            online: Arc::clone(&self.online),
        }
    }

    /// While offline, connects and provider calls fail.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Close every open stream from the server side.
    pub fn disconnect_all(&self) {
        let ids: Vec<String> = self.active.lock().drain().collect();
        for client_id in ids {
            debug!(client_id = %client_id, "dropping local stream");
            self.server.close_stream(&client_id);
        }
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.active.lock().len()
    }
}

impl Transport for LocalTransport {
    fn connect(&self, sink: TransportSink) -> Result<Box<dyn TransportConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(LiveQueryError::Transport("server unreachable".into()));
        }

        let stream = self.server.open_stream();
        let client_id = stream.client_id.clone();
        self.active.lock().insert(client_id.clone());

        let stopped = Arc::new(AtomicBool::new(false));
        let pump_stopped = Arc::clone(&stopped);
        thread::Builder::new()
            .name("livequery-local-stream".into())
            .spawn(move || {
                let mut decoder = SseDecoder::new();
                loop {
                    match stream.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => {
                            let frame = match sse::encode(&event) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!(error = %e, "could not encode event");
                                    continue;
                                }
                            };
                            if !sink.feed_sse(&mut decoder, &frame) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if pump_stopped.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            if !pump_stopped.load(Ordering::SeqCst) {
                                sink.closed("stream ended");
                            }
                            break;
                        }
                    }
                }
            })?;

        Ok(Box::new(LocalConnection {
            server: Arc::clone(&self.server),
            client_id,
            stopped,
            active: Arc::clone(&self.active),
        }))
    }
}

struct LocalConnection {
    server: Arc<LiveQueryServer>,
    client_id: String,
    stopped: Arc<AtomicBool>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TransportConnection for LocalConnection {
    fn close(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.lock().remove(&self.client_id);
        self.server.close_stream(&self.client_id);
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Calls the server's fetch and notice operations as one subject.
pub struct LocalProvider {
    server: Arc<LiveQueryServer>,
    context: SecurityContext,
    online: Arc<AtomicBool>,
}

impl LocalProvider {
    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LiveQueryError::Transport("server unreachable".into()))
        }
    }
}

impl LiveQueryProvider for LocalProvider {
    fn fetch(&self, entity: &EntityDescriptor, query: &QuerySpec) -> Result<SubscribeResult> {
        self.check_online()?;
        self.server.fetch_live(&entity.key, query, &self.context)
    }

    fn subscribe(&self, notice: &ChannelNotice) -> Result<()> {
        self.check_online()?;
        self.server.subscribe(notice, &self.context)
    }

    fn unsubscribe(&self, notice: &ChannelNotice) -> Result<()> {
        self.check_online()?;
        self.server.unsubscribe(notice);
        Ok(())
    }
}
