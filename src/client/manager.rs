//! The client subscription manager.
//!
//! One owner thread holds every piece of mutable subscription state and
//! consumes a single command queue: application subscribe/unsubscribe calls,
//! fetch results, transport reports and notice acknowledgements all arrive
//! there, so bookkeeping is never touched concurrently. Timers (idle grace,
//! reconnect backoff) are driven by the queue's receive deadline.
//!
//! Control notices go through one FIFO worker, so an unsubscribe notice is
//! never sent ahead of its subscribe notice.
//!
//! Plain message channels share the connection and the notice worker. They
//! hold no rows, so a reconnect only resubscribes them.

use super::apply::{apply_changes, LiveQueryUpdate};
use super::state::{Backoff, ConnectionMachine, ConnectionState, OpenKind, RetryPolicy};
use super::transport::{
    LiveQueryProvider, Transport, TransportConnection, TransportSignal, TransportSink,
};
use crate::error::{LiveQueryError, Result};
use crate::types::{EntityDescriptor, QuerySpec, Record};
use crate::wire::{ChannelMessage, ChannelNotice, DiffMessage, SubscribeResult, TransportEvent};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type ChangeListener = Box<dyn FnMut(&LiveQueryUpdate) + Send>;
type MessageListener = Box<dyn FnMut(&Value) + Send>;
type ErrorListener = Box<dyn FnMut(&LiveQueryError) + Send>;

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long a channel without listeners, and then the connection, is
    /// kept before being released. Default: 1s
    pub idle_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// A query to keep live.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveQuery {
    pub entity: EntityDescriptor,
    pub query: QuerySpec,
}

impl LiveQuery {
    pub fn new(entity: EntityDescriptor, query: QuerySpec) -> Self {
        Self { entity, query }
    }

    /// Subscriptions with equal keys share one fetch and one channel.
    pub fn key(&self) -> Result<String> {
        Ok(format!("{}:{}", self.entity.key, self.query.to_json()?))
    }
}

/// Snapshot of the manager's bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Queries held, including ones lingering without listeners.
    pub queries: usize,
    /// Message channels held, including lingering ones.
    pub message_channels: usize,
    pub listeners: usize,
    /// Query and message channels with a subscribe notice on the current
    /// connection.
    pub subscribed_channels: usize,
    pub fetches_in_flight: usize,
    pub notices_in_flight: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NoticeKind {
    Subscribe,
    Unsubscribe,
}

pub(crate) enum Command {
    Subscribe {
        listener: u64,
        query: LiveQuery,
        key: String,
        on_change: ChangeListener,
        on_error: Option<ErrorListener>,
    },
    SubscribeChannel {
        listener: u64,
        channel: String,
        on_message: MessageListener,
        on_error: Option<ErrorListener>,
    },
    Unsubscribe {
        listener: u64,
    },
    FetchDone {
        key: String,
        generation: u64,
        result: Result<SubscribeResult>,
    },
    Transport {
        attempt: u64,
        signal: TransportSignal,
    },
    NoticeDone {
        kind: NoticeKind,
        notice: ChannelNotice,
        result: Result<()>,
    },
    Flush(Sender<()>),
    Shutdown,
}

struct NoticeJob {
    kind: NoticeKind,
    notice: ChannelNotice,
}

struct Shared {
    state: ConnectionState,
    stats: ClientStats,
}

/// Keeps many live queries in sync over one shared connection.
pub struct LiveQueryClient {
    commands: Sender<Command>,
    shared: Arc<RwLock<Shared>>,
    next_listener: AtomicU64,
    owner: Option<JoinHandle<()>>,
}

impl LiveQueryClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        provider: Arc<dyn LiveQueryProvider>,
        config: ClientConfig,
    ) -> Result<Self> {
        let (commands, receiver) = unbounded();
        let (notices, jobs) = unbounded();

        let worker_provider = Arc::clone(&provider);
        let worker_commands = commands.clone();
        let notice_worker = thread::Builder::new()
            .name("livequery-notices".into())
            .spawn(move || send_notices(worker_provider, jobs, worker_commands))?;

        let shared = Arc::new(RwLock::new(Shared {
            state: ConnectionState::Closed,
            stats: ClientStats::default(),
        }));

        let owner = Owner {
            machine: ConnectionMachine::new(config.retry.clone()),
            transport,
            provider,
            config,
            commands: commands.clone(),
            notices: Some(notices),
            notice_worker: Some(notice_worker),
            shared: Arc::clone(&shared),
            connection: None,
            attempt: 0,
            reconnect_at: None,
            queries: HashMap::new(),
            channels: HashMap::new(),
            message_channels: HashMap::new(),
            listeners: HashMap::new(),
            generation: 0,
            fetches: 0,
            notices_in_flight: 0,
            flush_waiters: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name("livequery-client".into())
            .spawn(move || owner.run(receiver))?;

        Ok(Self {
            commands,
            shared,
            next_listener: AtomicU64::new(1),
            owner: Some(handle),
        })
    }

    /// Keep `query` live. `on_change` first receives the full result, then
    /// every change to it, on the manager's thread.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<F>(&self, query: LiveQuery, on_change: F) -> Result<Subscription>
    where
        F: FnMut(&LiveQueryUpdate) + Send + 'static,
    {
        self.register(query, Box::new(on_change), None)
    }

    /// Like [`subscribe`](Self::subscribe), also reporting failures the
    /// manager cannot recover from: denied subscriptions, failed fetches and
    /// exhausted reconnect retries.
    pub fn subscribe_with_errors<F, E>(
        &self,
        query: LiveQuery,
        on_change: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        F: FnMut(&LiveQueryUpdate) + Send + 'static,
        E: FnMut(&LiveQueryError) + Send + 'static,
    {
        self.register(query, Box::new(on_change), Some(Box::new(on_error)))
    }

    /// Listen on a plain message channel. Each payload is decoded as `T`;
    /// ones that do not decode are logged and skipped.
    ///
    /// Listeners of one channel share a single subscribe notice.
    pub fn subscribe_channel<T, F>(&self, channel: &str, on_message: F) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        F: FnMut(T) + Send + 'static,
    {
        self.register_channel(channel, decoding(channel, on_message), None)
    }

    /// Like [`subscribe_channel`](Self::subscribe_channel), also reporting
    /// a refused subscription and exhausted reconnect retries.
    pub fn subscribe_channel_with_errors<T, F, E>(
        &self,
        channel: &str,
        on_message: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        F: FnMut(T) + Send + 'static,
        E: FnMut(&LiveQueryError) + Send + 'static,
    {
        self.register_channel(channel, decoding(channel, on_message), Some(Box::new(on_error)))
    }

    fn register_channel(
        &self,
        channel: &str,
        on_message: MessageListener,
        on_error: Option<ErrorListener>,
    ) -> Result<Subscription> {
        let listener = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.commands
            .send(Command::SubscribeChannel {
                listener,
                channel: channel.to_string(),
                on_message,
                on_error,
            })
            .map_err(|_| LiveQueryError::ManagerClosed)?;

        Ok(Subscription {
            listener,
            commands: self.commands.clone(),
            active: true,
        })
    }

    fn register(
        &self,
        query: LiveQuery,
        on_change: ChangeListener,
        on_error: Option<ErrorListener>,
    ) -> Result<Subscription> {
        let key = query.key()?;
        let listener = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.commands
            .send(Command::Subscribe {
                listener,
                query,
                key,
                on_change,
                on_error,
            })
            .map_err(|_| LiveQueryError::ManagerClosed)?;

        Ok(Subscription {
            listener,
            commands: self.commands.clone(),
            active: true,
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.read().state.clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.shared.read().stats.clone()
    }

    /// Wait until no fetch, notice or connection attempt is outstanding.
    /// Must not be called from a subscription callback.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = bounded(1);
        if self.commands.send(Command::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Close the connection and stop the manager. Subscriptions still held
    /// become inert.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                warn!("subscription manager panicked");
            }
        }
    }
}

impl Drop for LiveQueryClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to one `subscribe` call.
pub struct Subscription {
    listener: u64,
    commands: Sender<Command>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.listener
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.active, false) {
            let _ = self.commands.send(Command::Unsubscribe {
                listener: self.listener,
            });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

enum Callback {
    Query(ChangeListener),
    Message(MessageListener),
}

struct ListenerEntry {
    /// Query key, or the channel name of a message listener.
    key: String,
    callback: Callback,
    on_error: Option<ErrorListener>,
}

/// Client-side state of one (entity, query) pair.
struct QueryState {
    query: LiveQuery,
    /// Known once the first fetch answered.
    channel: Option<String>,
    items: Vec<Record>,
    loaded: bool,
    listeners: Vec<u64>,
    /// Generation of the newest fetch; only its result is used.
    generation: u64,
    fetching: bool,
    /// Diffs received while a fetch is outstanding.
    buffered: Vec<DiffMessage>,
    /// Subscribe notice sent on the current connection.
    subscribed: bool,
    /// Set while no listener is attached.
    idle_since: Option<Instant>,
}

/// Client-side state of one plain message channel.
#[derive(Default)]
struct MessageChannelState {
    listeners: Vec<u64>,
    subscribed: bool,
    idle_since: Option<Instant>,
}

impl QueryState {
    fn new(query: LiveQuery, listener: u64) -> Self {
        Self {
            query,
            channel: None,
            items: Vec::new(),
            loaded: false,
            listeners: vec![listener],
            generation: 0,
            fetching: false,
            buffered: Vec::new(),
            subscribed: false,
            idle_since: None,
        }
    }
}

struct Owner {
    transport: Arc<dyn Transport>,
    provider: Arc<dyn LiveQueryProvider>,
    config: ClientConfig,
    commands: Sender<Command>,
    notices: Option<Sender<NoticeJob>>,
    notice_worker: Option<JoinHandle<()>>,
    shared: Arc<RwLock<Shared>>,
    machine: ConnectionMachine,
    connection: Option<Box<dyn TransportConnection>>,
    /// Connection attempt counter; reports from older attempts are stale.
    attempt: u64,
    reconnect_at: Option<Instant>,
    /// Query key to state.
    queries: HashMap<String, QueryState>,
    /// Channel to query key.
    channels: HashMap<String, String>,
    message_channels: HashMap<String, MessageChannelState>,
    listeners: HashMap<u64, ListenerEntry>,
    /// Last fetch generation handed out. Never reused, so a result for a
    /// query that was torn down and recreated is still recognised as stale.
    generation: u64,
    fetches: usize,
    notices_in_flight: usize,
    flush_waiters: Vec<Sender<()>>,
}

impl Owner {
    fn run(mut self, receiver: Receiver<Command>) {
        loop {
            let command = match self.next_deadline() {
                Some(deadline) => match receiver.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            if let Some(command) = command {
                if !self.handle(command) {
                    break;
                }
            }
            self.fire_timers(Instant::now());
            self.publish_state();
        }
        self.stop();
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe {
                listener,
                query,
                key,
                on_change,
                on_error,
            } => self.add_listener(listener, query, key, on_change, on_error),
            Command::SubscribeChannel {
                listener,
                channel,
                on_message,
                on_error,
            } => self.add_channel_listener(listener, channel, on_message, on_error),
            Command::Unsubscribe { listener } => self.remove_listener(listener),
            Command::FetchDone {
                key,
                generation,
                result,
            } => self.fetch_done(key, generation, result),
            Command::Transport { attempt, signal } => {
                if attempt == self.attempt {
                    self.transport_signal(signal);
                } else {
                    debug!(attempt, current = self.attempt, "ignoring stale connection report");
                }
            }
            Command::NoticeDone {
                kind,
                notice,
                result,
            } => self.notice_done(kind, notice, result),
            Command::Flush(done) => self.flush_waiters.push(done),
            Command::Shutdown => return false,
        }
        true
    }

    fn add_listener(
        &mut self,
        id: u64,
        query: LiveQuery,
        key: String,
        on_change: ChangeListener,
        on_error: Option<ErrorListener>,
    ) {
        self.listeners.insert(
            id,
            ListenerEntry {
                key: key.clone(),
                callback: Callback::Query(on_change),
                on_error,
            },
        );

        match self.queries.get_mut(&key) {
            Some(state) => {
                state.listeners.push(id);
                if state.idle_since.take().is_some() {
                    debug!(key = %key, "query revived within grace period");
                }
                if state.loaded {
                    let update = LiveQueryUpdate::new(
                        state.items.clone(),
                        vec![DiffMessage::All(state.items.clone())],
                        state.query.entity.clone(),
                    );
                    deliver(&mut self.listeners, &[id], &update);
                }
            }
            None => {
                self.queries.insert(key.clone(), QueryState::new(query, id));
                self.start_fetch(&key);
            }
        }

        self.ensure_connection();
    }

    fn add_channel_listener(
        &mut self,
        id: u64,
        channel: String,
        on_message: MessageListener,
        on_error: Option<ErrorListener>,
    ) {
        self.listeners.insert(
            id,
            ListenerEntry {
                key: channel.clone(),
                callback: Callback::Message(on_message),
                on_error,
            },
        );

        let state = self.message_channels.entry(channel.clone()).or_default();
        state.listeners.push(id);
        if state.idle_since.take().is_some() {
            debug!(channel = %channel, "message channel revived within grace period");
        }

        self.ensure_connection();
        self.ensure_channel_subscribed(&channel);
    }

    fn remove_listener(&mut self, id: u64) {
        let Some(entry) = self.listeners.remove(&id) else {
            return;
        };
        let listeners = match entry.callback {
            Callback::Query(_) => self
                .queries
                .get_mut(&entry.key)
                .map(|state| (&mut state.listeners, &mut state.idle_since)),
            Callback::Message(_) => self
                .message_channels
                .get_mut(&entry.key)
                .map(|state| (&mut state.listeners, &mut state.idle_since)),
        };
        if let Some((listeners, idle_since)) = listeners {
            listeners.retain(|l| *l != id);
            if listeners.is_empty() {
                debug!(key = %entry.key, "last listener left");
                *idle_since = Some(Instant::now());
            }
        }
    }

    fn start_fetch(&mut self, key: &str) {
        let Some(state) = self.queries.get_mut(key) else {
            return;
        };
        self.generation += 1;
        state.generation = self.generation;
        state.fetching = true;

        let generation = state.generation;
        let query = state.query.clone();
        let provider = Arc::clone(&self.provider);
        let commands = self.commands.clone();
        let fetch_key = key.to_string();

        let spawned = thread::Builder::new()
            .name("livequery-fetch".into())
            .spawn(move || {
                let result = provider.fetch(&query.entity, &query.query);
                let _ = commands.send(Command::FetchDone {
                    key: fetch_key,
                    generation,
                    result,
                });
            });

        match spawned {
            Ok(_) => self.fetches += 1,
            Err(e) => {
                state.fetching = false;
                warn!(key = %key, error = %e, "could not start fetch");
            }
        }
    }

    fn fetch_done(&mut self, key: String, generation: u64, result: Result<SubscribeResult>) {
        self.fetches = self.fetches.saturating_sub(1);

        let Some(state) = self.queries.get_mut(&key) else {
            // Torn down while fetching; the server registered it anyway
            if let Ok(result) = result {
                warn!(channel = %result.id, "late fetch result discarded");
                self.release_channel(result.id);
            }
            return;
        };
        if state.generation != generation {
            debug!(key = %key, "superseded fetch result ignored");
            return;
        }
        state.fetching = false;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %key, error = %e, "fetch failed");
                state.buffered.clear();
                let ids = state.listeners.clone();
                notify_error(&mut self.listeners, &ids, &e);
                return;
            }
        };

        let mut stale_channel = None;
        if state.channel.as_deref() != Some(result.id.as_str()) {
            if let Some(old) = state.channel.replace(result.id.clone()) {
                self.channels.remove(&old);
                if std::mem::replace(&mut state.subscribed, false) {
                    stale_channel = Some(old);
                }
            }
            self.channels.insert(result.id.clone(), key.clone());
        }

        let mut changes = Vec::with_capacity(1 + state.buffered.len());
        changes.push(DiffMessage::All(result.items));
        changes.append(&mut state.buffered);
        state.items = apply_changes(&[], &changes, &state.query.entity);
        state.loaded = true;

        let update = LiveQueryUpdate::new(state.items.clone(), changes, state.query.entity.clone());
        deliver(&mut self.listeners, &state.listeners, &update);

        if let Some(old) = stale_channel {
            self.release_channel(old);
        }
        self.ensure_subscribed(&key);
    }

    /// Tell the server a channel is no longer wanted on this connection.
    fn release_channel(&mut self, channel: String) {
        if let Some(client_id) = self.machine.state().client_id() {
            let notice = ChannelNotice::new(channel, client_id);
            self.queue_notice(NoticeKind::Unsubscribe, notice);
        }
    }

    fn ensure_subscribed(&mut self, key: &str) {
        let Some(client_id) = self.machine.state().client_id().map(str::to_string) else {
            return;
        };
        let Some(state) = self.queries.get_mut(key) else {
            return;
        };
        if state.subscribed {
            return;
        }
        let Some(channel) = state.channel.clone() else {
            return;
        };
        state.subscribed = true;
        self.queue_notice(NoticeKind::Subscribe, ChannelNotice::new(channel, client_id));
    }

    fn ensure_channel_subscribed(&mut self, channel: &str) {
        let Some(client_id) = self.machine.state().client_id().map(str::to_string) else {
            return;
        };
        let Some(state) = self.message_channels.get_mut(channel) else {
            return;
        };
        if state.subscribed {
            return;
        }
        state.subscribed = true;
        self.queue_notice(NoticeKind::Subscribe, ChannelNotice::new(channel, client_id));
    }

    fn queue_notice(&mut self, kind: NoticeKind, notice: ChannelNotice) {
        let Some(notices) = &self.notices else {
            return;
        };
        debug!(kind = ?kind, channel = %notice.channel, client_id = %notice.client_id, "queueing notice");
        if notices.send(NoticeJob { kind, notice }).is_ok() {
            self.notices_in_flight += 1;
        }
    }

    fn notice_done(&mut self, kind: NoticeKind, notice: ChannelNotice, result: Result<()>) {
        self.notices_in_flight = self.notices_in_flight.saturating_sub(1);

        let e = match result {
            Ok(()) => {
                debug!(kind = ?kind, channel = %notice.channel, "notice sent");
                return;
            }
            Err(e) => e,
        };
        warn!(kind = ?kind, channel = %notice.channel, error = %e, "notice failed");
        if kind != NoticeKind::Subscribe {
            return;
        }

        let current = self.machine.state().client_id() == Some(notice.client_id.as_str());
        let state = match self.channels.get(&notice.channel) {
            Some(key) => self
                .queries
                .get_mut(key)
                .map(|state| (&mut state.subscribed, state.listeners.clone())),
            None => self
                .message_channels
                .get_mut(&notice.channel)
                .map(|state| (&mut state.subscribed, state.listeners.clone())),
        };
        if let Some((subscribed, ids)) = state {
            if current {
                *subscribed = false;
            }
            if matches!(e, LiveQueryError::AuthorizationDenied(_)) {
                notify_error(&mut self.listeners, &ids, &e);
            }
        }
    }

    fn transport_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Event(TransportEvent::ConnectionId(client_id)) => self.opened(client_id),
            TransportSignal::Event(TransportEvent::Message(message)) => self.channel_message(message),
            TransportSignal::Closed(reason) => self.connection_lost(&reason),
        }
    }

    fn opened(&mut self, client_id: String) {
        if self.connection.is_none() {
            debug!(client_id = %client_id, "connection id without a connection");
            return;
        }
        let kind = self.machine.opened(client_id.clone());
        info!(
            client_id = %client_id,
            resync = kind == OpenKind::Reconnected,
            "connection open"
        );

        let channels: Vec<String> = self.message_channels.keys().cloned().collect();
        for channel in &channels {
            self.ensure_channel_subscribed(channel);
        }

        let keys: Vec<String> = self.queries.keys().cloned().collect();
        for key in &keys {
            self.ensure_subscribed(key);
            let refetch = match self.queries.get(key) {
                Some(state) => kind == OpenKind::Reconnected || (!state.loaded && !state.fetching),
                None => false,
            };
            if refetch {
                self.start_fetch(key);
            }
        }
    }

    fn channel_message(&mut self, message: ChannelMessage) {
        if let Some(key) = self.channels.get(&message.channel).cloned() {
            match message.into_diffs() {
                Ok(data) => self.query_message(&key, data),
                Err(e) => {
                    // A lost diff leaves the rows behind the server
                    warn!(key = %key, error = %e, "undecodable diff batch, refetching");
                    self.start_fetch(&key);
                }
            }
            return;
        }

        match self.message_channels.get(&message.channel) {
            Some(state) => {
                let ids = state.listeners.clone();
                deliver_message(&mut self.listeners, &ids, &message.data);
            }
            None => debug!(channel = %message.channel, "message for unknown channel"),
        }
    }

    fn query_message(&mut self, key: &str, data: Vec<DiffMessage>) {
        let Some(state) = self.queries.get_mut(key) else {
            return;
        };

        if state.fetching || !state.loaded {
            state.buffered.extend(data);
            return;
        }

        state.items = apply_changes(&state.items, &data, &state.query.entity);
        if state.listeners.is_empty() {
            return;
        }
        let update = LiveQueryUpdate::new(state.items.clone(), data, state.query.entity.clone());
        deliver(&mut self.listeners, &state.listeners, &update);
    }

    fn ensure_connection(&mut self) {
        if self.machine.start() {
            self.connect();
        }
    }

    fn connect(&mut self) {
        self.attempt += 1;
        let sink = TransportSink::new(self.attempt, self.commands.clone());
        match self.transport.connect(sink) {
            Ok(connection) => {
                debug!(attempt = self.attempt, "connecting");
                self.connection = Some(connection);
            }
            Err(e) => {
                warn!(attempt = self.attempt, error = %e, "connect failed");
                self.connection_lost(&e.to_string());
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        for state in self.queries.values_mut() {
            state.subscribed = false;
        }
        for state in self.message_channels.values_mut() {
            state.subscribed = false;
        }

        if self.is_unused() {
            self.close_connection();
            return;
        }

        match self.machine.lost() {
            Backoff::Retry(delay) => {
                info!(reason = %reason, retry_in_ms = delay.as_millis() as u64, "connection lost");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Backoff::Exhausted { retries } => {
                error!(retries, reason = %reason, "reconnect retries exhausted");
                self.reconnect_at = None;
                let err = LiveQueryError::RetriesExhausted(retries);
                let ids: Vec<u64> = self.listeners.keys().copied().collect();
                notify_error(&mut self.listeners, &ids, &err);
            }
        }
    }

    fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            info!("connection closed, no listeners left");
        }
        self.machine.close();
        self.reconnect_at = None;
    }

    fn is_unused(&self) -> bool {
        self.queries.is_empty() && self.message_channels.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let grace = self.config.idle_grace;
        self.queries
            .values()
            .map(|state| state.idle_since)
            .chain(self.message_channels.values().map(|state| state.idle_since))
            .flatten()
            .map(|since| since + grace)
            .chain(self.reconnect_at)
            .min()
    }

    fn fire_timers(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if at <= now {
                self.reconnect_at = None;
                if self.is_unused() {
                    self.machine.close();
                } else {
                    self.connect();
                }
            }
        }

        let grace = self.config.idle_grace;
        let expired = |idle_since: Option<Instant>| matches!(idle_since, Some(since) if since + grace <= now);
        let queries: Vec<String> = self
            .queries
            .iter()
            .filter(|(_, state)| expired(state.idle_since))
            .map(|(key, _)| key.clone())
            .collect();
        let channels: Vec<String> = self
            .message_channels
            .iter()
            .filter(|(_, state)| expired(state.idle_since))
            .map(|(channel, _)| channel.clone())
            .collect();
        if queries.is_empty() && channels.is_empty() {
            return;
        }

        for key in &queries {
            self.teardown(key);
        }
        for channel in channels {
            self.teardown_channel(channel);
        }
        if self.is_unused() {
            self.close_connection();
        }
    }

    fn teardown(&mut self, key: &str) {
        let Some(state) = self.queries.remove(key) else {
            return;
        };
        debug!(key = %key, "query released");
        if let Some(channel) = state.channel {
            self.channels.remove(&channel);
            if state.subscribed {
                self.release_channel(channel);
            }
        }
    }

    fn teardown_channel(&mut self, channel: String) {
        let Some(state) = self.message_channels.remove(&channel) else {
            return;
        };
        debug!(channel = %channel, "message channel released");
        if state.subscribed {
            self.release_channel(channel);
        }
    }

    fn is_settled(&self) -> bool {
        self.fetches == 0
            && self.notices_in_flight == 0
            && self.reconnect_at.is_none()
            && matches!(
                self.machine.state(),
                ConnectionState::Open { .. } | ConnectionState::Closed
            )
    }

    fn publish_state(&mut self) {
        {
            let mut shared = self.shared.write();
            shared.state = self.machine.state().clone();
            shared.stats = ClientStats {
                queries: self.queries.len(),
                message_channels: self.message_channels.len(),
                listeners: self.listeners.len(),
                subscribed_channels: self.queries.values().filter(|s| s.subscribed).count()
                    + self.message_channels.values().filter(|s| s.subscribed).count(),
                fetches_in_flight: self.fetches,
                notices_in_flight: self.notices_in_flight,
            };
        }

        if !self.flush_waiters.is_empty() && self.is_settled() {
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.machine.close();
        self.reconnect_at = None;

        // The worker drains queued notices, then exits
        self.notices.take();
        if let Some(worker) = self.notice_worker.take() {
            if worker.join().is_err() {
                warn!("notice worker panicked");
            }
        }
        self.publish_state();
        debug!("subscription manager stopped");
    }
}

fn deliver(listeners: &mut HashMap<u64, ListenerEntry>, ids: &[u64], update: &LiveQueryUpdate) {
    for id in ids {
        if let Some(Callback::Query(on_change)) = listeners.get_mut(id).map(|e| &mut e.callback) {
            on_change(update);
        }
    }
}

fn deliver_message(listeners: &mut HashMap<u64, ListenerEntry>, ids: &[u64], data: &Value) {
    for id in ids {
        if let Some(Callback::Message(on_message)) = listeners.get_mut(id).map(|e| &mut e.callback) {
            on_message(data);
        }
    }
}

/// Wrap a typed message callback for the owner thread.
fn decoding<T, F>(channel: &str, mut on_message: F) -> MessageListener
where
    T: DeserializeOwned + 'static,
    F: FnMut(T) + Send + 'static,
{
    let channel = channel.to_string();
    Box::new(move |data: &Value| match T::deserialize(data) {
        Ok(message) => on_message(message),
        Err(e) => warn!(channel = %channel, error = %e, "undecodable channel message skipped"),
    })
}

fn notify_error(listeners: &mut HashMap<u64, ListenerEntry>, ids: &[u64], error: &LiveQueryError) {
    for id in ids {
        if let Some(on_error) = listeners.get_mut(id).and_then(|e| e.on_error.as_mut()) {
            on_error(error);
        }
    }
}

fn send_notices(
    provider: Arc<dyn LiveQueryProvider>,
    jobs: Receiver<NoticeJob>,
    commands: Sender<Command>,
) {
    for job in jobs {
        let result = match job.kind {
            NoticeKind::Subscribe => provider.subscribe(&job.notice),
            NoticeKind::Unsubscribe => provider.unsubscribe(&job.notice),
        };
        let done = Command::NoticeDone {
            kind: job.kind,
            notice: job.notice,
            result,
        };
        if commands.send(done).is_err() {
            break;
        }
    }
}
