//! # Live Query
//!
//! Keeps remote copies of server-side query results up to date without
//! polling.
//!
//! ## Core Concepts
//!
//! - **Registrations**: watched queries with the identities they matched last
//! - **Publisher**: re-evaluates registrations on every committed change and
//!   publishes minimal diffs (`all`, `add`, `replace`, `remove`)
//! - **Bus**: fans diffs out to the connections attached to a channel
//! - **Client**: shares one connection across many subscriptions, applies
//!   diffs locally and resyncs after reconnects
//! - **Message channels**: plain named channels over the same connection,
//!   for application messages that are not query results
//!
//! ## Example
//!
//! ```ignore
//! use livequery::{LiveQueryServer, ServerConfig, InMemoryRegistrationStore, AllowAll};
//! use livequery::client::{local::LocalTransport, LiveQuery, LiveQueryClient, ClientConfig};
//!
//! let server = Arc::new(LiveQueryServer::new(
//!     Arc::new(InMemoryRegistrationStore::new()),
//!     evaluator,
//!     Arc::new(AllowAll),
//!     ServerConfig::default(),
//! ));
//!
//! let transport = Arc::new(LocalTransport::new(server.clone()));
//! let provider = Arc::new(transport.provider(SecurityContext::user("noam")));
//! let client = LiveQueryClient::new(transport, provider, ClientConfig::default())?;
//!
//! let query = LiveQuery::new(EntityDescriptor::new("tasks"), QuerySpec::all());
//! let _sub = client.subscribe(query, |update| println!("{} rows", update.items.len()))?;
//!
//! // After a mutation commits:
//! server.items_changed("tasks", &[ChangeEvent::insert("tasks", 4.into(), json!({"id": 4}))])?;
//! ```

pub mod bus;
pub mod channel;
pub mod client;
pub mod error;
pub mod policy;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod sse;
pub mod types;
pub mod wal;
pub mod wire;

// Re-exports
pub use bus::{BusConfig, MessageBus, StreamHandle, SubscriptionServer};
pub use channel::MessageChannel;
pub use error::{LiveQueryError, Result};
pub use policy::{AllowAll, ChannelRequest, SubscribePolicy};
pub use publisher::{
    compute_diff, ChangeFeed, DiffOutcome, LiveQueryPublisher, PublishReport, PublisherConfig,
    QueryEvaluator,
};
pub use registry::{
    channel_id, FileRegistrationStore, FileStoreConfig, InMemoryRegistrationStore, Registration,
    RegistrationStore,
};
pub use server::{LiveQueryServer, ServerConfig};
pub use types::*;
pub use wal::{ChangeBatch, WriteAheadLog};
pub use wire::{ChannelMessage, ChannelNotice, DiffMessage, SubscribeResult, TransportEvent};
