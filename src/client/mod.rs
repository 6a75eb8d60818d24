//! Client subscription manager.
//!
//! [`LiveQueryClient`] multiplexes any number of live queries over one
//! transport connection. Subscribers of the same query share its fetch, its
//! channel and its cached rows; the server hears one subscribe notice per
//! channel no matter how many local listeners come and go within the idle
//! grace period.
//!
//! After a lost connection the client reconnects with backoff, resends a
//! subscribe notice for every channel it still holds and refetches every
//! query, so missed diffs are healed by a full snapshot.

mod apply;
pub mod local;
mod manager;
mod state;
mod transport;

pub use apply::{apply_changes, LiveQueryUpdate};
pub use manager::{ClientConfig, ClientStats, LiveQuery, LiveQueryClient, Subscription};
pub use state::{ConnectionState, RetryPolicy};
pub use transport::{LiveQueryProvider, Transport, TransportConnection, TransportSink};
