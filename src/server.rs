//! Server side of the engine, wired together.
//!
//! [`LiveQueryServer`] owns the subscription server and the publisher and
//! exposes the operations a transport layer maps its endpoints onto:
//! opening a stream, live fetches, subscribe/unsubscribe notices and the
//! mutation entry point. It also declares plain message channels.

use crate::bus::{BusConfig, StreamHandle, SubscriptionServer};
use crate::channel::MessageChannel;
use crate::error::{LiveQueryError, Result};
use crate::policy::{ChannelRequest, SubscribePolicy};
use crate::publisher::{LiveQueryPublisher, PublishReport, PublisherConfig, QueryEvaluator};
use crate::registry::{Registration, RegistrationStore};
use crate::types::{ChangeEvent, QuerySpec, SecurityContext};
use crate::wire::{ChannelNotice, SubscribeResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Server configuration.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    pub bus: BusConfig,
    pub publisher: PublisherConfig,
}

pub struct LiveQueryServer {
    store: Arc<dyn RegistrationStore>,
    evaluator: Arc<dyn QueryEvaluator>,
    policy: Arc<dyn SubscribePolicy>,
    bus: Arc<SubscriptionServer>,
    publisher: Arc<LiveQueryPublisher>,
    /// Declared message channels and who may listen to them.
    message_channels: RwLock<HashMap<String, Arc<dyn SubscribePolicy>>>,
}

impl LiveQueryServer {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        evaluator: Arc<dyn QueryEvaluator>,
        policy: Arc<dyn SubscribePolicy>,
        config: ServerConfig,
    ) -> Self {
        let bus = Arc::new(SubscriptionServer::new(config.bus));

        // A channel nobody listens to any more needs no registration
        let idle_store = Arc::clone(&store);
        bus.set_idle_listener(move |channel| match idle_store.remove(channel) {
            Ok(true) => debug!(channel = %channel, "registration released"),
            Ok(false) => {}
            Err(e) => warn!(channel = %channel, error = %e, "failed to release registration"),
        });

        let publisher = Arc::new(LiveQueryPublisher::new(
            Arc::clone(&store),
            Arc::clone(&evaluator),
            bus.clone(),
            Arc::clone(&policy),
            config.publisher,
        ));

        match store.list() {
            Ok(existing) if !existing.is_empty() => {
                info!(registrations = existing.len(), "restored registrations")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not list stored registrations"),
        }

        Self {
            store,
            evaluator,
            policy,
            bus,
            publisher,
            message_channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open an event stream. Its first event carries the client id.
    pub fn open_stream(&self) -> StreamHandle {
        self.bus.open_connection()
    }

    pub fn close_stream(&self, client_id: &str) {
        self.bus.close_connection(client_id);
    }

    /// Evaluate a query and register it for live updates.
    ///
    /// The returned id is the channel the caller subscribes to. Fetching the
    /// same query again under the same context lands on the same channel and
    /// refreshes its identity list.
    pub fn fetch_live(
        &self,
        entity_key: &str,
        query: &QuerySpec,
        context: &SecurityContext,
    ) -> Result<SubscribeResult> {
        let mut registration = Registration::new(entity_key, query, context.clone(), Vec::new())?;
        let request = ChannelRequest {
            channel: &registration.id,
            entity_key: Some(entity_key),
        };
        if !self.policy.can_subscribe(&request, context) {
            return Err(LiveQueryError::AuthorizationDenied(registration.id));
        }

        let items = self.evaluator.evaluate(entity_key, query, context)?;
        registration.identities = items
            .iter()
            .map(|row| self.evaluator.identity_of(entity_key, row))
            .collect::<Result<_>>()?;

        let id = registration.id.clone();
        self.store.add(registration)?;
        debug!(channel = %id, entity = %entity_key, rows = items.len(), "live query registered");

        Ok(SubscribeResult { id, items })
    }

    /// Attach a client to a channel.
    ///
    /// A channel registered under another subject, or one the policy
    /// refuses, is rejected with [`LiveQueryError::AuthorizationDenied`].
    pub fn subscribe(&self, notice: &ChannelNotice, context: &SecurityContext) -> Result<()> {
        let registration = self.store.get(&notice.channel)?;
        if let Some(registration) = &registration {
            if registration.context.subject() != context.subject() {
                warn!(channel = %notice.channel, subject = %context.subject(), "subscribe to foreign channel");
                return Err(LiveQueryError::AuthorizationDenied(notice.channel.clone()));
            }
        }

        let request = ChannelRequest {
            channel: &notice.channel,
            entity_key: registration.as_ref().map(|r| r.entity_key.as_str()),
        };
        if !self.policy.can_subscribe(&request, context) {
            return Err(LiveQueryError::AuthorizationDenied(notice.channel.clone()));
        }
        if registration.is_none() {
            let channel_policy = self.message_channels.read().get(&notice.channel).cloned();
            if let Some(channel_policy) = channel_policy {
                if !channel_policy.can_subscribe(&request, context) {
                    debug!(channel = %notice.channel, subject = %context.subject(), "message channel refused");
                    return Err(LiveQueryError::AuthorizationDenied(notice.channel.clone()));
                }
            }
        }

        self.bus.subscribe(notice)
    }

    /// Declare a plain message channel. Subscribers must pass both the
    /// server policy and `policy`. Declaring a key again replaces its policy.
    pub fn message_channel<T: Serialize>(
        &self,
        key: &str,
        policy: Arc<dyn SubscribePolicy>,
    ) -> MessageChannel<T> {
        self.message_channels.write().insert(key.to_string(), policy);
        MessageChannel::new(key, self.bus.clone())
    }

    /// Detach a client from a channel. Returns true when the channel was
    /// left without listeners and its registration released.
    pub fn unsubscribe(&self, notice: &ChannelNotice) -> bool {
        self.bus.unsubscribe(notice)
    }

    /// Publish the diffs caused by committed changes, synchronously.
    ///
    /// Use a [`ChangeFeed`](crate::publisher::ChangeFeed) over
    /// [`publisher`](Self::publisher) to decouple this from the caller.
    pub fn items_changed(&self, entity_key: &str, changes: &[ChangeEvent]) -> Result<PublishReport> {
        self.publisher.items_changed(entity_key, changes)
    }

    /// Remove stored registrations no connection listens to, e.g. ones
    /// restored from a durable store after a restart. Returns how many
    /// were removed.
    pub fn prune_unattached(&self) -> Result<usize> {
        let mut removed = 0;
        for registration in self.store.list()? {
            if self.bus.listener_count(&registration.id) == 0 && self.store.remove(&registration.id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned unattached registrations");
        }
        Ok(removed)
    }

    pub fn publisher(&self) -> Arc<LiveQueryPublisher> {
        Arc::clone(&self.publisher)
    }

    pub fn bus(&self) -> &Arc<SubscriptionServer> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn RegistrationStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowAll;
    use crate::registry::InMemoryRegistrationStore;
    use crate::types::{Identity, Record};
    use crate::wire::{DiffMessage, TransportEvent};
    use serde_json::json;
    use std::time::Duration;

    struct Static;

    impl QueryEvaluator for Static {
        fn evaluate(&self, _: &str, _: &QuerySpec, _: &SecurityContext) -> Result<Vec<Record>> {
            Ok(vec![json!({"id": 1}), json!({"id": 2})])
        }
    }

    fn server(policy: Arc<dyn SubscribePolicy>) -> (LiveQueryServer, Arc<InMemoryRegistrationStore>) {
        let store = Arc::new(InMemoryRegistrationStore::new());
        let server = LiveQueryServer::new(store.clone(), Arc::new(Static), policy, ServerConfig::default());
        (server, store)
    }

    #[test]
    fn test_fetch_live_registers() {
        let (server, store) = server(Arc::new(AllowAll));
        let ctx = SecurityContext::user("u1");

        let result = server.fetch_live("tasks", &QuerySpec::all(), &ctx).unwrap();
        assert_eq!(result.items.len(), 2);

        let registration = store.get(&result.id).unwrap().unwrap();
        assert_eq!(registration.identities, vec![Identity::Int(1), Identity::Int(2)]);
        assert_eq!(registration.context, ctx);

        let again = server.fetch_live("tasks", &QuerySpec::all(), &ctx).unwrap();
        assert_eq!(again.id, result.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_denied_fetch_registers_nothing() {
        let deny = |_: &ChannelRequest<'_>, ctx: &SecurityContext| ctx.has_role("reader");
        let (server, store) = server(Arc::new(deny));

        let err = server
            .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::user("u1"))
            .unwrap_err();
        assert!(matches!(err, LiveQueryError::AuthorizationDenied(_)));
        assert!(store.is_empty());

        let reader = SecurityContext::user("u1").with_role("reader");
        assert!(server.fetch_live("tasks", &QuerySpec::all(), &reader).is_ok());
    }

    #[test]
    fn test_subscribe_foreign_channel_denied() {
        let (server, _store) = server(Arc::new(AllowAll));
        let owner = server
            .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::user("owner"))
            .unwrap();
        let stream = server.open_stream();

        let notice = ChannelNotice::new(owner.id, stream.client_id.clone());
        let err = server
            .subscribe(&notice, &SecurityContext::user("intruder"))
            .unwrap_err();
        assert!(matches!(err, LiveQueryError::AuthorizationDenied(_)));
        assert!(server.subscribe(&notice, &SecurityContext::user("owner")).is_ok());
    }

    #[test]
    fn test_last_listener_releases_registration() {
        let (server, store) = server(Arc::new(AllowAll));
        let ctx = SecurityContext::anonymous();
        let fetched = server.fetch_live("tasks", &QuerySpec::all(), &ctx).unwrap();

        let a = server.open_stream();
        let b = server.open_stream();
        server.subscribe(&ChannelNotice::new(fetched.id.clone(), a.client_id.clone()), &ctx).unwrap();
        server.subscribe(&ChannelNotice::new(fetched.id.clone(), b.client_id.clone()), &ctx).unwrap();

        assert!(!server.unsubscribe(&ChannelNotice::new(fetched.id.clone(), a.client_id.clone())));
        assert!(store.get(&fetched.id).unwrap().is_some());

        server.close_stream(&b.client_id);
        assert!(store.get(&fetched.id).unwrap().is_none());
    }

    #[test]
    fn test_items_changed_reaches_stream() {
        let (server, _store) = server(Arc::new(AllowAll));
        let ctx = SecurityContext::anonymous();
        let fetched = server.fetch_live("tasks", &QuerySpec::all(), &ctx).unwrap();
        let stream = server.open_stream();
        server.subscribe(&ChannelNotice::new(fetched.id.clone(), stream.client_id.clone()), &ctx).unwrap();

        let change = ChangeEvent::update("tasks", 2.into(), None, 2.into(), json!({"id": 2}));
        let report = server.items_changed("tasks", &[change]).unwrap();
        assert_eq!(report.published, 1);

        assert!(matches!(
            stream.recv_timeout(Duration::from_millis(100)).unwrap(),
            TransportEvent::ConnectionId(_)
        ));
        match stream.recv_timeout(Duration::from_millis(100)).unwrap() {
            TransportEvent::Message(message) => {
                assert_eq!(message.channel, fetched.id);
                assert_eq!(
                    message.into_diffs().unwrap(),
                    vec![DiffMessage::replace(2.into(), json!({"id": 2}))]
                );
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_message_channel_policy() {
        let (server, store) = server(Arc::new(AllowAll));
        let admins_only = |_: &ChannelRequest<'_>, ctx: &SecurityContext| ctx.has_role("admin");
        let alerts = server.message_channel::<String>("alerts", Arc::new(admins_only));
        let stream = server.open_stream();
        let notice = ChannelNotice::new("alerts", stream.client_id.clone());

        let err = server.subscribe(&notice, &SecurityContext::user("u1")).unwrap_err();
        assert!(matches!(err, LiveQueryError::AuthorizationDenied(_)));
        assert_eq!(alerts.send(&"ignored".to_string()).unwrap(), 0);

        let admin = SecurityContext::user("u2").with_role("admin");
        server.subscribe(&notice, &admin).unwrap();
        assert_eq!(alerts.send(&"deploy done".to_string()).unwrap(), 1);

        // Undeclared channels only answer to the server policy
        server
            .subscribe(&ChannelNotice::new("lobby", stream.client_id.clone()), &SecurityContext::user("u1"))
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_prune_unattached() {
        let (server, store) = server(Arc::new(AllowAll));
        let ctx = SecurityContext::anonymous();
        server.fetch_live("tasks", &QuerySpec::all(), &ctx).unwrap();
        let kept = server.fetch_live("tasks", &QuerySpec::all().limit(1), &ctx).unwrap();
        let stream = server.open_stream();
        server.subscribe(&ChannelNotice::new(kept.id.clone(), stream.client_id.clone()), &ctx).unwrap();

        assert_eq!(server.prune_unattached().unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&kept.id).unwrap().is_some());
    }
}
