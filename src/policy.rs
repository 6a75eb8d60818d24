//! Authorization hook consulted before a channel may receive diffs.

use crate::types::SecurityContext;

/// The channel a subscriber asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelRequest<'a> {
    pub channel: &'a str,
    /// Entity watched by the channel, when a registration for it exists.
    pub entity_key: Option<&'a str>,
}

/// Decides whether `context` may subscribe to a channel.
///
/// Checked when a query is registered, when a subscribe notice arrives and
/// again before every publish, so a denial means the channel never receives
/// a diff.
pub trait SubscribePolicy: Send + Sync {
    fn can_subscribe(&self, request: &ChannelRequest<'_>, context: &SecurityContext) -> bool;
}

/// Allows every subscription.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl SubscribePolicy for AllowAll {
    fn can_subscribe(&self, _request: &ChannelRequest<'_>, _context: &SecurityContext) -> bool {
        true
    }
}

impl<F> SubscribePolicy for F
where
    F: Fn(&ChannelRequest<'_>, &SecurityContext) -> bool + Send + Sync,
{
    fn can_subscribe(&self, request: &ChannelRequest<'_>, context: &SecurityContext) -> bool {
        self(request, context)
    }
}
