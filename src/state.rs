//! Shared application state passed explicitly to the gateway's handlers —
//! no hidden globals.

use crate::registry::SubscriptionRegistry;
use crate::service::ChannelService;

/// Cheaply cloneable: both fields wrap `Arc`-backed handles internally, so
/// cloning `AppState` per request costs only a handful of atomic
/// increments.
#[derive(Clone)]
pub struct AppState {
    pub service: ChannelService,
    pub registry: SubscriptionRegistry,
}
