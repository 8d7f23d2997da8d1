//! Subscription protocol: native and message-driven terminators, the
//! publisher-side receiver behavior, and subscriber storage.

pub mod receiver;
pub mod storage;
pub mod terminators;

use std::time::Duration;

pub use receiver::SubscriptionReceiverBehavior;
pub use storage::{InMemorySubscriptionStorage, Subscriber, SubscriptionStorage};
pub use terminators::{
    MessageDrivenSubscribeTerminator, MessageDrivenUnsubscribeTerminator,
    NativeSubscribeTerminator, NativeUnsubscribeTerminator,
};

/// Retry policy for subscription control messages sent to publishers.
///
/// Looked up from the operation's context with `get_or_create`, so a value
/// set on an individual operation overrides the endpoint-wide one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRetrySettings {
    /// Retries after the first attempt when the publisher queue is missing.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SubscriptionRetrySettings {
    /// Ten retries, two seconds apart.
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_secs(2),
        }
    }
}
