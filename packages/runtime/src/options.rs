//! Per-call options for the message operations.
//!
//! Options values are reusable: the operations copy what they need into a
//! fresh context and never write back into the options.

use std::time::{Duration, SystemTime};

use courier_core::transport::DeliveryConstraint;
use courier_core::Headers;

use crate::subscriptions::SubscriptionRetrySettings;

/// Options for [`send`](crate::operations::MessageOperations::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Caller-chosen message id. A time-ordered id is generated otherwise.
    pub message_id: Option<String>,
    pub headers: Headers,
    /// Explicit destination queue, overriding the routing table.
    pub destination: Option<String>,
    /// Route to this endpoint's own input queue.
    pub route_to_this_endpoint: bool,
    pub delayed_delivery: Option<DeliveryConstraint>,
    pub time_to_be_received: Option<Duration>,
    /// Dispatch immediately instead of batching with the incoming message.
    pub immediate_dispatch: bool,
}

impl SendOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn to(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    #[must_use]
    pub fn route_to_this_endpoint(mut self) -> Self {
        self.route_to_this_endpoint = true;
        self
    }

    #[must_use]
    pub fn delay_delivery_with(mut self, delay: Duration) -> Self {
        self.delayed_delivery = Some(DeliveryConstraint::DelayDeliveryWith(delay));
        self
    }

    #[must_use]
    pub fn do_not_deliver_before(mut self, at: SystemTime) -> Self {
        self.delayed_delivery = Some(DeliveryConstraint::DoNotDeliverBefore(at));
        self
    }

    #[must_use]
    pub fn discard_if_not_received_within(mut self, ttbr: Duration) -> Self {
        self.time_to_be_received = Some(ttbr);
        self
    }

    #[must_use]
    pub fn require_immediate_dispatch(mut self) -> Self {
        self.immediate_dispatch = true;
        self
    }
}

/// Options for [`publish`](crate::operations::MessageOperations::publish).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub message_id: Option<String>,
    pub headers: Headers,
    pub time_to_be_received: Option<Duration>,
    pub immediate_dispatch: bool,
}

impl PublishOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Options for [`reply`](crate::operations::MessageOperations::reply).
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    pub message_id: Option<String>,
    pub headers: Headers,
    /// Overrides the incoming message's reply-to address.
    pub destination: Option<String>,
    pub immediate_dispatch: bool,
}

impl ReplyOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn to(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Options for subscribe and unsubscribe.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Overrides the endpoint's retry policy for this call only.
    pub retry: Option<SubscriptionRetrySettings>,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retry(mut self, retry: SubscriptionRetrySettings) -> Self {
        self.retry = Some(retry);
        self
    }
}
