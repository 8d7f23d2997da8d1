//! Runtime error types.

use courier_core::{ContextError, MessageType, TransportError};

/// Failures resolving where an outgoing message goes.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no destination configured for message type `{message_type}`")]
    NoDestination { message_type: MessageType },
    #[error("cannot reply: the incoming message has no reply-to address and no destination was given")]
    NoReplyAddress,
    #[error("the transport does not support the `{constraint}` delivery constraint")]
    UnsupportedConstraint { constraint: &'static str },
    #[error("endpoint is send-only and has no local address")]
    SendOnly,
}

/// Failures in the subscription protocol.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// A publisher queue stayed missing after every retry.
    #[error(
        "failed to {action} for `{message_type}` at publisher queue `{destination}`: {source}"
    )]
    PublisherUnreachable {
        action: &'static str,
        destination: String,
        message_type: MessageType,
        #[source]
        source: TransportError,
    },
    #[error("subscription storage failed: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Errors returned from a pipeline invocation. Behaviors and terminators
/// propagate these unchanged.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline invocation cancelled")]
    Cancelled,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no handlers registered for message type `{message_type}`")]
    NoHandlers { message_type: MessageType },
    #[error("incoming message has no `{header}` header")]
    MissingHeader { header: &'static str },
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl PipelineError {
    /// `true` when the failure is the transport reporting a missing queue.
    #[must_use]
    pub fn is_queue_not_found(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_queue_not_found())
    }
}
