//! Context types the built-in pipelines run over.
//!
//! All of them embed one [`Extensions`] node; the role-specific data sits
//! next to it. Outgoing contexts are always children of the context the
//! operation was started from, so they see its values but never write to it.

use std::sync::Arc;

use courier_core::transport::{
    DeliveryConstraint, DispatchConsistency, IncomingMessage, TransportOperation,
};
use courier_core::{
    Extensions, Headers, IncomingLogicalMessage, MessageIntent, MessageType,
    OutgoingLogicalMessage,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::PipelineContext;

/// Context of a send, publish, or reply.
#[derive(Debug)]
pub struct OutgoingContext {
    pub extensions: Arc<Extensions>,
    pub cancellation: CancellationToken,
    pub intent: MessageIntent,
    pub message_id: String,
    pub headers: Headers,
    pub message: OutgoingLogicalMessage,
    /// Explicit destination (send) or reply-to override (reply).
    pub destination: Option<String>,
    /// Owned by this operation only; never shared with the options it came from.
    pub delivery_constraints: Vec<DeliveryConstraint>,
    pub dispatch_consistency: DispatchConsistency,
}

impl OutgoingContext {
    pub fn add_delivery_constraint(&mut self, constraint: DeliveryConstraint) {
        self.delivery_constraints.push(constraint);
    }
}

impl PipelineContext for OutgoingContext {
    fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Context of a subscribe or unsubscribe.
#[derive(Debug)]
pub struct SubscriptionContext {
    pub extensions: Arc<Extensions>,
    pub cancellation: CancellationToken,
    pub event_type: MessageType,
}

impl PipelineContext for SubscriptionContext {
    fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Context of one inbound delivery.
#[derive(Debug)]
pub struct IncomingContext {
    pub extensions: Arc<Extensions>,
    pub cancellation: CancellationToken,
    pub message: IncomingMessage,
    /// Filled in by the deserialization behavior.
    pub logical_message: Option<IncomingLogicalMessage>,
}

impl IncomingContext {
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.message.headers.get(key).map(String::as_str)
    }
}

impl PipelineContext for IncomingContext {
    fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Facts about the message currently being processed, stored at the root of
/// an incoming context tree so replies and causation headers can find them.
#[derive(Debug, Clone)]
pub struct IncomingMessageInfo {
    pub message: IncomingMessage,
    pub reply_to_address: Option<String>,
}

/// Outgoing operations collected while a message is processed, dispatched
/// as one batch after the incoming pipeline completes.
#[derive(Debug, Default)]
pub struct PendingTransportOperations {
    operations: Mutex<Vec<TransportOperation>>,
}

impl PendingTransportOperations {
    pub fn extend(&self, operations: impl IntoIterator<Item = TransportOperation>) {
        self.operations.lock().extend(operations);
    }

    /// Takes every collected operation, leaving the batch empty.
    #[must_use]
    pub fn take(&self) -> Vec<TransportOperation> {
        std::mem::take(&mut *self.operations.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }
}
