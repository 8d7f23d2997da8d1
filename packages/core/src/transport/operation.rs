//! Physical dispatch units: outgoing messages, address tags, delivery constraints.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::context::Extensions;
use crate::headers::Headers;
use crate::message::MessageType;

/// A serialized message ready for dispatch.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutgoingMessage {
    #[must_use]
    pub fn new(message_id: impl Into<String>, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: message_id.into(),
            headers,
            body: body.into(),
        }
    }
}

/// Where a transport operation is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressTag {
    /// Deliver to exactly one queue.
    Unicast { destination: String },
    /// Deliver to every subscriber of an event type (native pub/sub only).
    Multicast { message_type: MessageType },
}

impl AddressTag {
    #[must_use]
    pub fn unicast(destination: impl Into<String>) -> Self {
        Self::Unicast {
            destination: destination.into(),
        }
    }
}

/// A non-default delivery requirement attached to one transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryConstraint {
    /// Discard the message if it has not been received within this time (TTBR).
    DiscardIfNotReceivedBefore(Duration),
    /// Deliver no earlier than this long after dispatch.
    DelayDeliveryWith(Duration),
    /// Deliver no earlier than this point in time.
    DoNotDeliverBefore(SystemTime),
}

impl DeliveryConstraint {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DiscardIfNotReceivedBefore(_) => "DiscardIfNotReceivedBefore",
            Self::DelayDeliveryWith(_) => "DelayDeliveryWith",
            Self::DoNotDeliverBefore(_) => "DoNotDeliverBefore",
        }
    }

    #[must_use]
    pub fn is_delayed_delivery(&self) -> bool {
        matches!(self, Self::DelayDeliveryWith(_) | Self::DoNotDeliverBefore(_))
    }

    /// The earliest delivery time for delayed-delivery constraints.
    #[must_use]
    pub fn deliver_at(&self, now: SystemTime) -> Option<SystemTime> {
        match self {
            Self::DelayDeliveryWith(delay) => now.checked_add(*delay),
            Self::DoNotDeliverBefore(at) => Some(*at),
            Self::DiscardIfNotReceivedBefore(_) => None,
        }
    }
}

/// Whether an operation takes part in the ambient receive transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchConsistency {
    /// Enlist in the receive transaction when the transaction mode allows it.
    #[default]
    Default,
    /// Dispatch immediately, independently of the receive outcome.
    Isolated,
}

/// One physical unit of dispatch. Owns its constraint list exclusively.
#[derive(Debug, Clone)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    pub address_tag: AddressTag,
    pub delivery_constraints: Vec<DeliveryConstraint>,
    pub required_dispatch_consistency: DispatchConsistency,
}

impl TransportOperation {
    #[must_use]
    pub fn new(message: OutgoingMessage, address_tag: AddressTag) -> Self {
        Self {
            message,
            address_tag,
            delivery_constraints: Vec::new(),
            required_dispatch_consistency: DispatchConsistency::Default,
        }
    }

    #[must_use]
    pub fn with_constraints(mut self, constraints: impl IntoIterator<Item = DeliveryConstraint>) -> Self {
        self.delivery_constraints.extend(constraints);
        self
    }

    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.required_dispatch_consistency = DispatchConsistency::Isolated;
        self
    }

    /// The TTBR of this operation, if constrained.
    #[must_use]
    pub fn time_to_be_received(&self) -> Option<Duration> {
        self.delivery_constraints.iter().find_map(|c| match c {
            DeliveryConstraint::DiscardIfNotReceivedBefore(ttbr) => Some(*ttbr),
            _ => None,
        })
    }

    /// The earliest delivery time, if a delayed-delivery constraint is present.
    #[must_use]
    pub fn deliver_at(&self, now: SystemTime) -> Option<SystemTime> {
        self.delivery_constraints
            .iter()
            .find_map(|c| c.deliver_at(now))
    }
}

/// An ordered batch of operations dispatched together.
#[derive(Debug, Clone, Default)]
pub struct TransportOperations {
    operations: Vec<TransportOperation>,
}

impl TransportOperations {
    #[must_use]
    pub fn new(operations: Vec<TransportOperation>) -> Self {
        Self { operations }
    }

    pub fn push(&mut self, operation: TransportOperation) {
        self.operations.push(operation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TransportOperation> {
        self.operations.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<TransportOperation> {
        self.operations
    }
}

impl From<TransportOperation> for TransportOperations {
    fn from(operation: TransportOperation) -> Self {
        Self {
            operations: vec![operation],
        }
    }
}

impl FromIterator<TransportOperation> for TransportOperations {
    fn from_iter<I: IntoIterator<Item = TransportOperation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TransportOperations {
    type Item = TransportOperation;
    type IntoIter = std::vec::IntoIter<TransportOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.into_iter()
    }
}

/// Ambient transaction a dispatch may enlist in.
///
/// Transports stash their own transaction handle in the bag when a receive
/// starts; dispatchers look it up to decide whether to enlist or send directly.
#[derive(Debug, Clone)]
pub struct TransportTransaction {
    bag: Arc<Extensions>,
}

impl TransportTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bag: Extensions::root(),
        }
    }

    #[must_use]
    pub fn extensions(&self) -> &Arc<Extensions> {
        &self.bag
    }
}

impl Default for TransportTransaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    fn message() -> OutgoingMessage {
        OutgoingMessage::new(crate::message::new_message_id(), Headers::new(), Bytes::new())
    }

    #[test]
    fn constraints_are_not_shared_between_operations() {
        let mut first = TransportOperation::new(message(), AddressTag::unicast("destination"));
        let second = TransportOperation::new(message(), AddressTag::unicast("destination2"));

        first
            .delivery_constraints
            .push(DeliveryConstraint::DiscardIfNotReceivedBefore(Duration::from_secs(86_400)));

        assert!(second.delivery_constraints.is_empty());
        assert_eq!(first.delivery_constraints.len(), 1);
    }

    #[test]
    fn constraints_from_one_template_stay_independent() {
        let template = vec![DeliveryConstraint::DelayDeliveryWith(Duration::from_secs(5))];
        let mut first =
            TransportOperation::new(message(), AddressTag::unicast("a")).with_constraints(template.clone());
        let second =
            TransportOperation::new(message(), AddressTag::unicast("b")).with_constraints(template.clone());

        first
            .delivery_constraints
            .push(DeliveryConstraint::DiscardIfNotReceivedBefore(Duration::from_secs(1)));

        assert_eq!(second.delivery_constraints, template);
        assert_eq!(template.len(), 1);
        assert_eq!(first.delivery_constraints.len(), 2);
    }

    #[test]
    fn deliver_at_prefers_the_delay_constraint() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let op = TransportOperation::new(message(), AddressTag::unicast("q")).with_constraints([
            DeliveryConstraint::DiscardIfNotReceivedBefore(Duration::from_secs(30)),
            DeliveryConstraint::DelayDeliveryWith(Duration::from_secs(10)),
        ]);

        assert_eq!(op.deliver_at(now), Some(UNIX_EPOCH + Duration::from_secs(110)));
        assert_eq!(op.time_to_be_received(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn batch_preserves_order() {
        let batch: TransportOperations = ["a", "b", "c"]
            .into_iter()
            .map(|q| TransportOperation::new(message(), AddressTag::unicast(q)))
            .collect();

        let destinations: Vec<_> = batch
            .iter()
            .map(|op| match &op.address_tag {
                AddressTag::Unicast { destination } => destination.clone(),
                AddressTag::Multicast { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(destinations, vec!["a", "b", "c"]);
    }
}
