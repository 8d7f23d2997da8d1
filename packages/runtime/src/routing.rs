//! Routing tables and the outgoing terminator that turns a logical message
//! into physical transport operations.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::transport::{
    AddressTag, DeliveryConstraint, Dispatcher, OutgoingMessage, TransportCapabilities,
    TransportOperation,
};
use courier_core::{Message, MessageIntent, MessageType};
use dashmap::DashMap;
use tracing::debug;

use crate::dispatch::dispatch_operations;
use crate::error::{PipelineError, RoutingError, SubscriptionError};
use crate::pipeline::contexts::{IncomingMessageInfo, OutgoingContext};
use crate::pipeline::Terminator;
use crate::subscriptions::SubscriptionStorage;

// ---------------------------------------------------------------------------
// UnicastRoutingTable
// ---------------------------------------------------------------------------

/// Maps command types to the queue that owns them.
#[derive(Debug, Default)]
pub struct UnicastRoutingTable {
    routes: DashMap<MessageType, String>,
}

impl UnicastRoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages of type `T` to `destination`.
    pub fn route<T: Message>(&self, destination: impl Into<String>) {
        self.route_type(MessageType::of::<T>(), destination);
    }

    pub fn route_type(&self, message_type: MessageType, destination: impl Into<String>) {
        self.routes.insert(message_type, destination.into());
    }

    #[must_use]
    pub fn destination_for(&self, message_type: &MessageType) -> Option<String> {
        self.routes.get(message_type).map(|entry| entry.value().clone())
    }
}

// ---------------------------------------------------------------------------
// PublisherTable
// ---------------------------------------------------------------------------

/// Known publisher queues per event type, used by message-driven subscriptions.
#[derive(Debug, Default)]
pub struct PublisherTable {
    publishers: DashMap<MessageType, BTreeSet<String>>,
}

impl PublisherTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` as a publisher of events of type `T`.
    pub fn register<T: Message>(&self, address: impl Into<String>) {
        self.register_type(MessageType::of::<T>(), address);
    }

    pub fn register_type(&self, event_type: MessageType, address: impl Into<String>) {
        self.publishers
            .entry(event_type)
            .or_default()
            .insert(address.into());
    }

    /// Publisher addresses for `event_type`, in a stable order.
    #[must_use]
    pub fn addresses_for(&self, event_type: &MessageType) -> Vec<String> {
        self.publishers
            .get(event_type)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// RoutingTerminator
// ---------------------------------------------------------------------------

/// How publish operations find their audience.
#[derive(Clone)]
pub enum PublishRouting {
    /// The transport fans out by event type.
    Native,
    /// One unicast operation per subscriber found in storage.
    MessageDriven(Arc<dyn SubscriptionStorage>),
}

/// Terminates the send, publish, and reply pipelines.
///
/// Resolves address tags for the operation's intent, checks delivery
/// constraints against the transport's capabilities, serializes the body
/// once, and builds one transport operation per tag. Each operation gets
/// its own copy of the headers and constraints.
pub struct RoutingTerminator {
    dispatcher: Arc<dyn Dispatcher>,
    capabilities: TransportCapabilities,
    unicast: Arc<UnicastRoutingTable>,
    publish: PublishRouting,
}

impl RoutingTerminator {
    #[must_use]
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        capabilities: TransportCapabilities,
        unicast: Arc<UnicastRoutingTable>,
        publish: PublishRouting,
    ) -> Self {
        Self {
            dispatcher,
            capabilities,
            unicast,
            publish,
        }
    }

    async fn address_tags(&self, context: &OutgoingContext) -> Result<Vec<AddressTag>, PipelineError> {
        let message_type = &context.message.message_type;
        match context.intent {
            MessageIntent::Publish => match &self.publish {
                PublishRouting::Native => Ok(vec![AddressTag::Multicast {
                    message_type: message_type.clone(),
                }]),
                PublishRouting::MessageDriven(storage) => {
                    let subscribers = storage
                        .subscribers_for(message_type)
                        .await
                        .map_err(SubscriptionError::Storage)?;
                    let addresses: BTreeSet<String> =
                        subscribers.into_iter().map(|s| s.transport_address).collect();
                    Ok(addresses.into_iter().map(AddressTag::unicast).collect())
                }
            },
            MessageIntent::Reply => {
                let destination = match &context.destination {
                    Some(destination) => destination.clone(),
                    None => context
                        .extensions
                        .try_get::<IncomingMessageInfo>()
                        .and_then(|info| info.reply_to_address.clone())
                        .ok_or(RoutingError::NoReplyAddress)?,
                };
                Ok(vec![AddressTag::unicast(destination)])
            }
            MessageIntent::Send | MessageIntent::Subscribe | MessageIntent::Unsubscribe => {
                let destination = context
                    .destination
                    .clone()
                    .or_else(|| self.unicast.destination_for(message_type))
                    .ok_or_else(|| RoutingError::NoDestination {
                        message_type: message_type.clone(),
                    })?;
                Ok(vec![AddressTag::unicast(destination)])
            }
        }
    }

    fn check_constraints(&self, constraints: &[DeliveryConstraint]) -> Result<(), RoutingError> {
        for constraint in constraints {
            let supported = match constraint {
                DeliveryConstraint::DiscardIfNotReceivedBefore(_) => self.capabilities.supports_ttbr,
                DeliveryConstraint::DelayDeliveryWith(_)
                | DeliveryConstraint::DoNotDeliverBefore(_) => {
                    self.capabilities.supports_delayed_delivery
                }
            };
            if !supported {
                return Err(RoutingError::UnsupportedConstraint {
                    constraint: constraint.name(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Terminator<OutgoingContext> for RoutingTerminator {
    async fn terminate(&self, context: &mut OutgoingContext) -> Result<(), PipelineError> {
        self.check_constraints(&context.delivery_constraints)?;
        let tags = self.address_tags(context).await?;

        if tags.is_empty() {
            debug!(
                message_type = %context.message.message_type,
                message_id = %context.message_id,
                "no subscribers, nothing to dispatch"
            );
            return Ok(());
        }

        let body = Bytes::from(serde_json::to_vec(&context.message.instance)?);
        let operations: Vec<TransportOperation> = tags
            .into_iter()
            .map(|tag| TransportOperation {
                message: OutgoingMessage::new(
                    context.message_id.clone(),
                    context.headers.clone(),
                    body.clone(),
                ),
                address_tag: tag,
                delivery_constraints: context.delivery_constraints.clone(),
                required_dispatch_consistency: context.dispatch_consistency,
            })
            .collect();

        debug!(
            intent = %context.intent,
            message_type = %context.message.message_type,
            message_id = %context.message_id,
            operations = operations.len(),
            "routing outgoing message"
        );

        dispatch_operations(
            &context.extensions,
            self.dispatcher.as_ref(),
            operations,
            &context.cancellation,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
