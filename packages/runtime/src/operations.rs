//! Entry points that turn application intents into pipeline invocations.
//!
//! Every operation creates a fresh child context under the caller's context,
//! copies what it needs out of the options value, and runs the matching
//! pipeline. Nothing is written back into the caller's context or options.

use std::sync::Arc;

use courier_core::headers::{self, Headers};
use courier_core::transport::{
    AddressTag, DeliveryConstraint, DispatchConsistency, Dispatcher, OutgoingMessage,
    TransportOperation,
};
use courier_core::{
    new_message_id, Extensions, Message, MessageIntent, MessageType, OutgoingLogicalMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::dispatch_operations;
use crate::error::{PipelineError, RoutingError};
use crate::options::{PublishOptions, ReplyOptions, SendOptions, SubscriptionOptions};
use crate::pipeline::contexts::IncomingMessageInfo;
use crate::pipeline::{OutgoingContext, Pipeline, SubscriptionContext};

/// The five pipelines behind the message operations.
pub struct MessagePipelines {
    pub send: Pipeline<OutgoingContext>,
    pub publish: Pipeline<OutgoingContext>,
    pub reply: Pipeline<OutgoingContext>,
    pub subscribe: Pipeline<SubscriptionContext>,
    pub unsubscribe: Pipeline<SubscriptionContext>,
}

/// Dispatch facade shared by sessions, handlers, and satellites.
///
/// Stored at the root of every context tree the endpoint creates, so any
/// context can reach it through its extensions.
pub struct MessageOperations {
    pipelines: MessagePipelines,
    dispatcher: Arc<dyn Dispatcher>,
    local_address: Option<String>,
}

impl MessageOperations {
    /// `local_address` is `None` for send-only endpoints.
    #[must_use]
    pub fn new(
        pipelines: MessagePipelines,
        dispatcher: Arc<dyn Dispatcher>,
        local_address: Option<String>,
    ) -> Self {
        Self {
            pipelines,
            dispatcher,
            local_address,
        }
    }

    #[must_use]
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    #[must_use]
    pub fn pipelines(&self) -> &MessagePipelines {
        &self.pipelines
    }

    fn outgoing_context(
        parent: &Arc<Extensions>,
        intent: MessageIntent,
        message: OutgoingLogicalMessage,
        message_id: Option<&str>,
        user_headers: &Headers,
        cancellation: &CancellationToken,
    ) -> OutgoingContext {
        let message_id = message_id.map_or_else(new_message_id, str::to_string);
        let mut message_headers = user_headers.clone();
        message_headers.insert(headers::MESSAGE_ID.into(), message_id.clone());
        OutgoingContext {
            extensions: Extensions::new_child(parent),
            cancellation: cancellation.clone(),
            intent,
            message_id,
            headers: message_headers,
            message,
            destination: None,
            delivery_constraints: Vec::new(),
            dispatch_consistency: DispatchConsistency::Default,
        }
    }

    fn consistency(immediate_dispatch: bool) -> DispatchConsistency {
        if immediate_dispatch {
            DispatchConsistency::Isolated
        } else {
            DispatchConsistency::Default
        }
    }

    // ---- Send ----

    /// Sends a command.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be serialized, no destination can be
    /// resolved, or the send pipeline fails.
    pub async fn send<T: Message>(
        &self,
        parent: &Arc<Extensions>,
        message: &T,
        options: &SendOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let logical = OutgoingLogicalMessage::new(message)?;
        self.send_logical(parent, logical, options, cancellation).await
    }

    /// Builds a `T` from its default value and sends it.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_with<T, F>(
        &self,
        parent: &Arc<Extensions>,
        build: F,
        options: &SendOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError>
    where
        T: Message + Default,
        F: FnOnce(&mut T) + Send,
    {
        let mut message = T::default();
        build(&mut message);
        self.send(parent, &message, options, cancellation).await
    }

    /// Sends an already serialized message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_logical(
        &self,
        parent: &Arc<Extensions>,
        message: OutgoingLogicalMessage,
        options: &SendOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let destination = if options.route_to_this_endpoint {
            Some(self.local_address.clone().ok_or(RoutingError::SendOnly)?)
        } else {
            options.destination.clone()
        };

        let mut context = Self::outgoing_context(
            parent,
            MessageIntent::Send,
            message,
            options.message_id.as_deref(),
            &options.headers,
            cancellation,
        );
        context.destination = destination;
        context.dispatch_consistency = Self::consistency(options.immediate_dispatch);
        if let Some(delay) = &options.delayed_delivery {
            context.add_delivery_constraint(delay.clone());
        }
        if let Some(ttbr) = options.time_to_be_received {
            context.add_delivery_constraint(DeliveryConstraint::DiscardIfNotReceivedBefore(ttbr));
        }

        self.pipelines.send.invoke(&mut context).await
    }

    // ---- Publish ----

    /// Publishes an event to every subscriber.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be serialized or the publish pipeline fails.
    pub async fn publish<T: Message>(
        &self,
        parent: &Arc<Extensions>,
        message: &T,
        options: &PublishOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let logical = OutgoingLogicalMessage::new(message)?;
        self.publish_logical(parent, logical, options, cancellation).await
    }

    /// Builds a `T` from its default value and publishes it.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_with<T, F>(
        &self,
        parent: &Arc<Extensions>,
        build: F,
        options: &PublishOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError>
    where
        T: Message + Default,
        F: FnOnce(&mut T) + Send,
    {
        let mut message = T::default();
        build(&mut message);
        self.publish(parent, &message, options, cancellation).await
    }

    /// Publishes an already serialized event.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn publish_logical(
        &self,
        parent: &Arc<Extensions>,
        message: OutgoingLogicalMessage,
        options: &PublishOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut context = Self::outgoing_context(
            parent,
            MessageIntent::Publish,
            message,
            options.message_id.as_deref(),
            &options.headers,
            cancellation,
        );
        context.dispatch_consistency = Self::consistency(options.immediate_dispatch);
        if let Some(ttbr) = options.time_to_be_received {
            context.add_delivery_constraint(DeliveryConstraint::DiscardIfNotReceivedBefore(ttbr));
        }

        self.pipelines.publish.invoke(&mut context).await
    }

    // ---- Reply ----

    /// Replies to the message currently being processed.
    ///
    /// # Errors
    ///
    /// Fails with [`RoutingError::NoReplyAddress`] when neither the options
    /// nor the incoming message name a reply destination.
    pub async fn reply<T: Message>(
        &self,
        parent: &Arc<Extensions>,
        message: &T,
        options: &ReplyOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let logical = OutgoingLogicalMessage::new(message)?;
        let mut context = Self::outgoing_context(
            parent,
            MessageIntent::Reply,
            logical,
            options.message_id.as_deref(),
            &options.headers,
            cancellation,
        );
        context.destination = options.destination.clone();
        context.dispatch_consistency = Self::consistency(options.immediate_dispatch);

        self.pipelines.reply.invoke(&mut context).await
    }

    /// Builds a `T` from its default value and replies with it.
    ///
    /// # Errors
    ///
    /// See [`reply`](Self::reply).
    pub async fn reply_with<T, F>(
        &self,
        parent: &Arc<Extensions>,
        build: F,
        options: &ReplyOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError>
    where
        T: Message + Default,
        F: FnOnce(&mut T) + Send,
    {
        let mut message = T::default();
        build(&mut message);
        self.reply(parent, &message, options, cancellation).await
    }

    // ---- Subscriptions ----

    /// Subscribes this endpoint to `event_type`.
    ///
    /// # Errors
    ///
    /// Propagates failures of the subscribe pipeline.
    pub async fn subscribe(
        &self,
        parent: &Arc<Extensions>,
        event_type: MessageType,
        options: &SubscriptionOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut context = Self::subscription_context(parent, event_type, options, cancellation);
        self.pipelines.subscribe.invoke(&mut context).await
    }

    /// Unsubscribes this endpoint from `event_type`.
    ///
    /// # Errors
    ///
    /// Propagates failures of the unsubscribe pipeline.
    pub async fn unsubscribe(
        &self,
        parent: &Arc<Extensions>,
        event_type: MessageType,
        options: &SubscriptionOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut context = Self::subscription_context(parent, event_type, options, cancellation);
        self.pipelines.unsubscribe.invoke(&mut context).await
    }

    fn subscription_context(
        parent: &Arc<Extensions>,
        event_type: MessageType,
        options: &SubscriptionOptions,
        cancellation: &CancellationToken,
    ) -> SubscriptionContext {
        let extensions = Extensions::new_child(parent);
        if let Some(retry) = options.retry {
            extensions.set(retry);
        }
        SubscriptionContext {
            extensions,
            cancellation: cancellation.clone(),
            event_type,
        }
    }

    // ---- Forwarding ----

    /// Sends the incoming physical message, unchanged, to `destination`.
    ///
    /// # Errors
    ///
    /// Fails with [`PipelineError::Context`] when called outside of message
    /// processing, or with the dispatcher's error.
    pub async fn forward_current_message_to(
        &self,
        parent: &Arc<Extensions>,
        destination: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let info = parent.get::<IncomingMessageInfo>()?;
        debug!(
            message_id = %info.message.message_id,
            destination,
            "forwarding incoming message"
        );
        let operation = TransportOperation::new(
            OutgoingMessage::new(
                info.message.message_id.clone(),
                info.message.headers.clone(),
                info.message.body.clone(),
            ),
            AddressTag::unicast(destination),
        );
        dispatch_operations(parent, self.dispatcher.as_ref(), vec![operation], cancellation).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_core::transport::{IncomingMessage, TransportCapabilities, TransportTransactionMode};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::dispatch::testing::RecordingDispatcher;
    use crate::pipeline::Terminator;
    use crate::routing::{PublishRouting, RoutingTerminator, UnicastRoutingTable};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct PlaceOrder {
        id: u32,
    }
    impl Message for PlaceOrder {}

    struct Noop;

    #[async_trait]
    impl Terminator<SubscriptionContext> for Noop {
        async fn terminate(&self, _context: &mut SubscriptionContext) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn capabilities() -> TransportCapabilities {
        TransportCapabilities {
            transaction_modes: vec![TransportTransactionMode::ReceiveOnly],
            supports_delayed_delivery: true,
            supports_ttbr: true,
            supports_native_pubsub: true,
        }
    }

    fn operations(
        dispatcher: &Arc<RecordingDispatcher>,
        local_address: Option<&str>,
    ) -> MessageOperations {
        let routes = Arc::new(UnicastRoutingTable::new());
        routes.route::<PlaceOrder>("sales");
        let terminator = Arc::new(RoutingTerminator::new(
            dispatcher.clone(),
            capabilities(),
            routes,
            PublishRouting::Native,
        ));
        MessageOperations::new(
            MessagePipelines {
                send: Pipeline::builder("send").terminate_with_shared(terminator.clone()),
                publish: Pipeline::builder("publish").terminate_with_shared(terminator.clone()),
                reply: Pipeline::builder("reply").terminate_with_shared(terminator),
                subscribe: Pipeline::builder("subscribe").terminate_with(Noop),
                unsubscribe: Pipeline::builder("unsubscribe").terminate_with(Noop),
            },
            dispatcher.clone(),
            local_address.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn reused_options_never_accumulate_constraints() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let ops = operations(&dispatcher, None);
        let root = Extensions::root();
        let options = SendOptions::new().delay_delivery_with(Duration::from_secs(5));

        for id in 0..2 {
            ops.send(&root, &PlaceOrder { id }, &options, &CancellationToken::new())
                .await
                .unwrap();
        }

        let batches = dispatcher.batches();
        assert_eq!(batches.len(), 2);
        for batch in batches {
            assert_eq!(
                batch[0].delivery_constraints,
                vec![DeliveryConstraint::DelayDeliveryWith(Duration::from_secs(5))]
            );
        }
        assert!(options.headers.is_empty());
    }

    #[tokio::test]
    async fn message_id_comes_from_options_or_is_generated() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let ops = operations(&dispatcher, None);
        let root = Extensions::root();
        let token = CancellationToken::new();

        ops.send(
            &root,
            &PlaceOrder { id: 1 },
            &SendOptions::new().with_message_id("fixed").with_header("Tenant", "a"),
            &token,
        )
        .await
        .unwrap();
        ops.send_with(&root, |m: &mut PlaceOrder| m.id = 2, &SendOptions::new(), &token)
            .await
            .unwrap();

        let batches = dispatcher.batches();
        let first = &batches[0][0].message;
        assert_eq!(first.message_id, "fixed");
        assert_eq!(first.headers[headers::MESSAGE_ID], "fixed");
        assert_eq!(first.headers["Tenant"], "a");
        let second = &batches[1][0].message;
        assert_ne!(second.message_id, "fixed");
        assert_eq!(second.headers[headers::MESSAGE_ID], second.message_id);
        assert_eq!(&second.body[..], br#"{"id":2}"#);
    }

    #[tokio::test]
    async fn route_to_this_endpoint_requires_a_local_address() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let token = CancellationToken::new();
        let options = SendOptions::new().route_to_this_endpoint();

        let err = operations(&dispatcher, None)
            .send(&Extensions::root(), &PlaceOrder::default(), &options, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Routing(RoutingError::SendOnly)));

        operations(&dispatcher, Some("orders"))
            .send(&Extensions::root(), &PlaceOrder::default(), &options, &token)
            .await
            .unwrap();
        assert_eq!(dispatcher.destinations(), vec!["orders"]);
    }

    #[tokio::test]
    async fn reply_goes_to_the_incoming_reply_address() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let ops = operations(&dispatcher, Some("sales"));
        let root = Extensions::root();
        let token = CancellationToken::new();

        let err = ops
            .reply(&root, &PlaceOrder::default(), &ReplyOptions::new(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Routing(RoutingError::NoReplyAddress)));

        root.set(IncomingMessageInfo {
            message: IncomingMessage {
                message_id: "in-1".into(),
                headers: Headers::new(),
                body: Bytes::new(),
            },
            reply_to_address: Some("client".into()),
        });
        ops.reply(&root, &PlaceOrder::default(), &ReplyOptions::new(), &token)
            .await
            .unwrap();
        ops.reply(&root, &PlaceOrder::default(), &ReplyOptions::new().to("audit"), &token)
            .await
            .unwrap();
        assert_eq!(dispatcher.destinations(), vec!["client", "audit"]);
    }

    #[tokio::test]
    async fn forward_sends_the_unchanged_physical_message() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let ops = operations(&dispatcher, Some("sales"));
        let root = Extensions::root();
        let mut incoming_headers = Headers::new();
        incoming_headers.insert("Custom".into(), "kept".into());
        root.set(IncomingMessageInfo {
            message: IncomingMessage {
                message_id: "in-9".into(),
                headers: incoming_headers,
                body: Bytes::from_static(b"{}"),
            },
            reply_to_address: None,
        });

        ops.forward_current_message_to(&root, "audit", &CancellationToken::new())
            .await
            .unwrap();

        let batches = dispatcher.batches();
        let forwarded = &batches[0][0];
        assert_eq!(forwarded.address_tag, AddressTag::unicast("audit"));
        assert_eq!(forwarded.message.message_id, "in-9");
        assert_eq!(forwarded.message.headers["Custom"], "kept");
        assert_eq!(&forwarded.message.body[..], b"{}");
    }

    #[tokio::test]
    async fn forward_outside_processing_fails() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let err = operations(&dispatcher, None)
            .forward_current_message_to(&Extensions::root(), "audit", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Context(_)));
    }
}
