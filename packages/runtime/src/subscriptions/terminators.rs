//! Terminators of the subscribe and unsubscribe pipelines.
//!
//! Transports with native publish/subscribe get the native pair, which hands
//! the event type straight to the transport's [`SubscriptionManager`].
//! Everything else gets the message-driven pair: an empty-body control
//! message is sent to every known publisher of the event type, retried while
//! the publisher's queue does not exist yet.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::headers::{self, Headers};
use courier_core::transport::{
    AddressTag, Dispatcher, OutgoingMessage, SubscriptionManager, TransportOperation,
    TransportTransaction,
};
use courier_core::{new_message_id, MessageIntent, MessageType};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::SubscriptionRetrySettings;
use crate::error::{PipelineError, SubscriptionError};
use crate::pipeline::{SubscriptionContext, Terminator};
use crate::routing::PublisherTable;

// ---------------------------------------------------------------------------
// Native
// ---------------------------------------------------------------------------

/// Subscribes through the transport's native subscription manager.
pub struct NativeSubscribeTerminator {
    manager: Arc<dyn SubscriptionManager>,
}

impl NativeSubscribeTerminator {
    #[must_use]
    pub fn new(manager: Arc<dyn SubscriptionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Terminator<SubscriptionContext> for NativeSubscribeTerminator {
    async fn terminate(&self, context: &mut SubscriptionContext) -> Result<(), PipelineError> {
        debug!(event_type = %context.event_type, "subscribing natively");
        self.manager
            .subscribe(&context.event_type, &context.extensions)
            .await?;
        Ok(())
    }
}

/// Unsubscribes through the transport's native subscription manager.
pub struct NativeUnsubscribeTerminator {
    manager: Arc<dyn SubscriptionManager>,
}

impl NativeUnsubscribeTerminator {
    #[must_use]
    pub fn new(manager: Arc<dyn SubscriptionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Terminator<SubscriptionContext> for NativeUnsubscribeTerminator {
    async fn terminate(&self, context: &mut SubscriptionContext) -> Result<(), PipelineError> {
        debug!(event_type = %context.event_type, "unsubscribing natively");
        self.manager
            .unsubscribe(&context.event_type, &context.extensions)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message-driven
// ---------------------------------------------------------------------------

/// Shared machinery of the message-driven terminators.
struct ControlMessageSender {
    local_manager: Option<Arc<dyn SubscriptionManager>>,
    publishers: Arc<PublisherTable>,
    dispatcher: Arc<dyn Dispatcher>,
    subscriber_address: String,
    endpoint: String,
}

impl ControlMessageSender {
    fn control_message(&self, intent: MessageIntent, event_type: &MessageType) -> OutgoingMessage {
        let message_id = new_message_id();
        let mut message_headers = Headers::new();
        message_headers.insert(headers::MESSAGE_ID.into(), message_id.clone());
        message_headers.insert(headers::CONTROL_MESSAGE.into(), "true".into());
        message_headers.insert(headers::MESSAGE_INTENT.into(), intent.to_string());
        message_headers.insert(
            headers::SUBSCRIPTION_MESSAGE_TYPE.into(),
            event_type.as_str().to_string(),
        );
        message_headers.insert(headers::REPLY_TO_ADDRESS.into(), self.subscriber_address.clone());
        message_headers.insert(
            headers::SUBSCRIBER_TRANSPORT_ADDRESS.into(),
            self.subscriber_address.clone(),
        );
        message_headers.insert(headers::SUBSCRIBER_ENDPOINT.into(), self.endpoint.clone());
        message_headers.insert(
            headers::TIME_SENT.into(),
            headers::to_wire_time(SystemTime::now()),
        );
        message_headers.insert(headers::VERSION.into(), headers::PROTOCOL_VERSION.into());
        OutgoingMessage::new(message_id, message_headers, Bytes::new())
    }

    async fn run(
        &self,
        intent: MessageIntent,
        context: &SubscriptionContext,
    ) -> Result<(), PipelineError> {
        let event_type = &context.event_type;

        if let Some(manager) = &self.local_manager {
            match intent {
                MessageIntent::Unsubscribe => {
                    manager.unsubscribe(event_type, &context.extensions).await?;
                }
                _ => manager.subscribe(event_type, &context.extensions).await?,
            }
        }

        let publishers = self.publishers.addresses_for(event_type);
        if publishers.is_empty() {
            debug!(%event_type, %intent, "no publishers known, nothing to send");
            return Ok(());
        }

        let settings = context.extensions.get_or_create::<SubscriptionRetrySettings>();
        let transaction = context.extensions.get_or_create::<TransportTransaction>();

        let sends = publishers.into_iter().map(|publisher| {
            debug!(%event_type, %intent, publisher = %publisher, "sending subscription control message");
            let message = self.control_message(intent, event_type);
            self.send_with_retries(
                intent,
                publisher,
                message,
                event_type,
                *settings,
                &transaction,
                &context.cancellation,
            )
        });

        // Every send runs to completion; the first failure is reported.
        let mut first_failure = None;
        for result in join_all(sends).await {
            if let Err(err) = result {
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_with_retries(
        &self,
        intent: MessageIntent,
        destination: String,
        message: OutgoingMessage,
        event_type: &MessageType,
        settings: SubscriptionRetrySettings,
        transaction: &TransportTransaction,
        cancellation: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let action = if intent == MessageIntent::Unsubscribe {
            "unsubscribe"
        } else {
            "subscribe"
        };
        let mut retries = 0;
        loop {
            let operation =
                TransportOperation::new(message.clone(), AddressTag::unicast(destination.clone()));
            match self
                .dispatcher
                .dispatch(operation.into(), transaction, cancellation)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_queue_not_found() && retries < settings.max_retries => {
                    retries += 1;
                    warn!(
                        %event_type,
                        publisher = %destination,
                        attempt = retries,
                        max_retries = settings.max_retries,
                        "publisher queue not found, retrying {action}"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(settings.retry_delay) => {}
                        () = cancellation.cancelled() => return Err(PipelineError::Cancelled),
                    }
                }
                Err(err) if err.is_queue_not_found() => {
                    error!(
                        %event_type,
                        publisher = %destination,
                        error = %err,
                        "failed to {action} at publisher queue"
                    );
                    return Err(SubscriptionError::PublisherUnreachable {
                        action,
                        destination,
                        message_type: event_type.clone(),
                        source: err,
                    }
                    .into());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Subscribes by sending a control message to every known publisher.
pub struct MessageDrivenSubscribeTerminator {
    sender: ControlMessageSender,
}

impl MessageDrivenSubscribeTerminator {
    /// `subscriber_address` is the queue events should be delivered to.
    #[must_use]
    pub fn new(
        local_manager: Option<Arc<dyn SubscriptionManager>>,
        publishers: Arc<PublisherTable>,
        dispatcher: Arc<dyn Dispatcher>,
        subscriber_address: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            sender: ControlMessageSender {
                local_manager,
                publishers,
                dispatcher,
                subscriber_address: subscriber_address.into(),
                endpoint: endpoint.into(),
            },
        }
    }
}

#[async_trait]
impl Terminator<SubscriptionContext> for MessageDrivenSubscribeTerminator {
    async fn terminate(&self, context: &mut SubscriptionContext) -> Result<(), PipelineError> {
        self.sender.run(MessageIntent::Subscribe, context).await
    }
}

/// Unsubscribes locally (when a manager is present) and then at every known publisher.
///
/// Publishers are contacted concurrently. A publisher that stays unreachable
/// after all retries fails the call, but the sends to the other publishers
/// still complete.
pub struct MessageDrivenUnsubscribeTerminator {
    sender: ControlMessageSender,
}

impl MessageDrivenUnsubscribeTerminator {
    #[must_use]
    pub fn new(
        local_manager: Option<Arc<dyn SubscriptionManager>>,
        publishers: Arc<PublisherTable>,
        dispatcher: Arc<dyn Dispatcher>,
        subscriber_address: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            sender: ControlMessageSender {
                local_manager,
                publishers,
                dispatcher,
                subscriber_address: subscriber_address.into(),
                endpoint: endpoint.into(),
            },
        }
    }
}

#[async_trait]
impl Terminator<SubscriptionContext> for MessageDrivenUnsubscribeTerminator {
    async fn terminate(&self, context: &mut SubscriptionContext) -> Result<(), PipelineError> {
        self.sender.run(MessageIntent::Unsubscribe, context).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
