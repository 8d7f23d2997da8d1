//! Publisher-side handling of subscription control messages.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::headers;
use courier_core::{MessageIntent, MessageType};
use tracing::info;

use super::storage::{Subscriber, SubscriptionStorage};
use crate::error::{PipelineError, SubscriptionError};
use crate::pipeline::{Behavior, IncomingContext, Next};

/// Records subscribe/unsubscribe requests in [`SubscriptionStorage`].
///
/// Control messages end here; every other message continues down the
/// incoming pipeline untouched.
pub struct SubscriptionReceiverBehavior {
    storage: Arc<dyn SubscriptionStorage>,
}

impl SubscriptionReceiverBehavior {
    #[must_use]
    pub fn new(storage: Arc<dyn SubscriptionStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Behavior<IncomingContext> for SubscriptionReceiverBehavior {
    async fn invoke(
        &self,
        context: &mut IncomingContext,
        next: Next<'_, IncomingContext>,
    ) -> Result<(), PipelineError> {
        let intent = context
            .header(headers::MESSAGE_INTENT)
            .and_then(|value| value.parse::<MessageIntent>().ok());
        if !matches!(intent, Some(MessageIntent::Subscribe | MessageIntent::Unsubscribe)) {
            return next.run(context).await;
        }

        let event_type = context
            .header(headers::SUBSCRIPTION_MESSAGE_TYPE)
            .map(MessageType::new)
            .ok_or(PipelineError::MissingHeader {
                header: headers::SUBSCRIPTION_MESSAGE_TYPE,
            })?;
        let address = context
            .header(headers::SUBSCRIBER_TRANSPORT_ADDRESS)
            .or_else(|| context.header(headers::REPLY_TO_ADDRESS))
            .ok_or(PipelineError::MissingHeader {
                header: headers::SUBSCRIBER_TRANSPORT_ADDRESS,
            })?;
        let subscriber = Subscriber::new(
            address,
            context.header(headers::SUBSCRIBER_ENDPOINT).map(str::to_string),
        );

        if intent == Some(MessageIntent::Subscribe) {
            info!(%event_type, subscriber = %subscriber.transport_address, "adding subscriber");
            self.storage
                .subscribe(subscriber, &event_type)
                .await
                .map_err(SubscriptionError::Storage)?;
        } else {
            info!(%event_type, subscriber = %subscriber.transport_address, "removing subscriber");
            self.storage
                .unsubscribe(&subscriber, &event_type)
                .await
                .map_err(SubscriptionError::Storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use courier_core::transport::IncomingMessage;
    use courier_core::{Extensions, Headers};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pipeline::{Pipeline, Terminator};
    use crate::subscriptions::InMemorySubscriptionStorage;

    struct MustNotRun;

    #[async_trait]
    impl Terminator<IncomingContext> for MustNotRun {
        async fn terminate(&self, _context: &mut IncomingContext) -> Result<(), PipelineError> {
            Err(PipelineError::Handler(anyhow::anyhow!("control message reached handlers")))
        }
    }

    fn incoming(pairs: &[(&str, &str)]) -> IncomingContext {
        let headers: Headers = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        IncomingContext {
            extensions: Extensions::root(),
            cancellation: CancellationToken::new(),
            message: IncomingMessage {
                message_id: "1".into(),
                headers,
                body: Bytes::new(),
            },
            logical_message: None,
        }
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_updates_storage_and_short_circuits() {
        let storage = Arc::new(InMemorySubscriptionStorage::new());
        let pipeline = Pipeline::builder("incoming")
            .register(SubscriptionReceiverBehavior::new(storage.clone()))
            .terminate_with(MustNotRun);
        let event = MessageType::new("OrderPlaced");

        let mut subscribe = incoming(&[
            (headers::MESSAGE_INTENT, "Subscribe"),
            (headers::SUBSCRIPTION_MESSAGE_TYPE, "OrderPlaced"),
            (headers::SUBSCRIBER_TRANSPORT_ADDRESS, "billing"),
            (headers::SUBSCRIBER_ENDPOINT, "Billing"),
        ]);
        pipeline.invoke(&mut subscribe).await.unwrap();
        assert_eq!(
            storage.subscribers_for(&event).await.unwrap(),
            vec![Subscriber::new("billing", Some("Billing".into()))]
        );

        let mut unsubscribe = incoming(&[
            (headers::MESSAGE_INTENT, "Unsubscribe"),
            (headers::SUBSCRIPTION_MESSAGE_TYPE, "OrderPlaced"),
            (headers::REPLY_TO_ADDRESS, "billing"),
        ]);
        pipeline.invoke(&mut unsubscribe).await.unwrap();
        assert!(storage.subscribers_for(&event).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ordinary_messages_continue_down_the_pipeline() {
        let storage = Arc::new(InMemorySubscriptionStorage::new());
        let pipeline = Pipeline::builder("incoming")
            .register(SubscriptionReceiverBehavior::new(storage))
            .terminate_with(MustNotRun);

        let mut ctx = incoming(&[(headers::MESSAGE_INTENT, "Send")]);
        let err = pipeline.invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Handler(_)));
    }

    #[tokio::test]
    async fn control_message_without_event_type_is_rejected() {
        let storage = Arc::new(InMemorySubscriptionStorage::new());
        let pipeline = Pipeline::builder("incoming")
            .register(SubscriptionReceiverBehavior::new(storage))
            .terminate_with(MustNotRun);

        let mut ctx = incoming(&[(headers::MESSAGE_INTENT, "Subscribe")]);
        let err = pipeline.invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingHeader {
                header: headers::SUBSCRIPTION_MESSAGE_TYPE
            }
        ));
    }
}
