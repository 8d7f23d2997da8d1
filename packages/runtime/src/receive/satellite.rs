//! Satellites: extra receivers with their own queue and handler, outside
//! the main incoming pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::transport::{
    Dispatcher, ErrorContext, ErrorHandleResult, IncomingMessage, MessageContext,
    MessageProcessor, PushRuntimeSettings,
};
use courier_core::Extensions;
use tracing::debug;

use super::recoverability::{handle_failure, RecoverabilityPolicy};
use super::{dispatch_pending, prepare_root};
use crate::operations::MessageOperations;
use crate::session::HandlerContext;

/// Processes raw deliveries of a satellite queue.
#[async_trait]
pub trait SatelliteHandler: Send + Sync {
    /// # Errors
    ///
    /// Any error hands the delivery to the satellite's recoverability policy.
    async fn handle(&self, message: &IncomingMessage, context: &HandlerContext) -> anyhow::Result<()>;
}

/// A satellite receiver registered with the endpoint.
#[derive(Clone)]
pub struct SatelliteDefinition {
    pub name: String,
    /// Logical queue name; mapped through the transport on start.
    pub queue: String,
    pub runtime_settings: PushRuntimeSettings,
    pub recoverability: Arc<dyn RecoverabilityPolicy>,
    pub handler: Arc<dyn SatelliteHandler>,
}

/// Connects a satellite pump to its handler.
pub struct SatellitePipelineExecutor {
    handler: Arc<dyn SatelliteHandler>,
    operations: Arc<MessageOperations>,
    dispatcher: Arc<dyn Dispatcher>,
    recoverability: Arc<dyn RecoverabilityPolicy>,
}

impl SatellitePipelineExecutor {
    #[must_use]
    pub fn new(
        definition: &SatelliteDefinition,
        operations: Arc<MessageOperations>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            handler: Arc::clone(&definition.handler),
            operations,
            dispatcher,
            recoverability: Arc::clone(&definition.recoverability),
        }
    }
}

#[async_trait]
impl MessageProcessor for SatellitePipelineExecutor {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()> {
        let root = &context.extensions;
        prepare_root(
            root,
            &self.operations,
            &context.message,
            &context.transport_transaction,
        );
        let handler_context = HandlerContext::new(
            Extensions::new_child(root),
            context.cancellation.clone(),
            context.message.message_id.clone(),
            context.message.headers.clone(),
            context
                .message
                .headers
                .get(courier_core::headers::REPLY_TO_ADDRESS)
                .cloned(),
        );
        debug!(message_id = %context.message.message_id, "invoking satellite");
        self.handler.handle(&context.message, &handler_context).await?;
        dispatch_pending(
            root,
            self.dispatcher.as_ref(),
            &context.transport_transaction,
            &context.cancellation,
        )
        .await?;
        Ok(())
    }

    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        handle_failure(self.recoverability.as_ref(), self.dispatcher.as_ref(), context).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use courier_core::transport::{TransportCapabilities, TransportTransaction};
    use courier_core::Headers;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::dispatch::testing::RecordingDispatcher;
    use crate::error::PipelineError;
    use crate::operations::MessagePipelines;
    use crate::pipeline::{Pipeline, SubscriptionContext, Terminator};
    use crate::receive::DefaultRecoverabilityPolicy;
    use crate::routing::{PublishRouting, RoutingTerminator, UnicastRoutingTable};

    struct Forward;

    #[async_trait]
    impl SatelliteHandler for Forward {
        async fn handle(&self, _message: &IncomingMessage, context: &HandlerContext) -> anyhow::Result<()> {
            context.forward_current_message_to("audit").await?;
            Ok(())
        }
    }

    struct Noop;

    #[async_trait]
    impl Terminator<SubscriptionContext> for Noop {
        async fn terminate(&self, _context: &mut SubscriptionContext) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn satellite_forwards_are_dispatched_after_the_handler() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let routing = Arc::new(RoutingTerminator::new(
            dispatcher.clone(),
            TransportCapabilities {
                transaction_modes: Vec::new(),
                supports_delayed_delivery: false,
                supports_ttbr: false,
                supports_native_pubsub: false,
            },
            Arc::new(UnicastRoutingTable::new()),
            PublishRouting::Native,
        ));
        let operations = Arc::new(MessageOperations::new(
            MessagePipelines {
                send: Pipeline::builder("send").terminate_with_shared(routing.clone()),
                publish: Pipeline::builder("publish").terminate_with_shared(routing.clone()),
                reply: Pipeline::builder("reply").terminate_with_shared(routing),
                subscribe: Pipeline::builder("subscribe").terminate_with(Noop),
                unsubscribe: Pipeline::builder("unsubscribe").terminate_with(Noop),
            },
            dispatcher.clone(),
            None,
        ));
        let definition = SatelliteDefinition {
            name: "audit-forwarder".into(),
            queue: "sales.satellite".into(),
            runtime_settings: PushRuntimeSettings::new(1),
            recoverability: Arc::new(DefaultRecoverabilityPolicy::new(0, "error")),
            handler: Arc::new(Forward),
        };
        let executor = SatellitePipelineExecutor::new(&definition, operations, dispatcher.clone());

        executor
            .on_message(MessageContext {
                message: IncomingMessage {
                    message_id: "s-1".into(),
                    headers: Headers::new(),
                    body: Bytes::from_static(b"raw"),
                },
                transport_transaction: TransportTransaction::new(),
                extensions: Extensions::root(),
                cancellation: CancellationToken::new(),
            })
            .await
            .unwrap();

        assert_eq!(dispatcher.destinations(), vec!["audit"]);
        assert_eq!(&dispatcher.batches()[0][0].message.body[..], b"raw");
    }
}
