//! Processor behind the endpoint's main input queue.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use courier_core::transport::{
    Dispatcher, ErrorContext, ErrorHandleResult, MessageContext, MessageProcessor,
};
use courier_core::Extensions;
use tracing::{info_span, Instrument};

use super::recoverability::{handle_failure, RecoverabilityPolicy};
use super::{dispatch_pending, prepare_root};
use crate::operations::MessageOperations;
use crate::pipeline::{IncomingContext, Pipeline};

/// Runs every delivery of the main queue through the incoming pipeline.
///
/// Operations started by handlers are collected while the pipeline runs and
/// dispatched in the receive transaction once it completed successfully, so
/// a failed delivery never leaks outgoing messages.
pub struct MainPipelineExecutor {
    pipeline: Arc<Pipeline<IncomingContext>>,
    operations: Arc<MessageOperations>,
    dispatcher: Arc<dyn Dispatcher>,
    recoverability: Arc<dyn RecoverabilityPolicy>,
}

impl MainPipelineExecutor {
    #[must_use]
    pub fn new(
        pipeline: Arc<Pipeline<IncomingContext>>,
        operations: Arc<MessageOperations>,
        dispatcher: Arc<dyn Dispatcher>,
        recoverability: Arc<dyn RecoverabilityPolicy>,
    ) -> Self {
        Self {
            pipeline,
            operations,
            dispatcher,
            recoverability,
        }
    }
}

#[async_trait]
impl MessageProcessor for MainPipelineExecutor {
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()> {
        let MessageContext {
            message,
            transport_transaction,
            extensions: root,
            cancellation,
        } = context;

        let span = info_span!(
            "receive",
            message_id = %message.message_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let start = Instant::now();

        let result = async {
            prepare_root(&root, &self.operations, &message, &transport_transaction);
            let mut incoming = IncomingContext {
                extensions: Extensions::new_child(&root),
                cancellation: cancellation.clone(),
                message,
                logical_message: None,
            };
            self.pipeline.invoke(&mut incoming).await?;
            dispatch_pending(
                &root,
                self.dispatcher.as_ref(),
                &transport_transaction,
                &cancellation,
            )
            .await
        }
        .instrument(span.clone())
        .await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        span.record("duration_ms", duration_ms);
        span.record("outcome", if result.is_ok() { "ok" } else { "error" });
        result.map_err(anyhow::Error::from)
    }

    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult> {
        handle_failure(self.recoverability.as_ref(), self.dispatcher.as_ref(), context).await
    }
}
