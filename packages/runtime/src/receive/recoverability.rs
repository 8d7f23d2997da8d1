//! Decides what happens to a delivery whose processing failed.

use courier_core::headers::{self, Headers};
use courier_core::transport::{
    AddressTag, Dispatcher, ErrorContext, ErrorHandleResult, OutgoingMessage, TransportOperation,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::PipelineError;

/// Outcome of classifying a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverabilityAction {
    /// Process the same delivery again right away.
    ImmediateRetry,
    /// Give up and move the message to `error_queue`.
    MoveToError { error_queue: String },
    /// Give up and drop the message.
    Discard { reason: String },
}

/// Classifies failed deliveries.
pub trait RecoverabilityPolicy: Send + Sync {
    fn classify(&self, context: &ErrorContext) -> RecoverabilityAction;
}

/// Retries a fixed number of times, then moves the message to the error queue.
///
/// Failures that no retry can fix (a body that does not deserialize, a
/// missing type header) skip the retries.
#[derive(Debug, Clone)]
pub struct DefaultRecoverabilityPolicy {
    /// Retries after the first failed attempt.
    pub immediate_retries: u32,
    pub error_queue: String,
}

impl DefaultRecoverabilityPolicy {
    #[must_use]
    pub fn new(immediate_retries: u32, error_queue: impl Into<String>) -> Self {
        Self {
            immediate_retries,
            error_queue: error_queue.into(),
        }
    }
}

impl RecoverabilityPolicy for DefaultRecoverabilityPolicy {
    fn classify(&self, context: &ErrorContext) -> RecoverabilityAction {
        let unrecoverable = matches!(
            context.error.downcast_ref::<PipelineError>(),
            Some(PipelineError::Serialization(_) | PipelineError::MissingHeader { .. })
        );
        if !unrecoverable && context.immediate_processing_failures <= self.immediate_retries {
            return RecoverabilityAction::ImmediateRetry;
        }
        RecoverabilityAction::MoveToError {
            error_queue: self.error_queue.clone(),
        }
    }
}

/// Applies `policy` to a failed delivery.
///
/// # Errors
///
/// Fails if the message cannot be moved to the error queue; the pump then
/// keeps the delivery and retries it.
pub(crate) async fn handle_failure(
    policy: &dyn RecoverabilityPolicy,
    dispatcher: &dyn Dispatcher,
    context: ErrorContext,
) -> anyhow::Result<ErrorHandleResult> {
    let message_id = context.message.message_id.clone();
    match policy.classify(&context) {
        RecoverabilityAction::ImmediateRetry => {
            warn!(
                %message_id,
                attempt = context.immediate_processing_failures,
                error = %context.error,
                "message processing failed, retrying immediately"
            );
            Ok(ErrorHandleResult::RetryRequired)
        }
        RecoverabilityAction::MoveToError { error_queue } => {
            error!(
                %message_id,
                attempts = context.immediate_processing_failures,
                error_queue = %error_queue,
                error = %context.error,
                "moving message to the error queue"
            );
            let operation =
                TransportOperation::new(failed_message(&context), AddressTag::unicast(error_queue));
            dispatcher
                .dispatch(
                    operation.into(),
                    &context.transport_transaction,
                    &CancellationToken::new(),
                )
                .await?;
            Ok(ErrorHandleResult::Handled)
        }
        RecoverabilityAction::Discard { reason } => {
            warn!(%message_id, %reason, "discarding failed message");
            Ok(ErrorHandleResult::Handled)
        }
    }
}

fn failed_message(context: &ErrorContext) -> OutgoingMessage {
    let mut failed_headers: Headers = context.message.headers.clone();
    failed_headers.insert(headers::FAILED_QUEUE.into(), context.receive_address.clone());
    failed_headers.insert(headers::EXCEPTION_MESSAGE.into(), format!("{:#}", context.error));
    failed_headers.insert(
        headers::PROCESSING_ATTEMPTS.into(),
        context.immediate_processing_failures.to_string(),
    );
    OutgoingMessage::new(
        context.message.message_id.clone(),
        failed_headers,
        context.message.body.clone(),
    )
}
