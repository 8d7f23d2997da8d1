//! Contexts application code holds: the endpoint-level session and the
//! per-message handler context. Both reach the message operations through
//! the [`MessageOps`] facade.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Extensions, Headers, Message, MessageType, OutgoingLogicalMessage};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::operations::MessageOperations;
use crate::options::{PublishOptions, ReplyOptions, SendOptions, SubscriptionOptions};
use crate::pipeline::PipelineContext;

// ---------------------------------------------------------------------------
// MessageOps
// ---------------------------------------------------------------------------

/// Message operations available on every context.
///
/// Each call resolves [`MessageOperations`] from the context tree and runs
/// the operation in a child of this context, under this context's token.
#[async_trait]
pub trait MessageOps: PipelineContext + Sync {
    /// # Errors
    ///
    /// Fails with [`PipelineError::Context`] outside an endpoint, otherwise as
    /// [`MessageOperations::send`].
    async fn send<T: Message>(&self, message: &T, options: &SendOptions) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .send(self.extensions(), message, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`send`](Self::send).
    async fn send_with<T, F>(&self, build: F, options: &SendOptions) -> Result<(), PipelineError>
    where
        T: Message + Default,
        F: FnOnce(&mut T) + Send + 'static,
    {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .send_with(self.extensions(), build, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`send`](Self::send).
    async fn send_logical(
        &self,
        message: OutgoingLogicalMessage,
        options: &SendOptions,
    ) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .send_logical(self.extensions(), message, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`MessageOperations::publish`].
    async fn publish<T: Message>(&self, message: &T, options: &PublishOptions) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .publish(self.extensions(), message, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    async fn publish_with<T, F>(&self, build: F, options: &PublishOptions) -> Result<(), PipelineError>
    where
        T: Message + Default,
        F: FnOnce(&mut T) + Send + 'static,
    {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .publish_with(self.extensions(), build, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`publish`](Self::publish).
    async fn publish_logical(
        &self,
        message: OutgoingLogicalMessage,
        options: &PublishOptions,
    ) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .publish_logical(self.extensions(), message, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`MessageOperations::reply`].
    async fn reply<T: Message>(&self, message: &T, options: &ReplyOptions) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .reply(self.extensions(), message, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`MessageOperations::subscribe`].
    async fn subscribe(&self, event_type: MessageType, options: &SubscriptionOptions) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .subscribe(self.extensions(), event_type, options, self.cancellation())
            .await
    }

    /// # Errors
    ///
    /// As [`MessageOperations::unsubscribe`].
    async fn unsubscribe(&self, event_type: MessageType, options: &SubscriptionOptions) -> Result<(), PipelineError> {
        let operations = self.extensions().get::<MessageOperations>()?;
        operations
            .unsubscribe(self.extensions(), event_type, options, self.cancellation())
            .await
    }
}

impl<C: PipelineContext + Sync> MessageOps for C {}

// ---------------------------------------------------------------------------
// MessageSession
// ---------------------------------------------------------------------------

/// Endpoint-level context for sending outside of message handling.
#[derive(Debug, Clone)]
pub struct MessageSession {
    extensions: Arc<Extensions>,
    cancellation: CancellationToken,
}

impl MessageSession {
    /// Creates a session whose operations run under `extensions`.
    #[must_use]
    pub fn new(extensions: Arc<Extensions>, cancellation: CancellationToken) -> Self {
        Self {
            extensions,
            cancellation,
        }
    }
}

impl PipelineContext for MessageSession {
    fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Context handed to message handlers.
///
/// Messages sent through it are batched with the incoming message and
/// dispatched only after every handler succeeded, unless immediate dispatch
/// is requested.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    extensions: Arc<Extensions>,
    cancellation: CancellationToken,
    message_id: String,
    headers: Headers,
    reply_to_address: Option<String>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(
        extensions: Arc<Extensions>,
        cancellation: CancellationToken,
        message_id: String,
        headers: Headers,
        reply_to_address: Option<String>,
    ) -> Self {
        Self {
            extensions,
            cancellation,
            message_id,
            headers,
            reply_to_address,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn reply_to_address(&self) -> Option<&str> {
        self.reply_to_address.as_deref()
    }

    /// Sends the incoming message, unchanged, to `destination`.
    ///
    /// # Errors
    ///
    /// As [`MessageOperations::forward_current_message_to`].
    pub async fn forward_current_message_to(&self, destination: &str) -> Result<(), PipelineError> {
        let operations = self.extensions.get::<MessageOperations>()?;
        operations
            .forward_current_message_to(&self.extensions, destination, &self.cancellation)
            .await
    }
}

impl PipelineContext for HandlerContext {
    fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
