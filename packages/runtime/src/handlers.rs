//! Message handlers and the terminator that invokes them.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Extensions, IncomingLogicalMessage, Message, MessageType};
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::contexts::IncomingMessageInfo;
use crate::pipeline::{IncomingContext, Terminator};
use crate::session::HandlerContext;

/// Handles messages of type `M`.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error fails the delivery and hands it to recoverability.
    async fn handle(&self, message: M, context: &HandlerContext) -> anyhow::Result<()>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        message: &IncomingLogicalMessage,
        context: &HandlerContext,
    ) -> anyhow::Result<()>;
}

struct TypedHandler<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for TypedHandler<M, H>
where
    M: Message,
    H: MessageHandler<M>,
{
    fn name(&self) -> &'static str {
        std::any::type_name::<H>()
    }

    async fn handle(
        &self,
        message: &IncomingLogicalMessage,
        context: &HandlerContext,
    ) -> anyhow::Result<()> {
        let typed = message.deserialize::<M>()?;
        self.handler.handle(typed, context).await
    }
}

/// Handlers by message type, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` for messages of type `M`.
    pub fn register<M, H>(&mut self, handler: H)
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.handlers
            .entry(MessageType::of::<M>())
            .or_default()
            .push(Arc::new(TypedHandler {
                handler,
                _message: PhantomData,
            }));
    }

    /// Message types with at least one handler.
    pub fn message_types(&self) -> impl Iterator<Item = &MessageType> {
        self.handlers.keys()
    }

    #[must_use]
    pub fn handles(&self, message_type: &MessageType) -> bool {
        self.handlers.contains_key(message_type)
    }
}

/// Terminates the incoming pipeline by running every handler for the message.
///
/// Handlers run one after another; the first failure stops the chain.
pub struct InvokeHandlersTerminator {
    registry: Arc<HandlerRegistry>,
}

impl InvokeHandlersTerminator {
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Terminator<IncomingContext> for InvokeHandlersTerminator {
    async fn terminate(&self, context: &mut IncomingContext) -> Result<(), PipelineError> {
        let Some(logical) = context.logical_message.as_ref() else {
            return Err(PipelineError::Handler(anyhow::anyhow!(
                "message `{}` reached the handlers without being deserialized",
                context.message.message_id
            )));
        };
        let handlers = self
            .registry
            .handlers
            .get(&logical.message_type)
            .ok_or_else(|| PipelineError::NoHandlers {
                message_type: logical.message_type.clone(),
            })?;

        let reply_to_address = context
            .extensions
            .try_get::<IncomingMessageInfo>()
            .and_then(|info| info.reply_to_address.clone());
        let handler_context = HandlerContext::new(
            Extensions::new_child(&context.extensions),
            context.cancellation.clone(),
            context.message.message_id.clone(),
            context.message.headers.clone(),
            reply_to_address,
        );

        for handler in handlers {
            debug!(
                handler = handler.name(),
                message_type = %logical.message_type,
                message_id = %context.message.message_id,
                "invoking handler"
            );
            handler.handle(logical, &handler_context).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use courier_core::transport::IncomingMessage;
    use courier_core::Headers;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u32,
    }
    impl Message for OrderPlaced {
        fn message_type() -> MessageType {
            MessageType::new("OrderPlaced")
        }
    }

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler<OrderPlaced> for Record {
        async fn handle(&self, message: OrderPlaced, context: &HandlerContext) -> anyhow::Result<()> {
            self.log
                .lock()
                .push(format!("{}:{}:{}", self.name, message.id, context.message_id()));
            Ok(())
        }
    }

    fn context(message_type: &str, body: &'static [u8]) -> IncomingContext {
        IncomingContext {
            extensions: Extensions::root(),
            cancellation: CancellationToken::new(),
            message: IncomingMessage {
                message_id: "m-1".into(),
                headers: Headers::new(),
                body: Bytes::from_static(body),
            },
            logical_message: Some(IncomingLogicalMessage {
                message_type: MessageType::new(message_type),
                instance: serde_json::from_slice(body).unwrap(),
            }),
        }
    }

    #[tokio::test]
    async fn runs_every_handler_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Record {
            name: "first",
            log: log.clone(),
        });
        registry.register(Record {
            name: "second",
            log: log.clone(),
        });
        let terminator = InvokeHandlersTerminator::new(Arc::new(registry));

        terminator
            .terminate(&mut context("OrderPlaced", br#"{"id":7}"#))
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["first:7:m-1", "second:7:m-1"]);
    }

    #[tokio::test]
    async fn unknown_message_type_has_no_handlers() {
        let terminator = InvokeHandlersTerminator::new(Arc::new(HandlerRegistry::new()));
        let err = terminator
            .terminate(&mut context("Unknown", b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoHandlers { .. }));
    }

    #[tokio::test]
    async fn payload_of_the_wrong_shape_fails_the_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register(Record {
            name: "only",
            log: Arc::new(Mutex::new(Vec::new())),
        });
        let terminator = InvokeHandlersTerminator::new(Arc::new(registry));

        let err = terminator
            .terminate(&mut context("OrderPlaced", br#"{"id":"x"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Handler(_)));
    }
}
