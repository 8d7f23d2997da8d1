//! Built-in behaviors registered by the endpoint.

use std::time::SystemTime;

use async_trait::async_trait;
use courier_core::headers;
use courier_core::{new_message_id, IncomingLogicalMessage, MessageType};

use super::contexts::{IncomingContext, IncomingMessageInfo, OutgoingContext};
use super::{Behavior, Next};
use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// OutgoingHeadersBehavior
// ---------------------------------------------------------------------------

/// Stamps the standard headers on every outgoing message.
///
/// Values already present in the headers (set through the operation's
/// options) are left alone, except the intent, which always reflects the
/// operation actually performed.
pub struct OutgoingHeadersBehavior {
    originating_endpoint: String,
    reply_to_address: Option<String>,
}

impl OutgoingHeadersBehavior {
    #[must_use]
    pub fn new(originating_endpoint: impl Into<String>, reply_to_address: Option<String>) -> Self {
        Self {
            originating_endpoint: originating_endpoint.into(),
            reply_to_address,
        }
    }
}

#[async_trait]
impl Behavior<OutgoingContext> for OutgoingHeadersBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingContext,
        next: Next<'_, OutgoingContext>,
    ) -> Result<(), PipelineError> {
        let h = &mut context.headers;
        h.insert(headers::MESSAGE_INTENT.into(), context.intent.to_string());
        h.entry(headers::ENCLOSED_MESSAGE_TYPES.into())
            .or_insert_with(|| context.message.message_type.as_str().to_string());
        h.entry(headers::TIME_SENT.into())
            .or_insert_with(|| headers::to_wire_time(SystemTime::now()));
        h.entry(headers::ORIGINATING_ENDPOINT.into())
            .or_insert_with(|| self.originating_endpoint.clone());
        h.entry(headers::VERSION.into())
            .or_insert_with(|| headers::PROTOCOL_VERSION.to_string());
        if let Some(reply_to) = &self.reply_to_address {
            h.entry(headers::REPLY_TO_ADDRESS.into())
                .or_insert_with(|| reply_to.clone());
        }
        next.run(context).await
    }
}

// ---------------------------------------------------------------------------
// CausationHeadersBehavior
// ---------------------------------------------------------------------------

/// Links outgoing messages to the message being processed, if any.
///
/// Messages sent while handling another message join its conversation,
/// inherit its correlation id, and record it as their cause. Messages sent
/// from outside a handler start a new conversation.
pub struct CausationHeadersBehavior;

#[async_trait]
impl Behavior<OutgoingContext> for CausationHeadersBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingContext,
        next: Next<'_, OutgoingContext>,
    ) -> Result<(), PipelineError> {
        let incoming = context.extensions.try_get::<IncomingMessageInfo>();
        let h = &mut context.headers;

        match incoming {
            Some(info) => {
                let incoming_headers = &info.message.headers;
                let incoming_id = info.message.message_id.clone();
                let conversation = incoming_headers
                    .get(headers::CONVERSATION_ID)
                    .cloned()
                    .unwrap_or_else(|| incoming_id.clone());
                let correlation = incoming_headers
                    .get(headers::CORRELATION_ID)
                    .cloned()
                    .unwrap_or_else(|| incoming_id.clone());
                h.entry(headers::CONVERSATION_ID.into()).or_insert(conversation);
                h.entry(headers::CORRELATION_ID.into()).or_insert(correlation);
                h.insert(headers::RELATED_TO.into(), incoming_id);
            }
            None => {
                h.entry(headers::CONVERSATION_ID.into())
                    .or_insert_with(new_message_id);
                h.entry(headers::CORRELATION_ID.into())
                    .or_insert_with(|| context.message_id.clone());
            }
        }
        next.run(context).await
    }
}

// ---------------------------------------------------------------------------
// DeserializeMessageBehavior
// ---------------------------------------------------------------------------

/// Turns the incoming body into an [`IncomingLogicalMessage`].
///
/// The message type is the first entry of the enclosed-types header. An
/// empty body deserializes to `null`.
pub struct DeserializeMessageBehavior;

#[async_trait]
impl Behavior<IncomingContext> for DeserializeMessageBehavior {
    async fn invoke(
        &self,
        context: &mut IncomingContext,
        next: Next<'_, IncomingContext>,
    ) -> Result<(), PipelineError> {
        let message_type = context
            .header(headers::ENCLOSED_MESSAGE_TYPES)
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(MessageType::new)
            .ok_or(PipelineError::MissingHeader {
                header: headers::ENCLOSED_MESSAGE_TYPES,
            })?;

        let instance = if context.message.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&context.message.body)?
        };

        context.logical_message = Some(IncomingLogicalMessage {
            message_type,
            instance,
        });
        next.run(context).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
