//! Logical message model: typed payloads paired with their declared type.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of a message type as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(Arc<str>);

impl MessageType {
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the declared type of `T`.
    #[must_use]
    pub fn of<T: Message>() -> Self {
        T::message_type()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload that can travel through the pipelines.
///
/// The default type identity is the Rust type path. Override
/// [`message_type`](Message::message_type) when other processes must agree
/// on a stable name.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn message_type() -> MessageType {
        MessageType::new(std::any::type_name::<Self>())
    }
}

/// Why a message was sent. Stored in the `MessageIntent` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIntent {
    Send,
    Publish,
    Reply,
    Subscribe,
    Unsubscribe,
}

impl MessageIntent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Publish => "Publish",
            Self::Reply => "Reply",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
        }
    }
}

impl fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Send" => Ok(Self::Send),
            "Publish" => Ok(Self::Publish),
            "Reply" => Ok(Self::Reply),
            "Subscribe" => Ok(Self::Subscribe),
            "Unsubscribe" => Ok(Self::Unsubscribe),
            other => Err(format!("unknown message intent `{other}`")),
        }
    }
}

/// An outgoing payload and its declared type.
#[derive(Debug, Clone)]
pub struct OutgoingLogicalMessage {
    pub message_type: MessageType,
    pub instance: serde_json::Value,
}

impl OutgoingLogicalMessage {
    /// Captures `message` together with its declared type.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be represented as JSON.
    pub fn new<T: Message>(message: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: MessageType::of::<T>(),
            instance: serde_json::to_value(message)?,
        })
    }

    /// An empty-bodied message, used for control messages.
    #[must_use]
    pub fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            instance: serde_json::Value::Null,
        }
    }
}

/// An inbound payload after deserialization.
#[derive(Debug, Clone)]
pub struct IncomingLogicalMessage {
    pub message_type: MessageType,
    pub instance: serde_json::Value,
}

impl IncomingLogicalMessage {
    /// Converts the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`'s shape.
    pub fn deserialize<T: Message>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.instance)
    }
}

/// Generates a new time-ordered message id.
#[must_use]
pub fn new_message_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
