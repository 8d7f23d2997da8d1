//! Well-known header keys and the wire format for header values.
//!
//! Header values are always plain strings so that any tool reading a
//! transport's storage directly can interpret them.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Mutable header map attached to every message. Keys are unique; order is irrelevant.
pub type Headers = HashMap<String, String>;

pub const MESSAGE_ID: &str = "Courier.MessageId";
pub const CORRELATION_ID: &str = "Courier.CorrelationId";
pub const CONVERSATION_ID: &str = "Courier.ConversationId";
pub const RELATED_TO: &str = "Courier.RelatedTo";
pub const MESSAGE_INTENT: &str = "Courier.MessageIntent";
pub const ENCLOSED_MESSAGE_TYPES: &str = "Courier.EnclosedMessageTypes";
pub const REPLY_TO_ADDRESS: &str = "Courier.ReplyToAddress";
pub const ORIGINATING_ENDPOINT: &str = "Courier.OriginatingEndpoint";
pub const TIME_SENT: &str = "Courier.TimeSent";
pub const TIME_TO_BE_RECEIVED: &str = "Courier.TimeToBeReceived";
pub const CONTROL_MESSAGE: &str = "Courier.ControlMessage";
pub const VERSION: &str = "Courier.Version";

pub const SUBSCRIPTION_MESSAGE_TYPE: &str = "SubscriptionMessageType";
pub const SUBSCRIBER_TRANSPORT_ADDRESS: &str = "Courier.SubscriberAddress";
pub const SUBSCRIBER_ENDPOINT: &str = "Courier.SubscriberEndpoint";

pub const FAILED_QUEUE: &str = "Courier.FailedQ";
pub const EXCEPTION_MESSAGE: &str = "Courier.ExceptionInfo.Message";
pub const PROCESSING_ATTEMPTS: &str = "Courier.ProcessingAttempts";

/// Version stamped on control messages.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Formats a point in time as unix milliseconds.
#[must_use]
pub fn to_wire_time(time: SystemTime) -> String {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    millis.to_string()
}

/// Parses a value produced by [`to_wire_time`].
#[must_use]
pub fn from_wire_time(value: &str) -> Option<SystemTime> {
    let millis: u64 = value.trim().parse().ok()?;
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}

/// Formats a duration as whole milliseconds.
#[must_use]
pub fn to_wire_duration(duration: Duration) -> String {
    duration.as_millis().to_string()
}

/// Parses a value produced by [`to_wire_duration`].
#[must_use]
pub fn from_wire_duration(value: &str) -> Option<Duration> {
    value.trim().parse().ok().map(Duration::from_millis)
}
