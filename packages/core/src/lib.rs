//! Courier core: context tree, message model, header vocabulary, and the transport contract.

pub mod context;
pub mod error;
pub mod headers;
pub mod message;
pub mod transport;

pub use context::Extensions;
pub use error::{ConfigError, ContextError, TransportError};
pub use headers::Headers;
pub use message::{
    new_message_id, IncomingLogicalMessage, Message, MessageIntent, MessageType,
    OutgoingLogicalMessage,
};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
