//! The contract every transport backend implements.
//!
//! Three capability surfaces:
//!
//! 1. **Receiver** ([`MessagePump`]): push-style delivery with a per-queue concurrency cap
//! 2. **Dispatcher** ([`Dispatcher`]): ordered, batched, transaction-aware sends
//! 3. **Subscription manager** ([`SubscriptionManager`]): native pub/sub, when supported
//!
//! plus [`TransportCapabilities`], declared once so callers can check what
//! they may rely on.

pub mod infrastructure;
pub mod operation;
pub mod receive;

pub use infrastructure::{
    Dispatcher, SubscriptionManager, TransportCapabilities, TransportInfrastructure,
    TransportTransactionMode,
};
pub use operation::{
    AddressTag, DeliveryConstraint, DispatchConsistency, OutgoingMessage, TransportOperation,
    TransportOperations, TransportTransaction,
};
pub use receive::{
    CriticalError, ErrorContext, ErrorHandleResult, IncomingMessage, MessageContext,
    MessageProcessor, MessagePump, PushRuntimeSettings, ReceiveSettings,
};
