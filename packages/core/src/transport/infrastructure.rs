//! Dispatch, subscription management, and capability negotiation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::operation::{TransportOperations, TransportTransaction};
use super::receive::{MessagePump, ReceiveSettings};
use crate::context::Extensions;
use crate::error::TransportError;
use crate::message::MessageType;

/// Transaction guarantees a transport can offer, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportTransactionMode {
    /// No receive transaction; a failed message may be lost.
    None,
    /// The receive is transactional; outgoing sends are not.
    ReceiveOnly,
    /// Outgoing sends commit or roll back together with the receive.
    SendsAtomicWithReceive,
    /// Distributed transaction across transport and storage.
    TransactionScope,
}

/// Declared once, at initialization, by every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Supported modes ordered by preference (most preferred first).
    pub transaction_modes: Vec<TransportTransactionMode>,
    pub supports_delayed_delivery: bool,
    pub supports_ttbr: bool,
    pub supports_native_pubsub: bool,
}

impl TransportCapabilities {
    /// The most preferred transaction mode, or `None` when none is declared.
    #[must_use]
    pub fn preferred_transaction_mode(&self) -> TransportTransactionMode {
        self.transaction_modes
            .first()
            .copied()
            .unwrap_or(TransportTransactionMode::None)
    }

    #[must_use]
    pub fn supports_transaction_mode(&self, mode: TransportTransactionMode) -> bool {
        self.transaction_modes.contains(&mode)
    }
}

/// Sends batches of transport operations.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatches `operations` in order, enlisting in `transaction` when the
    /// transport's transaction mode permits.
    ///
    /// Failures are reported, never swallowed: an operation addressed to a
    /// missing queue yields [`TransportError::QueueNotFound`].
    async fn dispatch(
        &self,
        operations: TransportOperations,
        transaction: &TransportTransaction,
        cancellation: &CancellationToken,
    ) -> Result<(), TransportError>;
}

/// Native publish/subscribe management.
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    async fn subscribe(
        &self,
        event_type: &MessageType,
        context: &Extensions,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(
        &self,
        event_type: &MessageType,
        context: &Extensions,
    ) -> Result<(), TransportError>;
}

/// Entry point a transport exposes to the runtime.
#[async_trait]
pub trait TransportInfrastructure: Send + Sync {
    fn capabilities(&self) -> &TransportCapabilities;

    /// Shared dispatcher for all outgoing operations.
    fn dispatcher(&self) -> Arc<dyn Dispatcher>;

    /// Creates a receiver for one queue.
    async fn create_receiver(
        &self,
        settings: ReceiveSettings,
    ) -> Result<Arc<dyn MessagePump>, TransportError>;

    /// Native subscription manager for the endpoint `endpoint_name`
    /// receiving through `settings`.
    ///
    /// `None` unless the transport supports native publish/subscribe and
    /// `settings.use_publish_subscribe` is set.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint name cannot be used by the transport.
    fn subscription_manager(
        &self,
        endpoint_name: &str,
        settings: &ReceiveSettings,
    ) -> Result<Option<Arc<dyn SubscriptionManager>>, TransportError> {
        let _ = (endpoint_name, settings);
        Ok(None)
    }

    /// Maps a logical queue name to the transport's native address.
    fn to_transport_address(&self, queue: &str) -> String {
        queue.to_string()
    }

    /// Releases transport-wide resources.
    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
