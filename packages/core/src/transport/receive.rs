//! Receive-side contract: settings, per-message contexts, and the push pump.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::infrastructure::TransportTransactionMode;
use super::operation::TransportTransaction;
use crate::context::Extensions;
use crate::error::TransportError;
use crate::headers::Headers;

/// Per-queue configuration handed to `create_receiver`. Immutable afterwards.
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    /// Identifier of this receiver (e.g. `"Main"` or a satellite name).
    pub id: String,
    pub local_address: String,
    pub error_queue: String,
    pub use_publish_subscribe: bool,
    pub purge_on_startup: bool,
    pub required_transaction_mode: TransportTransactionMode,
}

/// Concurrency policy for a running pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushRuntimeSettings {
    max_concurrency: Option<NonZeroUsize>,
}

impl PushRuntimeSettings {
    /// At most `max` concurrent `on_message` invocations. Zero is treated as one.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max_concurrency: Some(NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// No concurrency cap.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_concurrency: None,
        }
    }

    /// `None` when unbounded.
    #[must_use]
    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency.map(NonZeroUsize::get)
    }
}

impl Default for PushRuntimeSettings {
    /// The available parallelism, but never less than two.
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self::new(cores.max(2))
    }
}

/// A message as read from the transport, before deserialization.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Everything a pump hands to `on_message` for one delivery.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: IncomingMessage,
    pub transport_transaction: TransportTransaction,
    /// Root of the context tree for this delivery.
    pub extensions: Arc<Extensions>,
    pub cancellation: CancellationToken,
}

/// Describes a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: Arc<anyhow::Error>,
    pub message: IncomingMessage,
    pub transport_transaction: TransportTransaction,
    /// Number of failed attempts for this delivery so far, including this one.
    pub immediate_processing_failures: u32,
    pub receive_address: String,
}

/// Disposition chosen by `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The failure was dealt with (e.g. moved to the error queue); complete the receive.
    Handled,
    /// Invoke `on_message` again for the same delivery.
    RetryRequired,
}

/// Callbacks a pump invokes for every delivery.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Processes one delivery. An error leads to `on_error`.
    async fn on_message(&self, context: MessageContext) -> anyhow::Result<()>;

    /// Classifies a failed delivery.
    async fn on_error(&self, context: ErrorContext) -> anyhow::Result<ErrorHandleResult>;
}

type CriticalErrorCallback = dyn Fn(&str, &anyhow::Error) + Send + Sync;

/// Raised by a pump when it cannot continue receiving.
#[derive(Clone)]
pub struct CriticalError {
    callback: Arc<CriticalErrorCallback>,
}

impl CriticalError {
    #[must_use]
    pub fn new(callback: impl Fn(&str, &anyhow::Error) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    pub fn raise(&self, message: &str, error: &anyhow::Error) {
        tracing::error!(error = %error, "{message}");
        (self.callback)(message, error);
    }
}

impl Default for CriticalError {
    fn default() -> Self {
        Self::new(|_, _| {})
    }
}

impl fmt::Debug for CriticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalError").finish_non_exhaustive()
    }
}

/// Push-style receiver for one queue.
///
/// Lifecycle: `init` → `start` → `stop`. `stop` returns only after every
/// in-flight `on_message` invocation has completed.
#[async_trait]
pub trait MessagePump: Send + Sync {
    /// The receive settings this pump was created with.
    fn settings(&self) -> &ReceiveSettings;

    /// Prepares the pump. Called once before `start`.
    async fn init(
        &self,
        processor: Arc<dyn MessageProcessor>,
        critical_error: CriticalError,
    ) -> Result<(), TransportError>;

    /// Begins pushing deliveries with at most `limitations.max_concurrency()`
    /// concurrent `on_message` invocations.
    async fn start(&self, limitations: PushRuntimeSettings) -> Result<(), TransportError>;

    /// Stops receiving and drains in-flight invocations.
    async fn stop(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_concurrency_is_clamped_to_one() {
        assert_eq!(PushRuntimeSettings::new(0).max_concurrency(), Some(1));
        assert_eq!(PushRuntimeSettings::new(10).max_concurrency(), Some(10));
    }

    #[test]
    fn unbounded_has_no_cap() {
        assert_eq!(PushRuntimeSettings::unbounded().max_concurrency(), None);
    }

    #[test]
    fn default_allows_at_least_two() {
        assert!(PushRuntimeSettings::default().max_concurrency().unwrap() >= 2);
    }

    #[test]
    fn critical_error_invokes_callback() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let critical = CriticalError::new(move |message, _| sink.lock().push(message.to_string()));

        critical.raise("pump failed", &anyhow::anyhow!("disk gone"));

        assert_eq!(*seen.lock(), vec!["pump failed".to_string()]);
    }
}
