//! Receive component: connects pumps to the incoming pipeline, applies
//! recoverability to failed deliveries, and hosts satellite receivers.

pub mod executor;
pub mod recoverability;
pub mod satellite;

use std::sync::Arc;

use courier_core::headers;
use courier_core::transport::{Dispatcher, IncomingMessage, TransportTransaction};
use courier_core::Extensions;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PipelineError;
use crate::operations::MessageOperations;
use crate::pipeline::contexts::{IncomingMessageInfo, PendingTransportOperations};

pub use executor::MainPipelineExecutor;
pub use recoverability::{DefaultRecoverabilityPolicy, RecoverabilityAction, RecoverabilityPolicy};
pub use satellite::{SatelliteDefinition, SatelliteHandler, SatellitePipelineExecutor};

/// Seeds the root of a delivery's context tree with what every operation
/// started while processing it needs to find.
fn prepare_root(
    root: &Arc<Extensions>,
    operations: &Arc<MessageOperations>,
    message: &IncomingMessage,
    transaction: &TransportTransaction,
) {
    root.set_shared(Arc::clone(operations));
    root.set(PendingTransportOperations::default());
    root.set(transaction.clone());
    root.set(IncomingMessageInfo {
        message: message.clone(),
        reply_to_address: message.headers.get(headers::REPLY_TO_ADDRESS).cloned(),
    });
}

/// Dispatches the operations batched while processing a delivery, inside the
/// receive transaction.
async fn dispatch_pending(
    root: &Arc<Extensions>,
    dispatcher: &dyn Dispatcher,
    transaction: &TransportTransaction,
    cancellation: &CancellationToken,
) -> Result<(), PipelineError> {
    let pending = root.get::<PendingTransportOperations>()?.take();
    if pending.is_empty() {
        return Ok(());
    }
    debug!(count = pending.len(), "dispatching batched operations");
    dispatcher
        .dispatch(pending.into_iter().collect(), transaction, cancellation)
        .await?;
    Ok(())
}
