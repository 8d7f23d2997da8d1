//! Hands physical operations to the transport, batching them with the
//! current receive when one is in progress.

use std::sync::Arc;

use courier_core::transport::{
    DispatchConsistency, Dispatcher, TransportOperation, TransportOperations,
    TransportTransaction,
};
use courier_core::Extensions;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::contexts::PendingTransportOperations;

/// Dispatches `operations`.
///
/// Operations with default consistency join the pending batch of the
/// enclosing incoming message when there is one; everything else is sent
/// immediately in a fresh transaction, preserving the given order.
pub(crate) async fn dispatch_operations(
    extensions: &Arc<Extensions>,
    dispatcher: &dyn Dispatcher,
    operations: Vec<TransportOperation>,
    cancellation: &CancellationToken,
) -> Result<(), PipelineError> {
    let (mut immediate, batched): (Vec<_>, Vec<_>) = operations
        .into_iter()
        .partition(|op| op.required_dispatch_consistency == DispatchConsistency::Isolated);

    match extensions.try_get::<PendingTransportOperations>() {
        Some(pending) if !batched.is_empty() => {
            debug!(count = batched.len(), "batching outgoing operations with the incoming message");
            pending.extend(batched);
        }
        _ => immediate.extend(batched),
    }

    if immediate.is_empty() {
        return Ok(());
    }

    if cancellation.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let batch: TransportOperations = immediate.into_iter().collect();
    dispatcher
        .dispatch(batch, &TransportTransaction::new(), cancellation)
        .await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use courier_core::transport::{AddressTag, OutgoingMessage};
    use courier_core::Headers;

    use super::testing::RecordingDispatcher;
    use super::*;

    fn op(destination: &str) -> TransportOperation {
        TransportOperation::new(
            OutgoingMessage::new(courier_core::new_message_id(), Headers::new(), Bytes::new()),
            AddressTag::unicast(destination),
        )
    }

    #[tokio::test]
    async fn dispatches_immediately_outside_a_receive() {
        let dispatcher = RecordingDispatcher::default();
        let root = Extensions::root();

        dispatch_operations(&root, &dispatcher, vec![op("a"), op("b")], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dispatcher.batches().len(), 1);
        assert_eq!(dispatcher.destinations(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn batches_with_the_incoming_message_unless_isolated() {
        let dispatcher = RecordingDispatcher::default();
        let root = Extensions::root();
        root.set(PendingTransportOperations::default());
        let child = Extensions::new_child(&root);

        dispatch_operations(
            &child,
            &dispatcher,
            vec![op("batched"), op("isolated").isolated()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(dispatcher.destinations(), vec!["isolated"]);
        let pending = root.get::<PendingTransportOperations>().unwrap();
        assert_eq!(pending.len(), 1);
    }
}
