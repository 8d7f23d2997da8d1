use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use courier_core::headers::{self, MESSAGE_ID, TIME_SENT, TIME_TO_BE_RECEIVED};
use courier_core::transport::{
    AddressTag, DispatchConsistency, Dispatcher, TransportOperation, TransportOperations,
    TransportTransaction,
};
use courier_core::TransportError;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::path::{sanitize, PathChecker};
use super::subscriptions::subscribers_for;
use super::transaction::ClaimTransaction;
use super::{body_path, write_atomic, BODIES_DIR, DELAYED_DIR, MAX_PAYLOAD_SIZE, METADATA_SUFFIX};

/// Writes outgoing messages into queue directories.
#[derive(Debug)]
pub struct LearningDispatcher {
    root: PathBuf,
    restrict_payload_size: bool,
}

impl LearningDispatcher {
    #[must_use]
    pub fn new(root: PathBuf, restrict_payload_size: bool) -> Self {
        Self {
            root,
            restrict_payload_size,
        }
    }

    fn check_payload_sizes(&self, operations: &TransportOperations) -> Result<(), TransportError> {
        if !self.restrict_payload_size {
            return Ok(());
        }
        match operations
            .iter()
            .map(|op| op.message.body.len())
            .find(|size| *size > MAX_PAYLOAD_SIZE)
        {
            Some(size) => Err(TransportError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            }),
            None => Ok(()),
        }
    }

    async fn write_message(
        &self,
        destination: &str,
        operation: &TransportOperation,
        claim: Option<&ClaimTransaction>,
        now: SystemTime,
    ) -> Result<(), TransportError> {
        PathChecker::check(destination, "destination queue")?;
        let queue_dir = self.root.join(destination);
        if !fs::try_exists(&queue_dir)
            .await
            .map_err(|e| TransportError::io(&queue_dir, e))?
        {
            return Err(TransportError::QueueNotFound {
                queue: destination.to_string(),
            });
        }

        let mut message_headers = operation.message.headers.clone();
        message_headers
            .entry(MESSAGE_ID.to_string())
            .or_insert_with(|| operation.message.message_id.clone());
        if let Some(ttbr) = operation.time_to_be_received() {
            message_headers.insert(
                TIME_TO_BE_RECEIVED.to_string(),
                headers::to_wire_duration(ttbr),
            );
            message_headers
                .entry(TIME_SENT.to_string())
                .or_insert_with(|| headers::to_wire_time(now));
        }

        let id = sanitize(&operation.message.message_id);
        let body = body_path(&queue_dir, &id);
        fs::create_dir_all(queue_dir.join(BODIES_DIR))
            .await
            .map_err(|e| TransportError::io(&queue_dir, e))?;
        write_atomic(&body, &operation.message.body).await?;

        let target_dir = match operation.deliver_at(now) {
            Some(due) if due > now => queue_dir.join(DELAYED_DIR).join(due_seconds(due).to_string()),
            _ => queue_dir,
        };
        let target = target_dir.join(format!("{id}{METADATA_SUFFIX}"));
        let metadata = serde_json::to_vec_pretty(&message_headers)?;

        debug!(
            destination,
            message_id = %operation.message.message_id,
            file = %target.display(),
            enlisted = claim.is_some(),
            "writing message"
        );
        match claim {
            Some(claim) => claim.enlist(target, &metadata, body).await,
            None => {
                fs::create_dir_all(&target_dir)
                    .await
                    .map_err(|e| TransportError::io(&target_dir, e))?;
                write_atomic(&target, &metadata).await
            }
        }
    }
}

/// Whole seconds since the epoch, rounded up so nothing is released early.
fn due_seconds(due: SystemTime) -> u64 {
    let since_epoch = due.duration_since(UNIX_EPOCH).unwrap_or_default();
    since_epoch.as_secs() + u64::from(since_epoch.subsec_nanos() > 0)
}

#[async_trait]
impl Dispatcher for LearningDispatcher {
    async fn dispatch(
        &self,
        operations: TransportOperations,
        transaction: &TransportTransaction,
        cancellation: &CancellationToken,
    ) -> Result<(), TransportError> {
        if cancellation.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        // Nothing is written unless the whole batch fits.
        self.check_payload_sizes(&operations)?;

        let claim = transaction.extensions().try_get::<ClaimTransaction>();
        let now = SystemTime::now();
        for operation in operations.iter() {
            let enlist = match operation.required_dispatch_consistency {
                DispatchConsistency::Isolated => None,
                DispatchConsistency::Default => claim.as_deref(),
            };
            match &operation.address_tag {
                AddressTag::Unicast { destination } => {
                    self.write_message(destination, operation, enlist, now).await?;
                }
                AddressTag::Multicast { message_type } => {
                    let subscribers = subscribers_for(&self.root, message_type).await?;
                    debug!(%message_type, subscribers = subscribers.len(), "publishing event");
                    for subscriber in subscribers {
                        self.write_message(&subscriber, operation, enlist, now).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
