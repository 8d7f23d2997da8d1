use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::headers::{self, MESSAGE_ID, TIME_SENT, TIME_TO_BE_RECEIVED};
use courier_core::transport::{
    CriticalError, ErrorContext, ErrorHandleResult, IncomingMessage, MessageContext,
    MessageProcessor, MessagePump, PushRuntimeSettings, ReceiveSettings, TransportTransaction,
    TransportTransactionMode,
};
use courier_core::{Extensions, Headers, TransportError};
use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::transaction::{recover_orphaned_claims, ClaimTransaction};
use super::{body_path, file_id, remove_if_exists, LearningTransport, BODIES_DIR, DELAYED_DIR};

// ---------------------------------------------------------------------------
// LearningMessagePump
// ---------------------------------------------------------------------------

/// Polls one queue directory and pushes its messages to a processor.
pub struct LearningMessagePump {
    settings: ReceiveSettings,
    queue_dir: PathBuf,
    error_queue_dir: PathBuf,
    poll_interval: Duration,
    delayed_poll_interval: Duration,
    orphaned_claim_timeout: Option<Duration>,
    receiver: Mutex<Option<Arc<QueueReceiver>>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancellation: CancellationToken,
    tracker: TaskTracker,
    poll: JoinHandle<()>,
    delayed: JoinHandle<()>,
}

impl LearningMessagePump {
    pub(crate) fn new(root: &Path, settings: ReceiveSettings, transport: &LearningTransport) -> Self {
        Self {
            queue_dir: root.join(&settings.local_address),
            error_queue_dir: root.join(&settings.error_queue),
            poll_interval: transport.poll_interval,
            delayed_poll_interval: transport.delayed_poll_interval,
            orphaned_claim_timeout: transport.orphaned_claim_timeout,
            settings,
            receiver: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    async fn purge(&self) -> Result<(), TransportError> {
        let mut purged = 0usize;
        for file in ready_files(&self.queue_dir).await? {
            remove_if_exists(&file).await?;
            purged += 1;
        }
        for dir in [BODIES_DIR, DELAYED_DIR] {
            let path = self.queue_dir.join(dir);
            match fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(TransportError::io(&path, e)),
            }
        }
        fs::create_dir_all(self.queue_dir.join(BODIES_DIR))
            .await
            .map_err(|e| TransportError::io(&self.queue_dir, e))?;
        info!(queue = %self.settings.local_address, purged, "purged queue on startup");
        Ok(())
    }
}

#[async_trait]
impl MessagePump for LearningMessagePump {
    fn settings(&self) -> &ReceiveSettings {
        &self.settings
    }

    async fn init(
        &self,
        processor: Arc<dyn MessageProcessor>,
        critical_error: CriticalError,
    ) -> Result<(), TransportError> {
        for dir in [&self.queue_dir, &self.error_queue_dir] {
            fs::create_dir_all(dir.join(BODIES_DIR))
                .await
                .map_err(|e| TransportError::io(dir, e))?;
        }
        if self.settings.purge_on_startup {
            self.purge().await?;
        }
        if let Some(timeout) = self.orphaned_claim_timeout {
            let recovered = recover_orphaned_claims(&self.queue_dir, timeout).await?;
            if recovered > 0 {
                warn!(
                    queue = %self.settings.local_address,
                    recovered,
                    "returned orphaned claims to the queue"
                );
            }
        }

        *self.receiver.lock() = Some(Arc::new(QueueReceiver {
            queue_dir: self.queue_dir.clone(),
            error_queue_dir: self.error_queue_dir.clone(),
            address: self.settings.local_address.clone(),
            mode: self.settings.required_transaction_mode,
            poll_interval: self.poll_interval,
            delayed_poll_interval: self.delayed_poll_interval,
            processor,
            critical_error,
        }));
        Ok(())
    }

    async fn start(&self, limitations: PushRuntimeSettings) -> Result<(), TransportError> {
        let receiver = self.receiver.lock().clone().ok_or_else(|| {
            TransportError::Other(anyhow::anyhow!(
                "receiver `{}` was started before it was initialized",
                self.settings.id
            ))
        })?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let cancellation = CancellationToken::new();
        let tracker = TaskTracker::new();
        let semaphore = limitations
            .max_concurrency()
            .map(|max| Arc::new(Semaphore::new(max)));

        let poll = tokio::spawn(Arc::clone(&receiver).poll(
            cancellation.clone(),
            tracker.clone(),
            semaphore,
        ));
        let delayed = tokio::spawn(receiver.poll_delayed(cancellation.clone()));
        *running = Some(Running {
            cancellation,
            tracker,
            poll,
            delayed,
        });

        info!(
            receiver = %self.settings.id,
            queue = %self.settings.local_address,
            max_concurrency = ?limitations.max_concurrency(),
            "pump started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        running.cancellation.cancel();
        for handle in [running.poll, running.delayed] {
            if let Err(e) = handle.await {
                warn!(error = %e, "receive loop ended abnormally");
            }
        }
        running.tracker.close();
        running.tracker.wait().await;

        info!(receiver = %self.settings.id, queue = %self.settings.local_address, "pump stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueueReceiver
// ---------------------------------------------------------------------------

enum Outcome {
    /// Processed or discarded; remove the message.
    Complete,
    /// Processing failed beyond what `on_error` could handle.
    Requeue,
    /// The receiver stopped mid-delivery; return the message untouched.
    Release,
}

/// State shared by the poll loops and every in-flight message of one pump.
struct QueueReceiver {
    queue_dir: PathBuf,
    error_queue_dir: PathBuf,
    address: String,
    mode: TransportTransactionMode,
    poll_interval: Duration,
    delayed_poll_interval: Duration,
    processor: Arc<dyn MessageProcessor>,
    critical_error: CriticalError,
}

impl QueueReceiver {
    async fn poll(
        self: Arc<Self>,
        cancellation: CancellationToken,
        tracker: TaskTracker,
        semaphore: Option<Arc<Semaphore>>,
    ) {
        loop {
            let files = match ready_files(&self.queue_dir).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(queue = %self.address, error = %e, "failed to scan the queue");
                    Vec::new()
                }
            };
            let Some(claimed) = self
                .claim_ready(files, &cancellation, &tracker, semaphore.as_ref())
                .await
            else {
                break;
            };
            // Nothing to do, or nothing could be claimed: wait before rescanning.
            if claimed == 0 {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        debug!(queue = %self.address, "poll loop stopped");
    }

    /// Claims `files` in order and hands each claim to `tracker`.
    ///
    /// Returns the number of messages claimed, or `None` once `cancellation`
    /// fires.
    async fn claim_ready(
        self: &Arc<Self>,
        files: Vec<PathBuf>,
        cancellation: &CancellationToken,
        tracker: &TaskTracker,
        semaphore: Option<&Arc<Semaphore>>,
    ) -> Option<usize> {
        let mut claimed = 0;
        for file in files {
            // The permit is taken before claiming so that no message sits
            // claimed while waiting for a free slot.
            let permit = match semaphore {
                Some(semaphore) => tokio::select! {
                    () = cancellation.cancelled() => return None,
                    permit = Arc::clone(semaphore).acquire_owned() => Some(permit.ok()?),
                },
                None => None,
            };
            if cancellation.is_cancelled() {
                return None;
            }

            let claim = match ClaimTransaction::begin(&self.queue_dir, &file, self.mode).await {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(e) => {
                    warn!(queue = %self.address, error = %e, "failed to claim a message");
                    continue;
                }
            };
            claimed += 1;
            let receiver = Arc::clone(self);
            let cancellation = cancellation.clone();
            tracker.spawn(async move {
                let _permit = permit;
                receiver.process(claim, &cancellation).await;
            });
        }
        Some(claimed)
    }

    async fn poll_delayed(self: Arc<Self>, cancellation: CancellationToken) {
        loop {
            if let Err(e) = release_due_messages(&self.queue_dir, SystemTime::now()).await {
                warn!(queue = %self.address, error = %e, "failed to release delayed messages");
            }
            tokio::select! {
                () = cancellation.cancelled() => break,
                () = tokio::time::sleep(self.delayed_poll_interval) => {}
            }
        }
    }

    async fn process(&self, claim: ClaimTransaction, cancellation: &CancellationToken) {
        let claim = Arc::new(claim);
        let id = file_id(claim.claimed_file())
            .unwrap_or_default()
            .to_string();
        let body_file = body_path(&self.queue_dir, &id);

        let outcome = match read_message(claim.claimed_file(), &body_file, &id).await {
            Ok(message) if is_expired(&message.headers, SystemTime::now()) => {
                info!(
                    queue = %self.address,
                    message_id = %message.message_id,
                    "discarding message whose time to be received has expired"
                );
                Outcome::Complete
            }
            Ok(message) => self.deliver(&claim, message, cancellation).await,
            Err(e) => {
                error!(queue = %self.address, file = %id, error = %e, "moving unreadable message to the error queue");
                self.quarantine(&claim, &id, &body_file).await;
                return;
            }
        };

        match outcome {
            Outcome::Requeue if self.mode == TransportTransactionMode::None => {
                // No receive transaction to roll back: the message stays claimed.
                warn!(
                    queue = %self.address,
                    file = %claim.claimed_file().display(),
                    "failed message left in its processing directory"
                );
            }
            Outcome::Requeue | Outcome::Release => {
                if let Err(e) = claim.requeue().await {
                    self.critical_error
                        .raise("failed to return a message to its queue", &anyhow::Error::from(e));
                }
            }
            Outcome::Complete => {
                if let Err(e) = claim.complete().await {
                    warn!(queue = %self.address, error = %e, "failed to remove a completed claim");
                }
                if let Err(e) = remove_if_exists(&body_file).await {
                    warn!(queue = %self.address, error = %e, "failed to remove a message body");
                }
            }
        }
    }

    async fn deliver(
        &self,
        claim: &Arc<ClaimTransaction>,
        message: IncomingMessage,
        cancellation: &CancellationToken,
    ) -> Outcome {
        let transaction = TransportTransaction::new();
        transaction.extensions().set_shared(Arc::clone(claim));

        let mut failures = 0u32;
        loop {
            let context = MessageContext {
                message: message.clone(),
                transport_transaction: transaction.clone(),
                extensions: Extensions::root(),
                cancellation: cancellation.child_token(),
            };
            let error = match self.processor.on_message(context).await {
                Ok(()) => return self.commit(claim).await,
                Err(error) => error,
            };

            claim.rollback().await;
            if cancellation.is_cancelled() {
                debug!(message_id = %message.message_id, "receiver stopped during delivery");
                return Outcome::Release;
            }
            failures += 1;
            let error_context = ErrorContext {
                error: Arc::new(error),
                message: message.clone(),
                transport_transaction: transaction.clone(),
                immediate_processing_failures: failures,
                receive_address: self.address.clone(),
            };
            match self.processor.on_error(error_context).await {
                Ok(ErrorHandleResult::RetryRequired) => {
                    debug!(message_id = %message.message_id, failures, "retrying message");
                }
                Ok(ErrorHandleResult::Handled) => return self.commit(claim).await,
                Err(e) => {
                    claim.rollback().await;
                    self.critical_error
                        .raise("failed to handle a message processing failure", &e);
                    return Outcome::Requeue;
                }
            }
        }
    }

    async fn commit(&self, claim: &ClaimTransaction) -> Outcome {
        match claim.commit().await {
            Ok(()) => Outcome::Complete,
            Err(e) => {
                claim.rollback().await;
                self.critical_error
                    .raise("failed to commit outgoing messages", &anyhow::Error::from(e));
                Outcome::Requeue
            }
        }
    }

    async fn quarantine(&self, claim: &ClaimTransaction, id: &str, body_file: &Path) {
        let Some(name) = claim.claimed_file().file_name() else {
            return;
        };
        let result = async {
            fs::rename(claim.claimed_file(), self.error_queue_dir.join(name))
                .await
                .map_err(|e| TransportError::io(claim.claimed_file(), e))?;
            match fs::rename(body_file, body_path(&self.error_queue_dir, id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(TransportError::io(body_file, e)),
            }
            claim.complete().await
        }
        .await;
        if let Err(e) = result {
            self.critical_error
                .raise("failed to move an unreadable message to the error queue", &anyhow::Error::from(e));
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Metadata files ready for delivery, oldest message id first.
async fn ready_files(queue_dir: &Path) -> Result<Vec<PathBuf>, TransportError> {
    let mut entries = fs::read_dir(queue_dir)
        .await
        .map_err(|e| TransportError::io(queue_dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TransportError::io(queue_dir, e))?
    {
        let path = entry.path();
        if file_id(&path).is_some_and(|id| !id.starts_with('.')) {
            files.push(path);
        }
    }
    // Message ids are time ordered.
    files.sort();
    Ok(files)
}

async fn read_message(
    metadata_file: &Path,
    body_file: &Path,
    id: &str,
) -> Result<IncomingMessage, TransportError> {
    let raw = fs::read(metadata_file)
        .await
        .map_err(|e| TransportError::io(metadata_file, e))?;
    let message_headers: Headers = serde_json::from_slice(&raw)?;
    let body = match fs::read(body_file).await {
        Ok(body) => Bytes::from(body),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(file = %body_file.display(), "message body is missing");
            Bytes::new()
        }
        Err(e) => return Err(TransportError::io(body_file, e)),
    };
    let message_id = message_headers
        .get(MESSAGE_ID)
        .cloned()
        .unwrap_or_else(|| id.to_string());
    Ok(IncomingMessage {
        message_id,
        headers: message_headers,
        body,
    })
}

fn is_expired(message_headers: &Headers, now: SystemTime) -> bool {
    let ttbr = message_headers
        .get(TIME_TO_BE_RECEIVED)
        .and_then(|value| headers::from_wire_duration(value));
    let sent = message_headers
        .get(TIME_SENT)
        .and_then(|value| headers::from_wire_time(value));
    match (sent, ttbr) {
        (Some(sent), Some(ttbr)) => sent.checked_add(ttbr).is_some_and(|deadline| deadline < now),
        _ => false,
    }
}

/// Moves delayed messages due at `now` into the queue.
async fn release_due_messages(queue_dir: &Path, now: SystemTime) -> Result<usize, TransportError> {
    let delayed_dir = queue_dir.join(DELAYED_DIR);
    let mut slots = match fs::read_dir(&delayed_dir).await {
        Ok(slots) => slots,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TransportError::io(&delayed_dir, e)),
    };
    let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

    let mut released = 0;
    while let Some(slot) = slots
        .next_entry()
        .await
        .map_err(|e| TransportError::io(&delayed_dir, e))?
    {
        let due = slot
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok());
        if !due.is_some_and(|due| due <= now_secs) {
            continue;
        }

        let slot_dir = slot.path();
        let mut files = fs::read_dir(&slot_dir)
            .await
            .map_err(|e| TransportError::io(&slot_dir, e))?;
        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|e| TransportError::io(&slot_dir, e))?
        {
            let path = file.path();
            if file_id(&path).is_some() {
                let target = queue_dir.join(file.file_name());
                fs::rename(&path, &target)
                    .await
                    .map_err(|e| TransportError::io(&target, e))?;
                released += 1;
            }
        }
        // Another pump may still be emptying the same slot.
        let _ = fs::remove_dir(&slot_dir).await;
    }
    if released > 0 {
        debug!(queue = %queue_dir.display(), released, "released delayed messages");
    }
    Ok(released)
}
