//! File-system transport for development and tests.
//!
//! Every queue is a directory under one storage root:
//!
//! ```text
//! <root>/<queue>/<id>.metadata.txt             headers, ready for delivery
//! <root>/<queue>/.bodies/<id>.body.txt         message body
//! <root>/<queue>/.pending/<claim>/             claimed by a running pump
//! <root>/<queue>/.delayed/<due-unix-secs>/     not deliverable before the due time
//! <root>/.events/<event type>/<endpoint>.subscription
//! ```
//!
//! Correctness relies on `rename` being atomic within one file system: a
//! metadata file only ever appears complete, and exactly one pump wins the
//! rename that claims it.

mod dispatcher;
mod path;
mod pump;
mod subscriptions;
mod transaction;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::transport::{
    Dispatcher, MessagePump, ReceiveSettings, SubscriptionManager, TransportCapabilities,
    TransportInfrastructure, TransportTransactionMode,
};
use courier_core::{ConfigError, TransportError};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub use dispatcher::LearningDispatcher;
pub use path::PathChecker;
pub use pump::LearningMessagePump;
pub use subscriptions::LearningSubscriptionManager;

/// Directory created at the storage root's location.
pub const STORAGE_DIRECTORY_NAME: &str = ".learningtransport";

/// File whose presence marks the directory the storage root is created in.
pub const STORAGE_MARKER_FILE: &str = "Cargo.toml";

/// Largest body accepted while `restrict_payload_size` is set.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

const BODIES_DIR: &str = ".bodies";
const PENDING_DIR: &str = ".pending";
const DELAYED_DIR: &str = ".delayed";
const EVENTS_DIR: &str = ".events";
const METADATA_SUFFIX: &str = ".metadata.txt";
const BODY_SUFFIX: &str = ".body.txt";

// ---------------------------------------------------------------------------
// LearningTransport
// ---------------------------------------------------------------------------

/// Configuration of the file transport.
#[derive(Debug, Clone)]
pub struct LearningTransport {
    /// Storage root. Discovered from the executable's location when `None`.
    pub storage_directory: Option<PathBuf>,
    /// Reject bodies larger than [`MAX_PAYLOAD_SIZE`] (default: true).
    pub restrict_payload_size: bool,
    /// Default: [`TransportTransactionMode::SendsAtomicWithReceive`].
    pub transaction_mode: TransportTransactionMode,
    /// Claims older than this are returned to their queue when a pump starts.
    /// Recovery is off when `None` (default).
    pub orphaned_claim_timeout: Option<Duration>,
    /// Delay between scans of an empty queue (default: 50 ms).
    pub poll_interval: Duration,
    /// Delay between scans for due delayed messages (default: 1 s).
    pub delayed_poll_interval: Duration,
}

impl Default for LearningTransport {
    fn default() -> Self {
        Self {
            storage_directory: None,
            restrict_payload_size: true,
            transaction_mode: TransportTransactionMode::SendsAtomicWithReceive,
            orphaned_claim_timeout: None,
            poll_interval: Duration::from_millis(50),
            delayed_poll_interval: Duration::from_secs(1),
        }
    }
}

impl LearningTransport {
    /// Creates a transport rooted at `storage_directory`.
    #[must_use]
    pub fn with_storage_directory(storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_directory: Some(storage_directory.into()),
            ..Self::default()
        }
    }

    /// Resolves the storage root and creates it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::StorageDirectoryNotFound`] when no root can be
    /// discovered, [`ConfigError::Invalid`] for an unsupported transaction
    /// mode, or an I/O error creating the directory.
    pub fn initialize(&self) -> Result<LearningTransportInfrastructure, TransportError> {
        if self.transaction_mode == TransportTransactionMode::TransactionScope {
            return Err(ConfigError::Invalid(
                "the learning transport does not support TransactionScope".to_string(),
            )
            .into());
        }

        let root = match &self.storage_directory {
            Some(directory) => directory.clone(),
            None => {
                let exe = std::env::current_exe().map_err(|e| {
                    ConfigError::Invalid(format!("unable to locate the running executable: {e}"))
                })?;
                let start = exe.parent().unwrap_or(Path::new("."));
                find_storage_path_from(start)?
            }
        };
        std::fs::create_dir_all(&root).map_err(|e| TransportError::io(&root, e))?;
        info!(storage = %root.display(), "learning transport initialized");

        let mut transaction_modes = vec![self.transaction_mode];
        transaction_modes.extend(
            [
                TransportTransactionMode::SendsAtomicWithReceive,
                TransportTransactionMode::ReceiveOnly,
                TransportTransactionMode::None,
            ]
            .into_iter()
            .filter(|mode| *mode != self.transaction_mode),
        );

        Ok(LearningTransportInfrastructure {
            dispatcher: Arc::new(LearningDispatcher::new(
                root.clone(),
                self.restrict_payload_size,
            )),
            capabilities: TransportCapabilities {
                transaction_modes,
                supports_delayed_delivery: true,
                supports_ttbr: true,
                supports_native_pubsub: true,
            },
            root,
            settings: self.clone(),
        })
    }
}

/// Walks from `start` to the file-system root looking for a place to keep
/// transport storage.
///
/// The first directory holding [`STORAGE_MARKER_FILE`] yields
/// `<dir>/`[`STORAGE_DIRECTORY_NAME`]; an existing storage directory found on
/// the way is used as is.
///
/// # Errors
///
/// Returns [`ConfigError::StorageDirectoryNotFound`] when neither is found.
pub fn find_storage_path_from(start: &Path) -> Result<PathBuf, ConfigError> {
    for directory in start.ancestors() {
        if directory.join(STORAGE_MARKER_FILE).is_file() {
            return Ok(directory.join(STORAGE_DIRECTORY_NAME));
        }
        let existing = directory.join(STORAGE_DIRECTORY_NAME);
        if existing.is_dir() {
            return Ok(existing);
        }
    }
    Err(ConfigError::StorageDirectoryNotFound {
        start: start.to_path_buf(),
        marker: STORAGE_MARKER_FILE,
        directory: STORAGE_DIRECTORY_NAME,
    })
}

// ---------------------------------------------------------------------------
// LearningTransportInfrastructure
// ---------------------------------------------------------------------------

/// An initialized file transport.
pub struct LearningTransportInfrastructure {
    root: PathBuf,
    capabilities: TransportCapabilities,
    dispatcher: Arc<LearningDispatcher>,
    settings: LearningTransport,
}

impl LearningTransportInfrastructure {
    #[must_use]
    pub fn storage_directory(&self) -> &Path {
        &self.root
    }

    /// Creates the directory for `queue` so that messages can be sent to it
    /// before its receiver starts.
    ///
    /// # Errors
    ///
    /// Fails for an invalid queue name or when the directory cannot be created.
    pub async fn create_queue(&self, queue: &str) -> Result<PathBuf, TransportError> {
        PathChecker::check(queue, "queue name")?;
        let directory = self.root.join(queue);
        fs::create_dir_all(directory.join(BODIES_DIR))
            .await
            .map_err(|e| TransportError::io(&directory, e))?;
        Ok(directory)
    }
}

#[async_trait]
impl TransportInfrastructure for LearningTransportInfrastructure {
    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatcher.clone()
    }

    async fn create_receiver(
        &self,
        settings: ReceiveSettings,
    ) -> Result<Arc<dyn MessagePump>, TransportError> {
        PathChecker::check(&settings.local_address, "queue name")?;
        PathChecker::check(&settings.error_queue, "error queue name")?;
        if !self
            .capabilities
            .supports_transaction_mode(settings.required_transaction_mode)
        {
            return Err(ConfigError::Invalid(format!(
                "the learning transport does not support transaction mode {:?}",
                settings.required_transaction_mode
            ))
            .into());
        }
        Ok(Arc::new(LearningMessagePump::new(
            &self.root,
            settings,
            &self.settings,
        )))
    }

    fn subscription_manager(
        &self,
        endpoint_name: &str,
        settings: &ReceiveSettings,
    ) -> Result<Option<Arc<dyn SubscriptionManager>>, TransportError> {
        PathChecker::check(endpoint_name, "endpoint name")?;
        if !settings.use_publish_subscribe {
            return Ok(None);
        }
        Ok(Some(Arc::new(LearningSubscriptionManager::new(
            &self.root,
            endpoint_name,
            settings.local_address.clone(),
        ))))
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Writes `contents` to a temporary sibling of `path`, then renames it into
/// place so readers never observe a partial file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), TransportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&tmp, contents)
        .await
        .map_err(|e| TransportError::io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(TransportError::io(path, e));
    }
    Ok(())
}

/// Removes a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), TransportError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransportError::io(path, e)),
    }
}

/// The `<id>` of a `<id>.metadata.txt` file.
pub(crate) fn file_id(metadata_file: &Path) -> Option<&str> {
    metadata_file
        .file_name()?
        .to_str()?
        .strip_suffix(METADATA_SUFFIX)
}

pub(crate) fn body_path(queue_dir: &Path, id: &str) -> PathBuf {
    queue_dir.join(BODIES_DIR).join(format!("{id}{BODY_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_directory_hosts_the_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORAGE_MARKER_FILE), "").unwrap();
        let start = dir.path().join("target").join("debug");
        std::fs::create_dir_all(&start).unwrap();

        let found = find_storage_path_from(&start).unwrap();
        assert_eq!(found, dir.path().join(STORAGE_DIRECTORY_NAME));
    }

    #[test]
    fn existing_storage_directory_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join(STORAGE_DIRECTORY_NAME);
        std::fs::create_dir_all(&existing).unwrap();
        let start = dir.path().join("bin");
        std::fs::create_dir_all(&start).unwrap();

        assert_eq!(find_storage_path_from(&start).unwrap(), existing);
    }

    #[test]
    fn capabilities_prefer_the_configured_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = LearningTransport::with_storage_directory(dir.path());
        transport.transaction_mode = TransportTransactionMode::ReceiveOnly;

        let infrastructure = transport.initialize().unwrap();
        let capabilities = infrastructure.capabilities();
        assert_eq!(
            capabilities.preferred_transaction_mode(),
            TransportTransactionMode::ReceiveOnly
        );
        assert!(capabilities.supports_transaction_mode(TransportTransactionMode::None));
        assert!(!capabilities.supports_transaction_mode(TransportTransactionMode::TransactionScope));
        assert!(capabilities.supports_native_pubsub);
    }

    #[test]
    fn transaction_scope_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = LearningTransport::with_storage_directory(dir.path());
        transport.transaction_mode = TransportTransactionMode::TransactionScope;

        assert!(matches!(
            transport.initialize(),
            Err(TransportError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.metadata.txt");

        write_atomic(&target, b"{}").await.unwrap();
        write_atomic(&target, b"{\"k\":\"v\"}").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.metadata.txt"]);
        assert_eq!(std::fs::read(&target).unwrap(), b"{\"k\":\"v\"}");
    }

    #[test]
    fn file_ids_come_from_metadata_names() {
        assert_eq!(file_id(Path::new("/q/abc.metadata.txt")), Some("abc"));
        assert_eq!(file_id(Path::new("/q/abc.body.txt")), None);
    }

    fn receive_settings(local_address: &str, use_publish_subscribe: bool) -> ReceiveSettings {
        ReceiveSettings {
            id: "Main".into(),
            local_address: local_address.into(),
            error_queue: "error".into(),
            use_publish_subscribe,
            purge_on_startup: false,
            required_transaction_mode: TransportTransactionMode::ReceiveOnly,
        }
    }

    #[tokio::test]
    async fn subscriptions_are_keyed_by_endpoint_name() {
        let dir = tempfile::tempdir().unwrap();
        let infrastructure = LearningTransport::with_storage_directory(dir.path())
            .initialize()
            .unwrap();

        let manager = infrastructure
            .subscription_manager("Billing", &receive_settings("billing-input", true))
            .unwrap()
            .unwrap();
        manager
            .subscribe(&courier_core::MessageType::new("OrderPlaced"), &courier_core::Extensions::root())
            .await
            .unwrap();

        let record = dir.path().join(EVENTS_DIR).join("OrderPlaced").join("Billing.subscription");
        assert_eq!(std::fs::read_to_string(record).unwrap(), "billing-input");
    }

    #[test]
    fn no_subscription_manager_without_publish_subscribe() {
        let dir = tempfile::tempdir().unwrap();
        let infrastructure = LearningTransport::with_storage_directory(dir.path())
            .initialize()
            .unwrap();

        assert!(infrastructure
            .subscription_manager("Billing", &receive_settings("billing", false))
            .unwrap()
            .is_none());
        assert!(matches!(
            infrastructure.subscription_manager("a/b", &receive_settings("billing", true)),
            Err(TransportError::Config(ConfigError::InvalidPath { .. }))
        ));
    }
}
