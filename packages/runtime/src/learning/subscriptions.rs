use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use courier_core::transport::SubscriptionManager;
use courier_core::{Extensions, MessageType, TransportError};
use tokio::fs;
use tracing::info;

use super::path::sanitize;
use super::{remove_if_exists, write_atomic, EVENTS_DIR};

const SUBSCRIPTION_SUFFIX: &str = ".subscription";

/// Native subscriptions kept as one file per subscriber and event type.
#[derive(Debug)]
pub struct LearningSubscriptionManager {
    events_dir: PathBuf,
    endpoint: String,
    address: String,
}

impl LearningSubscriptionManager {
    #[must_use]
    pub fn new(root: &Path, endpoint: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            events_dir: root.join(EVENTS_DIR),
            endpoint: endpoint.into(),
            address: address.into(),
        }
    }

    fn subscription_file(&self, event_type: &MessageType) -> PathBuf {
        self.events_dir
            .join(sanitize(event_type.as_str()))
            .join(format!("{}{SUBSCRIPTION_SUFFIX}", sanitize(&self.endpoint)))
    }
}

#[async_trait]
impl SubscriptionManager for LearningSubscriptionManager {
    async fn subscribe(
        &self,
        event_type: &MessageType,
        _context: &Extensions,
    ) -> Result<(), TransportError> {
        let file = self.subscription_file(event_type);
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| TransportError::io(dir, e))?;
        }
        write_atomic(&file, self.address.as_bytes()).await?;
        info!(%event_type, endpoint = %self.endpoint, "subscribed");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        event_type: &MessageType,
        _context: &Extensions,
    ) -> Result<(), TransportError> {
        remove_if_exists(&self.subscription_file(event_type)).await?;
        info!(%event_type, endpoint = %self.endpoint, "unsubscribed");
        Ok(())
    }
}

/// Addresses subscribed to `event_type`, sorted and without duplicates.
pub(crate) async fn subscribers_for(
    root: &Path,
    event_type: &MessageType,
) -> Result<Vec<String>, TransportError> {
    let dir = root.join(EVENTS_DIR).join(sanitize(event_type.as_str()));
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TransportError::io(&dir, e)),
    };

    let mut addresses = BTreeSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TransportError::io(&dir, e))?
    {
        let path = entry.path();
        if !path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(SUBSCRIPTION_SUFFIX))
        {
            continue;
        }
        match fs::read_to_string(&path).await {
            Ok(address) if !address.trim().is_empty() => {
                addresses.insert(address.trim().to_string());
            }
            Ok(_) => {}
            // Removed by a concurrent unsubscribe.
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(TransportError::io(&path, e)),
        }
    }
    Ok(addresses.into_iter().collect())
}
