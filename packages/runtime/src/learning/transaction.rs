//! Claims: the receive transaction of the file transport.
//!
//! A message is claimed by renaming its metadata file into a fresh directory
//! under `.pending/`. The claim directory doubles as the staging area for
//! outgoing messages when sends are atomic with the receive.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use courier_core::transport::TransportTransactionMode;
use courier_core::TransportError;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{remove_if_exists, write_atomic, PENDING_DIR};

const OUTGOING_DIR: &str = "outgoing";

#[derive(Debug)]
struct PendingWrite {
    staged: PathBuf,
    target: PathBuf,
    body: PathBuf,
}

/// An exclusively owned message plus the sends enlisted while processing it.
#[derive(Debug)]
pub(crate) struct ClaimTransaction {
    mode: TransportTransactionMode,
    claim_dir: PathBuf,
    claimed_file: PathBuf,
    original: PathBuf,
    outgoing: Mutex<Vec<PendingWrite>>,
}

impl ClaimTransaction {
    /// Claims `file` from `queue_dir`.
    ///
    /// Returns `None` when another receiver claimed the file first; in that
    /// case nothing is left behind.
    pub(crate) async fn begin(
        queue_dir: &Path,
        file: &Path,
        mode: TransportTransactionMode,
    ) -> Result<Option<Self>, TransportError> {
        let Some(file_name) = file.file_name() else {
            return Ok(None);
        };
        let claim_dir = queue_dir
            .join(PENDING_DIR)
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&claim_dir)
            .await
            .map_err(|e| TransportError::io(&claim_dir, e))?;

        let claimed_file = claim_dir.join(file_name);
        match fs::rename(file, &claimed_file).await {
            Ok(()) => Ok(Some(Self {
                mode,
                claim_dir,
                claimed_file,
                original: file.to_path_buf(),
                outgoing: Mutex::new(Vec::new()),
            })),
            Err(e) => {
                let _ = fs::remove_dir_all(&claim_dir).await;
                if e.kind() == ErrorKind::NotFound {
                    debug!(file = %file.display(), "message already claimed");
                    Ok(None)
                } else {
                    Err(TransportError::io(file, e))
                }
            }
        }
    }

    pub(crate) fn claimed_file(&self) -> &Path {
        &self.claimed_file
    }

    /// Records an outgoing message whose body is already at `body`.
    ///
    /// With atomic sends the metadata is staged inside the claim and only
    /// becomes visible at [`commit`](Self::commit); otherwise it is written
    /// to `target` right away.
    pub(crate) async fn enlist(
        &self,
        target: PathBuf,
        metadata: &[u8],
        body: PathBuf,
    ) -> Result<(), TransportError> {
        if self.mode != TransportTransactionMode::SendsAtomicWithReceive {
            create_parent(&target).await?;
            return write_atomic(&target, metadata).await;
        }

        let outgoing_dir = self.claim_dir.join(OUTGOING_DIR);
        fs::create_dir_all(&outgoing_dir)
            .await
            .map_err(|e| TransportError::io(&outgoing_dir, e))?;
        let staged = outgoing_dir.join(format!("{}.metadata.txt", Uuid::new_v4()));
        write_atomic(&staged, metadata).await?;
        self.outgoing.lock().push(PendingWrite {
            staged,
            target,
            body,
        });
        Ok(())
    }

    /// Makes every staged message visible in its destination.
    pub(crate) async fn commit(&self) -> Result<(), TransportError> {
        let pending = std::mem::take(&mut *self.outgoing.lock());
        for write in pending {
            create_parent(&write.target).await?;
            fs::rename(&write.staged, &write.target)
                .await
                .map_err(|e| TransportError::io(&write.target, e))?;
        }
        Ok(())
    }

    /// Discards every staged message and its body.
    pub(crate) async fn rollback(&self) {
        let pending = std::mem::take(&mut *self.outgoing.lock());
        for write in pending {
            for path in [&write.staged, &write.body] {
                if let Err(e) = remove_if_exists(path).await {
                    warn!(error = %e, "failed to discard a rolled back send");
                }
            }
        }
    }

    /// Ends the claim; the message is gone from the queue for good.
    pub(crate) async fn complete(&self) -> Result<(), TransportError> {
        fs::remove_dir_all(&self.claim_dir)
            .await
            .map_err(|e| TransportError::io(&self.claim_dir, e))
    }

    /// Returns the message to its queue and ends the claim.
    pub(crate) async fn requeue(&self) -> Result<(), TransportError> {
        self.rollback().await;
        fs::rename(&self.claimed_file, &self.original)
            .await
            .map_err(|e| TransportError::io(&self.original, e))?;
        self.complete().await
    }
}

async fn create_parent(path: &Path) -> Result<(), TransportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransportError::io(parent, e))?;
    }
    Ok(())
}

/// Returns messages of claims older than `timeout` to `queue_dir`.
///
/// Staged sends of those claims were never committed and are dropped.
pub(crate) async fn recover_orphaned_claims(
    queue_dir: &Path,
    timeout: std::time::Duration,
) -> Result<usize, TransportError> {
    let pending_dir = queue_dir.join(PENDING_DIR);
    let mut claims = match fs::read_dir(&pending_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(TransportError::io(&pending_dir, e)),
    };

    let mut recovered = 0;
    while let Some(claim) = claims
        .next_entry()
        .await
        .map_err(|e| TransportError::io(&pending_dir, e))?
    {
        let claim_dir = claim.path();
        let age = claim
            .metadata()
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .and_then(|modified| modified.elapsed().ok());
        if !age.is_some_and(|age| age >= timeout) {
            continue;
        }

        let mut files = fs::read_dir(&claim_dir)
            .await
            .map_err(|e| TransportError::io(&claim_dir, e))?;
        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|e| TransportError::io(&claim_dir, e))?
        {
            let path = file.path();
            if super::file_id(&path).is_some() {
                let target = queue_dir.join(file.file_name());
                fs::rename(&path, &target)
                    .await
                    .map_err(|e| TransportError::io(&target, e))?;
                recovered += 1;
            }
        }
        fs::remove_dir_all(&claim_dir)
            .await
            .map_err(|e| TransportError::io(&claim_dir, e))?;
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn queue_with_message(root: &Path) -> (PathBuf, PathBuf) {
        let queue = root.join("sales");
        fs::create_dir_all(&queue).await.unwrap();
        let file = queue.join("m1.metadata.txt");
        fs::write(&file, b"{}").await.unwrap();
        (queue, file)
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, file) = queue_with_message(dir.path()).await;
        let mode = TransportTransactionMode::ReceiveOnly;

        let (first, second) = tokio::join!(
            ClaimTransaction::begin(&queue, &file, mode),
            ClaimTransaction::begin(&queue, &file, mode),
        );
        let winners = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .count();

        assert_eq!(winners, 1);
        assert!(!file.exists());
        // The loser leaves no claim directory behind.
        let claims = std::fs::read_dir(queue.join(PENDING_DIR)).unwrap().count();
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn staged_sends_appear_only_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, file) = queue_with_message(dir.path()).await;
        let claim = ClaimTransaction::begin(&queue, &file, TransportTransactionMode::SendsAtomicWithReceive)
            .await
            .unwrap()
            .unwrap();

        let target = dir.path().join("billing").join("out.metadata.txt");
        claim
            .enlist(target.clone(), b"{}", dir.path().join("billing/.bodies/out.body.txt"))
            .await
            .unwrap();
        assert!(!target.exists());

        claim.commit().await.unwrap();
        assert!(target.exists());
        claim.complete().await.unwrap();
        assert!(!claim.claimed_file().exists());
    }

    #[tokio::test]
    async fn rollback_discards_staged_sends_and_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, file) = queue_with_message(dir.path()).await;
        let claim = ClaimTransaction::begin(&queue, &file, TransportTransactionMode::SendsAtomicWithReceive)
            .await
            .unwrap()
            .unwrap();
        let body = dir.path().join("out.body.txt");
        fs::write(&body, b"payload").await.unwrap();
        let target = dir.path().join("billing").join("out.metadata.txt");

        claim.enlist(target.clone(), b"{}", body.clone()).await.unwrap();
        claim.rollback().await;
        claim.commit().await.unwrap();

        assert!(!target.exists());
        assert!(!body.exists());
    }

    #[tokio::test]
    async fn receive_only_sends_are_written_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, file) = queue_with_message(dir.path()).await;
        let claim = ClaimTransaction::begin(&queue, &file, TransportTransactionMode::ReceiveOnly)
            .await
            .unwrap()
            .unwrap();
        let target = dir.path().join("billing").join("out.metadata.txt");

        claim
            .enlist(target.clone(), b"{}", dir.path().join("unused"))
            .await
            .unwrap();

        assert!(target.exists());
    }

    #[tokio::test]
    async fn requeue_returns_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, file) = queue_with_message(dir.path()).await;
        let claim = ClaimTransaction::begin(&queue, &file, TransportTransactionMode::ReceiveOnly)
            .await
            .unwrap()
            .unwrap();

        claim.requeue().await.unwrap();

        assert!(file.exists());
        assert_eq!(std::fs::read_dir(queue.join(PENDING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn orphaned_claims_are_recovered_after_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, file) = queue_with_message(dir.path()).await;
        let claim = ClaimTransaction::begin(&queue, &file, TransportTransactionMode::ReceiveOnly)
            .await
            .unwrap()
            .unwrap();
        drop(claim);

        assert_eq!(
            recover_orphaned_claims(&queue, Duration::from_secs(3600)).await.unwrap(),
            0
        );
        assert_eq!(recover_orphaned_claims(&queue, Duration::ZERO).await.unwrap(), 1);
        assert!(file.exists());
    }
}
