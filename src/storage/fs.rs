//! Background JSON-file persistence
//!
//! Entities are mirrored to `<storage_dir>/<collection>/<name>/` as one
//! JSON file per record plus a sidecar `__metadata__.json`. Callers
//! enqueue writes fire-and-forget; a single writer task applies them in
//! submission order, which also serializes writes per entity id.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

/// One unit of persistence work.
#[derive(Debug)]
pub enum WriteJob {
    Put { path: PathBuf, bytes: Vec<u8> },
    Delete { path: PathBuf },
    /// Remove a whole entity directory (purge)
    DeleteDir { path: PathBuf },
}

/// Handle to the background writer.
///
/// Cloning shares the same writer task. Dropping all handles closes the
/// channel and lets the task drain and exit.
#[derive(Clone)]
pub struct BackgroundWriter {
    tx: UnboundedSender<WriteJob>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl BackgroundWriter {
    /// Spawn the writer task.
    #[must_use]
    pub fn start() -> Self {
        let (tx, mut rx) = unbounded_channel::<WriteJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());

        let task_pending = Arc::clone(&pending);
        let task_drained = Arc::clone(&drained);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = apply(job).await {
                    log::warn!("Storage write failed: {e}");
                }
                if task_pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    task_drained.notify_waiters();
                }
            }
        });

        Self { tx, pending, drained }
    }

    /// Enqueue a write without waiting for it to land.
    pub fn submit(&self, job: WriteJob) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            // writer task gone; undo the accounting so flush() terminates
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::warn!("Background writer is closed, dropping write");
        }
    }

    /// Serialize a value and enqueue it as a pretty-printed JSON file.
    pub fn submit_json<T: serde::Serialize>(&self, path: PathBuf, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => self.submit(WriteJob::Put { path, bytes }),
            Err(e) => log::warn!("Skipping unserializable record for {}: {e}", path.display()),
        }
    }

    /// Wait until every previously submitted job has been applied.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn apply(job: WriteJob) -> std::io::Result<()> {
    match job {
        WriteJob::Put { path, bytes } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, bytes).await
        }
        WriteJob::Delete { path } => match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
        WriteJob::DeleteDir { path } => match tokio::fs::remove_dir_all(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_land_in_submission_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queues/default/abc.json");
        let writer = BackgroundWriter::start();

        writer.submit(WriteJob::Put { path: path.clone(), bytes: b"first".to_vec() });
        writer.submit(WriteJob::Put { path: path.clone(), bytes: b"second".to_vec() });
        writer.flush().await;

        let content = tokio::fs::read_to_string(&path).await.expect("file exists");
        assert_eq!(content, "second");
    }

    #[tokio::test]
    async fn test_delete_of_missing_file_is_silent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = BackgroundWriter::start();
        writer.submit(WriteJob::Delete { path: dir.path().join("nope.json") });
        writer.flush().await;
    }

    #[tokio::test]
    async fn test_flush_with_no_pending_returns_immediately() {
        let writer = BackgroundWriter::start();
        writer.flush().await;
    }
}
