use crate::core_disk::error::DiskError;
use log::{debug, trace};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum FlushRequest {
    /// Write the buffer, hand it back emptied for reuse.
    Write(Vec<u8>, oneshot::Sender<Result<Vec<u8>, DiskError>>),
    Close(oneshot::Sender<Result<(), DiskError>>),
}

/// Producer/consumer writer for one target file.
///
/// A background task owns the file. At most one buffer is being written while
/// the caller fills the next one; submitting a second full buffer waits for the
/// first to land on disk, which is what stalls the network reader.
pub struct DiskFlusher {
    path: PathBuf,
    tx: mpsc::Sender<FlushRequest>,
    in_flight: Option<oneshot::Receiver<Result<Vec<u8>, DiskError>>>,
    /// Buffer handed back by a write that finished while nobody was waiting.
    spare: Option<Vec<u8>>,
    task: JoinHandle<()>,
    submitted: u64,
}

impl DiskFlusher {
    /// Creates (or truncates) the target, or opens it for appending when resuming.
    pub async fn create(path: &Path, append: bool) -> Result<Self, DiskError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await
            .map_err(|e| DiskError::CreateFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        debug!("Opened {} for writing (append: {})", path.display(), append);

        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(Self::run(path.to_path_buf(), file, rx));
        Ok(Self {
            path: path.to_path_buf(),
            tx,
            in_flight: None,
            spare: None,
            task,
            submitted: 0,
        })
    }

    async fn run(path: PathBuf, mut file: File, mut rx: mpsc::Receiver<FlushRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                FlushRequest::Write(mut buffer, done) => {
                    let result = file.write_all(&buffer).await.map_err(|e| DiskError::WriteFailed {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                    trace!("Flushed {} bytes to {}", buffer.len(), path.display());
                    buffer.clear();
                    let _ = done.send(result.map(|_| buffer));
                }
                FlushRequest::Close(done) => {
                    let result = file.flush().await.map_err(|e| DiskError::WriteFailed {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                    let _ = done.send(result);
                    return;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes handed to the writer so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Whether a buffer is still on its way to disk. A write that has landed
    /// is collected here, its error (if any) surfaces now.
    pub fn is_flushing(&mut self) -> Result<bool, DiskError> {
        let Some(rx) = self.in_flight.as_mut() else {
            return Ok(false);
        };
        match rx.try_recv() {
            Ok(result) => {
                self.in_flight = None;
                self.spare = Some(result?);
                Ok(false)
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(true),
            Err(oneshot::error::TryRecvError::Closed) => {
                self.in_flight = None;
                Err(DiskError::WriterGone(self.path.clone()))
            }
        }
    }

    /// Waits for the buffer currently being written, returning it for reuse.
    pub async fn wait_in_flight(&mut self) -> Result<Option<Vec<u8>>, DiskError> {
        match self.in_flight.take() {
            Some(rx) => {
                let buffer = rx
                    .await
                    .map_err(|_| DiskError::WriterGone(self.path.clone()))??;
                Ok(Some(buffer))
            }
            None => Ok(None),
        }
    }

    /// Queues `buffer` for writing and returns an empty buffer to keep filling.
    pub async fn submit(&mut self, buffer: Vec<u8>) -> Result<Vec<u8>, DiskError> {
        let capacity = buffer.capacity();
        let recycled = match self.wait_in_flight().await? {
            Some(buffer) => Some(buffer),
            None => self.spare.take(),
        };
        self.submitted += buffer.len() as u64;

        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(FlushRequest::Write(buffer, done_tx))
            .await
            .map_err(|_| DiskError::WriterGone(self.path.clone()))?;
        self.in_flight = Some(done_rx);

        match recycled {
            Some(buffer) => Ok(buffer),
            None => {
                let mut fresh = Vec::new();
                fresh
                    .try_reserve_exact(capacity)
                    .map_err(|_| DiskError::LowMemory)?;
                Ok(fresh)
            }
        }
    }

    /// Writes what is left, flushes and closes the file.
    pub async fn close(mut self, rest: Vec<u8>) -> Result<u64, DiskError> {
        if !rest.is_empty() {
            self.submit(rest).await?;
        }
        self.wait_in_flight().await?;
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(FlushRequest::Close(done_tx))
            .await
            .map_err(|_| DiskError::WriterGone(self.path.clone()))?;
        done_rx
            .await
            .map_err(|_| DiskError::WriterGone(self.path.clone()))??;
        let _ = self.task.await;
        debug!("Closed {} after {} bytes", self.path.display(), self.submitted);
        Ok(self.submitted)
    }
}
