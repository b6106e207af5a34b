//! Model download facility and pending-download bookkeeping
//!
//! `DownloadService` is the seam to whatever actually moves bytes (a platform
//! download manager, or `HttpDownloadService` below). The orchestrator only
//! enqueues, polls and removes; completions arrive as download ids on a
//! channel, mirroring a platform completion broadcast.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{DownloadId, DownloadSnapshot, DownloadStatus, FailureReason, ModelDescriptor};
use crate::llm_engine::provider::LlmError;

/// What to fetch and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub uri: String,
    pub destination: PathBuf,
    pub title: String,
}

/// Download facility. Calls may block briefly (status queries hit a local store).
pub trait DownloadService: Send + Sync {
    /// Queue a download and return its id
    fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, LlmError>;

    /// Current row for `id`, `None` if unknown or removed
    fn query(&self, id: DownloadId) -> Option<DownloadSnapshot>;

    /// Cancel and forget a download
    fn remove(&self, id: DownloadId);
}

/// Status text and progress for a polled row. `None` progress means "unchanged".
pub fn progress_update(snapshot: &DownloadSnapshot) -> (String, Option<f32>) {
    match &snapshot.status {
        DownloadStatus::Successful => ("Download completed".to_string(), Some(1.0)),
        DownloadStatus::Failed(reason) => (reason.message().to_string(), Some(0.0)),
        DownloadStatus::Paused => ("Download paused".to_string(), None),
        DownloadStatus::Pending => ("Download pending...".to_string(), Some(0.0)),
        DownloadStatus::Running => {
            let progress = snapshot.progress();
            (
                format!("Downloading {}%", (progress * 100.0) as u32),
                Some(progress),
            )
        }
    }
}

struct PendingDownload {
    id: DownloadId,
    model: ModelDescriptor,
    last_progress: f32,
    terminal_published: bool,
}

/// Download id → model mapping, in insertion order.
///
/// Entries are removed once their terminal status has been handled.
#[derive(Default)]
pub struct DownloadRegistry {
    entries: Vec<PendingDownload>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: DownloadId, model: ModelDescriptor) {
        self.entries.retain(|e| e.id != id);
        self.entries.push(PendingDownload {
            id,
            model,
            last_progress: 0.0,
            terminal_published: false,
        });
    }

    pub fn get(&self, id: DownloadId) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.model)
    }

    pub fn remove(&mut self, id: DownloadId) -> Option<ModelDescriptor> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index).model)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Most recently added download
    pub fn latest(&self) -> Option<(DownloadId, &ModelDescriptor)> {
        self.entries.last().map(|e| (e.id, &e.model))
    }

    /// Ids of every pending download for a model with this name
    pub fn ids_for_model(&self, name: &str) -> Vec<DownloadId> {
        self.entries
            .iter()
            .filter(|e| e.model.name == name)
            .map(|e| e.id)
            .collect()
    }

    /// Never report less than what was already published for `id`
    pub fn clamp_progress(&mut self, id: DownloadId, progress: f32) -> f32 {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                if progress > entry.last_progress {
                    entry.last_progress = progress;
                }
                entry.last_progress
            }
            None => progress,
        }
    }

    /// Record that the terminal status of `id` was published.
    ///
    /// Returns false if it already was, or if `id` is unknown.
    pub fn mark_terminal(&mut self, id: DownloadId) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) if !entry.terminal_published => {
                entry.terminal_published = true;
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// HTTP download service
// ============================================================================

enum TransferError {
    Cancelled,
    Failed(FailureReason),
}

/// Streams downloads over HTTP on the tokio runtime
pub struct HttpDownloadService {
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
    next_id: AtomicU64,
    downloads: Arc<DashMap<DownloadId, DownloadSnapshot>>,
    cancel_tokens: Arc<DashMap<DownloadId, CancellationToken>>,
    completions: mpsc::UnboundedSender<DownloadId>,
}

impl HttpDownloadService {
    /// Must be called from within a tokio runtime
    pub fn new(completions: mpsc::UnboundedSender<DownloadId>) -> Result<Self, LlmError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LlmError::Other(format!("No tokio runtime: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(7200)) // large models
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| LlmError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            runtime,
            next_id: AtomicU64::new(1),
            downloads: Arc::new(DashMap::new()),
            cancel_tokens: Arc::new(DashMap::new()),
            completions,
        })
    }

    /// Service plus the receiving end of its completion notifications
    pub fn channel() -> Result<(Self, mpsc::UnboundedReceiver<DownloadId>), LlmError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Self::new(tx)?, rx))
    }

    fn finish(&self, id: DownloadId, status: DownloadStatus) {
        if let Some(mut row) = self.downloads.get_mut(&id) {
            row.status = status;
        }
        self.cancel_tokens.remove(&id);
        let _ = self.completions.send(id);
    }
}

impl DownloadService for HttpDownloadService {
    fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, LlmError> {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.downloads.insert(id, DownloadSnapshot::pending());

        log::info!(
            "Download {} queued: {} -> {}",
            id,
            request.uri,
            request.destination.display()
        );

        if request.destination.exists() {
            log::warn!("Download {} target already exists", id);
            self.finish(id, DownloadStatus::Failed(FailureReason::FileAlreadyExists));
            return Ok(id);
        }

        let token = CancellationToken::new();
        self.cancel_tokens.insert(id, token.clone());

        let client = self.client.clone();
        let downloads = self.downloads.clone();
        let cancel_tokens = self.cancel_tokens.clone();
        let completions = self.completions.clone();

        self.runtime.spawn(async move {
            let result = transfer(&client, &request, id, &downloads, &token).await;
            cancel_tokens.remove(&id);

            let status = match result {
                Ok(()) => {
                    log::info!("Download {} completed: {}", id, request.destination.display());
                    DownloadStatus::Successful
                }
                Err(TransferError::Cancelled) => {
                    log::info!("Download {} cancelled", id);
                    return;
                }
                Err(TransferError::Failed(reason)) => {
                    log::error!("Download {} failed: {}", id, reason);
                    DownloadStatus::Failed(reason)
                }
            };

            if let Some(mut row) = downloads.get_mut(&id) {
                row.status = status;
            }
            let _ = completions.send(id);
        });

        Ok(id)
    }

    fn query(&self, id: DownloadId) -> Option<DownloadSnapshot> {
        self.downloads.get(&id).map(|row| row.clone())
    }

    fn remove(&self, id: DownloadId) {
        if let Some((_, token)) = self.cancel_tokens.remove(&id) {
            token.cancel();
        }
        if self.downloads.remove(&id).is_some() {
            log::info!("Download {} removed", id);
        }
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

fn map_io_error(e: &std::io::Error) -> FailureReason {
    // ENOSPC
    if e.raw_os_error() == Some(28) {
        FailureReason::InsufficientSpace
    } else {
        FailureReason::FileError
    }
}

fn map_http_error(e: &reqwest::Error) -> FailureReason {
    if e.is_redirect() {
        FailureReason::TooManyRedirects
    } else if e.is_status() {
        FailureReason::UnhandledHttpCode
    } else {
        FailureReason::HttpDataError
    }
}

async fn transfer(
    client: &reqwest::Client,
    request: &DownloadRequest,
    id: DownloadId,
    downloads: &DashMap<DownloadId, DownloadSnapshot>,
    token: &CancellationToken,
) -> Result<(), TransferError> {
    if let Some(parent) = request.destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            log::error!("Download {}: cannot create {}: {}", id, parent.display(), e);
            TransferError::Failed(FailureReason::DeviceNotFound)
        })?;
    }

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(TransferError::Cancelled),
        response = client.get(&request.uri).send() => {
            response.map_err(|e| TransferError::Failed(map_http_error(&e)))?
        }
    };

    if !response.status().is_success() {
        log::error!("Download {} failed with status: {}", id, response.status());
        return Err(TransferError::Failed(FailureReason::UnhandledHttpCode));
    }

    let total_bytes = response.content_length().unwrap_or(0);
    if let Some(mut row) = downloads.get_mut(&id) {
        row.status = DownloadStatus::Running;
        row.total_bytes = total_bytes;
    }

    let temp_path = partial_path(&request.destination);
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| TransferError::Failed(map_io_error(&e)))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break Err(TransferError::Cancelled),
            next = stream.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break Err(TransferError::Failed(map_http_error(&e))),
            None => break Ok(()),
        };

        if let Err(e) = file.write_all(&chunk).await {
            break Err(TransferError::Failed(map_io_error(&e)));
        }

        downloaded += chunk.len() as u64;
        if let Some(mut row) = downloads.get_mut(&id) {
            row.downloaded_bytes = downloaded;
        }
    };

    let result = match result {
        Ok(()) => file
            .flush()
            .await
            .map_err(|e| TransferError::Failed(map_io_error(&e))),
        Err(e) => Err(e),
    };
    drop(file);

    if let Err(e) = result {
        tokio::fs::remove_file(&temp_path).await.ok();
        return Err(e);
    }

    tokio::fs::rename(&temp_path, &request.destination)
        .await
        .map_err(|e| TransferError::Failed(map_io_error(&e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn model(name: &str) -> ModelDescriptor {
        ModelDescriptor::new(name, "test")
    }

    #[test]
    fn test_registry_latest_is_most_recent() {
        let mut registry = DownloadRegistry::new();
        assert!(registry.latest().is_none());

        registry.insert(DownloadId(7), model("a"));
        registry.insert(DownloadId(3), model("b"));
        assert_eq!(registry.latest().map(|(id, _)| id), Some(DownloadId(3)));

        assert_eq!(registry.remove(DownloadId(3)).map(|m| m.name), Some("b".to_string()));
        assert_eq!(registry.latest().map(|(id, _)| id), Some(DownloadId(7)));
        assert!(registry.remove(DownloadId(3)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_ids_for_model() {
        let mut registry = DownloadRegistry::new();
        registry.insert(DownloadId(1), model("a"));
        registry.insert(DownloadId(2), model("b"));
        registry.insert(DownloadId(3), model("a"));
        assert_eq!(registry.ids_for_model("a"), vec![DownloadId(1), DownloadId(3)]);
        assert!(registry.ids_for_model("c").is_empty());
    }

    #[test]
    fn test_clamp_progress_is_monotonic() {
        let mut registry = DownloadRegistry::new();
        registry.insert(DownloadId(1), model("a"));
        assert_eq!(registry.clamp_progress(DownloadId(1), 0.4), 0.4);
        assert_eq!(registry.clamp_progress(DownloadId(1), 0.0), 0.4);
        assert_eq!(registry.clamp_progress(DownloadId(1), 0.9), 0.9);
    }

    #[test]
    fn test_terminal_published_once() {
        let mut registry = DownloadRegistry::new();
        registry.insert(DownloadId(1), model("a"));
        assert!(registry.mark_terminal(DownloadId(1)));
        assert!(!registry.mark_terminal(DownloadId(1)));
        assert!(!registry.mark_terminal(DownloadId(2)));
    }

    #[test]
    fn test_progress_update_text() {
        let mut snapshot = DownloadSnapshot::pending();
        assert_eq!(
            progress_update(&snapshot),
            ("Download pending...".to_string(), Some(0.0))
        );

        snapshot.status = DownloadStatus::Running;
        snapshot.downloaded_bytes = 333;
        snapshot.total_bytes = 1000;
        let (text, progress) = progress_update(&snapshot);
        assert_eq!(text, "Downloading 33%");
        assert!((progress.unwrap() - 0.333).abs() < 1e-6);

        snapshot.status = DownloadStatus::Paused;
        assert_eq!(progress_update(&snapshot), ("Download paused".to_string(), None));

        snapshot.status = DownloadStatus::Failed(FailureReason::InsufficientSpace);
        assert_eq!(
            progress_update(&snapshot),
            ("Insufficient storage space".to_string(), Some(0.0))
        );
    }

    async fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}/models/test-1b.gguf", addr)
    }

    #[tokio::test]
    async fn test_http_download_success() {
        let dir = tempdir().unwrap();
        let uri = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789",
        )
        .await;

        let (service, mut completions) = HttpDownloadService::channel().unwrap();
        let destination = dir.path().join("test-1b.gguf");
        let id = service
            .enqueue(DownloadRequest {
                uri,
                destination: destination.clone(),
                title: "test-1b.gguf".to_string(),
            })
            .unwrap();

        let done = tokio::time::timeout(Duration::from_secs(10), completions.recv())
            .await
            .unwrap();
        assert_eq!(done, Some(id));

        let row = service.query(id).unwrap();
        assert_eq!(row.status, DownloadStatus::Successful);
        assert_eq!(row.downloaded_bytes, 10);
        assert_eq!(std::fs::read(&destination).unwrap(), b"0123456789");
        assert!(!partial_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_http_download_bad_status() {
        let dir = tempdir().unwrap();
        let uri = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        let (service, mut completions) = HttpDownloadService::channel().unwrap();
        let id = service
            .enqueue(DownloadRequest {
                uri,
                destination: dir.path().join("test-1b.gguf"),
                title: "test-1b.gguf".to_string(),
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), completions.recv())
            .await
            .unwrap();
        assert_eq!(
            service.query(id).unwrap().status,
            DownloadStatus::Failed(FailureReason::UnhandledHttpCode)
        );
        assert!(!dir.path().join("test-1b.gguf").exists());
    }

    #[tokio::test]
    async fn test_existing_destination_fails_immediately() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("test-1b.gguf");
        std::fs::write(&destination, b"old").unwrap();

        let (service, mut completions) = HttpDownloadService::channel().unwrap();
        let id = service
            .enqueue(DownloadRequest {
                uri: "http://127.0.0.1:1/test-1b.gguf".to_string(),
                destination,
                title: "test-1b.gguf".to_string(),
            })
            .unwrap();

        assert_eq!(completions.recv().await, Some(id));
        assert_eq!(
            service.query(id).unwrap().status,
            DownloadStatus::Failed(FailureReason::FileAlreadyExists)
        );

        service.remove(id);
        assert!(service.query(id).is_none());
        service.remove(DownloadId(999));
    }
}
