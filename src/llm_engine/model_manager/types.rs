//! Model catalog and download types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::llm_engine::provider::SessionConfig;

/// Metadata for one selectable model.
///
/// Never mutated in place: every lifecycle transition produces a copy through
/// one of the `with_*` methods, so observers always hold a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Human-readable name
    pub name: String,
    /// Local weights file, if present on disk
    pub file: Option<PathBuf>,
    /// Remote download location
    pub remote_uri: Option<String>,
    /// In-flight download, if any
    pub download_id: Option<DownloadId>,
    /// Text inserted before every user turn
    pub input_prefix: Option<String>,
    /// Text inserted after every user turn
    pub input_suffix: Option<String>,
    /// Sequences that end the assistant turn; stripped from displayed output
    pub stop_sequences: Vec<String>,
    /// Description or current status text
    pub description: String,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
            remote_uri: None,
            download_id: None,
            input_prefix: None,
            input_suffix: None,
            stop_sequences: Vec::new(),
            description: description.into(),
        }
    }

    pub fn with_description(&self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self.clone()
        }
    }

    pub fn with_file(&self, file: PathBuf) -> Self {
        Self {
            file: Some(file),
            ..self.clone()
        }
    }

    pub fn with_download_id(&self, id: DownloadId) -> Self {
        Self {
            download_id: Some(id),
            ..self.clone()
        }
    }

    /// Last path segment of the remote URI, ignoring any query string
    pub fn remote_file_name(&self) -> Option<String> {
        let uri = self.remote_uri.as_deref()?;
        let parsed = url::Url::parse(uri).ok()?;
        parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(|s| s.to_string())
    }

    /// Prompt template for sessions created from this model
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            input_prefix: self.input_prefix.clone(),
            input_suffix: self.input_suffix.clone(),
            stop_sequences: self.stop_sequences.clone(),
        }
    }
}

/// Identifier handed out by the download facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Download status as reported by the download facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Pending,
    Running,
    Paused,
    Successful,
    Failed(FailureReason),
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Successful | DownloadStatus::Failed(_))
    }
}

/// Why a download failed. Display only; failures are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Unknown,
    FileError,
    UnhandledHttpCode,
    HttpDataError,
    TooManyRedirects,
    InsufficientSpace,
    DeviceNotFound,
    CannotResume,
    FileAlreadyExists,
}

impl FailureReason {
    pub fn message(&self) -> &'static str {
        match self {
            FailureReason::Unknown => "Unknown error occurred",
            FailureReason::FileError => "Storage issue",
            FailureReason::UnhandledHttpCode => "Unhandled HTTP code",
            FailureReason::HttpDataError => "HTTP data error",
            FailureReason::TooManyRedirects => "Too many redirects",
            FailureReason::InsufficientSpace => "Insufficient storage space",
            FailureReason::DeviceNotFound => "External device not found",
            FailureReason::CannotResume => "Cannot resume download",
            FailureReason::FileAlreadyExists => "File already exists",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// One row of the download facility's status table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    /// Zero when the server did not announce a length
    pub total_bytes: u64,
}

impl DownloadSnapshot {
    pub fn pending() -> Self {
        Self {
            status: DownloadStatus::Pending,
            downloaded_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Fraction downloaded, 0.0 when the total is unknown
    pub fn progress(&self) -> f32 {
        if self.total_bytes > 0 {
            (self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0) as f32
        } else {
            0.0
        }
    }
}
