//! LLM Model Manager
//!
//! Model catalog and weight-file downloads.
//!
//! Module structure:
//! - types.rs: ModelDescriptor, DownloadId, DownloadStatus, FailureReason
//! - registry.rs: built-in catalog, local file lookup
//! - downloader.rs: DownloadService, DownloadRegistry, HttpDownloadService

pub mod types;
pub mod registry;
pub mod downloader;

pub use types::{DownloadId, DownloadSnapshot, DownloadStatus, FailureReason, ModelDescriptor};
pub use registry::{available_models, find_file_named, ModelCatalog};
pub use downloader::{
    progress_update, DownloadRegistry, DownloadRequest, DownloadService, HttpDownloadService,
};
