//! Native engine boundary traits and types
//!
//! Defines the narrow interface through which the orchestrator drives the
//! native inference library. Every call here may block for a long time (model
//! loading, decode steps), so callers run them on the blocking pool.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Error types for engine and download operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// A native call returned a non-zero status
    #[error("Native call `{call}` failed with status {code}")]
    NativeCall { call: &'static str, code: i32 },
    /// Model file missing or not resolvable
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    /// A decode task is already running against the session
    #[error("Generation already in progress")]
    GenerationInProgress,
    /// Background task panicked or was aborted
    #[error("Background task failed: {0}")]
    TaskFailed(String),
    #[error("{0}")]
    Other(String),
}

impl From<tokio::task::JoinError> for LlmError {
    fn from(e: tokio::task::JoinError) -> Self {
        LlmError::TaskFailed(e.to_string())
    }
}

/// Outcome of a single decode step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// More tokens may follow
    Continue,
    /// End of generation (end-of-turn, context exhausted, or native error)
    Done,
}

/// Prompt template applied by the session around every user turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub input_prefix: Option<String>,
    pub input_suffix: Option<String>,
    pub stop_sequences: Vec<String>,
}

/// Process-wide native engine.
///
/// Exactly one instance is created at application start and injected into the
/// orchestrator; it is never instantiated twice.
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logging (e.g. "llama.cpp")
    fn backend_name(&self) -> &'static str;

    /// Initialize the native library
    fn init(&self) -> Result<(), LlmError>;

    /// Bootstrap the GPU backend, if any
    fn load_accelerator(&self) -> Result<(), LlmError>;

    /// Load model weights. `on_progress` receives values in `0.0..=1.0`.
    fn load_model(
        &self,
        path: &Path,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<Box<dyn ModelHandle>, LlmError>;
}

/// A loaded model
pub trait ModelHandle: Send {
    /// Size of the loaded weights in bytes
    fn size(&self) -> u64;

    /// Create a generation context bound to the given prompt template
    fn create_session(&mut self, config: &SessionConfig)
        -> Result<Box<dyn GenerationSession>, LlmError>;

    /// Release the weights
    fn unload(&mut self);
}

/// One loaded model's active context
pub trait GenerationSession: Send {
    /// Submit a user turn to the context
    fn add_message(&mut self, text: &str) -> Result<(), LlmError>;

    /// Run one decode step, streaming raw token bytes to `on_tokens`.
    ///
    /// Fragments are not guaranteed to end on UTF-8 boundaries.
    fn generate(&mut self, on_tokens: &mut dyn FnMut(&[u8])) -> StepStatus;

    /// Native-formatted timing report
    fn report(&self) -> String;

    /// Discarded decode run that pays first-turn initialization cost
    fn warm_up(&mut self) -> Result<(), LlmError> {
        Ok(())
    }

    /// Release the context
    fn destroy(&mut self);
}

impl fmt::Debug for dyn GenerationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GenerationSession")
    }
}

impl fmt::Debug for dyn ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelHandle({} bytes)", self.size())
    }
}
