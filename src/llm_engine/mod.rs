//! LLM Engine module - the native inference boundary
//!
//! - provider.rs: boundary traits (backend, model, session) and `LlmError`
//! - engine.rs: `LlmEngine`, the explicitly owned engine handle
//! - model_loader.rs: blocking load/unload sequence
//! - model_manager/: model catalog and downloads

pub mod provider;
pub mod engine;
pub mod model_loader;
pub mod model_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::{
    GenerationSession, InferenceBackend, LlmError, ModelHandle, SessionConfig, StepStatus,
};
pub use engine::LlmEngine;
pub use model_loader::{format_file_size, LoadedModel, ModelLoader, SharedSession};
