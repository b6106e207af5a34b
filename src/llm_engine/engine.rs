//! LLM Engine - owns the native backend and the currently loaded model
//!
//! One engine is created at application start and handed to the orchestrator.
//! Loading itself happens on the blocking pool through a `ModelLoader`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::llm_engine::model_loader::{LoadedModel, ModelLoader, SharedSession};
use crate::llm_engine::model_manager::ModelDescriptor;
use crate::llm_engine::provider::InferenceBackend;

pub struct LlmEngine {
    backend: Arc<dyn InferenceBackend>,
    /// Set once native init (and accelerator bootstrap) succeeded
    initialized: Arc<AtomicBool>,
    use_accelerator: bool,
    warm_up: bool,
    loaded: Option<LoadedModel>,
}

impl LlmEngine {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            initialized: Arc::new(AtomicBool::new(false)),
            use_accelerator: true,
            warm_up: true,
            loaded: None,
        }
    }

    pub fn with_options(mut self, use_accelerator: bool, warm_up: bool) -> Self {
        self.use_accelerator = use_accelerator;
        self.warm_up = warm_up;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Loader sharing this engine's backend and init state
    pub fn loader(&self) -> ModelLoader {
        ModelLoader::new(
            self.backend.clone(),
            self.initialized.clone(),
            self.use_accelerator,
            self.warm_up,
        )
    }

    /// Store a freshly loaded model. Any previous model must have been taken first.
    pub fn install(&mut self, loaded: LoadedModel) {
        if let Some(previous) = self.loaded.replace(loaded) {
            log::warn!(
                "Replacing loaded model '{}' without unloading",
                previous.descriptor.name
            );
        }
    }

    /// Remove the loaded model so it can be unloaded off the async runtime
    pub fn take_loaded(&mut self) -> Option<LoadedModel> {
        self.loaded.take()
    }

    pub fn session(&self) -> Option<SharedSession> {
        self.loaded.as_ref().map(|m| m.session())
    }

    pub fn current_model(&self) -> Option<&ModelDescriptor> {
        self.loaded.as_ref().map(|m| &m.descriptor)
    }

    pub fn is_model_loaded(&self) -> bool {
        self.loaded.is_some()
    }
}
