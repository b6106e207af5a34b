// LLM Engine - Model Loading and Session Setup
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::model_manager::ModelDescriptor;
use super::provider::{GenerationSession, InferenceBackend, LlmError, ModelHandle};

/// Session shared between the orchestrator and the decode task.
///
/// The mutex is held for one native call at a time, so a report can be
/// fetched between decode steps and destroy always waits for the current step.
pub type SharedSession = Arc<Mutex<Box<dyn GenerationSession>>>;

/// A model with its generation session, ready for chat
pub struct LoadedModel {
    /// Descriptor as published once ready (description = formatted size)
    pub descriptor: ModelDescriptor,
    pub size_bytes: u64,
    model: Box<dyn ModelHandle>,
    session: SharedSession,
}

impl LoadedModel {
    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }
}

/// Format a byte count with decimal units, e.g. "1.23 GB"
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else if value < 10.0 {
        format!("{:.2} {}", value, UNITS[unit])
    } else if value < 100.0 {
        format!("{:.1} {}", value, UNITS[unit])
    } else {
        format!("{:.0} {}", value, UNITS[unit])
    }
}

/// Runs the blocking load sequence against the backend.
///
/// Cheap to clone; moved onto the blocking pool for each load.
#[derive(Clone)]
pub struct ModelLoader {
    backend: Arc<dyn InferenceBackend>,
    initialized: Arc<AtomicBool>,
    use_accelerator: bool,
    warm_up: bool,
}

impl ModelLoader {
    pub(crate) fn new(
        backend: Arc<dyn InferenceBackend>,
        initialized: Arc<AtomicBool>,
        use_accelerator: bool,
        warm_up: bool,
    ) -> Self {
        Self {
            backend,
            initialized,
            use_accelerator,
            warm_up,
        }
    }

    /// Native init and accelerator bootstrap, once per process
    pub fn ensure_initialized(&self) -> Result<(), LlmError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        log::info!("Initializing {} backend", self.backend.backend_name());
        self.backend.init()?;

        if self.use_accelerator {
            self.backend.load_accelerator()?;
            log::info!("Accelerator backend loaded");
        } else {
            log::info!("Accelerator disabled - using CPU processing");
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Load weights, create the session and optionally warm it up. Blocking.
    ///
    /// `on_progress` receives the raw load fraction from the backend.
    pub fn load(
        &self,
        descriptor: &ModelDescriptor,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<LoadedModel, LlmError> {
        let path = descriptor
            .file
            .as_ref()
            .ok_or_else(|| LlmError::ModelNotFound(descriptor.name.clone()))?;

        self.ensure_initialized()?;

        log::info!("Loading model '{}' from {}", descriptor.name, path.display());
        let mut model = self.backend.load_model(path, on_progress)?;

        let size_bytes = model.size();
        let size_description = format_file_size(size_bytes);

        let mut session = match model.create_session(&descriptor.session_config()) {
            Ok(session) => session,
            Err(e) => {
                model.unload();
                return Err(e);
            }
        };

        if self.warm_up {
            if let Err(e) = session.warm_up() {
                session.destroy();
                model.unload();
                return Err(e);
            }
            log::debug!("Warm-up pass finished for '{}'", descriptor.name);
        }

        log::info!(
            "Successfully loaded model: {} ({})",
            descriptor.name,
            size_description
        );

        Ok(LoadedModel {
            descriptor: descriptor.with_description(size_description),
            size_bytes,
            model,
            session: Arc::new(Mutex::new(session)),
        })
    }
}

/// Destroy the session, then release the weights. Blocking.
///
/// Callers must have stopped any decode task first.
pub fn unload_model(loaded: LoadedModel) {
    let LoadedModel {
        descriptor,
        mut model,
        session,
        ..
    } = loaded;

    session.blocking_lock().destroy();
    model.unload();
    log::info!("Model '{}' unloaded", descriptor.name);
}
