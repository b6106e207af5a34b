//! Conversation orchestrator
//!
//! Owns the transcript and the model lifecycle, drives the engine on the
//! blocking pool, and bridges streamed tokens into the observable transcript.
//!
//! Lock order: `engine` before `registry`. The engine lock is the point that
//! serializes session ownership: load, unload and `add_message` all take it,
//! while the decode task only holds its own clone of the session.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::completion::{run_decode_loop, DecodeOutcome};
use crate::chat::task_registry::TaskRegistry;
use crate::chat::transcript::ConversationTranscript;
use crate::chat::types::Message;
use crate::config::OrchestratorConfig;
use crate::llm_engine::engine::LlmEngine;
use crate::llm_engine::model_loader::{unload_model, LoadedModel};
use crate::llm_engine::model_manager::{
    find_file_named, progress_update, DownloadId, DownloadRegistry, DownloadRequest,
    DownloadService, DownloadStatus, ModelCatalog, ModelDescriptor,
};
use crate::llm_engine::provider::LlmError;
use crate::state::{Lifecycle, LifecycleState, Observers};

struct Inner {
    config: OrchestratorConfig,
    catalog: ModelCatalog,
    engine: tokio::sync::Mutex<LlmEngine>,
    downloads: Arc<dyn DownloadService>,
    registry: tokio::sync::Mutex<DownloadRegistry>,
    poller: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Lifecycle,
    transcript: Arc<ConversationTranscript>,
    models: watch::Sender<Vec<ModelDescriptor>>,
    tasks: TaskRegistry,
}

/// Drives model lifecycle and chat generation. Cheap to clone.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    inner: Arc<Inner>,
}

impl ConversationOrchestrator {
    /// Orchestrator over the built-in catalog in `config.downloads_dir`
    pub fn new(
        engine: LlmEngine,
        downloads: Arc<dyn DownloadService>,
        config: OrchestratorConfig,
    ) -> Self {
        let catalog = ModelCatalog::new(config.downloads_dir.clone());
        Self::with_catalog(engine, downloads, config, catalog)
    }

    pub fn with_catalog(
        engine: LlmEngine,
        downloads: Arc<dyn DownloadService>,
        config: OrchestratorConfig,
        catalog: ModelCatalog,
    ) -> Self {
        let engine = engine.with_options(config.use_accelerator, config.warm_up);
        let (models, _) = watch::channel(Vec::new());

        log::info!(
            "Conversation orchestrator using {} backend, models in {}",
            engine.backend_name(),
            catalog.downloads_dir().display()
        );

        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                engine: tokio::sync::Mutex::new(engine),
                downloads,
                registry: tokio::sync::Mutex::new(DownloadRegistry::new()),
                poller: Mutex::new(None),
                lifecycle: Lifecycle::new(),
                transcript: Arc::new(ConversationTranscript::new()),
                models,
                tasks: TaskRegistry::new(),
            }),
        }
    }

    // === Observables ===

    pub fn subscribe(&self) -> Observers {
        Observers {
            lifecycle: self.inner.lifecycle.subscribe(),
            transcript: self.inner.transcript.subscribe(),
            models: self.inner.models.subscribe(),
        }
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.lifecycle.get()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.inner.transcript.snapshot()
    }

    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.inner.models.borrow().clone()
    }

    pub fn loaded_model(&self) -> Option<ModelDescriptor> {
        self.lifecycle().model().cloned()
    }

    pub fn is_generating(&self) -> bool {
        self.lifecycle().is_generating()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    // === Catalog ===

    /// Build the catalog off the async workers and publish it
    pub async fn request_catalog(&self) -> Vec<ModelDescriptor> {
        let catalog = self.inner.catalog.clone();
        let list = match tokio::task::spawn_blocking(move || catalog.build_list()).await {
            Ok(list) => list,
            Err(e) => {
                log::error!("Failed to build model list: {}", e);
                return Vec::new();
            }
        };

        self.inner.models.send_replace(list.clone());
        self.inner.lifecycle.transition(|state| match state {
            LifecycleState::NoModel => Some(LifecycleState::ModelListOpen),
            _ => None,
        });
        list
    }

    /// Close the picker
    pub fn reset_catalog(&self) {
        self.inner.models.send_replace(Vec::new());
        self.inner.lifecycle.transition(|state| match state {
            LifecycleState::ModelListOpen => Some(LifecycleState::NoModel),
            _ => None,
        });
    }

    // === Model lifecycle ===

    /// Load a model whose file is present. No-op without a file.
    ///
    /// Failures are logged and reset the lifecycle to `NoModel`.
    pub async fn load_model(&self, descriptor: ModelDescriptor) {
        if descriptor.file.is_none() {
            log::debug!("load_model('{}') ignored: no local file", descriptor.name);
            return;
        }

        let mut engine = self.inner.engine.lock().await;
        self.inner.models.send_replace(Vec::new());

        if self.release_loaded(&mut engine).await {
            log::info!("Previous model released before loading '{}'", descriptor.name);
            self.inner.transcript.reset();
        }

        self.inner.lifecycle.set(LifecycleState::Loading {
            model: descriptor.with_description("Loading..."),
            progress: 0.0,
        });

        let loader = engine.loader();
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            loader.load(&descriptor, &mut |progress| {
                this.inner.lifecycle.set(LifecycleState::Loading {
                    model: descriptor
                        .with_description(format!("{}%", (100.0 * progress).round() as i32)),
                    progress,
                });
            })
        })
        .await;

        match result {
            Ok(Ok(loaded)) => {
                let ready = loaded.descriptor.clone();
                engine.install(loaded);
                self.inner.lifecycle.set(LifecycleState::Ready { model: ready });
            }
            Ok(Err(e)) => {
                log::error!("Model load failed: {}", e);
                self.inner.lifecycle.set(LifecycleState::NoModel);
            }
            Err(e) => {
                log::error!("Model load task failed: {}", e);
                self.inner.lifecycle.set(LifecycleState::NoModel);
            }
        }
    }

    /// Unload the model (or cancel a pending download placeholder) and clear
    /// the transcript. No-op in any other state.
    pub async fn unload_model(&self) {
        match self.lifecycle() {
            LifecycleState::Ready { .. } | LifecycleState::Generating { .. } => {
                let mut engine = self.inner.engine.lock().await;
                self.release_loaded(&mut engine).await;
                drop(engine);

                self.inner.transcript.reset();
                self.inner.lifecycle.set(LifecycleState::NoModel);
            }
            LifecycleState::Downloading { model, .. } if model.file.is_none() => {
                let mut engine = self.inner.engine.lock().await;
                self.release_loaded(&mut engine).await;

                let ids = {
                    let mut registry = self.inner.registry.lock().await;
                    let ids = registry.ids_for_model(&model.name);
                    for id in &ids {
                        registry.remove(*id);
                    }
                    if registry.is_empty() {
                        self.stop_polling();
                    }
                    ids
                };

                for id in ids {
                    log::info!("Cancelling download {} for '{}'", id, model.name);
                    self.inner.downloads.remove(id);
                }

                self.inner.transcript.reset();
                self.inner.lifecycle.set(LifecycleState::NoModel);
                drop(engine);
            }
            state => {
                log::debug!("unload_model ignored in state {}", state.name());
            }
        }
    }

    /// Timing report of the current session, if one exists
    pub async fn get_report(&self) -> Option<String> {
        let session = self.inner.engine.lock().await.session()?;
        match tokio::task::spawn_blocking(move || session.blocking_lock().report()).await {
            Ok(report) => Some(report),
            Err(e) => {
                log::error!("Report task failed: {}", e);
                None
            }
        }
    }

    // === Generation ===

    /// Start answering `text`.
    ///
    /// Appends the user message and an empty assistant placeholder, then
    /// streams into the placeholder. Rejected while a generation is running;
    /// silently ignored when no model is ready.
    pub async fn add_message(&self, text: &str) -> Result<(), LlmError> {
        let engine = self.inner.engine.lock().await;

        if self.inner.tasks.is_processing() || self.is_generating() {
            log::warn!("add_message rejected: generation already in progress");
            return Err(LlmError::GenerationInProgress);
        }

        let Some(session) = engine.session() else {
            log::debug!("add_message ignored: no model loaded");
            return Ok(());
        };

        let mut model = None;
        let started = self.inner.lifecycle.transition(|state| match state {
            LifecycleState::Ready { model: ready } => {
                model = Some(ready.clone());
                Some(LifecycleState::Generating {
                    model: ready.clone(),
                })
            }
            _ => None,
        });
        let Some(model) = model.filter(|_| started) else {
            log::debug!("add_message ignored in state {}", self.lifecycle().name());
            return Ok(());
        };

        let index = self.inner.transcript.begin_exchange(text);
        let prompt = text.to_string();
        let stop_sequences = model.stop_sequences.clone();
        let this = self.clone();

        let generation_id = self.inner.tasks.start(move |generation_id, cancel| {
            tokio::spawn(async move {
                let transcript = this.inner.transcript.clone();
                let log_report = this.inner.config.log_report_on_finish;

                let result = tokio::task::spawn_blocking(move || {
                    let outcome = run_decode_loop(&session, &prompt, stop_sequences, &cancel, |content| {
                        transcript.replace_content(index, content);
                    })?;

                    if log_report && matches!(outcome, DecodeOutcome::Finished { .. }) {
                        let report = session.blocking_lock().report();
                        log::info!("Generation report:\n{}", report);
                    }
                    Ok::<_, LlmError>(outcome)
                })
                .await;

                this.finish_generation(generation_id, result);
            })
        });

        log::info!("Generation {} started for '{}'", generation_id, model.name);
        drop(engine);
        Ok(())
    }

    /// Cancel the running generation and wait for it to stop.
    ///
    /// The partially streamed assistant message stays in the transcript.
    pub async fn cancel_generation(&self) -> bool {
        self.stop_generation().await
    }

    async fn stop_generation(&self) -> bool {
        match self.inner.tasks.take() {
            Some(task) => {
                log::info!("Cancelling generation {}", task.generation_id);
                task.cancel_and_wait().await;
                true
            }
            None => false,
        }
    }

    fn finish_generation(
        &self,
        generation_id: u64,
        result: Result<Result<DecodeOutcome, LlmError>, tokio::task::JoinError>,
    ) {
        self.inner.tasks.remove(generation_id);

        match result {
            Ok(Ok(DecodeOutcome::Finished { steps, text })) => {
                log::info!(
                    "Generation {} finished after {} steps ({} chars)",
                    generation_id,
                    steps,
                    text.len()
                );
            }
            Ok(Ok(DecodeOutcome::Cancelled { steps, .. })) => {
                log::info!("Generation {} cancelled after {} steps", generation_id, steps);
            }
            Ok(Err(e)) => log::error!("Generation {} failed: {}", generation_id, e),
            Err(e) => log::error!("Generation {} task failed: {}", generation_id, e),
        }

        self.inner.lifecycle.transition(|state| match state {
            LifecycleState::Generating { model } => Some(LifecycleState::Ready {
                model: model.clone(),
            }),
            _ => None,
        });
    }

    // === Downloads ===

    /// Queue a download of the model's remote file into the downloads directory.
    ///
    /// Any loaded model is released first, since the lifecycle moves to
    /// `Downloading`. Returns `Ok(None)` when the remote URI has no file name.
    pub async fn download_model(
        &self,
        descriptor: ModelDescriptor,
    ) -> Result<Option<DownloadId>, LlmError> {
        let (Some(uri), Some(file_name)) =
            (descriptor.remote_uri.clone(), descriptor.remote_file_name())
        else {
            log::warn!("'{}' has no downloadable file name", descriptor.name);
            return Ok(None);
        };

        let request = DownloadRequest {
            uri,
            destination: self.inner.catalog.downloads_dir().join(&file_name),
            title: file_name,
        };
        let mut engine = self.inner.engine.lock().await;
        if self.release_loaded(&mut engine).await {
            log::info!("Current model released before downloading '{}'", descriptor.name);
            self.inner.transcript.reset();
            self.inner.lifecycle.set(LifecycleState::NoModel);
        }

        // Registered under the same lock as the enqueue, so a completion
        // delivered before `enqueue` returns still finds its entry.
        let mut registry = self.inner.registry.lock().await;
        let service = self.inner.downloads.clone();
        let id = tokio::task::spawn_blocking(move || service.enqueue(request)).await??;

        let placeholder = descriptor.with_download_id(id);
        registry.insert(id, placeholder.clone());

        self.inner.lifecycle.set(LifecycleState::Downloading {
            model: placeholder.with_description("Download pending..."),
            progress: 0.0,
        });
        self.ensure_polling();
        drop(registry);
        drop(engine);

        log::info!("Download {} started for '{}'", id, descriptor.name);
        Ok(Some(id))
    }

    /// Handle a download completion notification
    pub async fn on_terminal_event(&self, id: DownloadId) {
        let (model, snapshot) = {
            let mut registry = self.inner.registry.lock().await;
            let Some(model) = registry.get(id).cloned() else {
                log::debug!("Completion for unknown or handled download {}", id);
                return;
            };

            let service = self.inner.downloads.clone();
            let snapshot = tokio::task::spawn_blocking(move || service.query(id))
                .await
                .unwrap_or_else(|e| {
                    log::error!("Download query task failed: {}", e);
                    None
                });

            registry.remove(id);
            if registry.is_empty() {
                self.stop_polling();
            }
            (model, snapshot)
        };

        match snapshot.map(|s| s.status) {
            Some(DownloadStatus::Successful) => {
                let Some(file_name) = model.remote_file_name() else {
                    return;
                };
                let dir = self.inner.catalog.downloads_dir().to_path_buf();
                let lookup_name = file_name.clone();
                let found = tokio::task::spawn_blocking(move || find_file_named(&dir, &lookup_name))
                    .await
                    .unwrap_or(None);

                match found {
                    Some(path) => {
                        log::info!("Download {} finished: {}", id, path.display());
                        self.load_model(model.with_file(path)).await;
                    }
                    None => {
                        log::error!("Download {} finished but {} is missing", id, file_name);
                        self.abandon_download(id).await;
                    }
                }
            }
            Some(DownloadStatus::Failed(reason)) => {
                log::error!("Download {} for '{}' failed: {}", id, model.name, reason);
                self.abandon_download(id).await;
            }
            Some(status) => {
                log::debug!("Download {} reported non-terminal status {:?}", id, status);
            }
            None => {
                log::warn!("Download {} no longer known to the download service", id);
                self.abandon_download(id).await;
            }
        }
    }

    /// Reset to `NoModel` after download `id` ended without a model to load.
    ///
    /// Only applies while that download is the one shown; a model loaded in
    /// the meantime is left alone.
    async fn abandon_download(&self, id: DownloadId) {
        let mut engine = self.inner.engine.lock().await;
        let shown = match self.lifecycle() {
            LifecycleState::Downloading { model, .. } => model.download_id == Some(id),
            _ => false,
        };
        if !shown {
            log::debug!("Download {} ended while not shown, lifecycle kept", id);
            return;
        }

        self.release_loaded(&mut engine).await;
        self.inner.lifecycle.set(LifecycleState::NoModel);
    }

    /// Forward completion notifications into `on_terminal_event`
    pub fn spawn_download_listener(
        &self,
        mut completions: mpsc::UnboundedReceiver<DownloadId>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(id) = completions.recv().await {
                this.on_terminal_event(id).await;
            }
            log::debug!("Download completion channel closed");
        })
    }

    fn ensure_polling(&self) {
        let mut poller = self.inner.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.clone();
        let period = self.inner.config.poll_interval();
        *poller = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !this.poll_tick().await {
                    break;
                }
            }
            log::debug!("Download polling stopped");
        }));
    }

    fn stop_polling(&self) {
        let handle = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Publish progress of the most recently added download.
    ///
    /// The first terminal status seen is published once and then handled as
    /// a completion. Returns false once nothing is pending.
    async fn poll_tick(&self) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let Some((id, model)) = registry.latest().map(|(id, m)| (id, m.clone())) else {
            return false;
        };

        let service = self.inner.downloads.clone();
        let snapshot = match tokio::task::spawn_blocking(move || service.query(id)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                log::debug!("Download {} has no status row yet", id);
                return true;
            }
            Err(e) => {
                log::error!("Download query task failed: {}", e);
                return true;
            }
        };

        let (text, progress) = progress_update(&snapshot);
        let terminal = snapshot.status.is_terminal();
        let progress = if terminal {
            if !registry.mark_terminal(id) {
                return true;
            }
            progress.unwrap_or(0.0)
        } else {
            registry.clamp_progress(id, progress.unwrap_or(0.0))
        };

        let next = LifecycleState::Downloading {
            model: model.with_description(text),
            progress,
        };
        self.inner.lifecycle.transition(|state| match state {
            LifecycleState::Downloading { .. } => Some(next),
            _ => None,
        });

        if terminal {
            drop(registry);
            // Own task: `on_terminal_event` stops this poller
            let this = self.clone();
            tokio::spawn(async move { this.on_terminal_event(id).await });
        }
        true
    }

    /// Stop generation, then destroy the session and unload the model.
    ///
    /// Returns whether a model was loaded. Callers hold the engine lock.
    async fn release_loaded(&self, engine: &mut LlmEngine) -> bool {
        if !engine.is_model_loaded() {
            return false;
        }
        self.stop_generation().await;
        match engine.take_loaded() {
            Some(loaded) => {
                release(loaded).await;
                true
            }
            None => false,
        }
    }

    /// Teardown: stop polling, cancel generation, release the model
    pub async fn shutdown(&self) {
        self.stop_polling();
        let mut engine = self.inner.engine.lock().await;
        self.release_loaded(&mut engine).await;
        drop(engine);
        self.inner.lifecycle.set(LifecycleState::NoModel);
        log::info!("Conversation orchestrator shut down");
    }
}

/// Destroy session and model on the blocking pool
async fn release(loaded: LoadedModel) {
    if let Err(e) = tokio::task::spawn_blocking(move || unload_model(loaded)).await {
        log::error!("Model unload task failed: {}", e);
    }
}
