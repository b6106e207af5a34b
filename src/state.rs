// Lifecycle state for the conversation orchestrator

use tokio::sync::watch;

use crate::chat::Message;
use crate::llm_engine::model_manager::ModelDescriptor;

/// Model lifecycle as seen by the presentation layer.
///
/// The native session and the decode task are owned by the orchestrator and
/// are not part of the published value.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    NoModel,
    /// Model picker is showing the catalog
    ModelListOpen,
    Downloading { model: ModelDescriptor, progress: f32 },
    Loading { model: ModelDescriptor, progress: f32 },
    Ready { model: ModelDescriptor },
    Generating { model: ModelDescriptor },
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::NoModel => "NoModel",
            LifecycleState::ModelListOpen => "ModelListOpen",
            LifecycleState::Downloading { .. } => "Downloading",
            LifecycleState::Loading { .. } => "Loading",
            LifecycleState::Ready { .. } => "Ready",
            LifecycleState::Generating { .. } => "Generating",
        }
    }

    /// Descriptor shown in the app bar, if any
    pub fn model(&self) -> Option<&ModelDescriptor> {
        match self {
            LifecycleState::Downloading { model, .. }
            | LifecycleState::Loading { model, .. }
            | LifecycleState::Ready { model }
            | LifecycleState::Generating { model } => Some(model),
            LifecycleState::NoModel | LifecycleState::ModelListOpen => None,
        }
    }

    /// Download or load fraction; zero outside those states
    pub fn progress(&self) -> f32 {
        match self {
            LifecycleState::Downloading { progress, .. } | LifecycleState::Loading { progress, .. } => {
                *progress
            }
            _ => 0.0,
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(self, LifecycleState::Generating { .. })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready { .. })
    }
}

/// Last-write-wins holder for the lifecycle value
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::NoModel);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn get(&self) -> LifecycleState {
        self.tx.borrow().clone()
    }

    pub fn set(&self, next: LifecycleState) {
        let previous = self.tx.send_replace(next);
        let current = self.tx.borrow();
        if previous.name() == current.name() {
            log::debug!("Lifecycle: {} ({:.2})", current.name(), current.progress());
        } else {
            log::info!("Lifecycle: {} -> {}", previous.name(), current.name());
        }
    }

    /// Atomically replace the value when `f` returns a successor.
    ///
    /// Returns whether a transition happened.
    pub fn transition<F>(&self, f: F) -> bool
    where
        F: FnOnce(&LifecycleState) -> Option<LifecycleState>,
    {
        let mut from = "";
        let mut to = "";
        let changed = self.tx.send_if_modified(|state| match f(state) {
            Some(next) => {
                from = state.name();
                to = next.name();
                *state = next;
                true
            }
            None => false,
        });
        if changed && from == to {
            log::debug!("Lifecycle: {} updated", to);
        } else if changed {
            log::info!("Lifecycle: {} -> {}", from, to);
        }
        changed
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receivers for everything the orchestrator publishes
#[derive(Clone)]
pub struct Observers {
    pub lifecycle: watch::Receiver<LifecycleState>,
    pub transcript: watch::Receiver<Vec<Message>>,
    pub models: watch::Receiver<Vec<ModelDescriptor>>,
}
