// LM Playground - on-device LLM chat core
//
// Model catalog, weight downloads, native engine lifecycle and streamed
// generation behind a single orchestrator. The presentation layer only
// subscribes to the published observables and calls orchestrator operations.

pub mod config;
pub mod state;
pub mod llm_engine;
pub mod chat;
pub mod orchestrator;

pub use chat::{Author, Message};
pub use config::OrchestratorConfig;
pub use llm_engine::model_manager::{
    available_models, DownloadId, DownloadService, DownloadSnapshot, DownloadStatus,
    FailureReason, HttpDownloadService, ModelCatalog, ModelDescriptor,
};
pub use llm_engine::{
    GenerationSession, InferenceBackend, LlmEngine, LlmError, ModelHandle, SessionConfig,
    StepStatus,
};
pub use orchestrator::ConversationOrchestrator;
pub use state::{LifecycleState, Observers};

/// Initialize env_logger on stderr (reads RUST_LOG, defaults to info).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
