//! Scripted stand-ins for the native engine and the download facility

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::model_manager::{DownloadId, DownloadRequest, DownloadService, DownloadSnapshot};
use super::provider::{
    GenerationSession, InferenceBackend, LlmError, ModelHandle, SessionConfig, StepStatus,
};

/// Scripted native status: 0 is success
fn check_status(call: &'static str, code: i32) -> Result<(), LlmError> {
    if code == 0 {
        Ok(())
    } else {
        Err(LlmError::NativeCall { call, code })
    }
}

#[derive(Clone)]
pub struct FakeScript {
    pub init_status: i32,
    pub accelerator_status: i32,
    pub load_status: i32,
    pub session_status: i32,
    pub model_size: u64,
    pub load_progress: Vec<f32>,
    /// One chunk per decode step; `Done` once exhausted
    pub chunks: Vec<Vec<u8>>,
    /// Emit `b"tok "` forever instead of `chunks`
    pub endless: bool,
    pub step_delay: Duration,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            init_status: 0,
            accelerator_status: 0,
            load_status: 0,
            session_status: 0,
            model_size: 1_230_000_000,
            load_progress: vec![0.5, 1.0],
            chunks: Vec::new(),
            endless: false,
            step_delay: Duration::ZERO,
        }
    }
}

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct FakeBackend {
    script: FakeScript,
    calls: CallLog,
    loaded_paths: Mutex<Vec<PathBuf>>,
}

impl FakeBackend {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
            loaded_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loaded_paths.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl InferenceBackend for FakeBackend {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    fn init(&self) -> Result<(), LlmError> {
        self.record("init");
        check_status("init", self.script.init_status)
    }

    fn load_accelerator(&self) -> Result<(), LlmError> {
        self.record("load_accelerator");
        check_status("load_accelerator", self.script.accelerator_status)
    }

    fn load_model(
        &self,
        path: &Path,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<Box<dyn ModelHandle>, LlmError> {
        self.record("load_model");
        self.loaded_paths.lock().unwrap().push(path.to_path_buf());
        for p in &self.script.load_progress {
            on_progress(*p);
        }
        check_status("load_model", self.script.load_status)?;
        Ok(Box::new(FakeModel {
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct FakeModel {
    script: FakeScript,
    calls: CallLog,
}

impl ModelHandle for FakeModel {
    fn size(&self) -> u64 {
        self.script.model_size
    }

    fn create_session(
        &mut self,
        _config: &SessionConfig,
    ) -> Result<Box<dyn GenerationSession>, LlmError> {
        self.calls.lock().unwrap().push("create_session".to_string());
        check_status("create_session", self.script.session_status)?;
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            calls: self.calls.clone(),
            next_chunk: 0,
        }))
    }

    fn unload(&mut self) {
        self.calls.lock().unwrap().push("unload".to_string());
    }
}

struct FakeSession {
    script: FakeScript,
    calls: CallLog,
    next_chunk: usize,
}

impl GenerationSession for FakeSession {
    fn add_message(&mut self, text: &str) -> Result<(), LlmError> {
        self.calls.lock().unwrap().push(format!("add_message:{}", text));
        self.next_chunk = 0;
        Ok(())
    }

    fn generate(&mut self, on_tokens: &mut dyn FnMut(&[u8])) -> StepStatus {
        if !self.script.step_delay.is_zero() {
            std::thread::sleep(self.script.step_delay);
        }
        if self.script.endless {
            on_tokens(b"tok ");
            return StepStatus::Continue;
        }
        match self.script.chunks.get(self.next_chunk) {
            Some(chunk) => {
                self.next_chunk += 1;
                on_tokens(chunk);
                StepStatus::Continue
            }
            None => StepStatus::Done,
        }
    }

    fn report(&self) -> String {
        "fake timing report".to_string()
    }

    fn warm_up(&mut self) -> Result<(), LlmError> {
        self.calls.lock().unwrap().push("warm_up".to_string());
        Ok(())
    }

    fn destroy(&mut self) {
        self.calls.lock().unwrap().push("destroy".to_string());
    }
}

/// Download facility whose rows are set by the test
#[derive(Default)]
pub struct FakeDownloadService {
    next_id: AtomicU64,
    rows: Mutex<HashMap<DownloadId, DownloadSnapshot>>,
    pub enqueued: Mutex<Vec<DownloadRequest>>,
    pub removed: Mutex<Vec<DownloadId>>,
}

impl FakeDownloadService {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            ..Self::default()
        }
    }

    pub fn set(&self, id: DownloadId, snapshot: DownloadSnapshot) {
        self.rows.lock().unwrap().insert(id, snapshot);
    }

    pub fn clear(&self, id: DownloadId) {
        self.rows.lock().unwrap().remove(&id);
    }
}

impl DownloadService for FakeDownloadService {
    fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId, LlmError> {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.enqueued.lock().unwrap().push(request);
        self.set(id, DownloadSnapshot::pending());
        Ok(id)
    }

    fn query(&self, id: DownloadId) -> Option<DownloadSnapshot> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    fn remove(&self, id: DownloadId) {
        self.removed.lock().unwrap().push(id);
        self.clear(id);
    }
}
