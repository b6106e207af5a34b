//! Generation task registry - tracks the single active decode task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Active decode task
pub struct GenerationTask {
    pub generation_id: u64,
    pub cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl GenerationTask {
    /// Request cancellation and wait until the task has actually stopped
    pub async fn cancel_and_wait(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.handle.await {
            log::error!("Generation {} task failed: {}", self.generation_id, e);
        }
    }
}

/// At most one decode task per session
#[derive(Default)]
pub struct TaskRegistry {
    active: Mutex<Option<GenerationTask>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<GenerationTask>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new task built by `spawn`.
    ///
    /// The slot stays locked while spawning, so a task that finishes
    /// immediately cannot call `remove` before it is registered.
    pub fn start<F>(&self, spawn: F) -> u64
    where
        F: FnOnce(u64, CancellationToken) -> JoinHandle<()>,
    {
        let mut slot = self.slot();
        let generation_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel_token = CancellationToken::new();
        let handle = spawn(generation_id, cancel_token.clone());

        if let Some(previous) = slot.replace(GenerationTask {
            generation_id,
            cancel_token,
            handle,
        }) {
            log::warn!("Generation {} replaced while still registered", previous.generation_id);
            previous.cancel_token.cancel();
        }
        generation_id
    }

    /// Remove the task if it is still the registered one
    pub fn remove(&self, generation_id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().map(|t| t.generation_id) == Some(generation_id) {
            slot.take();
        }
    }

    /// Take the active task out so it can be cancelled and awaited
    pub fn take(&self) -> Option<GenerationTask> {
        self.slot().take()
    }

    pub fn is_processing(&self) -> bool {
        self.slot().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_and_remove() {
        let registry = TaskRegistry::new();
        let id = registry.start(|_, _| tokio::spawn(async {}));
        assert!(registry.is_processing());

        registry.remove(id + 1);
        assert!(registry.is_processing());

        registry.remove(id);
        assert!(!registry.is_processing());
    }

    #[tokio::test]
    async fn test_cancel_and_wait_observes_stop() {
        let registry = TaskRegistry::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        registry.start(|_, token| {
            tokio::spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = tx.send("stopped");
            })
        });

        let task = registry.take().unwrap();
        assert!(!registry.is_processing());
        task.cancel_and_wait().await;
        assert_eq!(rx.await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let registry = TaskRegistry::new();
        let first = registry.start(|_, _| tokio::spawn(async {}));
        registry.take();
        let second = registry.start(|_, _| tokio::spawn(async {}));
        assert!(second > first);
    }
}
