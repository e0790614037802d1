//! Task tracking for device teardown work
//!
//! Keeps the JoinHandles of background teardowns keyed by device id so the
//! server can wait for them on shutdown.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tracks background tasks associated with devices
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Track a task for a device. Finished tasks are pruned on the way in.
    pub fn register(&self, device_id: String, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, handles| {
                handles.retain(|h| !h.is_finished());
                !handles.is_empty()
            });
            tasks.entry(device_id).or_default().push(handle);
        }
    }

    /// Whether an unfinished task is tracked for the device
    pub fn is_active(&self, device_id: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .get(device_id)
                    .map(|handles| handles.iter().any(|h| !h.is_finished()))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .values()
                    .flatten()
                    .filter(|h| !h.is_finished())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Wait for every tracked task, aborting whatever is still running after `grace`.
    /// Returns the number of aborted tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().flat_map(|(_, handles)| handles).collect(),
            Err(_) => return 0,
        };

        debug!(count = handles.len(), "Waiting for background tasks");
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted, "Aborted background tasks still running at shutdown");
        }
        aborted
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
