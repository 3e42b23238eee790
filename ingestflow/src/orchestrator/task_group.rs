//! A group of sibling tasks that never cancel each other.

use parking_lot::RwLock;
use std::future::Future;
use tokio::task::JoinHandle;

/// Spawns named tasks and collects every result.
///
/// Unlike a fail-fast group, a task that fails or panics has no effect on
/// its siblings; [`IsolatedTaskGroup::wait`] reports each task separately,
/// in spawn order.
pub struct IsolatedTaskGroup<T> {
    handles: RwLock<Vec<(String, JoinHandle<T>)>>,
}

impl<T: Send + 'static> IsolatedTaskGroup<T> {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Spawns `task` on the runtime under `name`.
    pub fn spawn<Fut>(&self, name: impl Into<String>, task: Fut)
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.handles.write().push((name.into(), handle));
    }

    /// Waits for every task.
    ///
    /// A task that panicked or was aborted yields `Err` with the join error.
    pub async fn wait(&self) -> Vec<(String, Result<T, String>)> {
        let handles: Vec<_> = {
            let mut h = self.handles.write();
            std::mem::take(&mut *h)
        };

        let mut results = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let result = handle
                .await
                .map_err(|join_error| format!("Task join error: {join_error}"));
            results.push((name, result));
        }
        results
    }

    /// Number of tasks not yet waited on.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.read().len()
    }
}

impl<T: Send + 'static> Default for IsolatedTaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for IsolatedTaskGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedTaskGroup")
            .field("task_count", &self.handles.read().len())
            .finish()
    }
}
