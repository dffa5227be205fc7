//! Minimal task-submission port.
//!
//! The runtime never spawns timers directly; it hands futures to a
//! [`Scheduler`]. Hosts that drive their own loop implement the trait
//! natively; everyone else uses [`TokioScheduler`].

use futures::future::BoxFuture;
use std::time::Duration;

/// Handle to a submitted task. Dropping it does not cancel the task.
pub struct TaskHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle whose task cannot be cancelled.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Stop the task if it has not completed yet.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Runs futures now or after a delay.
pub trait Scheduler: Send + Sync + 'static {
    fn submit(&self, task: BoxFuture<'static, ()>) -> TaskHandle;

    fn submit_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// [`Scheduler`] backed by the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn submit(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = tokio::spawn(task);
        let abort = handle.abort_handle();
        TaskHandle::new(move || abort.abort())
    }

    fn submit_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let abort = handle.abort_handle();
        TaskHandle::new(move || abort.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_runs_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let _h = TokioScheduler.submit_delayed(
            Duration::from_millis(500),
            async move { f.store(true, Ordering::SeqCst) }.boxed(),
        );

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let h = TokioScheduler.submit_delayed(
            Duration::from_millis(100),
            async move { f.store(true, Ordering::SeqCst) }.boxed(),
        );
        h.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
