//! Per-peer command lane: FIFO, one command in flight.
//!
//! Tokio's semaphore hands out permits in request order, so a single-permit
//! semaphore is a fair FIFO queue. Closing the lane fails every waiter at
//! once and installs a fresh semaphore for the next connection.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Why a queued command did not run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneError {
    /// The lane was closed while the command waited.
    Closed,
    /// The timeout elapsed, either in the queue or while executing.
    TimedOut,
}

/// Lane occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LaneOccupancy {
    /// 0 or 1.
    pub in_flight: usize,
    pub queued: usize,
}

/// Single-flight FIFO queue for one peer's commands.
#[derive(Debug)]
pub struct CommandLane {
    sem: RwLock<Arc<Semaphore>>,
    waiting: Arc<AtomicUsize>,
}

impl CommandLane {
    pub fn new() -> Self {
        Self {
            sem: RwLock::new(Arc::new(Semaphore::new(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue `work` and run it once every earlier command has resolved.
    ///
    /// `timeout` starts now and covers both queue wait and execution.
    pub async fn run<F, T>(&self, timeout: Duration, work: F) -> Result<T, LaneError>
    where
        F: Future<Output = T>,
    {
        let sem = self.current();
        let waiting = Arc::clone(&self.waiting);

        let queued_and_run = async move {
            waiting.fetch_add(1, Ordering::SeqCst);
            let acquired = sem.acquire().await;
            waiting.fetch_sub(1, Ordering::SeqCst);
            let _permit = acquired.map_err(|_| LaneError::Closed)?;
            Ok(work.await)
        };

        match tokio::time::timeout(timeout, queued_and_run).await {
            Ok(result) => result,
            Err(_) => Err(LaneError::TimedOut),
        }
    }

    /// Reject every queued command with [`LaneError::Closed`].
    ///
    /// A command already executing keeps its permit and finishes (or times
    /// out) on its own; later submissions go to a fresh lane.
    pub fn close_pending(&self) {
        let mut guard = self.sem.write().unwrap_or_else(|e| e.into_inner());
        guard.close();
        *guard = Arc::new(Semaphore::new(1));
    }

    pub fn occupancy(&self) -> LaneOccupancy {
        let sem = self.current();
        LaneOccupancy {
            in_flight: 1usize.saturating_sub(sem.available_permits()),
            queued: self.waiting.load(Ordering::SeqCst),
        }
    }

    fn current(&self) -> Arc<Semaphore> {
        Arc::clone(&self.sem.read().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Default for CommandLane {
    fn default() -> Self {
        Self::new()
    }
}
