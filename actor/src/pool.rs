// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Pool and timer
//!
//! The two collaborators an actor group runs on: a [`Pool`] that executes actor chunks and a
//! [`Timer`] that fires reaction timeouts. The tokio implementations run chunks on the blocking
//! thread pool of a multi-thread runtime, because actor code is allowed to block (`receive`,
//! `join`, dataflow reads).
//!
//! Both run their tasks inside the tracing span that was current when the task was submitted.
//!

use crate::Error;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

/// A unit of work submitted to a pool or timer.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes actor chunks.
pub trait Pool: Send + Sync {
    /// Submits `task`. Never blocks the caller for long.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] once the pool was shut down.
    fn execute(&self, task: Task) -> Result<(), Error>;

    /// Maximum number of tasks running at once.
    fn size(&self) -> usize;

    /// Stops accepting work.
    fn shutdown(&self);
}

/// Handle of a scheduled timer task.
///
/// Dropping the handle leaves the task scheduled; call [`Scheduled::cancel`] to withdraw it.
#[derive(Debug, Clone, Default)]
pub struct Scheduled {
    token: CancellationToken,
}

impl Scheduled {
    /// Wraps the token the timer task watches.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Withdraws the task if it has not run yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the task was withdrawn, individually or by a timer shutdown.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs single-shot delayed tasks.
pub trait Timer: Send + Sync {
    /// Runs `task` once after `delay`, unless the returned handle is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] once the timer was shut down.
    fn schedule(&self, delay: Duration, task: Task) -> Result<Scheduled, Error>;

    /// Drops every pending task and rejects new ones.
    fn shutdown(&self);
}

/// Pool backed by the blocking threads of a tokio runtime.
pub struct TokioPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    size: usize,
    closed: AtomicBool,
}

impl TokioPool {
    /// Builds a dedicated runtime whose blocking pool is capped at `size` threads.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of actor chunks that may run at once. Zero is raised to one.
    /// * `name` - Name given to the runtime threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if tokio cannot build the runtime.
    pub fn new(size: usize, name: &str) -> Result<Self, Error> {
        let size = size.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(size)
            .thread_name(name)
            .enable_time()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        debug!("Pool {} created with {} threads.", name, size);
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            size,
            closed: AtomicBool::new(false),
        })
    }

    /// Uses the runtime behind `handle` without owning it. Its blocking thread limit applies,
    /// `size` is only reported.
    pub fn from_handle(handle: Handle, size: usize) -> Self {
        Self {
            runtime: Mutex::new(None),
            handle,
            size: size.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Handle of the underlying runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Pool for TokioPool {
    fn execute(&self, task: Task) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }
        let span = Span::current();
        drop(self.handle.spawn_blocking(move || span.in_scope(task)));
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            // Does not wait, so it is safe from inside any runtime.
            runtime.shutdown_background();
        }
    }
}

impl Drop for TokioPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Timer built on `tokio::time::sleep`. Shutting it down cancels every pending task.
pub struct TokioTimer {
    handle: Handle,
    token: CancellationToken,
}

impl TokioTimer {
    /// Creates a timer on the runtime behind `handle`. The runtime must have time enabled.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            token: CancellationToken::new(),
        }
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: Task) -> Result<Scheduled, Error> {
        if self.token.is_cancelled() {
            return Err(Error::PoolShutdown);
        }
        let token = self.token.child_token();
        let scheduled = Scheduled::new(token.clone());
        self.handle.spawn(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Timer task cancelled.");
                    }
                    _ = tokio::time::sleep(delay) => task(),
                }
            }
            .instrument(Span::current()),
        );
        Ok(scheduled)
    }

    fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use dataflow::DataflowVariable;
    use tracing_test::traced_test;

    use std::time::Instant;

    #[test]
    fn test_pool_runs_tasks() {
        let pool = TokioPool::new(2, "test-pool").unwrap();
        assert_eq!(pool.size(), 2);
        let done = DataflowVariable::new();
        let target = done.clone();
        pool.execute(Box::new(move || {
            target.bind(std::thread::current().name().map(str::to_owned))
                .unwrap();
        }))
        .unwrap();
        assert_eq!(done.get().unwrap().as_deref(), Some("test-pool"));
    }

    #[test]
    fn test_pool_rejects_after_shutdown() {
        let pool = TokioPool::new(0, "closed-pool").unwrap();
        assert_eq!(pool.size(), 1);
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.execute(Box::new(|| {})), Err(Error::PoolShutdown));
    }

    #[test]
    fn test_timer_fires_once_after_delay() {
        let pool = TokioPool::new(1, "timer-pool").unwrap();
        let timer = TokioTimer::new(pool.handle().clone());
        let fired = DataflowVariable::new();
        let target = fired.clone();
        let start = Instant::now();
        timer
            .schedule(
                Duration::from_millis(30),
                Box::new(move || {
                    target.bind(Instant::now()).unwrap();
                }),
            )
            .unwrap();
        assert!(fired.get().unwrap() - start >= Duration::from_millis(30));
    }

    #[test]
    fn test_timer_shutdown_cancels_pending() {
        let pool = TokioPool::new(1, "timer-pool").unwrap();
        let timer = TokioTimer::new(pool.handle().clone());
        let fired = DataflowVariable::new();
        let target = fired.clone();
        timer
            .schedule(
                Duration::from_millis(30),
                Box::new(move || {
                    target.bind(()).unwrap();
                }),
            )
            .unwrap();
        timer.shutdown();
        assert_eq!(fired.get_timeout(Duration::from_millis(100)), Ok(None));
        assert!(matches!(
            timer.schedule(Duration::ZERO, Box::new(|| {})),
            Err(Error::PoolShutdown)
        ));
    }

    #[test]
    #[traced_test]
    fn test_cancelled_task_never_runs() {
        let pool = TokioPool::new(1, "timer-pool").unwrap();
        let timer = TokioTimer::new(pool.handle().clone());
        let fired = DataflowVariable::new();
        let (early, late) = (fired.clone(), fired.clone());
        let withdrawn = timer
            .schedule(
                Duration::from_millis(30),
                Box::new(move || {
                    early.bind("withdrawn").unwrap();
                }),
            )
            .unwrap();
        timer
            .schedule(
                Duration::from_millis(60),
                Box::new(move || {
                    late.bind("kept").unwrap();
                }),
            )
            .unwrap();
        withdrawn.cancel();
        assert!(withdrawn.is_cancelled());
        assert_eq!(fired.get_timeout(Duration::from_secs(1)), Ok(Some("kept")));
        assert!(logs_contain("Timer task cancelled."));
    }

    #[tokio::test]
    async fn test_pool_from_handle() {
        let pool = TokioPool::from_handle(Handle::current(), 4);
        let done = DataflowVariable::new();
        let target = done.clone();
        pool.execute(Box::new(move || {
            target.bind(7).unwrap();
        }))
        .unwrap();
        assert_eq!(done.wait().await, 7);
        pool.shutdown();
        assert_eq!(pool.execute(Box::new(|| {})), Err(Error::PoolShutdown));
    }
}
