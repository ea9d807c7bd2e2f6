//! Time and task scheduling capability
//!
//! Components that need a clock or a timer (the store sweeper, the batching
//! loader's flush delay, the shape detector's window) take an
//! `Arc<dyn Scheduler>` instead of calling `tokio::time` directly.
//!
//! [`TokioScheduler`] is built on `tokio::time`, which means tests can run
//! with a paused clock (`#[tokio::test(start_paused = true)]`) and move time
//! forward with `tokio::time::advance` instead of sleeping for real.

use futures::future::BoxFuture;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};

/// Clock plus one-shot and periodic task scheduling.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Current instant on the scheduler's timeline.
    fn now(&self) -> Instant;

    /// Future that completes after `duration` on the scheduler's timeline.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Run `task` in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// Convenience helpers available on every [`Scheduler`].
pub trait SchedulerExt: Scheduler {
    /// Run `task` once after `delay`.
    fn spawn_after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sleep = self.sleep(delay);
        self.spawn(Box::pin(async move {
            sleep.await;
            task.await;
        }))
    }

    /// Call `tick` every `period` until the returned handle is aborted.
    ///
    /// The first call happens one full period after scheduling.
    fn spawn_every<F>(self: &Arc<Self>, period: Duration, mut tick: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
        Self: 'static,
    {
        let scheduler = Arc::clone(self);
        self.spawn(Box::pin(async move {
            loop {
                scheduler.sleep(period).await;
                tick();
            }
        }))
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}

/// Handle to a background task started through a [`Scheduler`].
///
/// Dropping the handle detaches the task; call [`TaskHandle::abort`] to stop it.
#[derive(Debug)]
pub struct TaskHandle {
    inner: JoinHandle<()>,
}

impl TaskHandle {
    /// Wrap a tokio join handle.
    pub fn from_tokio(inner: JoinHandle<()>) -> Self {
        Self { inner }
    }

    /// Stop the task at its next suspension point.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Whether the task has run to completion or been aborted.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the task to finish. Aborted or panicked tasks resolve too.
    pub async fn join(self) {
        if let Err(err) = self.inner.await
            && err.is_panic()
        {
            tracing::error!("Scheduled task panicked: {}", err);
        }
    }
}

/// [`Scheduler`] backed by the ambient tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Shared scheduler handle, ready to inject into components.
    pub fn shared() -> Arc<dyn Scheduler> {
        Arc::new(Self)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        TaskHandle::from_tokio(tokio::spawn(task))
    }
}
