//! Per-key in-flight registry
//!
//! Concurrent callers asking for the same key share one execution of the
//! work: the first caller starts it, later callers await a clone of the
//! same [`Shared`] future. The registry entry is removed as soon as the work
//! finishes, so the next call after completion starts fresh.
//!
//! The registry is type-erased so one instance can serve values of any type.
//! A caller whose `(T, E)` differs from the in-flight call under the same
//! key runs its own work instead of joining.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::trace;

type SharedCall<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;
type CallMap = Mutex<HashMap<String, Slot>>;

struct Slot {
    id: u64,
    call: Box<dyn Any + Send + Sync>,
}

/// Registry of in-flight calls, shared by cloning.
#[derive(Clone, Default)]
pub struct InFlight {
    calls: Arc<CallMap>,
    next_id: Arc<AtomicU64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the call already running for it.
    ///
    /// Every joined caller receives a clone of the same result, errors
    /// included. The registry is consulted when the returned future is first
    /// polled, not when `run` is called.
    pub async fn run<T, E, F, Fut>(&self, key: &str, work: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(slot) => {
                    trace!("Joining in-flight call for '{}'", key);
                    // Same key, different value type: run separately
                    slot.call
                        .downcast_ref::<SharedCall<T, E>>()
                        .cloned()
                        .ok_or(work)
                }
                None => Ok(self.register(&mut calls, key, work())),
            }
        };

        match call {
            Ok(call) => call.await,
            Err(work) => work().await,
        }
    }

    /// Start `work` for `key` unless a call for it is already running.
    ///
    /// Registration happens before this returns, so of several concurrent
    /// callers exactly one gets `Some`. The returned future drives the work
    /// and may be spawned; other callers can join it through [`run`](Self::run).
    pub fn try_start<T, E, F, Fut>(
        &self,
        key: &str,
        work: F,
    ) -> Option<BoxFuture<'static, Result<T, E>>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut calls = self.calls.lock();
        if calls.contains_key(key) {
            return None;
        }
        Some(self.register(&mut calls, key, work()).boxed())
    }

    fn register<T, E, Fut>(
        &self,
        calls: &mut HashMap<String, Slot>,
        key: &str,
        work: Fut,
    ) -> SharedCall<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = Self::start(Arc::downgrade(&self.calls), key.to_string(), id, work);
        calls.insert(
            key.to_string(),
            Slot {
                id,
                call: Box::new(call.clone()),
            },
        );
        call
    }

    fn start<T, E, Fut>(calls: Weak<CallMap>, key: String, id: u64, work: Fut) -> SharedCall<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        async move {
            let result = work.await;
            if let Some(calls) = calls.upgrade() {
                let mut calls = calls.lock();
                if calls.get(&key).is_some_and(|slot| slot.id == id) {
                    calls.remove(&key);
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Whether a call for `key` is currently running.
    pub fn contains(&self, key: &str) -> bool {
        self.calls.lock().contains_key(key)
    }

    /// Number of calls currently running.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("in_flight", &self.len())
            .finish()
    }
}
