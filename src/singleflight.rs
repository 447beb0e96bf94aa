//! Request coalescing.
//!
//! Concurrent calls with the same key share one execution of the work
//! future; each caller gets its own clone of the output. The work runs on
//! its own task, so it finishes and clears its key even when every caller
//! has given up waiting.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

type Calls<T> = Arc<Mutex<FxHashMap<String, Call<T>>>>;

struct Call<T: Clone> {
    id: u64,
    future: Shared<BoxFuture<'static, Option<T>>>,
}

/// Removes the call's key when its task ends, panics included.
struct Release<T: Clone> {
    calls: Calls<T>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        if calls.get(&self.key).is_some_and(|call| call.id == self.id) {
            calls.remove(&self.key);
        }
    }
}

pub struct SingleFlight<T: Clone> {
    calls: Calls<T>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(FxHashMap::default())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `work` under `key`, or join the call already in flight.
    ///
    /// Returns the output and whether it was shared with an earlier caller.
    /// `work` is only invoked when no call for `key` is in flight. The
    /// output is `None` if the work task panicked or was aborted.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Option<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (future, shared) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(call) => (call.future.clone(), true),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let release = Release {
                        calls: self.calls.clone(),
                        key: key.to_string(),
                        id,
                    };
                    let work = work();
                    let task = tokio::spawn(async move {
                        let _release = release;
                        work.await
                    });
                    let future = task.map(Result::ok).boxed().shared();
                    calls.insert(
                        key.to_string(),
                        Call {
                            id,
                            future: future.clone(),
                        },
                    );
                    (future, false)
                }
            }
        };

        (future.await, shared)
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
