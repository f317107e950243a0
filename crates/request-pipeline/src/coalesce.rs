//! Short-window deduplication of identical in-flight reads
//!
//! The first caller for a key runs the operation and registers its shared
//! future; callers arriving within the coalescing window await that future
//! instead of running their own. The window only bounds attachment: an entry
//! lives until its operation settles, however long that takes, and is removed
//! by the operation itself on completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default window during which identical reads are merged.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(1000);

struct PendingEntry<T> {
    id: u64,
    started_at: Instant,
    result: Shared<BoxFuture<'static, T>>,
}

type PendingMap<T> = Arc<Mutex<HashMap<String, PendingEntry<T>>>>;

/// Merges concurrent operations that share a key.
///
/// `T` is cloned out to every attached caller, so failures should be part of
/// `T` (e.g. a `Result`) for all callers to observe the same rejection.
pub struct RequestCoalescer<T> {
    window: Duration,
    pending: PendingMap<T>,
    next_id: AtomicU64,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Run `op` under `key`, or join the in-flight run started less than one
    /// window ago.
    pub async fn dedupe<F, Fut>(&self, key: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let result = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(entry) if entry.started_at.elapsed() < self.window => {
                    debug!(key, "joining in-flight request");
                    crate::metrics::record_coalesced();
                    entry.result.clone()
                }
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let result = settle_and_remove(op(), key.to_string(), id, self.pending.clone())
                        .boxed()
                        .shared();
                    // Replaces any entry past its window; that entry keeps
                    // running for its own callers but no longer accepts new ones
                    pending.insert(
                        key.to_string(),
                        PendingEntry {
                            id,
                            started_at: Instant::now(),
                            result: result.clone(),
                        },
                    );
                    result
                }
            }
        };
        result.await
    }

    /// Number of keys with a registered in-flight operation.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW)
    }
}

/// Await the operation, then drop its entry unless a newer run replaced it.
async fn settle_and_remove<T, Fut>(op: Fut, key: String, id: u64, pending: PendingMap<T>) -> T
where
    Fut: Future<Output = T>,
{
    let value = op.await;
    let mut pending = pending.lock();
    if pending.get(&key).is_some_and(|entry| entry.id == id) {
        pending.remove(&key);
    }
    value
}
