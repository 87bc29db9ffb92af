//! Single-flight request coalescing
//!
//! At most one computation per key runs at a time. Later callers for the same
//! key join the running computation and receive a clone of its result, error
//! included. The computation is driven by its own task, so it completes and
//! leaves the table even if every caller stops waiting. A computation that
//! panics resolves to an error and leaves the table like any other.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::SharedError;

/// Result shared between coalesced callers
pub type FlightResult<V> = Result<V, SharedError>;

/// Handle to an in-flight computation
pub type Flight<V> = Shared<BoxFuture<'static, FlightResult<V>>>;

struct Slot<V: Clone> {
    id: u64,
    flight: Flight<V>,
}

type Table<V> = Arc<DashMap<String, Slot<V>>>;

/// Removes a computation's own slot when the computation is dropped,
/// whether it finished, panicked or was never polled
struct SlotGuard<V: Clone> {
    table: Table<V>,
    key: String,
    id: u64,
}

impl<V: Clone> Drop for SlotGuard<V> {
    fn drop(&mut self) {
        let id = self.id;
        self.table.remove_if(&self.key, |_, slot| slot.id == id);
    }
}

/// Per-key deduplication table
pub struct SingleFlight<V: Clone> {
    inflight: Table<V>,
    next_id: AtomicU64,
    started: AtomicU64,
    joined: AtomicU64,
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            started: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Join the computation for `key`, or start `work` if none is running.
    ///
    /// Returns the handle and whether it was joined rather than started.
    /// `work` is only invoked when a new computation starts.
    pub fn begin<F, Fut>(&self, key: &str, work: F) -> (Flight<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult<V>> + Send + 'static,
    {
        let flight = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(slot) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                return (slot.get().flight.clone(), true);
            }
            Entry::Vacant(vacant) => {
                let fut = work();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = SlotGuard {
                    table: Arc::clone(&self.inflight),
                    key: vacant.key().clone(),
                    id,
                };

                let flight = async move {
                    let _guard = guard;
                    match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(result) => result,
                        Err(payload) => Err(SharedError::new(anyhow::anyhow!(
                            "computation panicked: {}",
                            panic_message(payload.as_ref())
                        ))),
                    }
                }
                .boxed()
                .shared();

                vacant.insert(Slot {
                    id,
                    flight: flight.clone(),
                });
                flight
            }
        };

        self.started.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(flight.clone().map(|_| ()));
        (flight, false)
    }

    /// Run `work` under single-flight and wait for the shared result
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (FlightResult<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult<V>> + Send + 'static,
    {
        let (flight, joined) = self.begin(key, work);
        (flight.await, joined)
    }

    /// True while a computation for `key` is running
    pub fn in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Number of keys with a running computation
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Computations started
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that joined a running computation
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

impl<V> Default for SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
