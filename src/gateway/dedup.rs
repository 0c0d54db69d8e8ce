//! In-Flight Request Coalescing
//!
//! Collapses concurrent identical requests into a single upstream execution.
//! The first caller for a fingerprint becomes the leader and spawns the
//! executor as a detached task; everyone else awaits a shared handle to the
//! same result. Detaching matters: a caller that times out or disconnects
//! must not cancel work that other callers are still waiting on.
//!
//! A safety net bounds how long an entry can sit in the map. If a leader
//! stalls past the deadline (stuck socket, panicked task that never
//! unwound), the next caller replaces it with a fresh executor instead of
//! queueing behind a corpse.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use uuid::Uuid;

use crate::constants::dedup as dedup_constants;
use crate::gateway::fingerprint::Fingerprint;
use crate::types::ProviderError;

/// What a coalesced execution resolves to. Cloned to every waiter.
type PendingResult<T> = std::result::Result<T, ProviderError>;

/// One in-flight execution, shared by all callers with the same fingerprint.
struct PendingEntry<T: Clone> {
    /// Identifies the executor so a superseded task cannot remove its
    /// replacement from the map.
    id: Uuid,
    future: Shared<BoxFuture<'static, PendingResult<T>>>,
    started_at: Instant,
}

impl<T: Clone> Clone for PendingEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            future: self.future.clone(),
            started_at: self.started_at,
        }
    }
}

/// Result of a coalesced call: the shared outcome plus whether this caller
/// piggybacked on an execution another caller started.
#[derive(Debug)]
pub struct CoalesceOutcome<T> {
    pub result: PendingResult<T>,
    pub deduplicated: bool,
}

/// Coalescing map keyed by request fingerprint.
///
/// Cloning is cheap and shares the underlying map.
pub struct RequestCoalescer<T: Clone + Send + Sync + 'static> {
    pending: Arc<DashMap<Fingerprint, PendingEntry<T>>>,
    safety_net: Duration,
}

impl<T: Clone + Send + Sync + 'static> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            safety_net: self.safety_net,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self::new(Duration::from_secs(dedup_constants::SAFETY_NET_SECS))
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    pub fn new(safety_net: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            safety_net,
        }
    }

    /// Run `execute` for this fingerprint, or join an execution already in
    /// flight.
    ///
    /// Exactly one caller's `execute` is invoked per fingerprint at a time.
    /// The executor runs detached from every caller, so dropping this future
    /// does not abort the upstream call.
    pub async fn run<F, Fut>(&self, fingerprint: &Fingerprint, execute: F) -> CoalesceOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PendingResult<T>> + Send + 'static,
    {
        // The entry guard must not live across an await point.
        let (future, deduplicated) = match self.pending.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started_at.elapsed() > self.safety_net {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        elapsed_secs = occupied.get().started_at.elapsed().as_secs(),
                        "Replacing stalled in-flight execution"
                    );
                    let fresh = self.spawn_executor(fingerprint.clone(), execute);
                    let future = fresh.future.clone();
                    occupied.insert(fresh);
                    (future, false)
                } else {
                    tracing::debug!(fingerprint = %fingerprint, "Joining in-flight execution");
                    (occupied.get().future.clone(), true)
                }
            }
            Entry::Vacant(vacant) => {
                let entry = self.spawn_executor(fingerprint.clone(), execute);
                let future = entry.future.clone();
                vacant.insert(entry);
                (future, false)
            }
        };

        let result = future.await;
        CoalesceOutcome {
            result,
            deduplicated,
        }
    }

    /// Spawn the executor as a detached task that removes its own map entry
    /// when it finishes, even if the execution panics.
    fn spawn_executor<F, Fut>(&self, fingerprint: Fingerprint, execute: F) -> PendingEntry<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PendingResult<T>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let pending = Arc::clone(&self.pending);
        let fut = execute();

        let handle = tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(fut).catch_unwind().await;

            // Only remove the entry if it is still ours; a stalled entry may
            // already have been replaced by a fresh executor.
            pending.remove_if(&fingerprint, |_, entry| entry.id == id);

            match result {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "Unknown panic".to_string());
                    tracing::error!("Coalesced execution panicked: {}", msg);
                    Err(ProviderError::internal(format!(
                        "execution panicked: {}",
                        msg
                    )))
                }
            }
        });

        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ProviderError::internal(format!(
                    "execution task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();

        PendingEntry {
            id,
            future,
            started_at: Instant::now(),
        }
    }

    /// Drop entries older than the safety net. Returns the number removed.
    pub fn clean_stale(&self) -> usize {
        let before = self.pending.len();
        let deadline = self.safety_net;
        self.pending
            .retain(|_, entry| entry.started_at.elapsed() <= deadline);
        before - self.pending.len()
    }

    /// Drop every entry regardless of age. Returns the number removed.
    ///
    /// Waiters already attached to a dropped entry still resolve through
    /// their shared handle; this only stops new callers from joining.
    pub fn clear(&self) -> usize {
        let before = self.pending.len();
        self.pending.clear();
        before
    }

    /// Number of executions currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
