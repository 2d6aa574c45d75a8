//! Upstream admission engine: the concurrency core sitting in front of
//! every upstream call. Enforces three orthogonal policies — a bounded
//! global FIFO queue (Policy A), per-API-key single-flight (Policy B),
//! and submit pacing (Policy C) — behind one mutex guarding a small
//! set/list, not a per-key mutex. Per-key concurrency is enforced purely
//! by set membership, which is what makes same-key rejection immediate
//! without occupying a queue slot.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// Per-key or queue-full rejection — immediate, no slot was touched.
    RateLimited,
    /// The key is known-revoked; acquisition refused without consulting
    /// the key store.
    KeyRevoked,
    /// The caller's cancellation token fired while waiting.
    Cancelled,
}

struct WaiterState {
    cancelled: AtomicBool,
    handed_off: AtomicBool,
}

struct Waiter {
    id: u64,
    api_key_id: String,
    ready_tx: Option<oneshot::Sender<()>>,
    state: Arc<WaiterState>,
}

struct Inner {
    in_flight: usize,
    waiters: VecDeque<Waiter>,
    active_keys: HashSet<String>,
    revoked_keys: HashSet<String>,
    last_submit_start: Option<Instant>,
}

/// Bounded global FIFO admission gate with per-key single-flight and
/// submit pacing. Cloned cheaply (internally `Arc`-backed state) so it
/// can be shared across the router's handlers.
#[derive(Clone)]
pub struct AdmissionEngine {
    inner: Arc<Mutex<Inner>>,
    max_concurrent: usize,
    max_queue: usize,
    submit_min_interval: Duration,
    next_waiter_id: Arc<AtomicU64>,
}

/// Held while an upstream call is in flight. Releases the slot — and
/// hands it off to the next waiter, if any — on drop, regardless of
/// whether the caller returns normally, errors, or is cancelled.
pub struct AdmitGuard {
    engine: AdmissionEngine,
    api_key_id: String,
    released: bool,
}

impl Drop for AdmitGuard {
    fn drop(&mut self) {
        if !self.released {
            self.engine.release_slot(&self.api_key_id);
        }
    }
}

impl AdmissionEngine {
    pub fn new(max_concurrent: usize, max_queue: usize, submit_min_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                in_flight: 0,
                waiters: VecDeque::new(),
                active_keys: HashSet::new(),
                revoked_keys: HashSet::new(),
                last_submit_start: None,
            })),
            max_concurrent,
            max_queue,
            submit_min_interval,
            next_waiter_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mark a key as revoked so future acquisitions fail fast. Does not
    /// affect any call already admitted for that key.
    pub fn mark_key_revoked(&self, api_key_id: &str) {
        self.inner.lock().revoked_keys.insert(api_key_id.to_string());
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Current queue depth, for metrics scraping.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Current in-flight count, for metrics scraping.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Acquire a slot for `api_key_id`, honouring `cancel`. Resolves
    /// immediately with `RateLimited`/`KeyRevoked` or, after waiting in
    /// the FIFO queue, with a guard or `Cancelled`.
    pub async fn acquire(
        &self,
        api_key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AdmitGuard, AdmitError> {
        let wait_rx = {
            let mut guard = self.inner.lock();

            if guard.revoked_keys.contains(api_key_id) {
                return Err(AdmitError::KeyRevoked);
            }

            if guard.active_keys.contains(api_key_id) {
                return Err(AdmitError::RateLimited);
            }
            guard.active_keys.insert(api_key_id.to_string());

            if guard.in_flight < self.max_concurrent {
                guard.in_flight += 1;
                None
            } else if guard.waiters.len() < self.max_queue {
                let (tx, rx) = oneshot::channel();
                let state = Arc::new(WaiterState {
                    cancelled: AtomicBool::new(false),
                    handed_off: AtomicBool::new(false),
                });
                let id = self.next_waiter_id.fetch_add(1, Ordering::SeqCst);
                guard.waiters.push_back(Waiter {
                    id,
                    api_key_id: api_key_id.to_string(),
                    ready_tx: Some(tx),
                    state: state.clone(),
                });
                Some((id, rx, state))
            } else {
                guard.active_keys.remove(api_key_id);
                return Err(AdmitError::RateLimited);
            }
        };

        let Some((waiter_id, ready_rx, state)) = wait_rx else {
            return Ok(AdmitGuard {
                engine: self.clone(),
                api_key_id: api_key_id.to_string(),
                released: false,
            });
        };

        tokio::select! {
            _ = ready_rx => Ok(AdmitGuard {
                engine: self.clone(),
                api_key_id: api_key_id.to_string(),
                released: false,
            }),
            _ = cancel.cancelled() => {
                state.cancelled.store(true, Ordering::SeqCst);
                self.cleanup_cancelled_waiter(waiter_id, api_key_id, &state);
                Err(AdmitError::Cancelled)
            }
        }
    }

    /// Submit-only pacing: sleep until at least `submit_min_interval`
    /// has elapsed since the previous submit's reserved start time.
    /// Cancellable; does not release the admission slot on cancellation.
    pub async fn pace_submit(&self, cancel: &CancellationToken) -> Result<(), AdmitError> {
        if self.submit_min_interval.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let wait = {
            let mut guard = self.inner.lock();
            let wait = match guard.last_submit_start {
                Some(last) if last > now => last - now,
                Some(last) => self
                    .submit_min_interval
                    .saturating_sub(now.saturating_duration_since(last)),
                None => Duration::ZERO,
            };
            guard.last_submit_start = Some(now + wait);
            wait
        };

        if wait.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(AdmitError::Cancelled),
        }
    }

    fn cleanup_cancelled_waiter(&self, waiter_id: u64, api_key_id: &str, state: &WaiterState) {
        let mut guard = self.inner.lock();

        let position = guard.waiters.iter().position(|w| w.id == waiter_id);
        if let Some(pos) = position {
            guard.waiters.remove(pos);
        } else if state.handed_off.load(Ordering::SeqCst) {
            // The slot was already reserved for us before we cancelled;
            // pass it on instead of leaking it.
            Self::reassign_locked(&mut guard);
        }

        guard.active_keys.remove(api_key_id);
    }

    /// Hand the currently-held slot to the next live waiter, skipping
    /// any already-cancelled ones, or give it back to the free pool.
    fn reassign_locked(guard: &mut Inner) {
        loop {
            match guard.waiters.pop_front() {
                None => {
                    guard.in_flight = guard.in_flight.saturating_sub(1);
                    return;
                }
                Some(mut w) => {
                    if w.state.cancelled.load(Ordering::SeqCst) {
                        continue;
                    }
                    w.state.handed_off.store(true, Ordering::SeqCst);
                    if let Some(tx) = w.ready_tx.take() {
                        let _ = tx.send(());
                    }
                    return;
                }
            }
        }
    }

    fn release_slot(&self, releasing_key: &str) {
        let mut guard = self.inner.lock();
        Self::reassign_locked(&mut guard);
        guard.active_keys.remove(releasing_key);
    }
}
