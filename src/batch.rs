//! Bounded-batch admission gate.
//!
//! A [`BatchExecutor`] admits at most `capacity` callers at a time. When the
//! last admitted caller releases while others are still waiting, that caller
//! sleeps for `cooldown` before anyone else is admitted. This smooths bursts
//! of acceptance tests against a rate-limited cloud account.
//!
//! # Starvation
//!
//! Admission never fails and never times out through [`BatchExecutor::acquire`].
//! A [`BatchPermit`] that is never dropped (for example one passed to
//! `std::mem::forget`, or held by a thread that blocks forever) keeps its slot
//! for the rest of the process, and once every slot is lost this way all other
//! callers block permanently. Use [`BatchExecutor::acquire_timeout`] where an
//! upper bound on waiting is required.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use provider_acctest_gate::BatchExecutor;
//!
//! let executor = BatchExecutor::new(2, Duration::from_millis(10));
//!
//! let permit = executor.acquire("is_backup_policy");
//! assert_eq!(executor.active(), 1);
//! permit.release();
//! assert_eq!(executor.active(), 0);
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::error::GateError;

#[derive(Debug, Default)]
struct BatchState {
    active: usize,
    waiting: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BatchState>,
    admitted: Condvar,
    capacity: usize,
    cooldown: Duration,
}

impl Shared {
    // Counters are only ever updated in single statements, so a poisoned
    // lock still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits up to `capacity` concurrent callers, pausing for `cooldown` when a
/// full drain happens with callers still waiting.
///
/// The executor is a cheap handle: clones share the same counters.
/// Admission is not FIFO; all waiters are woken together and race to
/// re-check the capacity.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    shared: Arc<Shared>,
}

impl BatchExecutor {
    /// Create a new executor.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, cooldown: Duration) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BatchState::default()),
                admitted: Condvar::new(),
                capacity,
                cooldown,
            }),
        }
    }

    /// Create an executor from a validated configuration.
    pub fn from_config(config: BatchConfig) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self::new(config.capacity, config.cooldown))
    }

    /// Block until a slot is free, then take it.
    ///
    /// The slot is given back when the returned permit is released or dropped.
    ///
    /// # Arguments
    ///
    /// * `key` - Labels log events only; every key draws from the same pool.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use provider_acctest_gate::BatchExecutor;
    ///
    /// let executor = BatchExecutor::new(1, Duration::ZERO);
    ///
    /// let permit = executor.acquire("is_placement_group");
    /// assert_eq!(permit.key(), "is_placement_group");
    /// assert_eq!(executor.active(), 1);
    ///
    /// drop(permit);
    /// assert_eq!(executor.active(), 0);
    /// ```
    pub fn acquire(&self, key: &str) -> BatchPermit {
        let shared = &*self.shared;
        let capacity = shared.capacity;
        let mut state = shared.lock();

        if state.active >= capacity {
            state.waiting += 1;
            debug!(
                key,
                active = state.active,
                waiting = state.waiting,
                capacity,
                "waiting for batch admission"
            );
            state = shared
                .admitted
                .wait_while(state, |s| s.active >= capacity)
                .unwrap_or_else(PoisonError::into_inner);
            state.waiting -= 1;
        }

        state.active += 1;
        info!(
            key,
            active = state.active,
            waiting = state.waiting,
            capacity,
            "admitted to batch"
        );
        drop(state);

        BatchPermit::new(self.clone(), key)
    }

    /// Like [`acquire`](Self::acquire), but give up after `timeout`.
    ///
    /// A caller may overshoot `timeout` by up to one cooldown, because the
    /// cooldown is taken while holding the executor's lock.
    pub fn acquire_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<BatchPermit, GateError> {
        let start = Instant::now();
        let shared = &*self.shared;
        let capacity = shared.capacity;
        let mut state = shared.lock();

        if state.active >= capacity {
            state.waiting += 1;
            debug!(
                key,
                active = state.active,
                waiting = state.waiting,
                timeout_ms = as_millis(timeout),
                "waiting for batch admission with deadline"
            );
            let (guard, result) = shared
                .admitted
                .wait_timeout_while(state, timeout, |s| s.active >= capacity)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.waiting -= 1;

            if result.timed_out() {
                let waited = start.elapsed();
                warn!(
                    key,
                    active = state.active,
                    waited_ms = as_millis(waited),
                    "gave up waiting for batch admission"
                );
                return Err(GateError::Timeout {
                    key: key.to_string(),
                    waited,
                });
            }
        }

        state.active += 1;
        info!(
            key,
            active = state.active,
            waiting = state.waiting,
            capacity,
            "admitted to batch"
        );
        drop(state);

        Ok(BatchPermit::new(self.clone(), key))
    }

    /// Run `f` while holding a slot.
    ///
    /// The slot is released even if `f` panics.
    pub fn run<F, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _permit = self.acquire(key);
        f()
    }

    fn release(&self, key: &str) {
        let shared = &*self.shared;
        let mut state = shared.lock();

        debug_assert!(state.active > 0, "release without a matching acquire");
        state.active = state.active.saturating_sub(1);
        debug!(
            key,
            active = state.active,
            waiting = state.waiting,
            "released batch slot"
        );

        if state.active == 0 && state.waiting > 0 && !shared.cooldown.is_zero() {
            info!(
                key,
                waiting = state.waiting,
                cooldown_ms = as_millis(shared.cooldown),
                "batch drained, cooling down"
            );
            // The lock stays held so nobody is admitted until the pause ends.
            thread::sleep(shared.cooldown);
            info!(key, waiting = state.waiting, "batch cooldown finished");
        }

        shared.admitted.notify_all();
    }

    /// Number of callers currently admitted.
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }

    /// Number of callers currently blocked waiting for admission.
    pub fn waiting(&self) -> usize {
        self.shared.lock().waiting
    }

    /// Maximum number of concurrently admitted callers.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Pause applied after a drain with waiters.
    pub fn cooldown(&self) -> Duration {
        self.shared.cooldown
    }

    /// Point-in-time view of the executor, for logs and test output.
    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.shared.lock();
        BatchSnapshot {
            capacity: self.shared.capacity,
            cooldown_ms: as_millis(self.shared.cooldown),
            active: state.active,
            waiting: state.waiting,
        }
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub(crate) fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A slot held in a [`BatchExecutor`].
///
/// Dropping the permit releases the slot. The release may block for the
/// executor's cooldown if it drains the batch while others are waiting.
#[must_use = "dropping the permit releases the batch slot immediately"]
#[derive(Debug)]
pub struct BatchPermit {
    executor: BatchExecutor,
    key: String,
}

impl BatchPermit {
    fn new(executor: BatchExecutor, key: &str) -> Self {
        Self {
            executor,
            key: key.to_string(),
        }
    }

    /// The key this permit was acquired for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give the slot back.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BatchPermit {
    fn drop(&mut self) {
        self.executor.release(&self.key);
    }
}

/// Counters of a [`BatchExecutor`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    /// Maximum concurrent admissions.
    pub capacity: usize,
    /// Drain cooldown in milliseconds.
    pub cooldown_ms: u64,
    /// Currently admitted callers.
    pub active: usize,
    /// Currently blocked callers.
    pub waiting: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[should_panic(expected = "capacity must be greater than zero")]
    fn test_new_zero_capacity_panics() {
        let _ = BatchExecutor::new(0, Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let executor =
            BatchExecutor::from_config(BatchConfig::new().with_capacity(4)).unwrap();
        assert_eq!(executor.capacity(), 4);
        assert_eq!(executor.cooldown(), Duration::from_secs(120));

        let err = BatchExecutor::from_config(BatchConfig::new().with_capacity(0)).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[test]
    fn test_third_caller_admitted_after_single_release() {
        // Long cooldown: if it were applied here the admission would be late.
        let executor = BatchExecutor::new(2, Duration::from_secs(5));
        let (admitted_tx, admitted_rx) = mpsc::channel();
        let mut release_txs = Vec::new();
        let mut handles = Vec::new();

        for id in 0..3 {
            let executor = executor.clone();
            let admitted_tx = admitted_tx.clone();
            let (release_tx, release_rx) = mpsc::channel::<()>();
            release_txs.push(release_tx);
            handles.push(thread::spawn(move || {
                let permit = executor.acquire("k");
                admitted_tx.send(id).unwrap();
                release_rx.recv().unwrap();
                permit.release();
            }));
        }

        let first = admitted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = admitted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(admitted_rx.recv_timeout(Duration::from_millis(100)).is_err());
        wait_until("third caller to block", || executor.waiting() == 1);
        assert_eq!(executor.active(), 2);

        let start = Instant::now();
        release_txs[first].send(()).unwrap();
        let third = admitted_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "third caller should not pay a cooldown, took {:?}",
            start.elapsed()
        );
        assert_ne!(third, first);
        assert_ne!(third, second);

        release_txs[second].send(()).unwrap();
        release_txs[third].send(()).unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(executor.active(), 0);
        assert_eq!(executor.waiting(), 0);
    }

    #[test]
    fn test_drain_with_waiter_applies_cooldown() {
        let cooldown = Duration::from_millis(150);
        let executor = BatchExecutor::new(1, cooldown);
        let permit = executor.acquire("k");

        let waiter = {
            let executor = executor.clone();
            thread::spawn(move || {
                let permit = executor.acquire("k");
                let admitted_at = Instant::now();
                permit.release();
                admitted_at
            })
        };
        wait_until("waiter to block", || executor.waiting() == 1);

        let drained_at = Instant::now();
        permit.release();
        // The releasing caller pays the cooldown.
        assert!(drained_at.elapsed() >= cooldown);

        let admitted_at = waiter.join().unwrap();
        assert!(
            admitted_at.duration_since(drained_at) >= cooldown,
            "admitted {:?} after drain, expected at least {:?}",
            admitted_at.duration_since(drained_at),
            cooldown
        );
        assert_eq!(executor.active(), 0);
    }

    #[test]
    fn test_no_cooldown_without_waiters() {
        let executor = BatchExecutor::new(2, Duration::from_secs(5));
        let a = executor.acquire("k");
        let b = executor.acquire("k");

        let start = Instant::now();
        a.release();
        b.release();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(executor.active(), 0);
    }

    #[test]
    fn test_sequential_acquire_release() {
        let executor = BatchExecutor::new(1, Duration::ZERO);
        for _ in 0..5 {
            let permit = executor.acquire("k");
            assert_eq!(executor.active(), 1);
            permit.release();
            assert_eq!(executor.active(), 0);
        }
        assert_eq!(executor.waiting(), 0);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let executor = BatchExecutor::new(3, Duration::from_millis(5));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let executor = executor.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let key = format!("test_{}", i);
                    executor.run(&key, || {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        current.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(executor.active(), 0);
        assert_eq!(executor.waiting(), 0);
    }

    #[test]
    fn test_waiter_eventually_admitted_after_full_drain() {
        let executor = BatchExecutor::new(2, Duration::from_millis(20));
        let a = executor.acquire("k");
        let b = executor.acquire("k");

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let executor = executor.clone();
            thread::spawn(move || {
                let permit = executor.acquire("late");
                tx.send(()).unwrap();
                permit.release();
            })
        };
        wait_until("waiter to block", || executor.waiting() == 1);

        a.release();
        b.release();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(executor.active(), 0);
    }

    #[test]
    fn test_acquire_timeout() {
        let executor = BatchExecutor::new(1, Duration::ZERO);

        let permit = executor
            .acquire_timeout("k", Duration::from_millis(50))
            .unwrap();
        assert_eq!(permit.key(), "k");

        let err = executor
            .acquire_timeout("other", Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout());
        match err {
            GateError::Timeout { key, waited } => {
                assert_eq!(key, "other");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(executor.waiting(), 0);
        assert_eq!(executor.active(), 1);

        permit.release();
        assert!(executor
            .acquire_timeout("other", Duration::from_millis(50))
            .is_ok());
        assert_eq!(executor.active(), 0);
    }

    #[test]
    fn test_run_returns_value_and_releases() {
        let executor = BatchExecutor::new(1, Duration::ZERO);
        let value = executor.run("k", || {
            assert_eq!(executor.active(), 1);
            42
        });
        assert_eq!(value, 42);
        assert_eq!(executor.active(), 0);
    }

    #[test]
    fn test_run_releases_on_panic() {
        let executor = BatchExecutor::new(1, Duration::ZERO);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            executor.run("k", || panic!("step failed"))
        }));
        assert!(result.is_err());
        assert_eq!(executor.active(), 0);

        // The slot is usable again.
        executor.acquire("k").release();
    }

    #[test]
    fn test_snapshot() {
        let executor = BatchExecutor::new(2, Duration::from_millis(1500));
        let _permit = executor.acquire("k");

        let snapshot = executor.snapshot();
        assert_eq!(
            snapshot,
            BatchSnapshot {
                capacity: 2,
                cooldown_ms: 1500,
                active: 1,
                waiting: 0,
            }
        );

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["active"], 1);
        assert_eq!(json["cooldown_ms"], 1500);
    }

    #[test]
    fn test_as_millis_saturates() {
        assert_eq!(as_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(as_millis(Duration::MAX), u64::MAX);

        let executor = BatchExecutor::new(1, Duration::MAX);
        assert_eq!(executor.snapshot().cooldown_ms, u64::MAX);
    }
}
