//! Per-key "go-ahead" announcements.
//!
//! [`SequentialGate::enter`] announces that a caller is starting work for a
//! key and wakes anyone listening on that key. It is not a mutex: the caller
//! never waits for earlier occupants of the same key to finish, so two
//! callers may be inside the same key's section at once.
//!
//! Two lock tiers are used. The registry lock only guards the key map; each
//! key's rendezvous has its own lock for the broadcast. Registry entries are
//! created on first use and kept for the life of the process.
//!
//! # Example
//!
//! ```
//! use provider_acctest_gate::SequentialGate;
//!
//! let gate = SequentialGate::new();
//! gate.enter("is_vpn_server");
//! // ... test step ...
//! gate.exit("is_vpn_server");
//! assert!(gate.contains("is_vpn_server"));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Default)]
struct Signal {
    generation: u64,
    listeners: usize,
}

#[derive(Debug, Default)]
struct Rendezvous {
    signal: Mutex<Signal>,
    entered: Condvar,
}

impl Rendezvous {
    fn lock(&self) -> MutexGuard<'_, Signal> {
        self.signal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of per-key rendezvous points.
#[derive(Debug, Default)]
pub struct SequentialGate {
    registry: Mutex<HashMap<String, Arc<Rendezvous>>>,
}

impl SequentialGate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<Rendezvous>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rendezvous(&self, key: &str) -> Arc<Rendezvous> {
        let mut registry = self.registry();
        if let Some(existing) = registry.get(key) {
            return Arc::clone(existing);
        }

        debug!(key, keys = registry.len() + 1, "registered sequential key");
        let created = Arc::new(Rendezvous::default());
        registry.insert(key.to_string(), Arc::clone(&created));
        created
    }

    /// Announce entry for `key`, wake its listeners, and return immediately.
    ///
    /// Callers already inside the section for `key` are not waited for.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    /// use std::time::Duration;
    /// use provider_acctest_gate::SequentialGate;
    ///
    /// let gate = Arc::new(SequentialGate::new());
    ///
    /// let listener = {
    ///     let gate = Arc::clone(&gate);
    ///     thread::spawn(move || gate.wait_for_enter("is_route", Duration::from_secs(5)))
    /// };
    ///
    /// // Keep announcing until the listener has caught one.
    /// while !listener.is_finished() {
    ///     gate.enter("is_route");
    ///     thread::sleep(Duration::from_millis(5));
    /// }
    /// assert!(listener.join().unwrap());
    /// ```
    pub fn enter(&self, key: &str) {
        let rendezvous = self.rendezvous(key);

        let mut signal = rendezvous.lock();
        signal.generation = signal.generation.wrapping_add(1);
        rendezvous.entered.notify_all();
        debug!(
            key,
            generation = signal.generation,
            listeners = signal.listeners,
            "entered sequential section"
        );
    }

    /// Leave the section for `key`. Only records a log event.
    pub fn exit(&self, key: &str) {
        debug!(key, "exited sequential section");
    }

    /// Run `f` between [`enter`](Self::enter) and [`exit`](Self::exit).
    pub fn run<F, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.enter(key);
        let output = f();
        self.exit(key);
        output
    }

    /// Block until the next [`enter`](Self::enter) on `key`, or until
    /// `timeout` elapses.
    ///
    /// Returns `true` if an entry was observed. Entries that happened before
    /// this call are not counted.
    pub fn wait_for_enter(&self, key: &str, timeout: Duration) -> bool {
        let rendezvous = self.rendezvous(key);

        let mut signal = rendezvous.lock();
        let seen = signal.generation;
        signal.listeners += 1;

        let (mut signal, result) = rendezvous
            .entered
            .wait_timeout_while(signal, timeout, |s| s.generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        signal.listeners -= 1;

        !result.timed_out()
    }

    /// Whether `key` has ever been used.
    pub fn contains(&self, key: &str) -> bool {
        self.registry().contains_key(key)
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    /// Whether no key has been used yet.
    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn listeners(&self, key: &str) -> usize {
        self.rendezvous(key).lock().listeners
    }
}
