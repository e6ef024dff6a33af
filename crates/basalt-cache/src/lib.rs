//! Reference-counted resource cache.
//!
//! [`RefCache`] materializes resources on demand through a [`Source`] and
//! keeps them resident while anyone holds a reference. The last release
//! hands the resource back to the source for reclamation (for pages that
//! means flush-if-dirty) and evicts it. A capacity cap bounds the number of
//! *distinct* live resources; a cap of zero means unbounded.
//!
//! Concurrency contract: when two threads demand the same absent key, the
//! loader runs exactly once — the second thread parks on a condvar until
//! the first finishes, then takes the cached handle.

use std::hash::Hash;

use basalt_error::{BasaltError, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Where cached resources come from and where they go.
///
/// `load` may block on I/O; it is always called outside the cache mutex.
/// `reclaim` runs under the cache mutex so that a concurrent `get` of the
/// same key cannot observe the resource half-way through teardown; it must
/// not fail — a finalizer that gives up would leak the slot accounting.
pub trait Source {
    type Key: Copy + Eq + Hash;
    type Handle: Clone;

    fn load(&self, key: Self::Key) -> Result<Self::Handle>;
    fn reclaim(&self, key: Self::Key, handle: Self::Handle);
}

struct State<K, H> {
    present: HashMap<K, H>,
    refs: HashMap<K, u32>,
    loading: HashSet<K>,
    count: u32,
}

/// Reference-counted cache over a [`Source`].
pub struct RefCache<S: Source> {
    source: S,
    cap: u32,
    state: Mutex<State<S::Key, S::Handle>>,
    load_done: Condvar,
}

impl<S: Source> RefCache<S> {
    /// Create a cache admitting at most `cap` distinct resources
    /// (`0` = unbounded).
    pub fn new(source: S, cap: u32) -> Self {
        Self {
            source,
            cap,
            state: Mutex::new(State {
                present: HashMap::new(),
                refs: HashMap::new(),
                loading: HashSet::new(),
                count: 0,
            }),
            load_done: Condvar::new(),
        }
    }

    /// The underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of distinct resident resources.
    pub fn len(&self) -> usize {
        self.state.lock().present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().present.is_empty()
    }

    /// Fetch a shared handle, loading the resource if absent.
    ///
    /// # Errors
    /// [`BasaltError::CacheFull`] when the cap is reached and the key is
    /// not resident; otherwise whatever the loader returns.
    pub fn get(&self, key: S::Key) -> Result<S::Handle> {
        let mut state = self.state.lock();
        loop {
            if state.loading.contains(&key) {
                // Another thread is materializing this key; wait for it.
                self.load_done.wait(&mut state);
                continue;
            }
            if let Some(handle) = state.present.get(&key) {
                let handle = handle.clone();
                *state
                    .refs
                    .get_mut(&key)
                    .unwrap_or_else(|| panic!("present key has no refcount")) += 1;
                return Ok(handle);
            }
            if self.cap > 0 && state.count == self.cap {
                return Err(BasaltError::CacheFull);
            }
            // Reserve the slot before loading so concurrent demand for the
            // same key parks instead of double-loading.
            state.count += 1;
            state.loading.insert(key);
            break;
        }
        drop(state);

        let loaded = self.source.load(key);

        let mut state = self.state.lock();
        state.loading.remove(&key);
        let result = match loaded {
            Ok(handle) => {
                state.present.insert(key, handle.clone());
                state.refs.insert(key, 1);
                Ok(handle)
            }
            Err(err) => {
                // Back out the reservation.
                state.count -= 1;
                Err(err)
            }
        };
        drop(state);
        self.load_done.notify_all();
        result
    }

    /// Drop one reference to `key`. The last release reclaims and evicts.
    ///
    /// # Panics
    /// If `key` is not resident — releases must pair with gets.
    pub fn release(&self, key: S::Key) {
        let mut state = self.state.lock();
        let refs = state
            .refs
            .get_mut(&key)
            .unwrap_or_else(|| panic!("release of a key that is not resident"));
        *refs -= 1;
        if *refs == 0 {
            state.refs.remove(&key);
            let handle = state
                .present
                .remove(&key)
                .unwrap_or_else(|| panic!("refcounted key has no handle"));
            state.count -= 1;
            trace!(resident = state.present.len(), "cache evict");
            // Reclaim under the mutex: a concurrent get of the same key
            // must not reload while teardown is still writing back.
            self.source.reclaim(key, handle);
        }
    }

    /// Reclaim every resident resource regardless of reference counts.
    /// Only meaningful at shutdown, when no handles are live.
    pub fn close(&self) {
        let mut state = self.state.lock();
        let drained: Vec<_> = state.present.drain().collect();
        state.refs.clear();
        state.count = 0;
        for (key, handle) in drained {
            self.source.reclaim(key, handle);
        }
    }
}
