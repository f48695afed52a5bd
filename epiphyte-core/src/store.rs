use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::value::Value;

/// Error from a store mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("property key must be non-empty")]
    EmptyKey,
    #[error("property values must not contain non-finite floats")]
    NonFiniteFloat,
    #[error("re-entrant mutation from inside a change notification")]
    ReentrantMutation,
}

/// A change that happened to a store, delivered to the registered watcher
/// synchronously before the mutating call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A key was inserted or overwritten.
    Set { key: String },
    /// A present key was removed.
    Removed { key: String },
    /// All entries were removed at once.
    Cleared,
}

type Watcher = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

// Store ids distinguish stores in the per-thread notification stack, so a
// watcher may freely mutate *other* stores while mutation of the notifying
// store itself is rejected.
static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static NOTIFYING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Pops the store id from the notification stack even if the watcher panics.
struct NotifyGuard(u64);

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFYING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.0) {
                stack.remove(pos);
            }
        });
    }
}

/// Concurrent key/value store for schema-flexible entity properties.
///
/// All methods take `&self`; the entry map lives behind an `RwLock` so
/// readers on different keys never block each other and each individual
/// operation is atomic (no torn reads, no lost updates).
///
/// Every successful mutation bumps a monotonic generation counter. The
/// serialization controller derives its dirty state by comparing
/// generations instead of keeping a separate flag, so there is no second
/// piece of state to fall out of sync.
///
/// A watcher may be registered for change visibility. Mutating the store
/// from inside its own notification on the same thread is rejected with
/// `StoreError::ReentrantMutation` rather than deadlocking.
pub struct PropertyStore {
    id: u64,
    entries: RwLock<HashMap<String, Value>>,
    generation: AtomicU64,
    watcher: RwLock<Option<Watcher>>,
}

impl PropertyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        PropertyStore {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            watcher: RwLock::new(None),
        }
    }

    /// Returns a copy of the value for a key, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Returns whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }

    /// Inserts or overwrites a key.
    ///
    /// Values containing a non-finite float at any depth are rejected:
    /// they have no representation in the durable payload, so admitting
    /// one would corrupt it to nil across a save/reload cycle.
    ///
    /// The registered watcher is notified synchronously before this call
    /// returns; the entry lock is released first, so notification never
    /// blocks concurrent readers.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), StoreError> {
        let key = key.into();
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let value = value.into();
        if value.has_non_finite() {
            return Err(StoreError::NonFiniteFloat);
        }
        self.check_reentrancy()?;
        {
            let mut entries = self.entries.write().unwrap();
            entries.insert(key.clone(), value);
            // Bumped while the write lock is held so a snapshot can never
            // observe the new value under the old generation.
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.notify(&ChangeEvent::Set { key });
        Ok(())
    }

    /// Removes a key, returning whether it was present.
    ///
    /// Only an actual removal bumps the generation and notifies.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        self.check_reentrancy()?;
        let removed = {
            let mut entries = self.entries.write().unwrap();
            let removed = entries.remove(key).is_some();
            if removed {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            removed
        };
        if removed {
            self.notify(&ChangeEvent::Removed {
                key: key.to_string(),
            });
        }
        Ok(removed)
    }

    /// Removes every entry. A no-op on an already empty store.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.check_reentrancy()?;
        let cleared = {
            let mut entries = self.entries.write().unwrap();
            if entries.is_empty() {
                false
            } else {
                entries.clear();
                self.generation.fetch_add(1, Ordering::AcqRel);
                true
            }
        };
        if cleared {
            self.notify(&ChangeEvent::Cleared);
        }
        Ok(())
    }

    /// Returns a point-in-time copy of all entries, sorted by key.
    ///
    /// Safe to iterate while other threads keep mutating the live store;
    /// the copy never contains a half-written entry.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = {
            let entries = self.entries.read().unwrap();
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Current mutation generation. Strictly increases with every
    /// successful mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Registers the change watcher, replacing any previous one.
    ///
    /// Legal from inside a notification: the notifying call finishes with
    /// the watcher it already cloned out, and later mutations see the
    /// replacement.
    pub fn set_watcher(&self, watcher: impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        *self.watcher.write().unwrap() = Some(Arc::new(watcher));
    }

    /// Removes the change watcher.
    pub fn clear_watcher(&self) {
        *self.watcher.write().unwrap() = None;
    }

    /// Swaps in a full set of entries without notifying the watcher.
    ///
    /// Used by the load path: repopulation is not a consumer mutation, and
    /// firing the watcher mid-load could re-enter the controller. Returns
    /// the generation the swap produced, so the caller can record exactly
    /// this state as clean.
    pub(crate) fn replace_all(&self, new_entries: IndexMap<String, Value>) -> u64 {
        let mut entries = self.entries.write().unwrap();
        *entries = new_entries.into_iter().collect();
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Bumps the generation without touching entries. Used when non-map
    /// durable state (the declared type) changes.
    pub(crate) fn touch(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn check_reentrancy(&self) -> Result<(), StoreError> {
        let reentrant = NOTIFYING.with(|stack| stack.borrow().contains(&self.id));
        if reentrant {
            Err(StoreError::ReentrantMutation)
        } else {
            Ok(())
        }
    }

    fn notify(&self, event: &ChangeEvent) {
        // Clone the watcher out and drop the slot guard before invoking,
        // so a watcher calling set_watcher/clear_watcher on its own store
        // does not take a same-thread read-then-write lock.
        let watcher = self.watcher.read().unwrap().clone();
        if let Some(watcher) = watcher {
            NOTIFYING.with(|stack| stack.borrow_mut().push(self.id));
            let _guard = NotifyGuard(self.id);
            watcher(event);
        }
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore")
            .field("len", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    #[test]
    fn set_then_get() {
        let store = PropertyStore::new();
        store.set("length", 4.2).unwrap();

        assert_eq!(store.get("length"), Some(Value::Float(4.2)));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn set_overwrites() {
        let store = PropertyStore::new();
        store.set("material", "iron").unwrap();
        store.set("material", "steel").unwrap();

        assert_eq!(store.get("material"), Some(Value::from("steel")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_present_and_absent() {
        let store = PropertyStore::new();
        store.set("tag", "a").unwrap();

        assert!(store.remove("tag").unwrap());
        assert_eq!(store.get("tag"), None);
        assert!(!store.remove("tag").unwrap());
    }

    #[test]
    fn empty_key_rejected_without_state_change() {
        let store = PropertyStore::new();
        let before = store.generation();

        assert_eq!(store.set("", 1), Err(StoreError::EmptyKey));
        assert_eq!(store.remove(""), Err(StoreError::EmptyKey));
        assert_eq!(store.generation(), before);
        assert!(store.is_empty());
    }

    #[test]
    fn non_finite_floats_rejected_without_state_change() {
        let store = PropertyStore::new();
        let before = store.generation();

        assert_eq!(
            store.set("reading", f64::NAN),
            Err(StoreError::NonFiniteFloat)
        );
        assert_eq!(
            store.set("bounds", Value::list([Value::Float(f64::INFINITY)])),
            Err(StoreError::NonFiniteFloat)
        );
        assert_eq!(
            store.set(
                "origin",
                Value::record([("x", Value::Float(f64::NEG_INFINITY))])
            ),
            Err(StoreError::NonFiniteFloat)
        );

        assert_eq!(store.generation(), before);
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_point_in_time_copy() {
        let store = PropertyStore::new();
        store.set("b", 2).unwrap();
        store.set("a", 1).unwrap();

        let snap = store.snapshot();
        store.set("c", 3).unwrap();

        assert_eq!(
            snap,
            vec![
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Int(2)),
            ]
        );
    }

    #[test]
    fn generation_bumps_only_on_effective_mutation() {
        let store = PropertyStore::new();
        let g0 = store.generation();

        store.set("k", 1).unwrap();
        let g1 = store.generation();
        assert!(g1 > g0);

        // removing an absent key is not a mutation
        store.remove("missing").unwrap();
        assert_eq!(store.generation(), g1);

        // clearing an empty store after clear() is a no-op too
        store.clear().unwrap();
        let g2 = store.generation();
        assert!(g2 > g1);
        store.clear().unwrap();
        assert_eq!(store.generation(), g2);
    }

    #[test]
    fn watcher_sees_each_successful_mutation() {
        let store = PropertyStore::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        store.set_watcher(move |event| sink.lock().unwrap().push(event.clone()));

        store.set("k", 1).unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap(); // absent: no event
        let _ = store.set("", 1); // rejected: no event
        let _ = store.set("nan", f64::NAN); // rejected: no event

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ChangeEvent::Set {
                    key: "k".to_string()
                },
                ChangeEvent::Removed {
                    key: "k".to_string()
                },
            ]
        );
    }

    #[test]
    fn reentrant_mutation_rejected_not_deadlocked() {
        let store = Arc::new(PropertyStore::new());
        let result = Arc::new(Mutex::new(None));

        let inner_store = Arc::clone(&store);
        let inner_result = Arc::clone(&result);
        store.set_watcher(move |_| {
            let attempt = inner_store.set("again", 1);
            *inner_result.lock().unwrap() = Some(attempt);
        });

        store.set("first", 1).unwrap();

        assert_eq!(
            result.lock().unwrap().clone(),
            Some(Err(StoreError::ReentrantMutation))
        );
        assert_eq!(store.get("again"), None);
    }

    #[test]
    fn watcher_may_clear_itself_during_notification() {
        let store = Arc::new(PropertyStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner_store = Arc::clone(&store);
        let inner_calls = Arc::clone(&calls);
        store.set_watcher(move |_| {
            inner_calls.fetch_add(1, Ordering::SeqCst);
            inner_store.clear_watcher();
        });

        store.set("first", 1).unwrap();
        store.set("second", 2).unwrap();

        // the first notification deregistered the watcher; no deadlock,
        // and the second mutation fired nothing
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn watcher_may_replace_itself_during_notification() {
        let store = Arc::new(PropertyStore::new());
        let replacement_calls = Arc::new(AtomicUsize::new(0));

        let inner_store = Arc::clone(&store);
        let counter = Arc::clone(&replacement_calls);
        store.set_watcher(move |_| {
            let counter = Arc::clone(&counter);
            inner_store.set_watcher(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        store.set("first", 1).unwrap(); // swaps in the counting watcher
        store.set("second", 2).unwrap();

        assert_eq!(replacement_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watcher_may_mutate_a_different_store() {
        let store = Arc::new(PropertyStore::new());
        let other = Arc::new(PropertyStore::new());

        let target = Arc::clone(&other);
        store.set_watcher(move |event| {
            if let ChangeEvent::Set { key } = event {
                target.set(format!("mirror.{key}"), true).unwrap();
            }
        });

        store.set("k", 1).unwrap();
        assert_eq!(other.get("mirror.k"), Some(Value::Bool(true)));
    }

    #[test]
    fn concurrent_sets_lose_no_updates() {
        let store = Arc::new(PropertyStore::new());
        let threads = 8;
        let keys_per_thread = 50;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..keys_per_thread {
                        store.set(format!("t{t}.k{i}"), i as i64).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), threads * keys_per_thread);
        assert_eq!(store.generation(), (threads * keys_per_thread) as u64);
    }

    #[test]
    fn snapshot_during_mutation_storm() {
        let store = Arc::new(PropertyStore::new());
        let done = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.set(format!("t{t}.k{i}"), i as i64).unwrap();
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // every snapshot taken mid-storm must be internally consistent
        while done.load(Ordering::SeqCst) < 4 {
            for (key, value) in store.snapshot() {
                assert!(key.starts_with('t'));
                assert!(value.as_i64().is_some());
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
    }
}
