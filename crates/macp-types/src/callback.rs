//! Keyed callback tables with registration tokens.
//!
//! Every MACP component that demultiplexes inbound traffic (router, remote
//! endpoint, inter-process transport) keeps its handlers in a
//! [`CallbackTable`]. Registration returns a [`CallbackToken`] that is
//! required for removal. Registering the same `Arc` twice under one key is a
//! no-op that hands back the original token.
//!
//! Dispatch works on a [`snapshot`](CallbackTable::snapshot) of the handler
//! list, so a handler may unregister itself (or others) while it runs.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by a callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackToken(u64);

impl std::fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

type Entries<K, F> = HashMap<K, Vec<(CallbackToken, Arc<F>)>>;

/// Thread-safe mapping from a key to an ordered list of distinct handlers.
pub struct CallbackTable<K, F: ?Sized> {
    entries: RwLock<Entries<K, F>>,
    next_token: AtomicU64,
}

fn same_handler<F: ?Sized>(a: &Arc<F>, b: &Arc<F>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<K, F> CallbackTable<K, F>
where
    K: Eq + Hash + Copy,
    F: ?Sized,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register `handler` under `key`, after any handlers already there.
    pub fn register(&self, key: K, handler: Arc<F>) -> CallbackToken {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let list = entries.entry(key).or_default();
        if let Some((token, _)) = list.iter().find(|(_, h)| same_handler(h, &handler)) {
            return *token;
        }
        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        list.push((token, handler));
        token
    }

    /// Remove the handler registered under `key` with `token`.
    ///
    /// Returns `false` if nothing matched.
    pub fn unregister(&self, key: K, token: CallbackToken) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = entries.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(t, _)| *t != token);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(&key);
        }
        removed
    }

    /// Copy of the handlers registered under `key`, in registration order.
    pub fn snapshot(&self, key: &K) -> Vec<Arc<F>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered under `key`.
    pub fn count(&self, key: &K) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).map_or(0, Vec::len)
    }

    /// Whether no handler is registered under any key.
    pub fn is_empty(&self) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.is_empty()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }
}

impl<K, F> Default for CallbackTable<K, F>
where
    K: Eq + Hash + Copy,
    F: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, F: ?Sized> std::fmt::Debug for CallbackTable<K, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("CallbackTable")
            .field("keys", &entries.len())
            .field("handlers", &entries.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
