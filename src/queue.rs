//! Concurrency-safe FIFO with secondary lookup indices
//!
//! Items live in an arena keyed by stable handles. The FIFO holds handles
//! only; deleting by index removes the arena entry and leaves a stale handle
//! behind, which `pop` skips and `push` compacts away once stale handles
//! outnumber live ones.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A named secondary index over queued items
pub struct Index<T> {
    name: &'static str,
    key: fn(&T) -> &str,
}

impl<T> Index<T> {
    /// Index items by the string `key` extracts from them
    pub const fn new(name: &'static str, key: fn(&T) -> &str) -> Self {
        Self { name, key }
    }

    /// Field name used with `delete_by_index`
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

impl<T> std::fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").field("name", &self.name).finish()
    }
}

/// One-shot broadcast fired by the next push
///
/// Every holder of the same gate is released together; the queue installs a
/// fresh gate afterwards.
#[derive(Debug, Clone)]
pub struct WaitGate {
    token: CancellationToken,
}

impl WaitGate {
    /// Whether a push has happened since the gate was taken
    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once a push has happened since the gate was taken
    pub fn opened(self) -> WaitForCancellationFutureOwned {
        self.token.cancelled_owned()
    }
}

struct IndexMap<T> {
    index: Index<T>,
    entries: HashMap<String, HashSet<u64>>,
}

struct Inner<T> {
    next_handle: u64,
    items: HashMap<u64, T>,
    order: VecDeque<u64>,
    indices: Vec<IndexMap<T>>,
    gate: CancellationToken,
}

impl<T> Inner<T> {
    fn insert(&mut self, item: T) {
        let handle = self.next_handle;
        self.next_handle += 1;

        for map in &mut self.indices {
            let key = (map.index.key)(&item);
            if key.is_empty() {
                continue;
            }
            map.entries
                .entry(key.to_string())
                .or_default()
                .insert(handle);
        }

        self.items.insert(handle, item);
        self.order.push_back(handle);
    }

    fn unindex(&mut self, handle: u64, item: &T) {
        for map in &mut self.indices {
            let key = (map.index.key)(item);
            if key.is_empty() {
                continue;
            }
            if let Some(handles) = map.entries.get_mut(key) {
                handles.remove(&handle);
                if handles.is_empty() {
                    map.entries.remove(key);
                }
            }
        }
    }

    fn pop_front(&mut self) -> Option<T> {
        while let Some(handle) = self.order.pop_front() {
            // Handles of deleted items are skipped.
            if let Some(item) = self.items.remove(&handle) {
                self.unindex(handle, &item);
                return Some(item);
            }
        }
        None
    }

    fn compact(&mut self) {
        if self.order.len() > 2 * self.items.len() + 64 {
            let items = &self.items;
            self.order.retain(|handle| items.contains_key(handle));
        }
    }
}

/// FIFO queue with secondary indices and a push-broadcast gate
pub struct IndexedQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> IndexedQueue<T> {
    /// Create an empty queue maintaining `indices`
    pub fn new(indices: impl IntoIterator<Item = Index<T>>) -> Self {
        let indices = indices
            .into_iter()
            .map(|index| IndexMap {
                index,
                entries: HashMap::new(),
            })
            .collect();

        Self {
            inner: Mutex::new(Inner {
                next_handle: 0,
                items: HashMap::new(),
                order: VecDeque::new(),
                indices,
                gate: CancellationToken::new(),
            }),
        }
    }

    /// Append items in order and wake current waiters
    pub fn push(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        for item in items {
            inner.insert(item);
        }
        if inner.items.len() == before {
            return;
        }
        inner.compact();

        let gate = std::mem::replace(&mut inner.gate, CancellationToken::new());
        drop(inner);
        gate.cancel();
    }

    /// Pop the front item without waiting
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Pop the front item, waiting for a push if the queue is empty
    ///
    /// Returns `None` only when `ctx` is cancelled.
    pub async fn pop_blocking(&self, ctx: &CancellationToken) -> Option<T> {
        loop {
            // Take the gate under the same lock as the pop so a push between
            // the two cannot be missed.
            let gate = {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.pop_front() {
                    return Some(item);
                }
                inner.gate.clone()
            };

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return None,
                _ = gate.cancelled() => {}
            }
        }
    }

    /// Remove every item whose `field` equals `value`
    ///
    /// Returns the number of items removed. Unknown fields and the empty
    /// value never match.
    pub fn delete_by_index(&self, field: &str, value: &str) -> usize {
        if value.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock();
        let Some(position) = inner
            .indices
            .iter()
            .position(|map| map.index.name == field)
        else {
            return 0;
        };

        let Some(handles) = inner.indices[position].entries.remove(value) else {
            return 0;
        };

        let mut removed = 0;
        for handle in handles {
            if let Some(item) = inner.items.remove(&handle) {
                inner.unindex(handle, &item);
                removed += 1;
            }
        }

        if inner.items.is_empty() {
            inner.order.clear();
        }
        removed
    }

    /// Gate released by the next push
    pub fn wait(&self) -> WaitGate {
        WaitGate {
            token: self.inner.lock().gate.clone(),
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the maintained indices
    pub fn index_names(&self) -> Vec<&'static str> {
        self.inner
            .lock()
            .indices
            .iter()
            .map(|map| map.index.name)
            .collect()
    }
}

impl<T> std::fmt::Debug for IndexedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("IndexedQueue")
            .field("len", &inner.items.len())
            .field(
                "indices",
                &inner.indices.iter().map(|m| m.index.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
