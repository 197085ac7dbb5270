use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// FIFO partition for a single kind.
#[derive(Debug)]
pub struct KindQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for KindQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> KindQueue<T> {
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    /// Removes and returns everything currently enqueued, oldest first.
    pub fn drain_all(&self) -> Vec<T> {
        let drained = std::mem::take(&mut *self.lock());
        drained.into()
    }

    /// Puts drained items back ahead of anything enqueued since they were taken.
    pub fn requeue_front(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let mut guard = self.lock();
        for item in items.into_iter().rev() {
            guard.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // Items are plain data; a panicking producer cannot leave the deque half-written.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of independently locked FIFO queues keyed by a kind tag.
///
/// Partitions are created on first use. Producers of different kinds never contend on the
/// same queue lock; the registry lock is only written when a new kind shows up.
#[derive(Debug)]
pub struct TypedBuffer<K, T> {
    queues: RwLock<HashMap<K, Arc<KindQueue<T>>>>,
}

impl<K, T> Default for TypedBuffer<K, T> {
    fn default() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, T> TypedBuffer<K, T>
where
    K: Copy + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, kind: K) -> Arc<KindQueue<T>> {
        {
            let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = queues.get(&kind) {
                return queue.clone();
            }
        }
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues.entry(kind).or_default().clone()
    }

    pub fn add(&self, kind: K, item: T) {
        self.queue(kind).push(item);
    }

    pub fn drain(&self, kind: K) -> Vec<T> {
        let queue = {
            let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
            queues.get(&kind).cloned()
        };
        queue.map(|queue| queue.drain_all()).unwrap_or_default()
    }

    /// Drains every partition. Empty partitions are omitted; output is ordered by kind.
    pub fn drain_all(&self) -> Vec<(K, Vec<T>)> {
        self.snapshot()
            .into_iter()
            .filter_map(|(kind, queue)| {
                let items = queue.drain_all();
                (!items.is_empty()).then_some((kind, items))
            })
            .collect()
    }

    pub fn requeue(&self, kind: K, items: Vec<T>) {
        self.queue(kind).requeue_front(items);
    }

    pub fn kinds(&self) -> Vec<K> {
        self.snapshot().into_iter().map(|(kind, _)| kind).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().iter().map(|(_, queue)| queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().iter().all(|(_, queue)| queue.is_empty())
    }

    fn snapshot(&self) -> Vec<(K, Arc<KindQueue<T>>)> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(K, Arc<KindQueue<T>>)> = queues
            .iter()
            .map(|(kind, queue)| (*kind, queue.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
