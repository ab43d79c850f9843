use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::Mutex;

/// Async-locked map shared by the in-memory stores.
pub struct GenericMemoryStore<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    store: Mutex<HashMap<K, V>>,
}

impl<K, V> GenericMemoryStore<K, V>
where
    K: Eq + Hash + Send + Clone + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.store.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: K, value: V) {
        self.store.lock().await.insert(key, value);
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn values(&self) -> Vec<V> {
        self.store.lock().await.values().cloned().collect()
    }

    /// Runs `f` on the entry under the lock and returns its result, or
    /// `None` when the key is absent.
    pub async fn modify<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.store.lock().await.get_mut(key).map(f)
    }
}
