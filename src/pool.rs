use crate::client::WebClient;

/// Slot allocator for per-connection clients. Slot indexes double as
/// the epoll token of the connection. Released clients are reset and
/// parked in a cache so a new connection reuses their buffer
/// allocations instead of allocating fresh ones.
pub struct ClientPool {
    entries: Vec<Option<WebClient>>,
    free: Vec<usize>,
    cache: Vec<WebClient>,
    active: usize,
}

impl ClientPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            cache: Vec::new(),
            active: 0,
        }
    }

    /// Take a slot for a new connection. Returns the slot index, or
    /// None when the pool is exhausted (backpressure: drop the
    /// connection).
    pub fn acquire(&mut self) -> Option<usize> {
        let idx = self.free.pop()?;
        let client = self.cache.pop().unwrap_or_else(|| WebClient::new(0));
        self.entries[idx] = Some(client);
        self.active += 1;
        Some(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut WebClient> {
        self.entries.get_mut(idx).and_then(Option::as_mut)
    }

    pub fn get(&self, idx: usize) -> Option<&WebClient> {
        self.entries.get(idx).and_then(Option::as_ref)
    }

    /// Return a slot's client to the cache, reset for reuse.
    pub fn release(&mut self, idx: usize) {
        let Some(slot) = self.entries.get_mut(idx) else {
            return;
        };
        let Some(mut client) = slot.take() else {
            return; // double release
        };

        client.reuse();

        // the cache never outgrows what was concurrently alive
        if self.cache.len() < self.entries.len() {
            self.cache.push(client);
        }

        self.free.push(idx);
        self.active -= 1;
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Slot indexes currently in use, for periodic sweeps.
    pub fn active_slots(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let mut pool = ClientPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert!(pool.acquire().is_none());

        pool.release(a);
        assert_eq!(pool.len(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(c, a); // slot is recycled
    }

    #[test]
    fn released_clients_keep_their_buffers() {
        let mut pool = ClientPool::new(4);
        let idx = pool.acquire().unwrap();
        {
            let w = pool.get_mut(idx).unwrap();
            w.id = 42;
            w.response.data.push_str("leftover");
            w.response.data.need_bytes(4096);
        }
        pool.release(idx);

        let idx2 = pool.acquire().unwrap();
        let w = pool.get_mut(idx2).unwrap();
        // reused from cache: reset content, bumped use count
        assert!(w.response.data.is_empty());
        assert!(w.response.data.capacity() >= 4096);
        assert_eq!(w.use_count, 2);
        assert_eq!(w.id, 0);
    }

    #[test]
    fn double_release_is_harmless() {
        let mut pool = ClientPool::new(2);
        let a = pool.acquire().unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.len(), 0);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn active_slots_reflect_usage() {
        let mut pool = ClientPool::new(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        assert_eq!(pool.active_slots(), vec![b]);
    }
}
