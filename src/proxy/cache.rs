use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

/// Byte-bounded LRU store mapping request URLs to complete response byte
/// streams.
///
/// A single mutex covers both the recency list and the key map (the
/// `LruCache` maintains them together), so no caller can observe a state
/// where only one of the two has been updated. Payloads are immutable
/// [`Bytes`]; a `get` hands out a cloned handle, never a reference into
/// cache state.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    lru: LruCache<String, Bytes>,
    bytes_in_use: u64,
    capacity_bytes: u64,
}

impl ResponseCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
                capacity_bytes,
            }),
        }
    }

    /// Look up a URL, promoting the entry to most recently used on a hit.
    pub fn get(&self, url: &str) -> Option<Bytes> {
        if url.is_empty() {
            return None;
        }
        let mut guard = self.inner.lock();
        guard.lru.get(url).cloned()
    }

    /// Insert or replace the entry for `url`.
    ///
    /// An empty URL, an empty body, or a body larger than the total
    /// capacity makes the call a no-op; an existing entry under the same
    /// key is left untouched in that case. Otherwise any previous entry
    /// for the key is removed first, then least-recently-used entries are
    /// evicted until the new body fits, and the body is inserted at the
    /// most-recently-used position.
    pub fn put(&self, url: &str, body: Bytes) {
        let len = body.len() as u64;
        let mut guard = self.inner.lock();
        if url.is_empty() || body.is_empty() || len > guard.capacity_bytes {
            return;
        }

        if let Some(previous) = guard.lru.pop(url) {
            guard.bytes_in_use = guard.bytes_in_use.saturating_sub(previous.len() as u64);
        }

        // Terminates: len <= capacity_bytes and every pop strictly shrinks
        // bytes_in_use.
        while guard.bytes_in_use + len > guard.capacity_bytes {
            match guard.lru.pop_lru() {
                Some((_key, evicted)) => {
                    guard.bytes_in_use =
                        guard.bytes_in_use.saturating_sub(evicted.len() as u64);
                }
                None => break,
            }
        }

        guard.lru.push(url.to_string(), body);
        guard.bytes_in_use = guard.bytes_in_use.saturating_add(len);
    }

    /// Current entry count and total payload bytes. Exact at a quiescent
    /// point; a racing `put` may change it before the caller looks.
    pub fn size(&self) -> (usize, u64) {
        let guard = self.inner.lock();
        (guard.lru.len(), guard.bytes_in_use)
    }

    /// Keys and payload lengths in most-recently-used-first order.
    #[cfg(test)]
    fn snapshot(&self) -> Vec<(String, u64)> {
        let guard = self.inner.lock();
        guard
            .lru
            .iter()
            .map(|(key, body)| (key.clone(), body.len() as u64))
            .collect()
    }
}
