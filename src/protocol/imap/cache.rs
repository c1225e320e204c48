use std::collections::{ HashMap, HashSet };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::Duration;

use tokio::time::{ sleep, Instant };
use tracing::{ debug, trace };

use crate::message::section::BodyStructure;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// Has to stay above the largest message the store accepts (about 25 MB).
pub const DEFAULT_SIZE_LIMIT: usize = 100 * 1000 * 1000;

const BUILD_LOCK_POLL: Duration = Duration::from_millis(10);

/// Cache key: the same message is shared by every mailbox that shows it.
pub fn message_key(user_id: &str, message_id: &str) -> String {
    format!("{}/{}", user_id, message_id)
}

/// A built literal together with its section index.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub data: Arc<Vec<u8>>,
    pub structure: Arc<BodyStructure>,
}

struct Entry {
    message: CachedMessage,
    accessed: Instant,
}

impl Entry {
    fn size(&self) -> usize {
        self.message.data.len()
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    size: usize,
}

impl Entries {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.map.remove(key) {
            self.size -= entry.size();
        }
    }

    fn purge_expired(&mut self, ttl: Duration, now: Instant) {
        let expired: Vec<String> = self.map
            .iter()
            .filter(|(_, e)| now.duration_since(e.accessed) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }
}

/// Process-wide cache of built messages.
///
/// Two independent locks: `entries` guards single map operations, while
/// `building` marks message keys somebody is currently building, so that
/// waiting for a build never holds up reads of unrelated messages.
pub struct MessageCache {
    entries: Mutex<Entries>,
    building: Mutex<HashSet<String>>,
    ttl: Duration,
    size_limit: usize,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SIZE_LIMIT)
    }
}

impl MessageCache {
    pub fn new(ttl: Duration, size_limit: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            building: Mutex::new(HashSet::new()),
            ttl,
            size_limit,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn building(&self) -> MutexGuard<'_, HashSet<String>> {
        self.building.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until nobody else builds `key`, then holds it until the guard
    /// is dropped.
    pub async fn build_lock(&self, key: &str) -> BuildLock<'_> {
        loop {
            if self.building().insert(key.to_string()) {
                trace!(key, "Build lock acquired");
                return BuildLock { cache: self, key: key.to_string() };
            }
            sleep(BUILD_LOCK_POLL).await;
        }
    }

    fn release_build_lock(&self, key: &str) {
        self.building().remove(key);
    }

    /// Cached message for `key`; reading it keeps it alive for another TTL.
    pub fn lookup(&self, key: &str) -> Option<CachedMessage> {
        let mut entries = self.entries();
        let now = Instant::now();

        let expired = match entries.map.get_mut(key) {
            None => {
                return None;
            }
            Some(entry) if now.duration_since(entry.accessed) > self.ttl => true,
            Some(entry) => {
                entry.accessed = now;
                return Some(entry.message.clone());
            }
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    /// Inserts a built message, evicting the least recently used entries
    /// until it fits under the size ceiling.
    pub fn store(&self, key: &str, data: Vec<u8>, structure: BodyStructure) {
        if data.len() >= self.size_limit {
            debug!(key, size = data.len(), "Message too large for the build cache");
            return;
        }

        let mut entries = self.entries();
        let now = Instant::now();
        entries.remove(key);
        entries.purge_expired(self.ttl, now);

        let mut by_age: Vec<(Instant, String)> = entries.map
            .iter()
            .map(|(k, e)| (e.accessed, k.clone()))
            .collect();
        by_age.sort();

        let mut oldest = by_age.into_iter();
        while entries.size + data.len() >= self.size_limit {
            let Some((_, victim)) = oldest.next() else {
                break;
            };
            trace!(key = %victim, "Evicting cached message");
            entries.remove(&victim);
        }

        entries.size += data.len();
        entries.map.insert(key.to_string(), Entry {
            message: CachedMessage { data: Arc::new(data), structure: Arc::new(structure) },
            accessed: now,
        });
    }

    /// Total bytes held.
    pub fn size(&self) -> usize {
        self.entries().size
    }

    pub fn len(&self) -> usize {
        self.entries().map.len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries();
        entries.map.clear();
        entries.size = 0;
    }
}

/// Held while one task builds a message.
pub struct BuildLock<'a> {
    cache: &'a MessageCache,
    key: String,
}

impl Drop for BuildLock<'_> {
    fn drop(&mut self) {
        self.cache.release_build_lock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    fn structure() -> BodyStructure {
        BodyStructure::parse(b"Subject: x\r\n\r\nbody\r\n").unwrap()
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = MessageCache::default();
        assert!(cache.lookup("u/1").is_none());

        cache.store("u/1", b"literal".to_vec(), structure());
        let cached = cache.lookup("u/1").unwrap();
        assert_eq!(cached.data.as_slice(), b"literal");
        assert_eq!(cache.size(), 7);

        cache.store("u/1", b"longer literal".to_vec(), structure());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 14);
    }

    #[test]
    fn test_size_ceiling_evicts_oldest() {
        let cache = MessageCache::new(DEFAULT_TTL, 100);
        for n in 0..10 {
            cache.store(&format!("u/{}", n), vec![b'x'; 30], structure());
            assert!(cache.size() < 100, "size {} after insert {}", cache.size(), n);
        }
        assert!(cache.lookup("u/9").is_some());
        assert!(cache.lookup("u/8").is_some());
        assert!(cache.lookup("u/0").is_none());
    }

    #[test]
    fn test_recently_read_entries_survive_eviction() {
        let cache = MessageCache::new(DEFAULT_TTL, 100);
        cache.store("u/a", vec![b'a'; 30], structure());
        std::thread::sleep(Duration::from_millis(2));
        cache.store("u/b", vec![b'b'; 30], structure());
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.lookup("u/a").is_some());

        cache.store("u/c", vec![b'c'; 45], structure());
        assert!(cache.lookup("u/a").is_some());
        assert!(cache.lookup("u/b").is_none());
    }

    #[test]
    fn test_oversized_message_is_not_cached() {
        let cache = MessageCache::new(DEFAULT_TTL, 10);
        cache.store("u/big", vec![0; 10], structure());
        assert!(cache.lookup("u/big").is_none());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MessageCache::new(Duration::from_millis(50), DEFAULT_SIZE_LIMIT);
        cache.store("u/1", b"literal".to_vec(), structure());
        assert!(cache.lookup("u/1").is_some());

        sleep(Duration::from_millis(120)).await;
        assert!(cache.lookup("u/1").is_none());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_build_lock_is_exclusive_per_key() {
        let cache = Arc::new(MessageCache::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let (cache, inside, peak) = (cache.clone(), inside.clone(), peak.clone());
            handles.push(
                tokio::spawn(async move {
                    let _lock = cache.build_lock("u/1").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_locks_of_other_messages_do_not_block() {
        let cache = MessageCache::default();
        let _first = cache.build_lock("u/1").await;
        let second = tokio::time::timeout(Duration::from_millis(100), cache.build_lock("u/2")).await;
        assert!(second.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), cache.build_lock("u/1")).await;
        assert!(same.is_err());
    }
}
