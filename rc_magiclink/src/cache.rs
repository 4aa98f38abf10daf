//! Bounded packet cache for operators and the reply-wait timeout cache.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::{LocalPacket, Packet, PacketIdentification, PacketStatus, RemotePacket};

/// Default number of packets kept by a [`PacketCache`].
pub const DEFAULT_CACHE_SIZE: usize = 100;
/// Upper bound of a [`PacketCache`] size.
pub const MAX_CACHE_SIZE: usize = 1000;

/// A packet retained for inspection.
#[derive(Debug, Clone)]
pub enum CachedPacket {
    /// Sent by this process.
    Local(Arc<LocalPacket>),
    /// Received from a remote participant.
    Remote(Arc<RemotePacket>),
}

impl CachedPacket {
    pub fn packet(&self) -> &Packet {
        match self {
            Self::Local(packet) => packet.packet(),
            Self::Remote(packet) => packet.packet(),
        }
    }

    pub fn identification(&self) -> &PacketIdentification {
        self.packet().identification()
    }

    pub fn status(&self) -> PacketStatus {
        match self {
            Self::Local(packet) => packet.status(),
            Self::Remote(packet) => packet.status(),
        }
    }

    pub fn status_message(&self) -> Option<String> {
        match self {
            Self::Local(packet) => packet.status_message(),
            Self::Remote(packet) => packet.status_message(),
        }
    }

    fn key(&self) -> Option<&str> {
        self.packet().reply_endpoint()
    }
}

/// Fixed capacity, insertion ordered cache of recent packets.
///
/// Once full, inserting evicts the oldest entry regardless of how often
/// it was looked up. Packets of an ignored type are never stored.
pub struct PacketCache {
    max: usize,
    ignored: HashSet<PacketIdentification>,
    inner: Mutex<PacketCacheInner>,
}

#[derive(Default)]
struct PacketCacheInner {
    packets: HashMap<String, CachedPacket>,
    order: VecDeque<String>,
}

impl PacketCache {
    /// Creates a cache.
    ///
    /// ## Arguments
    ///
    /// * `max` - Capacity, clamped to `1..=1000`
    /// * `ignored` - Packet types that are never cached
    pub fn new(max: usize, ignored: HashSet<PacketIdentification>) -> Self {
        Self {
            max: max.clamp(1, MAX_CACHE_SIZE),
            ignored,
            inner: Mutex::new(PacketCacheInner::default()),
        }
    }

    /// Caches a packet, keyed by its reply endpoint.
    ///
    /// Returns whether the packet was stored.
    pub fn cache(&self, packet: CachedPacket) -> bool {
        if self.ignored.contains(packet.identification()) {
            return false;
        }
        let Some(key) = packet.key().map(str::to_owned) else {
            return false;
        };
        let mut inner = self.inner.lock();
        if inner.packets.insert(key.clone(), packet).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.max {
            if let Some(oldest) = inner.order.pop_front() {
                inner.packets.remove(&oldest);
            }
        }
        true
    }

    pub fn find(&self, id: &str) -> Option<CachedPacket> {
        self.inner.lock().packets.get(id).cloned()
    }

    /// All cached packets, oldest first.
    pub fn packets(&self) -> Vec<CachedPacket> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|key| inner.packets.get(key).cloned())
            .collect()
    }

    /// Cached packets of a given type, oldest first.
    pub fn filter(&self, identification: &PacketIdentification) -> Vec<CachedPacket> {
        self.packets()
            .into_iter()
            .filter(|packet| packet.identification() == identification)
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_ignored(&self, identification: &PacketIdentification) -> bool {
        self.ignored.contains(identification)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.packets.clear();
        inner.order.clear();
    }
}

impl Default for PacketCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE, HashSet::new())
    }
}

type ExpireCallback<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

/// Map whose entries each expire after their own deadline.
///
/// Deadlines are kept in a min-heap swept by a single task
/// (see [`TimeoutCache::run_sweeper`]) instead of one timer per entry.
/// Removed or replaced entries leave stale heap items behind, recognized
/// by their generation and skipped when popped.
pub struct TimeoutCache<K, V> {
    inner: Mutex<TimeoutInner<K, V>>,
    on_expire: Mutex<Vec<ExpireCallback<K, V>>>,
    wakeup: Notify,
}

struct TimeoutInner<K, V> {
    entries: HashMap<K, (V, u64)>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, K)>>,
    next_generation: u64,
}

impl<K, V> TimeoutCache<K, V>
where
    K: Eq + Hash + Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimeoutInner {
                entries: HashMap::new(),
                deadlines: BinaryHeap::new(),
                next_generation: 0,
            }),
            on_expire: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
        }
    }

    /// Registers a callback run for every expired entry.
    pub fn on_expire<F>(&self, callback: F)
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.on_expire.lock().push(Arc::new(callback));
    }

    /// Inserts or replaces an entry, resetting its deadline.
    pub fn put(&self, key: K, value: V, timeout: Duration) {
        self.inner.lock().insert(key, value, Instant::now() + timeout);
        self.wakeup.notify_one();
    }

    /// Inserts an entry only if the key is free.
    ///
    /// Returns whether the entry was inserted.
    pub fn put_if_absent(&self, key: K, value: V, timeout: Duration) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(&key) {
                return false;
            }
            inner.insert(key, value, Instant::now() + timeout);
        }
        self.wakeup.notify_one();
        true
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|(value, _)| value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Removes an entry without running expiry callbacks.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .entries
            .remove(key)
            .map(|(value, _)| value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.deadlines.clear();
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner.deadlines.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Removes every entry whose deadline is at or before `now` and runs
    /// expiry callbacks for them. Returns the number of expired entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some(Reverse((deadline, _, _))) = inner.deadlines.peek() {
                if *deadline > now {
                    break;
                }
                let Some(Reverse((_, generation, key))) = inner.deadlines.pop() else {
                    break;
                };
                let current = matches!(inner.entries.get(&key), Some((_, entry_generation)) if *entry_generation == generation);
                if current {
                    if let Some((value, _)) = inner.entries.remove(&key) {
                        expired.push((key, value));
                    }
                }
            }
        }
        let count = expired.len();
        if count > 0 {
            let callbacks = self.on_expire.lock().clone();
            for (key, value) in expired {
                for callback in callbacks.iter() {
                    callback(key.clone(), value.clone());
                }
            }
        }
        count
    }

    /// Sweeps expired entries as their deadlines come, until `stop` is notified.
    pub async fn run_sweeper(&self, stop: &Notify) {
        loop {
            let sleep = match self.next_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::select! {
                _ = stop.notified() => return,
                _ = self.wakeup.notified() => {},
                _ = sleep => {
                    self.sweep(Instant::now());
                },
            }
        }
    }
}

impl<K: Eq + Hash + Ord + Clone, V> TimeoutInner<K, V> {
    fn insert(&mut self, key: K, value: V, deadline: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(key.clone(), (value, generation));
        self.deadlines.push(Reverse((deadline, generation, key)));
    }
}

impl<K, V> Default for TimeoutCache<K, V>
where
    K: Eq + Hash + Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Weak,
        },
    };

    use uuid::Uuid;

    use super::*;
    use crate::{packet::Packet, SourceIdentifier};

    fn remote(identification: &'static str, id: &str) -> CachedPacket {
        let packet: Packet = serde_json::from_value(serde_json::json!({
            "v": 3,
            "i": identification,
            "s": {"u": Uuid::new_v4().to_string(), "n": 2, "r": id},
            "t": {"n": 1},
            "p": {},
        }))
        .unwrap();
        CachedPacket::Remote(Arc::new(RemotePacket::new(packet)))
    }

    #[test]
    fn evicts_oldest_first() {
        let cache = PacketCache::new(3, HashSet::new());
        for i in 0..5 {
            assert!(cache.cache(remote("RC-P", &format!("id{}", i))));
        }
        assert_eq!(cache.size(), 3);
        let kept: Vec<String> = cache
            .packets()
            .iter()
            .map(|packet| packet.packet().reply_endpoint().unwrap().to_owned())
            .collect();
        assert_eq!(kept, vec!["id2", "id3", "id4"]);
        assert!(cache.find("id0").is_none());
        assert!(cache.find("id4").is_some());
    }

    #[test]
    fn lookups_do_not_refresh_entries() {
        let cache = PacketCache::new(2, HashSet::new());
        cache.cache(remote("RC-P", "a"));
        cache.cache(remote("RC-P", "b"));
        assert!(cache.find("a").is_some());
        cache.cache(remote("RC-P", "c"));
        assert!(cache.find("a").is_none());
    }

    #[test]
    fn ignored_types_are_dropped() {
        let ignored = HashSet::from([PacketIdentification::from_static("RC-P")]);
        let cache = PacketCache::new(10, ignored);
        assert!(!cache.cache(remote("RC-P", "a")));
        assert!(cache.cache(remote("RC-D", "b")));
        assert_eq!(cache.size(), 1);
        assert_eq!(
            cache.filter(&PacketIdentification::from_static("RC-D")).len(),
            1
        );
    }

    #[test]
    fn size_is_clamped() {
        assert_eq!(PacketCache::new(0, HashSet::new()).max(), 1);
        assert_eq!(PacketCache::new(5000, HashSet::new()).max(), MAX_CACHE_SIZE);
        assert_eq!(PacketCache::default().max(), DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn local_packets_are_cached_by_endpoint() {
        let packet = Packet::new(
            PacketIdentification::from_static("RC-P"),
            SourceIdentifier::server(Uuid::new_v4()).with_reply_endpoint("local"),
            SourceIdentifier::all_available_proxies(),
            HashMap::new(),
        );
        let local = Arc::new(LocalPacket::new(packet, Weak::new(), Duration::from_secs(1)));
        let cache = PacketCache::default();
        assert!(cache.cache(CachedPacket::Local(local)));
        assert!(matches!(cache.find("local"), Some(CachedPacket::Local(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_independently() {
        let cache: TimeoutCache<String, u32> = TimeoutCache::new();
        let expired = Arc::new(AtomicUsize::new(0));
        cache.on_expire({
            let expired = expired.clone();
            move |_, _| {
                expired.fetch_add(1, Ordering::SeqCst);
            }
        });
        cache.put("short".into(), 1, Duration::from_secs(1));
        cache.put("long".into(), 2, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep(Instant::now()), 1);
        assert!(!cache.contains(&"short".to_owned()));
        assert!(cache.contains(&"long".to_owned()));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.sweep(Instant::now()), 1);
        assert!(cache.is_empty());
        assert_eq!(expired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_and_removed_entries_do_not_expire_early() {
        let cache: TimeoutCache<String, u32> = TimeoutCache::new();
        cache.put("a".into(), 1, Duration::from_secs(1));
        cache.put("a".into(), 2, Duration::from_secs(5));
        cache.put("b".into(), 3, Duration::from_secs(1));
        assert_eq!(cache.remove(&"b".to_owned()), Some(3));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep(Instant::now()), 0);
        assert_eq!(cache.get(&"a".to_owned()), Some(2));
        assert!(!cache.put_if_absent("a".into(), 9, Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_expires_entries() {
        let cache: Arc<TimeoutCache<String, u32>> = Arc::new(TimeoutCache::new());
        let stop = Arc::new(Notify::new());
        let sweeper = tokio::spawn({
            let cache = cache.clone();
            let stop = stop.clone();
            async move { cache.run_sweeper(&stop).await }
        });
        cache.put("a".into(), 1, Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(cache.is_empty());
        stop.notify_one();
        sweeper.await.unwrap();
    }
}
