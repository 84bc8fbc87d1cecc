use crate::constants::{ANONYMOUS_USER, CACHE_MIN_SIZE};
use crate::core_path::ServerPathType;
use chrono::{DateTime, Local};
use log::{debug, trace};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Identity of one cached listing.
#[derive(Debug, Clone)]
pub struct ListingCacheKey {
    pub host: String,
    pub port: u16,
    /// `None` for anonymous logins.
    pub user: Option<String>,
    pub path: String,
    pub path_type: ServerPathType,
    pub list_command: String,
    pub is_ftps: bool,
}

impl ListingCacheKey {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        path: &str,
        path_type: ServerPathType,
        list_command: &str,
        is_ftps: bool,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: normalize_user(user),
            path: path.to_string(),
            path_type,
            list_command: list_command.to_string(),
            is_ftps,
        }
    }

    fn same_server(&self, host: &str, port: u16, user: &Option<String>) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port == port && &self.user == user
    }

    fn matches(&self, other: &ListingCacheKey) -> bool {
        self.same_server(&other.host, other.port, &other.user)
            && self.path_type == other.path_type
            && other.path_type.is_same_path(&other.path, &self.path)
            && self.is_ftps == other.is_ftps
            && self.list_command.eq_ignore_ascii_case(&other.list_command)
    }
}

fn normalize_user(user: &str) -> Option<String> {
    if user.is_empty() || user == ANONYMOUS_USER {
        None
    } else {
        Some(user.to_string())
    }
}

/// A listing as it was captured, plus when.
#[derive(Debug, Clone)]
pub struct CachedListing {
    pub listing: Arc<[u8]>,
    /// Path as spelled when the listing was stored.
    pub path: String,
    pub captured_at: DateTime<Local>,
    /// Monotonic instant the LIST command was started.
    pub start_time: Instant,
}

struct CacheEntry {
    key: ListingCacheKey,
    value: CachedListing,
}

struct CacheState {
    /// Oldest insertion first.
    entries: Vec<CacheEntry>,
    total_size: u64,
    max_size: u64,
}

/// Process-wide cache of directory listings, bounded by total listing size.
///
/// Every worker and the foreground share one instance through `Arc`. All state
/// sits behind one `std::sync::Mutex`; the lock is never held across an
/// `.await` nor while any connection lock is held. Lookup followed by Insert is
/// not atomic: concurrent inserts of the same key keep the last one.
pub struct ListingCache {
    state: Mutex<CacheState>,
}

impl ListingCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: Vec::new(),
                total_size: 0,
                max_size: max_size.max(CACHE_MIN_SIZE),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock leaves the entries consistent; keep using them.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.lock().max_size = max_size.max(CACHE_MIN_SIZE);
    }

    pub fn max_size(&self) -> u64 {
        self.lock().max_size
    }

    pub fn total_size(&self) -> u64 {
        self.lock().total_size
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, key: &ListingCacheKey) -> Option<CachedListing> {
        let state = self.lock();
        let found = state
            .entries
            .iter()
            .find(|entry| entry.key.matches(key))
            .map(|entry| entry.value.clone());
        trace!(
            "Listing cache {} for {}:{}{}",
            if found.is_some() { "hit" } else { "miss" },
            key.host,
            key.port,
            key.path
        );
        found
    }

    /// Stores `listing` under `key`, replacing any entry with the same key.
    ///
    /// Then evicts the oldest entries while the total exceeds the cap. The entry
    /// just inserted is never evicted, even when it alone exceeds the cap.
    pub fn insert(
        &self,
        key: ListingCacheKey,
        listing: &[u8],
        captured_at: DateTime<Local>,
        start_time: Instant,
    ) {
        let mut state = self.lock();
        if let Some(index) = state.entries.iter().position(|entry| entry.key.matches(&key)) {
            let old = state.entries.remove(index);
            state.total_size -= old.value.listing.len() as u64;
        }

        state.total_size += listing.len() as u64;
        let path = key.path.clone();
        state.entries.push(CacheEntry {
            key,
            value: CachedListing {
                listing: Arc::from(listing),
                path,
                captured_at,
                start_time,
            },
        });

        let mut evict = 0;
        while state.entries.len() > evict + 1 && state.total_size > state.max_size {
            state.total_size -= state.entries[evict].value.listing.len() as u64;
            evict += 1;
        }
        if evict > 0 {
            debug!("Listing cache evicted {} oldest entries", evict);
            state.entries.drain(..evict);
        }
    }

    /// Drops every listing of `path` and of all paths below it for one server identity.
    pub fn invalidate_subtree(
        &self,
        host: &str,
        port: u16,
        user: &str,
        path_type: ServerPathType,
        path: &str,
    ) {
        let user = normalize_user(user);
        self.remove_where(|key| {
            key.same_server(host, port, &user) && path_type.is_prefix_path(path, &key.path)
        });
    }

    /// Drops every listing of one server identity, whatever the path.
    pub fn invalidate_server(&self, host: &str, port: u16, user: &str) {
        let user = normalize_user(user);
        self.remove_where(|key| key.same_server(host, port, &user));
    }

    fn remove_where(&self, predicate: impl Fn(&ListingCacheKey) -> bool) {
        let mut state = self.lock();
        let mut freed = 0u64;
        let before = state.entries.len();
        state.entries.retain(|entry| {
            let drop_it = predicate(&entry.key);
            if drop_it {
                freed += entry.value.listing.len() as u64;
            }
            !drop_it
        });
        state.total_size -= freed;
        if before != state.entries.len() {
            debug!("Listing cache invalidated {} entries", before - state.entries.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> ListingCacheKey {
        ListingCacheKey::new("ftp.example.com", 21, "alice", path, ServerPathType::Unix, "LIST", false)
    }

    fn insert(cache: &ListingCache, key: ListingCacheKey, size: usize) {
        cache.insert(key, &vec![b'x'; size], Local::now(), Instant::now());
    }

    #[test]
    fn test_insert_then_lookup_then_invalidate_root() {
        let cache = ListingCache::new(1024 * 1024);
        let listing: Vec<u8> = (0..1200).map(|i| (i % 251) as u8).collect();
        cache.insert(key("/"), &listing, Local::now(), Instant::now());

        let hit = cache.lookup(&key("/")).unwrap();
        assert_eq!(&hit.listing[..], &listing[..]);

        cache.invalidate_subtree("ftp.example.com", 21, "alice", ServerPathType::Unix, "/");
        assert!(cache.lookup(&key("/")).is_none());
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn test_key_parts_must_match() {
        let cache = ListingCache::new(0);
        insert(&cache, key("/pub"), 10);

        assert!(cache.lookup(&key("/pub/")).is_some());
        let mut other = key("/pub");
        other.host = "FTP.EXAMPLE.COM".into();
        assert!(cache.lookup(&other).is_some());
        other.list_command = "list".into();
        assert!(cache.lookup(&other).is_some());
        other.is_ftps = true;
        assert!(cache.lookup(&other).is_none());

        let mut other = key("/pub");
        other.port = 2121;
        assert!(cache.lookup(&other).is_none());
        let other = ListingCacheKey::new("ftp.example.com", 21, "bob", "/pub", ServerPathType::Unix, "LIST", false);
        assert!(cache.lookup(&other).is_none());
        assert!(cache.lookup(&key("/PUB")).is_none());
    }

    #[test]
    fn test_anonymous_is_no_user() {
        let cache = ListingCache::new(0);
        let anon = ListingCacheKey::new("h", 21, "anonymous", "/", ServerPathType::Unix, "LIST", false);
        assert!(anon.user.is_none());
        cache.insert(anon, b"x", Local::now(), Instant::now());
        let empty = ListingCacheKey::new("h", 21, "", "/", ServerPathType::Unix, "LIST", false);
        assert!(cache.lookup(&empty).is_some());
    }

    #[test]
    fn test_replace_same_key() {
        let cache = ListingCache::new(0);
        insert(&cache, key("/a"), 100);
        insert(&cache, key("/a"), 40);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 40);
    }

    #[test]
    fn test_eviction_oldest_first() {
        let cache = ListingCache::new(0);
        let cap = cache.max_size() as usize;
        insert(&cache, key("/a"), cap / 2);
        insert(&cache, key("/b"), cap / 2);
        insert(&cache, key("/c"), cap / 2);
        assert!(cache.lookup(&key("/a")).is_none());
        assert!(cache.lookup(&key("/b")).is_some());
        assert!(cache.lookup(&key("/c")).is_some());
        assert!(cache.total_size() <= cache.max_size());
    }

    #[test]
    fn test_newest_survives_alone_over_cap() {
        let cache = ListingCache::new(0);
        let cap = cache.max_size() as usize;
        insert(&cache, key("/a"), 10);
        insert(&cache, key("/huge"), cap * 3);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&key("/huge")).is_some());
    }

    #[test]
    fn test_min_cap_is_enforced() {
        let cache = ListingCache::new(10);
        assert_eq!(cache.max_size(), CACHE_MIN_SIZE);
        cache.set_max_size(CACHE_MIN_SIZE * 4);
        assert_eq!(cache.max_size(), CACHE_MIN_SIZE * 4);
    }

    #[test]
    fn test_invalidate_subtree_only_below() {
        let cache = ListingCache::new(0);
        insert(&cache, key("/pub"), 1);
        insert(&cache, key("/pub/sub"), 1);
        insert(&cache, key("/public"), 1);
        insert(&cache, key("/"), 1);
        cache.invalidate_subtree("ftp.example.com", 21, "alice", ServerPathType::Unix, "/pub");
        assert!(cache.lookup(&key("/pub")).is_none());
        assert!(cache.lookup(&key("/pub/sub")).is_none());
        assert!(cache.lookup(&key("/public")).is_some());
        assert!(cache.lookup(&key("/")).is_some());

        cache.invalidate_server("FTP.example.com", 21, "alice");
        assert!(cache.is_empty());
    }
}
