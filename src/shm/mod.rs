/// Fixed-capacity, persistent, concurrent hash map backed by a single
/// memory-mapped file that multiple independent processes may open
/// simultaneously.
///
/// All map state (header, hash directory, bucket arena) lives inside the
/// mapped region, so every process mapping the same file sees the same
/// contents. Readers are lock-free; writers coordinate per chain via
/// [`lock::ChainLock`], and bucket indices are handed out by the
/// wait-free allocator in [`alloc`].
pub mod alloc;
pub mod layout;
pub mod lock;
pub mod region;

use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use layout::{
    BucketHeader, Header, HashSlot, BUCKET_HEADER_SIZE, HASH_SLOT_SIZE, MAX_BUCKET, MAX_CAP,
    MAX_KEY, MIN_KEY, NONE,
};
use lock::ChainLock;
use region::MappedRegion;

/// `maxTry` used when a caller passes a non-positive value.
pub const DEFAULT_MAX_TRY: i32 = 20;

/// The public map handle. Cheap to share across threads (`&Map` is enough
/// for every operation); sharing across processes happens implicitly
/// because they each map the same backing file.
pub struct Map {
    region: MappedRegion,
    cap: i32,
    key_size: i32,
    bucket_size: i32,
    value_len: i32,
    hash_off: u32,
    data_off: u32,
    max_try: i32,
}

// All mutation of mapped bytes goes through the atomic / chain-lock
// protocol; nothing here depends on thread identity.
unsafe impl Send for Map {}
unsafe impl Sync for Map {}

impl Map {
    /// Create or open a map backed by the file at `path`.
    ///
    /// `map_cap` is rounded up to the next power of two (minimum 8).
    /// `key_len` is the maximum *unprefixed* key length this map will
    /// accept. `max_try` bounds contention retries per operation,
    /// defaulting to [`DEFAULT_MAX_TRY`] when `<= 0`. `wait` bounds how
    /// long `Create` waits to acquire the one-time boot lock that
    /// arbitrates fresh-region initialization against concurrent openers.
    pub fn create(
        path: impl AsRef<Path>,
        map_cap: i64,
        key_len: i64,
        value_len: i64,
        max_try: i64,
        wait: Duration,
    ) -> Result<Map> {
        if map_cap <= 0 || map_cap > MAX_CAP {
            return Err(Error::MapCap {
                got: map_cap,
                max: MAX_CAP,
            });
        }
        let cap = (map_cap as u64).next_power_of_two().max(8) as i64;

        if !(MIN_KEY - 1..=MAX_KEY - 1).contains(&key_len) {
            return Err(Error::KeyLen {
                got: key_len,
                min: MIN_KEY - 1,
                max: MAX_KEY - 1,
            });
        }
        let key_size = layout::key_size_for(key_len);

        if value_len < 0 {
            return Err(Error::ValLen {
                val_len: value_len,
                max: MAX_BUCKET,
            });
        }
        let bucket_size = layout::bucket_size_for(key_size, value_len);
        if bucket_size > MAX_BUCKET {
            return Err(Error::ValLen {
                val_len: value_len,
                max: MAX_BUCKET,
            });
        }

        let max_try = if max_try <= 0 {
            DEFAULT_MAX_TRY as i64
        } else {
            max_try
        };

        let hash_off = layout::hash_off();
        let data_off = layout::data_off(cap);
        let size = layout::region_size(cap, bucket_size);

        debug!(
            "map {:?}: cap={cap} key_size={key_size} bucket_size={bucket_size} region_size={size}",
            path.as_ref(),
        );

        let (region, unlock) = MappedRegion::open(path.as_ref(), size, wait)?;

        let outcome = Self::init_or_validate(
            &region,
            cap as i32,
            key_size as i32,
            bucket_size as i32,
            hash_off,
            data_off,
        );

        // Always release the boot lock, even when init/validate failed,
        // so a losing opener never wedges the next one. A validation
        // failure takes priority in the reported error; an unlock
        // failure on an otherwise-successful open still fails `Create`
        // rather than being silently discarded.
        let unlock_result = unlock();
        outcome?;
        unlock_result?;

        Ok(Map {
            region,
            cap: cap as i32,
            key_size: key_size as i32,
            bucket_size: bucket_size as i32,
            value_len: (bucket_size - BUCKET_HEADER_SIZE as i64 - key_size) as i32,
            hash_off,
            data_off,
            max_try: max_try as i32,
        })
    }

    /// Runs with the boot lock held: observes `header.cap` as the
    /// initialization gate, either validating an existing region's
    /// layout against ours, or initializing a fresh one and publishing
    /// `cap` last with release ordering (invariant 8 in the data model).
    fn init_or_validate(
        region: &MappedRegion,
        cap: i32,
        key_size: i32,
        bucket_size: i32,
        hash_off: u32,
        data_off: u32,
    ) -> Result<()> {
        let header = unsafe { &*(region.base_ptr() as *const Header) };
        let observed_cap = header.cap.load(Ordering::Acquire);

        if observed_cap != 0 {
            debug!("attaching to existing region (cap={observed_cap})");
            if observed_cap != cap
                || header.key_size != key_size
                || header.bucket_size != bucket_size
                || header.hash_off != hash_off
                || header.data_off != data_off
            {
                warn!(
                    "region layout mismatch: existing cap={} key_size={} bucket_size={}, \
                     requested cap={cap} key_size={key_size} bucket_size={bucket_size}",
                    observed_cap, header.key_size, header.bucket_size,
                );
                return Err(Error::DbSize);
            }
            return Ok(());
        }

        debug!("initializing fresh region");
        for i in 0..cap {
            let slot = unsafe {
                &*(region
                    .base_ptr()
                    .add(hash_off as usize + i as usize * HASH_SLOT_SIZE)
                    as *const HashSlot)
            };
            slot.index.store(NONE, Ordering::Relaxed);
            slot.serial.store(0, Ordering::Relaxed);
            slot.lock.store(0, Ordering::Relaxed);
            slot.chain_len.store(0, Ordering::Relaxed);
        }

        let header_mut = unsafe { &mut *(region.base_mut_ptr() as *mut Header) };
        header_mut.delete_link.store(NONE, Ordering::Relaxed);
        header_mut.key_size = key_size;
        header_mut.bucket_size = bucket_size;
        header_mut.hash_off = hash_off;
        header_mut.data_off = data_off;
        header_mut.next.store(0, Ordering::Relaxed);
        header_mut.len.store(0, Ordering::Relaxed);
        // Published last, with release ordering, so any opener that
        // observes cap != 0 also observes every field written above.
        header_mut.cap.store(cap, Ordering::Release);
        Ok(())
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.region.base_ptr() as *const Header) }
    }

    fn hash_slot(&self, idx: i32) -> &HashSlot {
        unsafe {
            &*(self
                .region
                .base_ptr()
                .add(self.hash_off as usize + idx as usize * HASH_SLOT_SIZE)
                as *const HashSlot)
        }
    }

    fn bucket_ptr(&self, idx: i32) -> *mut u8 {
        unsafe {
            self.region
                .base_mut_ptr()
                .add(self.data_off as usize + idx as usize * self.bucket_size as usize)
        }
    }

    fn bucket_header(&self, idx: i32) -> &BucketHeader {
        unsafe { &*(self.bucket_ptr(idx) as *const BucketHeader) }
    }

    /// # Safety
    /// `idx` must be a currently-reachable (or just-allocated) bucket.
    unsafe fn key_at(&self, idx: i32) -> &[u8] {
        let base = self.bucket_ptr(idx);
        let key_len = *base.add(BUCKET_HEADER_SIZE) as usize;
        std::slice::from_raw_parts(base.add(BUCKET_HEADER_SIZE + 1), key_len)
    }

    /// Raw, non-owning view of a bucket's value area. Deliberately not a
    /// `&mut [u8]`: two threads racing the same chain (one publishing an
    /// insert, one re-traversing and matching the freshly published key)
    /// can both reach the same bucket, and handing back a safe `&mut [u8]`
    /// from each would let ordinary safe call sites create two live,
    /// overlapping mutable references — undefined behavior, not merely
    /// the unsynchronized-content races the spec allows. Constructing a
    /// `NonNull<[u8]>` does not itself create a reference, so `get` and
    /// `foreach` stay safe to call; turning one into an actual `&`/`&mut`
    /// is the caller's unsafe step, and the caller's obligation not to
    /// alias it with another live reference to the same bytes.
    ///
    /// # Safety
    /// `idx` must be a currently-reachable (or just-allocated) bucket.
    unsafe fn value_ptr(&self, idx: i32) -> NonNull<[u8]> {
        let base = self.bucket_ptr(idx).add(BUCKET_HEADER_SIZE + self.key_size as usize);
        NonNull::slice_from_raw_parts(NonNull::new_unchecked(base), self.value_len as usize)
    }

    /// Copies at most `keySize - 1` bytes of `key` into the bucket's key
    /// area and writes the length prefix. Bytes beyond the copied prefix
    /// are left as whatever the bucket's previous tenant (if any) wrote;
    /// equality comparisons only ever read `keyLen` bytes, so this is safe.
    unsafe fn write_key(&self, idx: i32, key: &[u8]) {
        let base = self.bucket_ptr(idx);
        let n = key.len().min(self.key_size as usize - 1);
        *base.add(BUCKET_HEADER_SIZE) = n as u8;
        std::ptr::copy_nonoverlapping(key.as_ptr(), base.add(BUCKET_HEADER_SIZE + 1), n);
    }

    fn slot_for_hash(&self, hash: i32) -> (i32, &HashSlot) {
        let idx = (hash as u32) % (self.cap as u32);
        (idx as i32, self.hash_slot(idx as i32))
    }

    /// Look up `key`, inserting an empty-value bucket for it when `add`
    /// is true and it isn't already present. Returns a raw, non-owning
    /// view into the bucket's value area rather than a `&mut [u8]`:
    /// per the spec, callers may write into it without any
    /// synchronization from this layer, and two calls to `get` for the
    /// same key (even from different threads) can resolve to the same
    /// bytes. Exposing that as a safe `&mut [u8]` would let safe code
    /// produce two live, overlapping mutable references, which is
    /// undefined behavior; callers must dereference the returned
    /// pointer themselves (e.g. via `NonNull::as_mut`) and are
    /// responsible for not holding two live references — mutable or
    /// otherwise — to the same value bytes at once.
    pub fn get(&self, key: &[u8], add: bool) -> Result<NonNull<[u8]>> {
        if key.len() > self.key_size as usize - 1 {
            return Err(Error::KeyLen {
                got: key.len() as i64,
                min: MIN_KEY - 1,
                max: (self.key_size - 1) as i64,
            });
        }

        let hash = crc32fast::hash(key) as i32;
        let (slot_idx, slot) = self.slot_for_hash(hash);
        let chain_lock = ChainLock::new(slot);

        let mut tries_left = self.max_try;
        let mut target: Option<i32> = None;
        let mut last_check = false;

        let result = loop {
            if tries_left <= 0 {
                trace!("get: exhausted maxTry on slot {slot_idx}");
                break Err(Error::TryEnd);
            }
            tries_left -= 1;

            let idx0 = slot.index.load(Ordering::Relaxed);
            let s0 = chain_lock.serial();

            let mut cur = idx0;
            let mut found = None;
            while cur != NONE {
                if unsafe { self.key_at(cur) } == key {
                    found = Some(cur);
                    break;
                }
                cur = self.bucket_header(cur).next.load(Ordering::Relaxed);
            }

            if let Some(idx) = found {
                break Ok(unsafe { self.value_ptr(idx) });
            }

            if last_check {
                break Err(Error::DbFull);
            }
            if !add {
                break Err(Error::KeyNot);
            }

            if target.is_none() {
                let allocated = unsafe {
                    alloc::alloc(self.header(), self.cap as i64, |i| {
                        self.bucket_ptr(i) as *const BucketHeader
                    })
                };
                if allocated == NONE {
                    if chain_lock.serial() != s0 {
                        // Someone mutated this chain since our snapshot;
                        // give one more pass a chance to observe a
                        // concurrent insert of the same key.
                        last_check = true;
                        continue;
                    }
                    break Err(Error::DbFull);
                }
                unsafe {
                    self.write_key(allocated, key);
                    self.bucket_header(allocated).hash.store(hash, Ordering::Relaxed);
                }
                target = Some(allocated);
            }

            if chain_lock.try_lock(s0) {
                let t = target.take().expect("target allocated before locking");
                self.bucket_header(t).next.store(idx0, Ordering::Relaxed);
                slot.index.store(t, Ordering::Relaxed);
                self.bucket_header(t).used.store(1, Ordering::Relaxed);
                slot.chain_len.fetch_add(1, Ordering::Relaxed);
                chain_lock.unlock();
                self.header().len.fetch_add(1, Ordering::Relaxed);
                break Ok(unsafe { self.value_ptr(t) });
            }
            // Lock contended; retry with the same speculative target.
        };

        // A speculative allocation only survives to here when the key
        // turned out to already be present (found by someone else while
        // we were allocating) or the loop exited before publishing it;
        // either way it never became reachable from any HashSlot and
        // must go back on the free list.
        if let Some(t) = target {
            unsafe {
                alloc::free(self.header(), t, |i| self.bucket_ptr(i) as *const BucketHeader);
            }
        }
        result
    }

    /// Delete `key`. Returns `true` when the key is now absent (whether
    /// it was just removed or was already absent), and `false` only when
    /// the `maxTry` contention budget was exhausted.
    pub fn delete(&self, key: &[u8]) -> bool {
        let hash = crc32fast::hash(key) as i32;
        let (slot_idx, slot) = self.slot_for_hash(hash);
        let chain_lock = ChainLock::new(slot);

        let mut tries_left = self.max_try;
        loop {
            if tries_left <= 0 {
                trace!("delete: exhausted maxTry on slot {slot_idx}");
                return false;
            }
            tries_left -= 1;

            let idx0 = slot.index.load(Ordering::Relaxed);
            let s0 = chain_lock.serial();

            let mut prev = NONE;
            let mut cur = idx0;
            let mut found = None;
            while cur != NONE {
                if unsafe { self.key_at(cur) } == key {
                    found = Some((cur, prev));
                    break;
                }
                prev = cur;
                cur = self.bucket_header(cur).next.load(Ordering::Relaxed);
            }

            let (target, predecessor) = match found {
                None => return true,
                Some(pair) => pair,
            };

            if !chain_lock.try_lock(s0) {
                continue;
            }

            self.bucket_header(target).used.store(0, Ordering::Relaxed);
            let target_next = self.bucket_header(target).next.load(Ordering::Relaxed);
            if predecessor != NONE {
                self.bucket_header(predecessor)
                    .next
                    .store(target_next, Ordering::Relaxed);
            } else {
                slot.index.store(target_next, Ordering::Relaxed);
            }
            slot.chain_len.fetch_sub(1, Ordering::Relaxed);
            chain_lock.unlock();
            self.header().len.fetch_sub(1, Ordering::Relaxed);
            unsafe {
                alloc::free(self.header(), target, |i| {
                    self.bucket_ptr(i) as *const BucketHeader
                });
            }
            return true;
        }
    }

    /// Visits every live bucket in arena order, stopping early if `f`
    /// returns `false`. Not snapshot-consistent: concurrent inserts and
    /// deletes may or may not be observed.
    ///
    /// `f` receives a raw, non-owning view of the value area rather than
    /// a `&[u8]`, for the same reason [`Map::get`] does: the same bytes
    /// may be aliased by a live `&mut [u8]` some other caller obtained
    /// (soundly, per its own unsafe obligation) from `get`, and handing
    /// `foreach` callers a safe reference here could overlap with that.
    pub fn foreach<F: FnMut(&[u8], NonNull<[u8]>) -> bool>(&self, mut f: F) {
        for i in 0..self.cap {
            if self.bucket_header(i).used.load(Ordering::Relaxed) != 0 {
                let key = unsafe { self.key_at(i) };
                let value = unsafe { self.value_ptr(i) };
                if !f(key, value) {
                    break;
                }
            }
        }
    }

    /// Live key count.
    pub fn len(&self) -> i32 {
        self.header().len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hash slots (== number of buckets), fixed at creation.
    pub fn cap(&self) -> i32 {
        self.cap
    }

    /// Consumes the handle, unmapping the region. Further use of the map
    /// is a compile error rather than a runtime failure, which is a
    /// stronger guarantee than a runtime closed-flag check would give.
    pub fn close(self) -> Result<()> {
        drop(self.region);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    fn scratch_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join(name)
    }

    /// `env_logger::init()` panics if called twice in one process, which
    /// happens constantly across parallel `cargo test` threads; `try_init`
    /// ignores the "already initialized" case so every test can call this.
    fn init_logging() {
        let _ = env_logger::try_init();
    }

    const WAIT: Duration = Duration::from_secs(1);

    #[test]
    fn create_insert_lookup_persist_reopen() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");

        {
            let map = Map::create(&path, 16, 15, 16, 20, WAIT).unwrap();
            let mut value = map.get(b"hello", true).unwrap();
            assert_eq!(value.len(), 16);
            unsafe { value.as_mut()[0] = 0x11 };
        }

        {
            let map = Map::create(&path, 16, 15, 16, 20, WAIT).unwrap();
            let value = map.get(b"hello", false).unwrap();
            assert_eq!(unsafe { value.as_ref() }[0], 0x11);
        }
    }

    #[test]
    fn get_add_then_get_no_add_same_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 16, 15, 8, 20, WAIT).unwrap();

        let first_ptr = map.get(b"stable-key", true).unwrap().as_ptr();
        let second_ptr = map.get(b"stable-key", false).unwrap().as_ptr();
        assert_eq!(first_ptr, second_ptr);
    }

    #[test]
    fn delete_is_idempotent_and_then_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 16, 15, 8, 20, WAIT).unwrap();

        map.get(b"gone-soon", true).unwrap();
        assert!(map.delete(b"gone-soon"));
        assert!(map.delete(b"gone-soon"));
        assert!(matches!(
            map.get(b"gone-soon", false),
            Err(Error::KeyNot)
        ));
    }

    #[test]
    fn mapcap_rounds_up_to_power_of_two() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 3, 15, 8, 20, WAIT).unwrap();
        assert_eq!(map.cap(), 8);
    }

    #[test]
    fn mapcap_over_limit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let err = Map::create(&path, MAX_CAP + 1, 15, 8, 20, WAIT).unwrap_err();
        assert!(matches!(err, Error::MapCap { .. }));
    }

    #[test]
    fn keylen_boundaries() {
        let dir = tempfile::tempdir().unwrap();

        let path_ok = scratch_path(&dir, "ok.db");
        assert!(Map::create(&path_ok, 16, MAX_KEY - 1, 8, 20, WAIT).is_ok());

        let path_bad = scratch_path(&dir, "bad.db");
        let err = Map::create(&path_bad, 16, MAX_KEY, 8, 20, WAIT).unwrap_err();
        assert!(matches!(err, Error::KeyLen { .. }));
    }

    #[test]
    fn vallen_over_max_bucket_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let err = Map::create(&path, 16, 15, MAX_BUCKET as i64, 20, WAIT).unwrap_err();
        assert!(matches!(err, Error::ValLen { .. }));
    }

    #[test]
    fn reopen_with_mismatched_keylen_fails_dbsize() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        {
            let _map = Map::create(&path, 16, 15, 8, 20, WAIT).unwrap();
        }
        let err = Map::create(&path, 16, 31, 8, 20, WAIT).unwrap_err();
        assert!(matches!(err, Error::DbSize));
    }

    #[test]
    fn full_map_rejects_ninth_distinct_key() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 8, 15, 8, 20, WAIT).unwrap();

        for i in 0..8u32 {
            let key = format!("key-{i}");
            map.get(key.as_bytes(), true).unwrap();
        }
        assert_eq!(map.len(), 8);

        let err = map.get(b"one-too-many", true).unwrap_err();
        assert!(matches!(err, Error::DbFull));
    }

    #[test]
    fn delete_reclaims_a_slot_for_a_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 8, 15, 8, 20, WAIT).unwrap();

        for i in 0..8u32 {
            map.get(format!("key-{i}").as_bytes(), true).unwrap();
        }
        assert!(map.delete(b"key-0"));
        assert!(map.get(b"key-0", false).is_err());

        // A ninth distinct key only fits because of the delete above.
        assert!(map.get(b"brand-new-key", true).is_ok());
        assert_eq!(map.len(), 8);
    }

    /// Finds `count` distinct small numeric keys whose CRC32/IEEE hash all
    /// land on `target_slot` modulo `cap`.
    fn find_colliding_keys(cap: u32, target_slot: u32, count: usize) -> Vec<Vec<u8>> {
        let mut found = Vec::new();
        let mut n: u64 = 0;
        while found.len() < count {
            let key = format!("k{n}").into_bytes();
            if crc32fast::hash(&key) % cap == target_slot {
                found.push(key);
            }
            n += 1;
        }
        found
    }

    #[test]
    fn collision_chain_survives_mixed_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 8, 15, 8, 20, WAIT).unwrap();

        let keys = find_colliding_keys(8, 3, 5);
        for k in &keys {
            map.get(k, true).unwrap();
        }

        let mut seen = 0;
        map.foreach(|_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 5);

        assert!(map.delete(&keys[2]));
        assert!(map.get(&keys[2], false).is_err());
        for (i, k) in keys.iter().enumerate() {
            if i != 2 {
                assert!(map.get(k, false).is_ok());
            }
        }
    }

    #[test]
    fn concurrent_inserters_all_land_and_are_retrievable() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir, "t.db");
        let map = Map::create(&path, 65536, 31, 8, 20, WAIT).unwrap();

        const THREADS: u32 = 16;
        const PER_THREAD: u32 = 1024;

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let map = &map;
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        let key = format!("t{t}-k{i}");
                        map.get(key.as_bytes(), true).unwrap();
                    }
                });
            }
        });

        assert_eq!(map.len(), (THREADS * PER_THREAD) as i32);
        for t in 0..THREADS {
            for i in 0..PER_THREAD {
                let key = format!("t{t}-k{i}");
                assert!(map.get(key.as_bytes(), false).is_ok());
            }
        }
    }
}
