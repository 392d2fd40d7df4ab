/// `#[repr(C)]` structures that live in the mapped region.
///
/// All structs use fixed-size fields and explicit padding so the layout
/// is identical on every process that maps the same file. Integers are
/// native-endian i32/u32: the file is intentionally not portable across
/// architectures.
use std::sync::atomic::AtomicI32;

/// Upper bound on `cap` (number of hash slots / buckets).
pub const MAX_CAP: i64 = 64 * 1024 * 1024;
/// Lower/upper bound on the unprefixed user key length minus one, i.e.
/// the accepted range for the `keyLen` constructor parameter.
pub const MIN_KEY: i64 = 8;
pub const MAX_KEY: i64 = 256;
/// Upper bound on the per-bucket stride.
pub const MAX_BUCKET: i64 = 4096;

/// Sentinel meaning "no bucket" in `next`, `HashSlot.index`, and `deleteLink`.
pub const NONE: i32 = -1;

/// Size of the fixed header at offset 0, also `hashOff` when cap == 0.
pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();
/// Size of one `HashSlot`.
pub const HASH_SLOT_SIZE: usize = std::mem::size_of::<HashSlot>();
/// Size of the fixed bucket prefix, before `keyLen`/key bytes/value bytes.
pub const BUCKET_HEADER_SIZE: usize = std::mem::size_of::<BucketHeader>();

/// Header at offset 0 of the mapped region.
///
/// `cap` doubles as the initialization sentinel: a freshly created,
/// zero-filled region has `cap == 0` until the first opener finishes
/// initializing it and publishes `cap` last, with release ordering.
#[repr(C)]
pub struct Header {
    pub len: AtomicI32,
    pub cap: AtomicI32,
    pub key_size: i32,
    pub bucket_size: i32,
    pub hash_off: u32,
    pub data_off: u32,
    pub next: AtomicI32,
    pub delete_link: AtomicI32,
    pub _reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<Header>() == 64);

/// One entry in the hash directory: the head of one bucket chain.
#[repr(C)]
pub struct HashSlot {
    /// Head bucket index of the chain, or `NONE` when empty.
    pub index: AtomicI32,
    /// Incremented by the lock holder on every successful unlock.
    pub serial: AtomicI32,
    /// Writer-exclusion flag: 0 free, 1 held.
    pub lock: AtomicI32,
    /// Non-authoritative chain length, maintained for diagnostics.
    pub chain_len: AtomicI32,
}

const _: () = assert!(std::mem::size_of::<HashSlot>() == 16);

/// Fixed 16-byte prefix of every bucket. Followed by `keyLen` (u8), then
/// `keySize - 1` key bytes, then the value area.
#[repr(C)]
pub struct BucketHeader {
    /// Next bucket index in the chain, `NONE` at the tail.
    pub next: AtomicI32,
    /// Cached CRC32/IEEE hash of the key bytes.
    pub hash: AtomicI32,
    /// 1 = live, 0 = free/tombstone.
    pub used: AtomicI32,
    pub _pad: i32,
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == 16);

/// Round `n` up to the next multiple of `to` (`to` a power of two).
pub fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

/// Effective per-bucket key area, including the 1-byte length prefix,
/// rounded up to a multiple of 4.
pub fn key_size_for(key_len: i64) -> i64 {
    round_up((key_len + 1) as usize, 4) as i64
}

/// Effective per-bucket stride, rounded up to a multiple of 16.
pub fn bucket_size_for(key_size: i64, value_len: i64) -> i64 {
    round_up(BUCKET_HEADER_SIZE + key_size as usize + value_len as usize, 16) as i64
}

/// Byte offset of the hash directory from the start of the region.
pub fn hash_off() -> u32 {
    HEADER_SIZE as u32
}

/// Byte offset of the bucket arena from the start of the region.
pub fn data_off(cap: i64) -> u32 {
    hash_off() + (cap as u32) * HASH_SLOT_SIZE as u32
}

/// Total region size for the given layout parameters.
pub fn region_size(cap: i64, bucket_size: i64) -> u64 {
    data_off(cap) as u64 + (cap as u64) * (bucket_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_the_wire_layout() {
        assert_eq!(HEADER_SIZE, 64);
        assert_eq!(HASH_SLOT_SIZE, 16);
        assert_eq!(BUCKET_HEADER_SIZE, 16);
    }

    #[test]
    fn round_up_to_power_of_two() {
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(4, 4), 4);
        assert_eq!(round_up(5, 4), 8);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
    }

    #[test]
    fn key_size_includes_length_prefix_and_rounds_up() {
        // 15 key bytes + 1 length byte = 16, already a multiple of 4.
        assert_eq!(key_size_for(15), 16);
        // 14 key bytes + 1 length byte = 15, rounds up to 16.
        assert_eq!(key_size_for(14), 16);
    }

    #[test]
    fn bucket_size_rounds_up_to_16() {
        let key_size = key_size_for(15); // 16
        // 16 (BucketHeader) + 16 (key) + 8 (value) = 40, rounds up to 48.
        assert_eq!(bucket_size_for(key_size, 8), 48);
    }

    #[test]
    fn offsets_and_region_size_compose() {
        let cap = 8i64;
        let key_size = key_size_for(15);
        let bucket_size = bucket_size_for(key_size, 8);

        assert_eq!(hash_off(), HEADER_SIZE as u32);
        assert_eq!(data_off(cap), hash_off() + (cap as u32) * HASH_SLOT_SIZE as u32);
        assert_eq!(
            region_size(cap, bucket_size),
            data_off(cap) as u64 + (cap as u64) * (bucket_size as u64)
        );
    }
}
