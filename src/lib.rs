//! Fixed-capacity, persistent, concurrent hash map backed by a single
//! memory-mapped file that multiple independent OS processes may open
//! simultaneously.
//!
//! Header metadata, the hash directory, and the bucket arena all live
//! inside the mapped region, so any process mapping the same file sees
//! the same map contents. Readers are lock-free; writers coordinate
//! per-chain via a sequence lock, and bucket indices come from a
//! wait-free allocator backed by a free list plus a bump watermark. The
//! map does not grow — capacity is fixed at creation — and it makes no
//! crash-consistency or iteration-stability promises.
mod error;
mod shm;

pub use error::{Error, Result};
pub use shm::layout::{MAX_BUCKET, MAX_CAP, MAX_KEY, MIN_KEY};
pub use shm::{Map, DEFAULT_MAX_TRY};
