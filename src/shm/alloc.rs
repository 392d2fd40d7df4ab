/// Wait-free bucket-index allocator.
///
/// Reuses a LIFO free list of tombstoned bucket indices (rooted at
/// `Header.delete_link`) before falling back to a monotonic watermark
/// (`Header.next`) over indices never yet claimed. Both paths are CAS
/// loops with no blocking; `alloc` returns `NONE` only when the free list
/// is empty and the watermark has reached `cap`.
///
/// ABA safety note: the free list uses untagged indices. This is sound
/// here only because the sole freer of any given index is the thread
/// that just unlinked it from its chain under that chain's lock — see
/// `free`'s doc comment.
use std::sync::atomic::Ordering;

use super::layout::{BucketHeader, Header, NONE};

/// # Safety
/// `bucket_at` must return a valid `&BucketHeader` for any index in
/// `[0, cap)`.
pub unsafe fn alloc(header: &Header, cap: i64, bucket_at: impl Fn(i32) -> *const BucketHeader) -> i32 {
    // Free-list phase.
    loop {
        let head = header.delete_link.load(Ordering::Acquire);
        if head < 0 {
            break;
        }
        let head_bucket = &*bucket_at(head);
        let next = head_bucket.next.load(Ordering::Relaxed);
        if header
            .delete_link
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            (&*bucket_at(head)).next.store(NONE, Ordering::Relaxed);
            return head;
        }
    }

    // Watermark phase.
    loop {
        let n = header.next.load(Ordering::Acquire);
        if n as i64 >= cap {
            return NONE;
        }
        if header
            .next
            .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            (&*bucket_at(n)).next.store(NONE, Ordering::Relaxed);
            return n;
        }
    }
}

/// Push bucket index `i` onto the free list.
///
/// Must be called exactly once per tombstoning, and only after the
/// bucket has been observably unlinked from its chain (i.e. after the
/// chain-lock holder has published the unlink by releasing the lock).
/// Calling this twice for the same index while it is not otherwise
/// reachable from an in-flight `alloc` would reintroduce it to the free
/// list twice — a correctness bug in the caller, not in this function.
///
/// # Safety
/// `bucket_at` must return a valid `&BucketHeader` for index `i`.
pub unsafe fn free(header: &Header, i: i32, bucket_at: impl Fn(i32) -> *const BucketHeader) {
    loop {
        let head = header.delete_link.load(Ordering::Acquire);
        (&*bucket_at(i)).next.store(head, Ordering::Relaxed);
        if header
            .delete_link
            .compare_exchange(head, i, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}
