use core::ptr::{null_mut, NonNull};

use crate::cache::{cache_alloc_raw, cache_free_raw, Cache};
use crate::page_supplier::PageSupplier;
use crate::slab::Bufctl;
use crate::AllocFlags;

/// Fixed bucket count, matching the original `KM_NUM_BUCKETS`. No resize:
/// the hash is only ever consulted on `free` in the large regime, and each
/// cache's working set (buffers currently checked out) is small.
const NUM_BUCKETS: usize = 32;

/// One link in a bucket chain, mapping a buffer address to its bufctl.
pub(crate) struct HashNode {
    next: *mut HashNode,
    key: usize,
    value: *mut Bufctl,
}

/// `buf -> bufctl` lookup for the large regime. Draws its own storage and
/// its nodes from caches supplied at `init` time; does no raw allocation of
/// its own.
pub(crate) struct HashIndex {
    buckets: [*mut HashNode; NUM_BUCKETS],
    node_cache: NonNull<Cache>,
}

// Internal bookkeeping structure, always reached through a `Cache` the
// embedder already serializes.
unsafe impl Send for HashIndex {}
unsafe impl Sync for HashIndex {}

impl HashIndex {
    #[inline]
    fn bucket_of(key: usize) -> usize {
        key & (NUM_BUCKETS - 1)
    }

    /// Allocates and zeroes a hash index from `hash_table_cache`, remembering
    /// `node_cache` for subsequent inserts/removes.
    pub(crate) unsafe fn init<P: PageSupplier>(
        hash_table_cache: &mut Cache,
        node_cache: NonNull<Cache>,
        supplier: &mut P,
        flags: AllocFlags,
    ) -> Option<NonNull<HashIndex>> {
        let raw = cache_alloc_raw(hash_table_cache, supplier, None, flags);
        if raw.is_null() {
            return None;
        }
        let index_ptr = raw as *mut HashIndex;
        index_ptr.write(HashIndex {
            buckets: [null_mut(); NUM_BUCKETS],
            node_cache,
        });
        Some(NonNull::new_unchecked(index_ptr))
    }

    /// Releases every node in every bucket back to the node cache, then
    /// returns the table itself to `hash_table_cache`.
    pub(crate) unsafe fn free<P: PageSupplier>(
        index: NonNull<HashIndex>,
        hash_table_cache: &mut Cache,
        supplier: &mut P,
    ) {
        let index_ref = &mut *index.as_ptr();
        let node_cache = &mut *index_ref.node_cache.as_ptr();
        for bucket in index_ref.buckets.iter_mut() {
            let mut node = *bucket;
            while !node.is_null() {
                let next = (*node).next;
                cache_free_raw(node_cache, supplier, None, node as *mut u8);
                node = next;
            }
            *bucket = null_mut();
        }
        cache_free_raw(hash_table_cache, supplier, None, index.as_ptr() as *mut u8);
    }

    /// Prepends a fresh node onto the key's bucket. Assumes `key` is not
    /// already present.
    pub(crate) unsafe fn insert<P: PageSupplier>(
        &mut self,
        supplier: &mut P,
        flags: AllocFlags,
        key: usize,
        value: *mut Bufctl,
    ) -> bool {
        let node_cache = &mut *self.node_cache.as_ptr();
        let raw = cache_alloc_raw(node_cache, supplier, None, flags);
        if raw.is_null() {
            return false;
        }
        let node_ptr = raw as *mut HashNode;
        let idx = Self::bucket_of(key);
        node_ptr.write(HashNode {
            next: self.buckets[idx],
            key,
            value,
        });
        self.buckets[idx] = node_ptr;
        true
    }

    /// Walks the bucket chain for `key`, returning the stored bufctl or
    /// `None` if the key is absent.
    pub(crate) unsafe fn lookup(&self, key: usize) -> Option<*mut Bufctl> {
        let mut node = self.buckets[Self::bucket_of(key)];
        while !node.is_null() {
            if (*node).key == key {
                return Some((*node).value);
            }
            node = (*node).next;
        }
        None
    }

    /// Total number of entries across every bucket. Test-only: exercised by
    /// the hash-emptiness assertions in `tests.rs` (spec scenarios S3/S6).
    #[cfg(test)]
    pub(crate) unsafe fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|&bucket| {
                let mut count = 0;
                let mut node = bucket;
                while !node.is_null() {
                    count += 1;
                    node = (*node).next;
                }
                count
            })
            .sum()
    }

    /// Unlinks and releases the node for `key`, if present. A no-op if the
    /// key is absent.
    pub(crate) unsafe fn remove<P: PageSupplier>(&mut self, supplier: &mut P, key: usize) {
        let idx = Self::bucket_of(key);
        let mut prev: *mut HashNode = null_mut();
        let mut node = self.buckets[idx];
        while !node.is_null() {
            if (*node).key == key {
                if prev.is_null() {
                    self.buckets[idx] = (*node).next;
                } else {
                    (*prev).next = (*node).next;
                }
                let node_cache = &mut *self.node_cache.as_ptr();
                cache_free_raw(node_cache, supplier, None, node as *mut u8);
                return;
            }
            prev = node;
            node = (*node).next;
        }
    }
}
