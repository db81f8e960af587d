use core::mem::size_of;
use core::ptr::NonNull;

use intrusive_collections::UnsafeRef;

use crate::cache::{
    cache_alloc_raw, cache_destroy_raw, cache_free_raw, create_cache_raw, objects_per_slab_for,
    Cache, CacheStatistics, InternalCaches, ObjectRegime,
};
#[cfg(test)]
use crate::cache::cache_reap_raw;
use crate::hash::{HashIndex, HashNode};
use crate::page_supplier::PageSupplier;
use crate::slab::{self, Bufctl, SlabMeta};
use crate::AllocFlags;

/// Owns the five process-wide internal caches (cache headers, slab
/// metadata, bufctls, hash tables, hash nodes) and the page supplier they're
/// all ultimately backed by. Client caches are created, used, and destroyed
/// through this type.
///
/// Lives for as long as any cache created from it does; a typical embedder
/// keeps one behind a `static` `spin::Once<spin::Mutex<SlabAllocator<_>>>`,
/// since concurrent access is the embedder's responsibility to serialize
/// (see `tests.rs` for an example).
pub struct SlabAllocator<P: PageSupplier> {
    supplier: P,
    page_size: usize,
    money_cache: Option<NonNull<Cache>>,
    slab_meta_cache: Option<NonNull<Cache>>,
    bufctl_cache: Option<NonNull<Cache>>,
    hash_table_cache: Option<NonNull<Cache>>,
    hash_node_cache: Option<NonNull<Cache>>,
}

impl<P: PageSupplier> SlabAllocator<P> {
    /// `page_size` must be the supplier's page size and a power of two;
    /// discovered once by the embedder from its operating environment and
    /// handed in here.
    pub fn new(page_size: usize, supplier: P) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        assert!(page_size >= size_of::<SlabMeta>() * 2, "page size too small to host slab metadata");
        SlabAllocator {
            supplier,
            page_size,
            money_cache: None,
            slab_meta_cache: None,
            bufctl_cache: None,
            hash_table_cache: None,
            hash_node_cache: None,
        }
    }

    fn is_bootstrapped(&self) -> bool {
        self.money_cache.is_some()
    }

    fn internal_caches(&self) -> Option<InternalCaches> {
        Some(InternalCaches {
            slab_meta_cache: self.slab_meta_cache?,
            bufctl_cache: self.bufctl_cache?,
            hash_table_cache: self.hash_table_cache?,
            hash_node_cache: self.hash_node_cache?,
        })
    }

    /// Resolves the "allocating a cache requires a cache" bootstrap
    /// circularity: hand-places a self-hosted cache-cache on a raw page,
    /// then creates the four remaining internal caches through the ordinary
    /// `create_cache` path with hash creation suppressed, then retroactively
    /// attaches a hash index to all five.
    unsafe fn bootstrap(&mut self, flags: AllocFlags) -> bool {
        if self.is_bootstrapped() {
            return true;
        }

        // Ordering constraint: every bootstrap record type must fall into
        // the Small regime, or it would need a bufctl cache that isn't
        // built yet.
        debug_assert!(size_of::<Cache>() < self.page_size / 8);
        debug_assert!(size_of::<SlabMeta>() < self.page_size / 8);
        debug_assert!(size_of::<Bufctl>() < self.page_size / 8);
        debug_assert!(size_of::<HashIndex>() < self.page_size / 8);
        debug_assert!(size_of::<HashNode>() < self.page_size / 8);

        let firstpage = self.supplier.acquire_page(self.page_size, flags);
        if firstpage.is_null() {
            return false;
        }

        let object_size = size_of::<Cache>();
        let money_cache_ptr = firstpage as *mut Cache;
        money_cache_ptr.write(Cache {
            name: "cache_cache",
            object_size,
            regime: ObjectRegime::Small,
            page_size: self.page_size,
            objects_per_slab: objects_per_slab_for(ObjectRegime::Small, object_size, self.page_size),
            slab_count: 1,
            full_slabs: intrusive_collections::LinkedList::new(crate::slab::SlabAdapter::new()),
            partial_slabs: intrusive_collections::LinkedList::new(crate::slab::SlabAdapter::new()),
            empty_slabs: intrusive_collections::LinkedList::new(crate::slab::SlabAdapter::new()),
            hash: None,
        });
        let money_cache = &mut *money_cache_ptr;

        // offset = 1: slot 0 is already occupied by the cache-cache header
        // we just wrote into this same page.
        let slab_ptr = slab::init_small(firstpage, self.page_size, object_size, 1);
        (*slab_ptr).refcount = 1;
        money_cache.partial_slabs.push_back(UnsafeRef::from_raw(slab_ptr));
        self.money_cache = NonNull::new(money_cache_ptr);

        // Four more caches through the normal path, hash creation
        // suppressed: none of them may consult a hash table that doesn't
        // exist yet.
        let slab_meta_cache = match create_cache_raw(
            money_cache,
            None,
            &mut self.supplier,
            self.page_size,
            "slab_meta_cache",
            size_of::<SlabMeta>(),
            0,
            false,
            flags,
        ) {
            Some(c) => c,
            None => return false,
        };
        let bufctl_cache = match create_cache_raw(
            money_cache,
            None,
            &mut self.supplier,
            self.page_size,
            "bufctl_cache",
            size_of::<Bufctl>(),
            0,
            false,
            flags,
        ) {
            Some(c) => c,
            None => return false,
        };
        let hash_table_cache = match create_cache_raw(
            money_cache,
            None,
            &mut self.supplier,
            self.page_size,
            "hash_table_cache",
            size_of::<HashIndex>(),
            0,
            false,
            flags,
        ) {
            Some(c) => c,
            None => return false,
        };
        let hash_node_cache = match create_cache_raw(
            money_cache,
            None,
            &mut self.supplier,
            self.page_size,
            "hash_node_cache",
            size_of::<HashNode>(),
            0,
            false,
            flags,
        ) {
            Some(c) => c,
            None => return false,
        };

        self.slab_meta_cache = Some(slab_meta_cache);
        self.bufctl_cache = Some(bufctl_cache);
        self.hash_table_cache = Some(hash_table_cache);
        self.hash_node_cache = Some(hash_node_cache);

        // Retroactively attach a hash index to all five internal caches,
        // now that hash_table_cache/hash_node_cache exist to draw from.
        for cache_ptr in [
            self.money_cache.unwrap(),
            slab_meta_cache,
            bufctl_cache,
            hash_table_cache,
            hash_node_cache,
        ] {
            let hash_ptr = {
                let hash_table_cache_ref = &mut *hash_table_cache.as_ptr();
                HashIndex::init(hash_table_cache_ref, hash_node_cache, &mut self.supplier, flags)
            };
            match hash_ptr {
                Some(h) => (*cache_ptr.as_ptr()).hash = Some(h),
                None => return false,
            }
        }

        true
    }

    /// Creates a cache for objects of `size` bytes, aligned to `align` (zero
    /// or a power of two). Bootstraps the internal caches on first use.
    /// Returns `None` only on page-supplier exhaustion; bad arguments are
    /// assertion failures.
    pub fn create_cache(
        &mut self,
        name: &'static str,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<Cache>> {
        unsafe {
            if !self.is_bootstrapped() && !self.bootstrap(flags) {
                return None;
            }
            let money_cache = &mut *self.money_cache.unwrap().as_ptr();
            let internal = self.internal_caches();
            create_cache_raw(
                money_cache,
                internal.as_ref(),
                &mut self.supplier,
                self.page_size,
                name,
                size,
                align,
                true,
                flags,
            )
        }
    }

    /// Draws one buffer from `cache`. Returns null if `flags ==
    /// AllocFlags::NoWait` and the page supplier is exhausted.
    ///
    /// # Safety
    /// `cache` must be a handle returned by `create_cache` on this
    /// `SlabAllocator` and not yet destroyed.
    pub unsafe fn alloc(&mut self, cache: NonNull<Cache>, flags: AllocFlags) -> *mut u8 {
        let internal = self.internal_caches();
        let cache_ref = &mut *cache.as_ptr();
        cache_alloc_raw(cache_ref, &mut self.supplier, internal.as_ref(), flags)
    }

    /// Returns a buffer previously obtained from `cache` via `alloc`.
    ///
    /// # Safety
    /// `cache` must be a handle returned by `create_cache` on this
    /// `SlabAllocator`; `buf` must have been returned by `alloc` on that
    /// same cache and not already freed.
    pub unsafe fn free(&mut self, cache: NonNull<Cache>, buf: *mut u8) {
        let internal = self.internal_caches();
        let cache_ref = &mut *cache.as_ptr();
        cache_free_raw(cache_ref, &mut self.supplier, internal.as_ref(), buf);
    }

    /// Destroys `cache`: releases its hash index, reaps every slab back to
    /// the page supplier, and returns the cache header to the cache-cache.
    /// The five internal caches themselves are never destroyed by this
    /// method; they live for the lifetime of the `SlabAllocator`.
    ///
    /// # Safety
    /// `cache` must be a handle returned by `create_cache` on this
    /// `SlabAllocator`, with no outstanding (unfreed) buffers.
    pub unsafe fn destroy_cache(&mut self, cache: NonNull<Cache>) {
        let internal = self.internal_caches();
        let money_cache = &mut *self.money_cache.expect("destroy_cache called before any cache was created").as_ptr();
        cache_destroy_raw(cache, internal.as_ref(), money_cache, &mut self.supplier);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[cfg(test)]
    pub(crate) fn page_supplier_mut_for_test(&mut self) -> &mut P {
        &mut self.supplier
    }

    /// Forces every slab of `cache` to be reaped, including the one the
    /// "never reap the last slab" policy would otherwise keep around,
    /// without destroying `cache` itself. Lets tests observe the
    /// large-regime hash index actually empty out on reap (spec scenario
    /// S3) without reading through a handle `destroy_cache` has already
    /// freed.
    #[cfg(test)]
    pub(crate) unsafe fn force_reap_all_for_test(&mut self, cache: NonNull<Cache>) {
        let internal = self.internal_caches();
        let cache_ref = &mut *cache.as_ptr();
        cache_reap_raw(cache_ref, internal.as_ref(), &mut self.supplier, true);
    }

    /// Statistics for one of the five internal caches, keyed by name
    /// (`"cache_cache"`, `"slab_meta_cache"`, `"bufctl_cache"`,
    /// `"hash_table_cache"`, `"hash_node_cache"`), or `None` before
    /// bootstrap / for an unrecognized name.
    pub fn internal_cache_statistics(&self, name: &str) -> Option<CacheStatistics> {
        let ptr = match name {
            "cache_cache" => self.money_cache,
            "slab_meta_cache" => self.slab_meta_cache,
            "bufctl_cache" => self.bufctl_cache,
            "hash_table_cache" => self.hash_table_cache,
            "hash_node_cache" => self.hash_node_cache,
            _ => None,
        }?;
        Some(unsafe { (*ptr.as_ptr()).statistics() })
    }

    /// Handle to one of the five internal caches, keyed by the same names as
    /// `internal_cache_statistics`. Exposed so embedders (and tests) can
    /// inspect `name()`/`object_size()`/`regime()` without reaching into
    /// private bootstrap state.
    pub fn internal_cache(&self, name: &str) -> Option<NonNull<Cache>> {
        match name {
            "cache_cache" => self.money_cache,
            "slab_meta_cache" => self.slab_meta_cache,
            "bufctl_cache" => self.bufctl_cache,
            "hash_table_cache" => self.hash_table_cache,
            "hash_node_cache" => self.hash_node_cache,
            _ => None,
        }
    }
}
