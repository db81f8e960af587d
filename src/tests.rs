#[cfg(test)]
mod tests {
    use crate::*;
    extern crate alloc;
    extern crate std;
    use alloc::alloc::{alloc, dealloc, Layout};
    use alloc::vec::Vec;
    use rand::prelude::SliceRandom;
    use rand::thread_rng;
    use std::collections::HashSet;

    const PAGE_SIZE: usize = 4096;

    /// Hands out real heap pages (via `std`'s global allocator) aligned to
    /// `PAGE_SIZE`, and tracks every outstanding page so tests can assert on
    /// what got released.
    struct TestPageSupplier {
        outstanding: HashSet<usize>,
        exhausted: bool,
    }

    impl TestPageSupplier {
        fn new() -> Self {
            TestPageSupplier {
                outstanding: HashSet::new(),
                exhausted: false,
            }
        }
    }

    impl PageSupplier for TestPageSupplier {
        unsafe fn acquire_page(&mut self, page_size: usize, flags: AllocFlags) -> *mut u8 {
            if self.exhausted {
                assert_eq!(flags, AllocFlags::NoWait, "test never asks Wait to retry past exhaustion");
                return core::ptr::null_mut();
            }
            let layout = Layout::from_size_align(page_size, page_size).unwrap();
            let ptr = alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % page_size, 0);
            self.outstanding.insert(ptr as usize);
            ptr
        }

        unsafe fn release_page(&mut self, page_ptr: *mut u8, page_size: usize) {
            assert!(self.outstanding.remove(&(page_ptr as usize)), "released a page we never handed out");
            let layout = Layout::from_size_align(page_size, page_size).unwrap();
            dealloc(page_ptr, layout);
        }
    }

    #[test]
    fn _00_alloc_free_small_round_trip() {
        unsafe {
            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            let cache = allocator
                .create_cache("round_trip_u64", core::mem::size_of::<u64>(), 0, AllocFlags::NoWait)
                .unwrap();
            assert_eq!((*cache.as_ptr()).regime(), ObjectRegime::Small);

            let ptr = allocator.alloc(cache, AllocFlags::NoWait) as *mut u64;
            assert!(!ptr.is_null());
            ptr.write(0xdead_beef_cafe_babe);
            assert_eq!(ptr.read(), 0xdead_beef_cafe_babe);

            let stats_before_free = (*cache.as_ptr()).statistics();
            assert_eq!(stats_before_free.slab_count, 1);

            allocator.free(cache, ptr as *mut u8);
            let stats = (*cache.as_ptr()).statistics();
            assert_eq!(stats.empty_slabs, 1);
            assert_eq!(stats.partial_slabs, 0);
            assert_eq!(stats.full_slabs, 0);

            allocator.destroy_cache(cache);
        }
    }

    // Small regime, many objects spanning several slabs: exercises the
    // partial/full/empty list transitions directly.
    #[test]
    fn _01_alloc_small_multi_slab_list_discipline() {
        unsafe {
            struct Obj {
                #[allow(unused)]
                a: [u8; 32],
            }

            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            let cache = allocator
                .create_cache("obj32", core::mem::size_of::<Obj>(), 0, AllocFlags::NoWait)
                .unwrap();
            let per_slab = (*cache.as_ptr()).objects_per_slab();
            assert!(per_slab > 1);

            // Fill exactly two slabs full, and leave a third partially full.
            let total = per_slab * 2 + per_slab / 2;
            let mut ptrs = Vec::with_capacity(total);
            for _ in 0..total {
                let p = allocator.alloc(cache, AllocFlags::NoWait);
                assert!(!p.is_null());
                ptrs.push(p);
            }

            let stats = (*cache.as_ptr()).statistics();
            assert_eq!(stats.full_slabs, 2);
            assert_eq!(stats.partial_slabs, 1);
            assert_eq!(stats.empty_slabs, 0);
            assert_eq!(stats.slab_count, 3);

            // Every address unique and page-aligned.
            let unique: HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
            assert_eq!(unique.len(), ptrs.len());

            ptrs.shuffle(&mut thread_rng());
            for p in ptrs {
                allocator.free(cache, p);
            }
            let stats = (*cache.as_ptr()).statistics();
            assert_eq!(stats.full_slabs, 0);
            assert_eq!(stats.partial_slabs, 0);
            // The slab reaper keeps the cache's last slab around rather than
            // reaping every empty slab immediately.
            assert_eq!(stats.empty_slabs, 1);
            assert_eq!(stats.slab_count, 1);

            allocator.destroy_cache(cache);
        }
    }

    // Writes through the returned pointer and reads it back, confirming the
    // allocator never touches buffer contents it doesn't own.
    #[test]
    fn _02_round_trip_value_integrity() {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(C)]
        struct Triple {
            x: u32,
            y: u32,
            z: u32,
        }

        unsafe {
            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            let cache = allocator
                .create_cache(
                    "triple",
                    core::mem::size_of::<Triple>(),
                    core::mem::align_of::<Triple>(),
                    AllocFlags::NoWait,
                )
                .unwrap();

            let mut ptrs = Vec::new();
            for i in 0..50u32 {
                let raw = allocator.alloc(cache, AllocFlags::NoWait);
                assert!(!raw.is_null());
                let p = raw as *mut Triple;
                p.write(Triple { x: i, y: i * 2, z: i * 3 });
                ptrs.push(p);
            }
            for (i, p) in ptrs.iter().enumerate() {
                let i = i as u32;
                assert_eq!(p.read(), Triple { x: i, y: i * 2, z: i * 3 });
            }
            for p in ptrs {
                allocator.free(cache, p as *mut u8);
            }
            allocator.destroy_cache(cache);
        }
    }

    // Large regime: object size forces bufctls + a hash index. Confirms the
    // hash invariant (every live buffer resolves to exactly its own bufctl)
    // survives allocation and a shuffled free order.
    #[test]
    fn _03_alloc_large_hash_invariant() {
        unsafe {
            #[repr(C)]
            struct Big {
                #[allow(unused)]
                a: [u8; 600],
            }
            assert!(core::mem::size_of::<Big>() >= PAGE_SIZE / 8);

            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            let cache = allocator
                .create_cache("big600", core::mem::size_of::<Big>(), 0, AllocFlags::NoWait)
                .unwrap();
            assert_eq!((*cache.as_ptr()).regime(), ObjectRegime::Large);

            let mut ptrs = Vec::new();
            for _ in 0..10 {
                let p = allocator.alloc(cache, AllocFlags::NoWait);
                assert!(!p.is_null());
                ptrs.push(p as usize);
            }
            let unique: HashSet<usize> = ptrs.iter().copied().collect();
            assert_eq!(unique.len(), 10);

            ptrs.shuffle(&mut thread_rng());
            for p in ptrs {
                allocator.free(cache, p as *mut u8);
            }

            let stats = (*cache.as_ptr()).statistics();
            assert_eq!(stats.full_slabs, 0);
            assert_eq!(stats.partial_slabs, 0);

            // The "never reap the last slab" policy leaves one slab (and its
            // hash entries) behind; force every slab to reap, including that
            // one, and confirm the hash index is left with no residual
            // entries (spec scenario S3, invariant 5).
            allocator.force_reap_all_for_test(cache);
            assert_eq!(
                (*cache.as_ptr()).hash_entry_count(),
                0,
                "hash index must be empty once every slab has been reaped"
            );

            allocator.destroy_cache(cache);
        }
    }

    // Exhausting the page supplier under NoWait fails the allocation
    // cleanly rather than panicking; freeing a buffer immediately recovers
    // capacity without asking the supplier for another page (spec scenario
    // S4).
    #[test]
    fn _04_free_after_exhaust_recovers_capacity() {
        unsafe {
            struct Obj {
                #[allow(unused)]
                a: [u8; 64],
            }

            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            let cache = allocator
                .create_cache("obj64", core::mem::size_of::<Obj>(), 0, AllocFlags::NoWait)
                .unwrap();
            let per_slab = (*cache.as_ptr()).objects_per_slab();

            let mut ptrs = Vec::new();
            for _ in 0..per_slab {
                let p = allocator.alloc(cache, AllocFlags::NoWait);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            assert_eq!((*cache.as_ptr()).statistics().full_slabs, 1);

            let supplier = allocator.page_supplier_mut_for_test();
            supplier.exhausted = true;

            let failed = allocator.alloc(cache, AllocFlags::NoWait);
            assert!(failed.is_null(), "NoWait must fail rather than block when the supplier is dry");

            let freed = ptrs.pop().unwrap();
            allocator.free(cache, freed);
            let reallocated = allocator.alloc(cache, AllocFlags::NoWait);
            assert!(!reallocated.is_null());
            assert_eq!(reallocated, freed, "freed buffer should be handed back out first");

            allocator.page_supplier_mut_for_test().exhausted = false;
            ptrs.push(reallocated);
            for p in ptrs {
                allocator.free(cache, p);
            }
            allocator.destroy_cache(cache);
        }
    }

    // Confirms the bootstrap sequence actually produces five self-hosted
    // internal caches, all Small-regime, each carrying its own hash index.
    #[test]
    fn _05_bootstrap_brings_up_five_internal_caches() {
        unsafe {
            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            assert!(allocator.internal_cache("cache_cache").is_none());

            let _ = allocator
                .create_cache("anything", 16, 0, AllocFlags::NoWait)
                .unwrap();

            for name in [
                "cache_cache",
                "slab_meta_cache",
                "bufctl_cache",
                "hash_table_cache",
                "hash_node_cache",
            ] {
                let handle = allocator.internal_cache(name).unwrap_or_else(|| panic!("missing {name}"));
                let cache = &*handle.as_ptr();
                assert_eq!(cache.name(), name);
                assert_eq!(cache.regime(), ObjectRegime::Small);
                assert!(cache.slab_count() >= 1);
            }
        }
    }

    // Destroying a cache reaps every one of its slabs back to the page
    // supplier and (Large regime) leaves no residual hash entries; the
    // internal caches it was built on top of are left untouched (spec
    // scenario S6).
    #[test]
    fn _06_destroy_releases_all_of_a_caches_pages() {
        unsafe {
            #[repr(C)]
            struct Big {
                #[allow(unused)]
                a: [u8; 600],
            }
            assert!(core::mem::size_of::<Big>() >= PAGE_SIZE / 8);

            let mut allocator = SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new());
            let cache = allocator
                .create_cache("big600_destroy", core::mem::size_of::<Big>(), 0, AllocFlags::NoWait)
                .unwrap();
            assert_eq!((*cache.as_ptr()).regime(), ObjectRegime::Large);
            let per_slab = (*cache.as_ptr()).objects_per_slab();

            let mut ptrs = Vec::new();
            for _ in 0..(per_slab * 3) {
                let p = allocator.alloc(cache, AllocFlags::NoWait);
                assert!(!p.is_null());
                ptrs.push(p as usize);
            }
            let cache_pages: HashSet<usize> = ptrs.iter().map(|p| crate::align_down(*p, PAGE_SIZE)).collect();
            assert!(cache_pages.len() >= 2);
            assert_eq!((*cache.as_ptr()).hash_entry_count(), per_slab * 3);

            for p in ptrs {
                allocator.free(cache, p as *mut u8);
            }

            // Force every slab to reap before destroying, so the hash
            // invariant can be checked on a still-valid handle.
            allocator.force_reap_all_for_test(cache);
            assert_eq!(
                (*cache.as_ptr()).hash_entry_count(),
                0,
                "no residual hash entries may survive a full reap"
            );

            allocator.destroy_cache(cache);
            let outstanding = &allocator.page_supplier_mut_for_test().outstanding;
            assert!(
                cache_pages.iter().all(|p| !outstanding.contains(p)),
                "destroy must release every page the cache was holding back to the supplier"
            );

            let internal_cache_cache_handle = allocator.internal_cache("cache_cache").unwrap();
            let internal_cache_cache = &*internal_cache_cache_handle.as_ptr();
            assert!(
                internal_cache_cache.slab_count() >= 1,
                "internal caches survive a client cache's destruction"
            );
        }
    }

    #[test]
    fn can_be_used_behind_a_static_mutex() {
        use spin::{Mutex, Once};

        static ALLOCATOR: Once<Mutex<SlabAllocator<TestPageSupplier>>> = Once::new();
        ALLOCATOR.call_once(|| Mutex::new(SlabAllocator::new(PAGE_SIZE, TestPageSupplier::new())));

        unsafe {
            let mut guard = ALLOCATOR.get().unwrap().lock();
            let cache = guard.create_cache("static_u32", 4, 0, AllocFlags::NoWait).unwrap();
            let ptr = guard.alloc(cache, AllocFlags::NoWait);
            assert!(!ptr.is_null());
            guard.free(cache, ptr);
            guard.destroy_cache(cache);
        }
    }
}
