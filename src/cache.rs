use core::mem::size_of;
use core::ptr::{null_mut, NonNull};

use intrusive_collections::{LinkedList, UnsafeRef};

use crate::align_down;
use crate::hash::HashIndex;
use crate::page_supplier::PageSupplier;
use crate::slab::{self, SlabAdapter, SlabFreelist, SlabMeta};
use crate::AllocFlags;

/// Which of the two physical slab layouts a cache uses, decided once at
/// creation from the post-alignment object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRegime {
    /// Slab metadata embedded at the tail of the page; buffers self-link
    /// their own freelist.
    Small,
    /// Slab metadata and per-buffer control records (bufctls) allocated
    /// from internal caches; buffers are looked up via a hash index.
    Large,
}

/// Slab-count bookkeeping exposed for diagnostics. Client-visible
/// statistics are scoped to slab counts, not arbitrary metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatistics {
    pub slab_count: usize,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub empty_slabs: usize,
}

/// A pool of same-size buffers, organized as a list of slabs. Returned to
/// clients as an opaque handle (`NonNull<Cache>`) by
/// [`crate::SlabAllocator::create_cache`].
pub struct Cache {
    pub(crate) name: &'static str,
    pub(crate) object_size: usize,
    pub(crate) regime: ObjectRegime,
    pub(crate) page_size: usize,
    pub(crate) objects_per_slab: usize,
    pub(crate) slab_count: usize,
    pub(crate) full_slabs: LinkedList<SlabAdapter>,
    pub(crate) partial_slabs: LinkedList<SlabAdapter>,
    pub(crate) empty_slabs: LinkedList<SlabAdapter>,
    pub(crate) hash: Option<NonNull<HashIndex>>,
}

// Internal bookkeeping, always reached through `SlabAllocator`, which the
// embedder is responsible for serializing.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn regime(&self) -> ObjectRegime {
        self.regime
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            slab_count: self.slab_count,
            full_slabs: self.full_slabs.iter().count(),
            partial_slabs: self.partial_slabs.iter().count(),
            empty_slabs: self.empty_slabs.iter().count(),
        }
    }

    /// Number of entries in this cache's hash index, or `0` for a Small-regime
    /// cache (which has none). Test-only: lets `tests.rs` assert spec
    /// invariant 5 (a buffer's hash entry disappears exactly when its slab is
    /// reaped) directly, rather than inferring it from allocation behavior.
    #[cfg(test)]
    pub(crate) fn hash_entry_count(&self) -> usize {
        match self.hash {
            Some(hash_ptr) => unsafe { (*hash_ptr.as_ptr()).len() },
            None => 0,
        }
    }
}

/// The four caches bootstrap brings up to back a Large-regime cache: slab
/// metadata, bufctls, and the hash index's own table/node storage. Small
/// caches never need these (by construction, none of the bootstrap records
/// themselves are Large-regime).
pub(crate) struct InternalCaches {
    pub(crate) slab_meta_cache: NonNull<Cache>,
    pub(crate) bufctl_cache: NonNull<Cache>,
    pub(crate) hash_table_cache: NonNull<Cache>,
    pub(crate) hash_node_cache: NonNull<Cache>,
}

/// How many buffers a fresh, `offset == 0` slab of this regime/size holds.
/// The bootstrap's first (`offset == 1`) slab holds one fewer than this.
pub(crate) fn objects_per_slab_for(regime: ObjectRegime, object_size: usize, page_size: usize) -> usize {
    match regime {
        ObjectRegime::Small => {
            let available = page_size - size_of::<SlabMeta>();
            available / object_size - 1
        }
        ObjectRegime::Large => page_size / object_size,
    }
}

fn empty_slab_lists() -> (
    LinkedList<SlabAdapter>,
    LinkedList<SlabAdapter>,
    LinkedList<SlabAdapter>,
) {
    (
        LinkedList::new(SlabAdapter::new()),
        LinkedList::new(SlabAdapter::new()),
        LinkedList::new(SlabAdapter::new()),
    )
}

/// Allocates a `Cache` header from `money_cache`, computes its regime and
/// per-slab capacity, optionally stands up its hash index, and eagerly
/// grows its first slab. `create_hash` is `false` only while the bootstrap
/// is creating the four internal caches, none of which may consult a hash
/// table that doesn't exist yet.
///
/// # Panics
/// If `size == 0` or `align` is neither zero nor a power of two. Precondition
/// violations are assertion failures here, not recoverable errors.
pub(crate) unsafe fn create_cache_raw<P: PageSupplier>(
    money_cache: &mut Cache,
    internal: Option<&InternalCaches>,
    supplier: &mut P,
    page_size: usize,
    name: &'static str,
    size: usize,
    align: usize,
    create_hash: bool,
    flags: AllocFlags,
) -> Option<NonNull<Cache>> {
    assert!(size > 0, "object size must be nonzero");
    assert!(
        align == 0 || crate::is_power_of_two(align),
        "alignment must be zero or a power of two"
    );

    let object_size = if align > 0 { size + (size % align) } else { size };
    let regime = if object_size < page_size / 8 {
        ObjectRegime::Small
    } else {
        ObjectRegime::Large
    };
    if regime == ObjectRegime::Small {
        assert!(
            object_size >= size_of::<*mut u8>(),
            "object too small to hold the in-place freelist link"
        );
    }

    let raw = cache_alloc_raw(money_cache, supplier, None, flags);
    let cache_ptr = NonNull::new(raw as *mut Cache)?;

    let (full_slabs, partial_slabs, empty_slabs) = empty_slab_lists();
    cache_ptr.as_ptr().write(Cache {
        name,
        object_size,
        regime,
        page_size,
        objects_per_slab: objects_per_slab_for(regime, object_size, page_size),
        slab_count: 0,
        full_slabs,
        partial_slabs,
        empty_slabs,
        hash: None,
    });
    let cache = &mut *cache_ptr.as_ptr();

    if create_hash {
        let internal = internal.expect("hash creation requires the bootstrap internal caches");
        let hash_table_cache = &mut *internal.hash_table_cache.as_ptr();
        match HashIndex::init(hash_table_cache, internal.hash_node_cache, supplier, flags) {
            Some(hash_ptr) => cache.hash = Some(hash_ptr),
            None => {
                cache_free_raw(money_cache, supplier, None, cache_ptr.as_ptr() as *mut u8);
                return None;
            }
        }
    }

    if cache_grow_raw(cache, internal, supplier, flags).is_none() {
        if let Some(hash_ptr) = cache.hash.take() {
            let internal = internal.expect("hash teardown requires the bootstrap internal caches");
            let hash_table_cache = &mut *internal.hash_table_cache.as_ptr();
            HashIndex::free(hash_ptr, hash_table_cache, supplier);
        }
        cache_free_raw(money_cache, supplier, None, cache_ptr.as_ptr() as *mut u8);
        return None;
    }

    Some(cache_ptr)
}

/// Requests one page from `supplier`, builds a slab in `cache`'s regime on
/// it, and appends the (initially empty) slab to the cache's slab list.
pub(crate) unsafe fn cache_grow_raw<P: PageSupplier>(
    cache: &mut Cache,
    internal: Option<&InternalCaches>,
    supplier: &mut P,
    flags: AllocFlags,
) -> Option<NonNull<SlabMeta>> {
    let page = supplier.acquire_page(cache.page_size, flags);
    if page.is_null() {
        return None;
    }

    let slab_ptr = match cache.regime {
        ObjectRegime::Small => slab::init_small(page, cache.page_size, cache.object_size, 0),
        ObjectRegime::Large => {
            let internal = internal.expect("large-regime cache requires the bootstrap internal caches");
            let slab_meta_cache = &mut *internal.slab_meta_cache.as_ptr();
            let bufctl_cache = &mut *internal.bufctl_cache.as_ptr();
            let hash = &mut *cache
                .hash
                .expect("large-regime cache missing its hash index")
                .as_ptr();
            match slab::init_large(
                page,
                cache.page_size,
                cache.object_size,
                slab_meta_cache,
                bufctl_cache,
                hash,
                supplier,
                flags,
            ) {
                Some(s) => s,
                None => {
                    supplier.release_page(page, cache.page_size);
                    return None;
                }
            }
        }
    };

    cache.empty_slabs.push_back(UnsafeRef::from_raw(slab_ptr));
    cache.slab_count += 1;
    NonNull::new(slab_ptr)
}

/// Draws one buffer from `cache`, growing it (retrying under `Wait`, failing
/// under `NoWait`) if every existing slab is full.
pub(crate) unsafe fn cache_alloc_raw<P: PageSupplier>(
    cache: &mut Cache,
    supplier: &mut P,
    internal: Option<&InternalCaches>,
    flags: AllocFlags,
) -> *mut u8 {
    loop {
        let (slab_ptr, came_from_empty): (*mut SlabMeta, bool) =
            if let Some(slab_ref) = cache.partial_slabs.front().get() {
                (slab_ref as *const SlabMeta as *mut SlabMeta, false)
            } else if let Some(slab_ref) = cache.empty_slabs.front().get() {
                (slab_ref as *const SlabMeta as *mut SlabMeta, true)
            } else {
                match cache_grow_raw(cache, internal, supplier, flags) {
                    Some(_) => continue,
                    None => {
                        if flags == AllocFlags::Wait {
                            continue;
                        }
                        return null_mut();
                    }
                }
            };

        if came_from_empty {
            let mut cursor = cache.empty_slabs.cursor_mut_from_ptr(slab_ptr as *const SlabMeta);
            let slab_ref = cursor.remove().expect("slab missing from empty list");
            cache.partial_slabs.push_front(slab_ref);
        }

        let slab = &mut *slab_ptr;
        let freelist = &mut *slab.freelist.get();
        let object_ptr = match freelist {
            SlabFreelist::Small(head) => {
                debug_assert!(!head.is_null(), "slab with capacity has an empty freelist");
                let buf = *head;
                *head = (buf as *mut *mut u8).read();
                buf
            }
            SlabFreelist::Large { head, tail } => {
                let bufctl = *head;
                debug_assert!(!bufctl.is_null(), "slab with capacity has an empty bufctl list");
                *head = (*bufctl).next;
                if head.is_null() {
                    *tail = null_mut();
                }
                (*bufctl).buf
            }
        };
        slab.refcount += 1;

        if slab.refcount == slab.size {
            let mut cursor = cache.partial_slabs.cursor_mut_from_ptr(slab_ptr as *const SlabMeta);
            let slab_ref = cursor.remove().expect("just-filled slab missing from partial list");
            cache.full_slabs.push_back(slab_ref);
        }

        return object_ptr;
    }
}

/// Returns `object_ptr` (previously returned by `cache_alloc_raw` on this
/// cache) to its slab. Silently does nothing if `object_ptr` is unknown to
/// the cache's hash index (Large regime only).
pub(crate) unsafe fn cache_free_raw<P: PageSupplier>(
    cache: &mut Cache,
    supplier: &mut P,
    internal: Option<&InternalCaches>,
    object_ptr: *mut u8,
) {
    let slab_ptr: *mut SlabMeta = match cache.regime {
        ObjectRegime::Small => {
            let page_base = align_down(object_ptr as usize, cache.page_size) as *mut u8;
            page_base.add(cache.page_size - size_of::<SlabMeta>()) as *mut SlabMeta
        }
        ObjectRegime::Large => {
            let hash = &mut *cache.hash.expect("large-regime cache missing its hash index").as_ptr();
            match hash.lookup(object_ptr as usize) {
                Some(bufctl) => (*bufctl).slab,
                None => return,
            }
        }
    };

    match cache.regime {
        ObjectRegime::Small => {
            let slab = &mut *slab_ptr;
            if let SlabFreelist::Small(head) = &mut *slab.freelist.get() {
                (object_ptr as *mut *mut u8).write(*head);
                *head = object_ptr;
            }
        }
        ObjectRegime::Large => {
            let hash = &mut *cache.hash.unwrap().as_ptr();
            let bufctl = hash.lookup(object_ptr as usize).expect("buffer vanished between lookups");
            let slab = &mut *slab_ptr;
            if let SlabFreelist::Large { head, tail } = &mut *slab.freelist.get() {
                (*bufctl).next = null_mut();
                if head.is_null() {
                    *head = bufctl;
                } else {
                    (**tail).next = bufctl;
                }
                *tail = bufctl;
            }
        }
    }

    let slab = &mut *slab_ptr;
    let was_full = slab.refcount == slab.size;
    slab.refcount -= 1;

    if was_full {
        let mut cursor = cache.full_slabs.cursor_mut_from_ptr(slab_ptr as *const SlabMeta);
        let slab_ref = cursor.remove().expect("slab missing from full list");
        cache.partial_slabs.push_front(slab_ref);
    }

    if slab.refcount == 0 {
        let mut cursor = cache.partial_slabs.cursor_mut_from_ptr(slab_ptr as *const SlabMeta);
        let slab_ref = cursor.remove().expect("slab missing from partial list");
        cache.empty_slabs.push_front(slab_ref);

        if cache.slab_count > 1 {
            cache_reap_raw(cache, internal, supplier, false);
        }
    }
}

unsafe fn reap_one<P: PageSupplier>(
    cache: &mut Cache,
    internal: Option<&InternalCaches>,
    supplier: &mut P,
    slab_ptr: *mut SlabMeta,
) {
    match cache.regime {
        ObjectRegime::Small => slab::reap_small(slab_ptr, supplier, cache.page_size),
        ObjectRegime::Large => {
            let internal = internal.expect("large-regime cache requires the bootstrap internal caches");
            let slab_meta_cache = &mut *internal.slab_meta_cache.as_ptr();
            let bufctl_cache = &mut *internal.bufctl_cache.as_ptr();
            let hash = &mut *cache.hash.expect("large-regime cache missing its hash index").as_ptr();
            slab::reap_large(slab_ptr, supplier, cache.page_size, slab_meta_cache, bufctl_cache, hash);
        }
    }
    cache.slab_count -= 1;
}

/// Reclaims empty slabs' pages back to the supplier. With `force`, every
/// slab is reclaimed regardless of occupancy (used by `destroy`); otherwise
/// only fully-idle slabs are reclaimed, and the cache's last slab is never
/// touched.
pub(crate) unsafe fn cache_reap_raw<P: PageSupplier>(
    cache: &mut Cache,
    internal: Option<&InternalCaches>,
    supplier: &mut P,
    force: bool,
) {
    if force {
        while let Some(slab_ref) = cache.full_slabs.pop_front() {
            reap_one(cache, internal, supplier, UnsafeRef::into_raw(slab_ref));
        }
        while let Some(slab_ref) = cache.partial_slabs.pop_front() {
            reap_one(cache, internal, supplier, UnsafeRef::into_raw(slab_ref));
        }
        while let Some(slab_ref) = cache.empty_slabs.pop_front() {
            reap_one(cache, internal, supplier, UnsafeRef::into_raw(slab_ref));
        }
    } else {
        while cache.slab_count > 1 {
            match cache.empty_slabs.pop_front() {
                Some(slab_ref) => reap_one(cache, internal, supplier, UnsafeRef::into_raw(slab_ref)),
                None => break,
            }
        }
    }
}

/// Reaps every slab unconditionally (each Large-regime slab removing its own
/// hash entries on the way out, per spec invariant 5), then releases the
/// cache's now-empty hash index, then returns the cache header itself to
/// `money_cache`. Reap must run before the hash index is freed: `reap_one`
/// reaches through `cache.hash` to remove each bufctl's entry, so dropping
/// the hash table first would leave it dereferencing a freed table.
pub(crate) unsafe fn cache_destroy_raw<P: PageSupplier>(
    cache_ptr: NonNull<Cache>,
    internal: Option<&InternalCaches>,
    money_cache: &mut Cache,
    supplier: &mut P,
) {
    let cache = &mut *cache_ptr.as_ptr();
    cache_reap_raw(cache, internal, supplier, true);
    if let Some(hash_ptr) = cache.hash.take() {
        let internal = internal.expect("hash teardown requires the bootstrap internal caches");
        let hash_table_cache = &mut *internal.hash_table_cache.as_ptr();
        HashIndex::free(hash_ptr, hash_table_cache, supplier);
    }
    cache_free_raw(money_cache, supplier, None, cache_ptr.as_ptr() as *mut u8);
}
