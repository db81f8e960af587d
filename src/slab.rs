use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::null_mut;

use intrusive_collections::{intrusive_adapter, LinkedListLink, UnsafeRef};

use crate::cache::{cache_alloc_raw, cache_free_raw, Cache};
use crate::hash::HashIndex;
use crate::page_supplier::PageSupplier;
use crate::AllocFlags;

/// The Small regime's in-place freelist link: a single machine word written
/// into the first bytes of a free buffer, per `spec.md` §4.2 ("the first
/// machine-word of each free buffer stores the next-free pointer in-place").
/// Unlike the Large regime's bufctls, there is no separate metadata record,
/// the buffer *is* the link while it's unreferenced by the client, which is
/// why this is a raw pointer rather than an `intrusive_collections` node: a
/// doubly-linked link costs two words, and objects as small as one word must
/// still fit their own freelist link.
pub(crate) type FreeBuf = *mut u8;

/// Large-regime control record: lives outside the buffer's page, drawn from
/// the internal bufctl cache. `next` threads the slab's bufctl freelist;
/// `slab`/`buf` are the reverse-lookup fields the hash index's value points
/// at.
pub(crate) struct Bufctl {
    pub(crate) next: *mut Bufctl,
    pub(crate) slab: *mut SlabMeta,
    pub(crate) buf: *mut u8,
}

/// A slab's per-slab freelist, in whichever physical shape its cache's
/// regime calls for. This is the safe-Rust equivalent of the original's
/// `union buf_ish firstbuf/lastbuf` discriminated by `cp->type`.
pub(crate) enum SlabFreelist {
    /// Head of the in-place singly-linked chain of free buffers; null when
    /// the slab is full.
    Small(FreeBuf),
    Large {
        head: *mut Bufctl,
        tail: *mut Bufctl,
    },
}

/// One page's worth of buffers of a single object class. Embedded at the
/// tail of the page itself in the Small regime, or drawn from the internal
/// slab-metadata cache in the Large regime; `cache::create_cache_raw` and
/// `cache_grow_raw` decide which.
pub(crate) struct SlabMeta {
    pub(crate) link: LinkedListLink,
    pub(crate) page_base: *mut u8,
    pub(crate) size: usize,
    pub(crate) refcount: usize,
    pub(crate) freelist: UnsafeCell<SlabFreelist>,
}

intrusive_adapter!(pub(crate) SlabAdapter = UnsafeRef<SlabMeta>: SlabMeta { link: LinkedListLink });

// Internal bookkeeping, always reached through a `Cache` the embedder
// already serializes.
unsafe impl Send for SlabMeta {}
unsafe impl Sync for SlabMeta {}

/// Builds a Small-regime slab on a freshly acquired page: metadata at
/// `page + page_size - size_of::<SlabMeta>()`, buffers filling the head,
/// freelist threaded through the buffers themselves.
///
/// `offset` skips initializing the first `offset` object slots; used only by
/// the bootstrap to reserve the slot the self-hosted cache-cache header
/// already occupies on its own first page.
pub(crate) unsafe fn init_small(
    page: *mut u8,
    page_size: usize,
    object_size: usize,
    offset: usize,
) -> *mut SlabMeta {
    let slab_ptr = page.add(page_size - size_of::<SlabMeta>()) as *mut SlabMeta;
    let available = page_size - size_of::<SlabMeta>();
    // One slot's worth of space at the tail is deliberately left unused.
    let size = available / object_size - offset - 1;

    // Thread the freelist by writing, into the first machine word of each
    // free buffer, the address of the next free buffer. Ascending address
    // order, head pointing at the lowest-addressed buffer, per `spec.md`
    // §4.2.
    let mut head: FreeBuf = null_mut();
    for i in (offset..offset + size).rev() {
        let buf_ptr = page.add(i * object_size) as *mut u8;
        (buf_ptr as *mut FreeBuf).write(head);
        head = buf_ptr;
    }

    slab_ptr.write(SlabMeta {
        link: LinkedListLink::new(),
        page_base: page,
        size,
        refcount: 0,
        freelist: UnsafeCell::new(SlabFreelist::Small(head)),
    });
    slab_ptr
}

/// Builds a Large-regime slab: a metadata record from `slab_meta_cache`, and
/// one bufctl per buffer position from `bufctl_cache`, linked in address
/// order and inserted into `hash` as they're created.
pub(crate) unsafe fn init_large<P: PageSupplier>(
    page: *mut u8,
    page_size: usize,
    object_size: usize,
    slab_meta_cache: &mut Cache,
    bufctl_cache: &mut Cache,
    hash: &mut HashIndex,
    supplier: &mut P,
    flags: AllocFlags,
) -> Option<*mut SlabMeta> {
    let raw = cache_alloc_raw(slab_meta_cache, supplier, None, flags);
    if raw.is_null() {
        return None;
    }
    let slab_ptr = raw as *mut SlabMeta;
    let size = page_size / object_size;

    // Unwinds every bufctl linked onto `head` so far (including, if already
    // linked, the one whose hash insert just failed; `HashIndex::remove` is
    // a no-op for a key that was never inserted), frees the slab-metadata
    // record, and signals overall failure.
    unsafe fn unwind<P: PageSupplier>(
        head: *mut Bufctl,
        bufctl_cache: &mut Cache,
        slab_meta_cache: &mut Cache,
        slab_ptr: *mut SlabMeta,
        hash: &mut HashIndex,
        supplier: &mut P,
    ) -> Option<*mut SlabMeta> {
        let mut node = head;
        while !node.is_null() {
            let next = (*node).next;
            hash.remove(supplier, (*node).buf as usize);
            cache_free_raw(bufctl_cache, supplier, None, node as *mut u8);
            node = next;
        }
        cache_free_raw(slab_meta_cache, supplier, None, slab_ptr as *mut u8);
        None
    }

    let mut head: *mut Bufctl = null_mut();
    let mut tail: *mut Bufctl = null_mut();
    for i in 0..size {
        let raw_bufctl = cache_alloc_raw(bufctl_cache, supplier, None, flags);
        if raw_bufctl.is_null() {
            return unwind(head, bufctl_cache, slab_meta_cache, slab_ptr, hash, supplier);
        }
        let bufctl_ptr = raw_bufctl as *mut Bufctl;
        let buf = page.add(i * object_size);
        bufctl_ptr.write(Bufctl {
            next: null_mut(),
            slab: slab_ptr,
            buf,
        });
        if tail.is_null() {
            head = bufctl_ptr;
        } else {
            (*tail).next = bufctl_ptr;
        }
        tail = bufctl_ptr;

        if !hash.insert(supplier, flags, buf as usize, bufctl_ptr) {
            return unwind(head, bufctl_cache, slab_meta_cache, slab_ptr, hash, supplier);
        }
    }

    slab_ptr.write(SlabMeta {
        link: LinkedListLink::new(),
        page_base: page,
        size,
        refcount: 0,
        freelist: UnsafeCell::new(SlabFreelist::Large { head, tail }),
    });
    Some(slab_ptr)
}

/// Reclaims a Small-regime slab: its metadata lived inside the page, so
/// releasing the page is the whole job.
pub(crate) unsafe fn reap_small<P: PageSupplier>(
    slab: *mut SlabMeta,
    supplier: &mut P,
    page_size: usize,
) {
    let page = (*slab).page_base;
    supplier.release_page(page, page_size);
}

/// Reclaims a Large-regime slab: removes every buffer's hash entry and
/// releases its bufctl, releases the slab-metadata record, then releases the
/// page. Only called on slabs with `refcount == 0`, so every bufctl is on
/// the freelist.
pub(crate) unsafe fn reap_large<P: PageSupplier>(
    slab: *mut SlabMeta,
    supplier: &mut P,
    page_size: usize,
    slab_meta_cache: &mut Cache,
    bufctl_cache: &mut Cache,
    hash: &mut HashIndex,
) {
    {
        let freelist = &mut *(*slab).freelist.get();
        if let SlabFreelist::Large { head, .. } = freelist {
            let mut node = *head;
            while !node.is_null() {
                let next = (*node).next;
                hash.remove(supplier, (*node).buf as usize);
                cache_free_raw(bufctl_cache, supplier, None, node as *mut u8);
                node = next;
            }
        }
    }
    let page = (*slab).page_base;
    cache_free_raw(slab_meta_cache, supplier, None, slab as *mut u8);
    supplier.release_page(page, page_size);
}
