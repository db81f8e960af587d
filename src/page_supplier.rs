use crate::AllocFlags;

/// External collaborator that hands out page-aligned, page-sized memory
/// blocks on request and reclaims them on release.
///
/// This is the only way the allocator touches raw memory; every byte of
/// bookkeeping it needs (cache headers, slab metadata, bufctls, hash nodes)
/// is itself carved out of pages obtained through this trait, via the
/// bootstrap internal caches. See [`crate::SlabAllocator`].
pub trait PageSupplier {
    /// Returns a pointer aligned to `page_size`, or null if no page is
    /// available.
    ///
    /// `flags == AllocFlags::Wait` permits (but does not require) blocking
    /// until a page can be produced; `flags == AllocFlags::NoWait` must
    /// return null immediately under pressure rather than block.
    ///
    /// # Safety
    /// The returned pointer, if non-null, must be valid for reads and writes
    /// of `page_size` bytes and aligned to `page_size`.
    unsafe fn acquire_page(&mut self, page_size: usize, flags: AllocFlags) -> *mut u8;

    /// Returns a page previously handed out by `acquire_page` with the same
    /// `page_size`. The allocator never calls this with a pointer it did not
    /// receive from `acquire_page`, and never touches it again afterward.
    ///
    /// # Safety
    /// `page_ptr` must be a pointer previously returned by `acquire_page` on
    /// this supplier with the same `page_size`, and must not have already
    /// been released.
    unsafe fn release_page(&mut self, page_ptr: *mut u8, page_size: usize);
}
