use core::mem::{align_of, size_of};

/// A view into a contiguous block of memory, usually an mmap'd segment.
///
/// `Region` is `Copy` and carries no ownership: whoever created the mapping
/// must keep it alive for as long as any view derived from it is in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a raw base pointer and length.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// the region (or anything derived from it) is used.
    #[inline]
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to `offset` bytes past the base.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: offset is within the region (or one past its end).
        unsafe { self.base.add(offset) }
    }

    /// Typed pointer at `offset`, checked for bounds and alignment.
    #[inline]
    pub fn ptr<T>(&self, offset: usize) -> *mut T {
        assert!(
            offset
                .checked_add(size_of::<T>())
                .is_some_and(|end| end <= self.len),
            "typed access out of bounds"
        );
        let ptr = self.offset(offset);
        assert!(
            (ptr as usize).is_multiple_of(align_of::<T>()),
            "typed access misaligned"
        );
        ptr as *mut T
    }

    /// Borrow a `T` living at `offset`.
    ///
    /// # Safety
    ///
    /// A valid, initialized `T` must live at `offset`. Shared state inside it
    /// must only be mutated through atomics.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        unsafe { &*self.ptr::<T>(offset) }
    }

    /// A sub-view of `len` bytes starting at `offset`.
    pub fn sub_region(&self, offset: usize, len: usize) -> Region {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "sub-region out of bounds"
        );
        Region {
            base: self.offset(offset),
            len,
        }
    }
}

/// Something that owns a mapping and can hand out [`Region`] views of it.
///
/// Views that outlive the call site hold an `Arc<dyn MappedRegion>` so the
/// mapping stays alive for as long as they do.
pub trait MappedRegion: Send + Sync {
    fn region(&self) -> Region;
}

/// A heap allocation usable as a region (tests, in-process rings).
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: core::ptr::NonNull<u8>,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate `len` zeroed bytes aligned to a cache line.
    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region length must be > 0");
        let Ok(layout) = alloc::alloc::Layout::from_size_align(len, 64) else {
            panic!("region length {len} overflows a layout");
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(ptr) = core::ptr::NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as `self`.
        unsafe { Region::from_raw(self.ptr.as_ptr(), self.layout.size()) }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl MappedRegion for HeapRegion {
    fn region(&self) -> Region {
        HeapRegion::region(self)
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new_zeroed` with the same layout.
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
