//! Segmented stack-frame allocator
//!
//! Allocations are grouped into nestable frames; popping a frame releases
//! everything allocated after the matching push. Storage is a linked list
//! of variably-sized segments: the live stack carries the segments frames
//! are currently carved from, the free list keeps emptied segments for
//! reuse. Allocation is greedy — the first segment that fits wins, and when
//! none fits a fresh one is mapped from the operating system.
//!
//! Not thread-safe; state lives in `Cell`s.

use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};

use super::segment::{FrameDescriptor, SegmentDescriptor, MIN_SEGMENT_ALIGNMENT};
use crate::allocator::frame::FrameGuard;
use crate::allocator::traits::{validate_request, Allocator, AllocatorBase, MemoryUsage};
use crate::error::{AllocError, AllocResult};
use crate::platform::virtual_memory::{self as vmem, AccessFlags, RegionFlags};
use crate::size::SizeType;
use crate::utils::{align_up, allocate_from_buffer, can_satisfy_allocation, is_aligned_ptr, is_ptr_in_range};

/// Greedy multi-segment stack-frame allocator
///
/// Every allocation requires a live frame. The frame descriptor itself is
/// the first allocation of its frame, so a frame that opens a fresh segment
/// sits exactly at the segment's buffer base — the pop walk relies on that
/// to tell "this segment empties completely" apart from "this segment
/// rewinds to the frame".
///
/// `default_segment_size` doubles as the initialization sentinel: zero iff
/// uninitialized.
pub struct FrameStackAllocator<S: SizeType = usize> {
    base: AllocatorBase,
    live_segment: Cell<*mut SegmentDescriptor<S>>,
    live_frame: Cell<*mut FrameDescriptor>,
    free_segments: Cell<*mut SegmentDescriptor<S>>,
    default_segment_size: Cell<S>,
    /// Offset of the most recent allocation within the live segment's
    /// buffer. Only meaningful while the live segment is unchanged; see
    /// [`Allocator::reallocate`] notes on the type.
    last_allocation_offset: Cell<S>,
}

impl<S: SizeType> FrameStackAllocator<S> {
    /// Creates an uninitialized allocator
    pub const fn new() -> Self {
        Self {
            base: AllocatorBase::new(Self::reallocate_impl),
            live_segment: Cell::new(ptr::null_mut()),
            live_frame: Cell::new(ptr::null_mut()),
            free_segments: Cell::new(ptr::null_mut()),
            default_segment_size: Cell::new(S::ZERO),
            last_allocation_offset: Cell::new(S::ZERO),
        }
    }

    /// Creates and initializes an allocator in one step
    pub fn with_segment_size(segment_size: usize) -> AllocResult<Self> {
        let allocator = Self::new();
        allocator.initialize(segment_size)?;
        Ok(allocator)
    }

    /// Sets the capacity of freshly-mapped segments
    ///
    /// No memory is mapped yet; the first allocation under the first frame
    /// brings in the first segment.
    pub fn initialize(&self, segment_size: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::AlreadyInitialized);
        }
        if segment_size == 0 {
            return Err(AllocError::invalid_argument("segment size is zero"));
        }
        if segment_size > S::MAX_USIZE {
            return Err(AllocError::invalid_argument(
                "segment size exceeds the allocator's size type range",
            ));
        }

        self.live_segment.set(ptr::null_mut());
        self.live_frame.set(ptr::null_mut());
        self.free_segments.set(ptr::null_mut());
        self.default_segment_size.set(S::from_usize(segment_size));
        self.last_allocation_offset.set(S::from_usize(segment_size));
        Ok(())
    }

    /// Frees every owned segment and returns to the uninitialized state
    ///
    /// Refuses while a frame is live: the memory is leaked rather than
    /// pulled out from under live allocations. Externally-registered
    /// segments are unlinked but never freed.
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        if self.has_live_frame() {
            return Err(AllocError::LiveFrames);
        }

        // With no live frame every segment has drained to the free list
        debug_assert!(self.live_segment.get().is_null());

        let mut segment = self.free_segments.get();
        while !segment.is_null() {
            // SAFETY: free-list segments are live descriptors we or the
            // caller placed; the link is read before the memory goes away.
            let (next, externally_managed) = unsafe {
                ((*segment).link(), (*segment).is_externally_managed())
            };

            if !externally_managed {
                Self::release_segment(segment);
            }

            segment = next;
        }

        self.free_segments.set(ptr::null_mut());
        self.default_segment_size.set(S::ZERO);
        Ok(())
    }

    /// True once `initialize` has succeeded
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.default_segment_size.get() != S::ZERO
    }

    /// True while at least one frame is pushed and not yet popped
    #[inline]
    pub fn has_live_frame(&self) -> bool {
        !self.live_frame.get().is_null()
    }

    /// Bytes consumed across all live segments, padding included
    ///
    /// Walks the live stack; not constant-time.
    pub fn allocated_size(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }

        let mut total = 0;
        let mut segment = self.live_segment.get();
        while !segment.is_null() {
            // SAFETY: live-stack segments are live descriptors.
            let seg = unsafe { &*segment };
            total += seg.allocated_size.to_usize();
            segment = seg.link();
        }
        total
    }

    /// Bytes a pushed frame consumes out of its segment
    #[inline]
    pub fn frame_overhead(&self) -> usize {
        mem::size_of::<FrameDescriptor>()
    }

    /// Bytes of each segment consumed by its own descriptor
    #[inline]
    pub fn segment_overhead(&self) -> usize {
        mem::size_of::<SegmentDescriptor<S>>()
    }

    /// Hands a caller-owned buffer to the allocator as a reusable segment
    ///
    /// The buffer joins the free list marked externally managed, so
    /// `release` unlinks it without freeing. It must be at least
    /// 8-byte aligned and large enough to hold a segment descriptor plus
    /// usable space.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `buffer_size` bytes
    /// until the allocator is released, and must not be accessed except
    /// through pointers returned by this allocator.
    pub unsafe fn register_segment(&self, buffer: *mut u8, buffer_size: usize) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        if buffer.is_null() {
            return Err(AllocError::invalid_argument("buffer is null"));
        }
        if buffer_size <= mem::size_of::<SegmentDescriptor<S>>() {
            return Err(AllocError::invalid_argument(
                "buffer cannot hold a segment descriptor",
            ));
        }
        if !is_aligned_ptr(buffer, MIN_SEGMENT_ALIGNMENT) {
            return Err(AllocError::invalid_argument(
                "buffer is not aligned to the minimum segment alignment",
            ));
        }
        if buffer_size > S::MAX_USIZE {
            return Err(AllocError::invalid_argument(
                "buffer size exceeds the allocator's size type range",
            ));
        }

        let segment = buffer.cast::<SegmentDescriptor<S>>();
        // SAFETY: buffer is valid, aligned, and big enough per the checks
        // above; ownership of the bytes passes to the descriptor.
        unsafe {
            ptr::write(segment, SegmentDescriptor::new(S::from_usize(buffer_size)));
            (*segment).set_link(self.free_segments.get());
            (*segment).set_externally_managed(true);
        }
        self.free_segments.set(segment);
        Ok(())
    }

    /// Opens a new frame; allocations made until the matching pop are
    /// released together
    ///
    /// The frame descriptor is allocated through the normal allocation
    /// path, so pushing the very first frame may map the first segment.
    pub fn push_frame(&self) -> AllocResult<FrameGuard<'_>> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }

        let ptr = self.allocate_impl(
            mem::size_of::<FrameDescriptor>(),
            mem::align_of::<FrameDescriptor>(),
        )?;

        let frame = ptr.as_ptr().cast::<FrameDescriptor>();
        // SAFETY: freshly allocated, aligned for FrameDescriptor.
        unsafe {
            ptr::write(
                frame,
                FrameDescriptor {
                    prev_frame: self.live_frame.get(),
                },
            );
        }
        self.live_frame.set(frame);

        // SAFETY: frame came from a successful allocation.
        let data = unsafe { NonNull::new_unchecked(frame.cast::<()>()) };
        Ok(FrameGuard::new(self, Self::pop_frame_impl, data))
    }

    /// Pops `frame` if it is the topmost live frame
    ///
    /// Equivalent to [`FrameGuard::pop`]; returns false and leaves the
    /// allocator untouched when the frame is stale or out of order.
    pub fn pop_frame(&self, frame: &mut FrameGuard<'_>) -> bool {
        frame.pop()
    }

    fn allocate_impl(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        let segment = self.find_free_segment(size, alignment)?;

        // SAFETY: find_free_segment returned a live segment that satisfies
        // the request.
        unsafe {
            let seg = &mut *segment;
            let buffer = NonNull::new_unchecked(seg.buffer_base() as *mut u8);

            let mut allocated = seg.allocated_size;
            let mut last_offset = self.last_allocation_offset.get();
            let ptr = allocate_from_buffer(
                buffer,
                seg.buffer_size(),
                &mut allocated,
                size,
                alignment,
                &mut last_offset,
            );

            seg.allocated_size = allocated;
            self.last_allocation_offset.set(last_offset);
            Ok(ptr)
        }
    }

    /// Picks the segment the next allocation is carved from
    ///
    /// Search order: the current live segment, then the free list (first
    /// fit, spliced onto the live stack), then a fresh mapping.
    fn find_free_segment(
        &self,
        size: usize,
        alignment: usize,
    ) -> AllocResult<*mut SegmentDescriptor<S>> {
        let live = self.live_segment.get();
        // SAFETY: live-stack segments are live descriptors.
        if !live.is_null() && unsafe { Self::segment_can_satisfy(&*live, size, alignment) } {
            return Ok(live);
        }

        let mut prev: *mut SegmentDescriptor<S> = ptr::null_mut();
        let mut segment = self.free_segments.get();
        while !segment.is_null() {
            // SAFETY: free-list segments are live descriptors.
            let next = unsafe { (*segment).link() };

            // SAFETY: same as above.
            if unsafe { Self::segment_can_satisfy(&*segment, size, alignment) } {
                // Splice out of the free list, push onto the live stack
                if prev.is_null() {
                    self.free_segments.set(next);
                } else {
                    // SAFETY: prev is the previously visited live descriptor.
                    unsafe { (*prev).set_link(next) };
                }
                // SAFETY: segment is live; relinking preserves its flags.
                unsafe { (*segment).set_link(self.live_segment.get()) };
                self.live_segment.set(segment);
                return Ok(segment);
            }

            prev = segment;
            segment = next;
        }

        let segment = self.allocate_segment(size, alignment)?;
        // SAFETY: freshly written descriptor.
        unsafe { (*segment).set_link(self.live_segment.get()) };
        self.live_segment.set(segment);
        Ok(segment)
    }

    fn segment_can_satisfy(
        segment: &SegmentDescriptor<S>,
        size: usize,
        alignment: usize,
    ) -> bool {
        can_satisfy_allocation(
            segment.buffer_base(),
            segment.buffer_size(),
            segment.allocated_size,
            size,
            alignment,
        )
    }

    /// Maps a fresh segment big enough for the request
    ///
    /// Sized `max(default_segment_size, align_up(size + alignment +
    /// descriptor, alignment))` — the `+ alignment` is one byte more than
    /// the worst-case padding strictly needs, kept for its simplicity.
    fn allocate_segment(
        &self,
        size: usize,
        alignment: usize,
    ) -> AllocResult<*mut SegmentDescriptor<S>> {
        let overhead = mem::size_of::<SegmentDescriptor<S>>();
        let desired = size
            .checked_add(alignment)
            .and_then(|v| v.checked_add(overhead))
            .ok_or(AllocError::Overflow)?;
        let desired_aligned = align_up(desired, alignment);
        if desired_aligned < desired {
            return Err(AllocError::Overflow);
        }

        let segment_size = desired_aligned.max(self.default_segment_size.get().to_usize());
        if segment_size > S::MAX_USIZE {
            return Err(AllocError::Overflow);
        }

        let Some(ptr) = vmem::alloc(
            segment_size,
            AccessFlags::READ_WRITE,
            RegionFlags::PRIVATE_ANONYMOUS,
        ) else {
            return Err(AllocError::out_of_memory(size));
        };

        debug_assert!(is_aligned_ptr(ptr.as_ptr(), MIN_SEGMENT_ALIGNMENT));
        debug_assert_eq!(
            mem::align_of::<FrameDescriptor>(),
            mem::align_of::<SegmentDescriptor<S>>()
        );

        #[cfg(feature = "logging")]
        tracing::trace!(segment_size, "mapped fresh segment");

        let segment = ptr.as_ptr().cast::<SegmentDescriptor<S>>();
        // SAFETY: the mapping is committed read-write and big enough.
        unsafe {
            ptr::write(segment, SegmentDescriptor::new(S::from_usize(segment_size)));
        }
        Ok(segment)
    }

    fn release_segment(segment: *mut SegmentDescriptor<S>) {
        // SAFETY: the segment is an owned mapping created by
        // allocate_segment; its recorded size is the mapped size.
        unsafe {
            let size = (*segment).segment_size.to_usize();
            let ptr = NonNull::new_unchecked(segment.cast::<u8>());
            vmem::free(ptr, size);
        }
    }

    unsafe fn pop_frame_impl(allocator: NonNull<()>, data: NonNull<()>) -> bool {
        // SAFETY: the FrameGuard was built by push_frame on this allocator.
        let this = unsafe { allocator.cast::<Self>().as_ref() };

        if !this.is_initialized() {
            return false;
        }

        let frame = data.cast::<FrameDescriptor>().as_ptr();
        if frame != this.live_frame.get() {
            // Only the topmost frame may be popped
            return false;
        }

        // SAFETY: frame is the live frame descriptor we wrote at push time.
        this.live_frame.set(unsafe { (*frame).prev_frame });

        // Walk the live stack from the top. Segments above the frame's
        // segment drain completely; the frame's own segment either rewinds
        // to the frame or, when the frame was its first allocation, drains
        // too. Zero-padding of the frame descriptor in a fresh segment is
        // what makes the `offset == 0` test exact.
        let frame_addr = frame as usize;
        let mut live = this.live_segment.get();
        let mut free = this.free_segments.get();

        while !live.is_null() {
            // SAFETY: live-stack segments are live descriptors.
            let seg = unsafe { &mut *live };
            let next = seg.link();
            let buffer = seg.buffer_base();

            if is_ptr_in_range(frame as *const u8, buffer, seg.allocated_size.to_usize()) {
                let new_allocated = frame_addr - buffer;
                if new_allocated == 0 {
                    seg.set_link(free);
                    seg.allocated_size = S::ZERO;
                    free = live;
                    live = next;
                } else {
                    seg.allocated_size = S::from_usize(new_allocated);
                }
                break;
            }

            // The frame lies further down; this whole segment empties
            seg.set_link(free);
            seg.allocated_size = S::ZERO;
            free = live;
            live = next;
        }

        this.live_segment.set(live);
        this.free_segments.set(free);

        debug_assert!(this.live_frame.get().is_null() == this.live_segment.get().is_null());

        true
    }

    unsafe fn reallocate_impl(
        allocator: NonNull<()>,
        old_ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        // SAFETY: the Allocator contract hands this function only pointers
        // to the FrameStackAllocator<S> that stores it.
        let this = unsafe { allocator.cast::<Self>().as_ref() };

        if !this.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        validate_request::<S>(new_size, alignment)?;
        if old_size > S::MAX_USIZE {
            return Err(AllocError::invalid_argument(
                "old size exceeds the allocator's size type range",
            ));
        }
        if !this.has_live_frame() {
            return Err(AllocError::NoLiveFrame);
        }

        // The fast path only recognizes the last allocation while the live
        // segment is unchanged; after a segment switch the comparison
        // simply misses and the call falls through to allocate-and-copy.
        let live_segment = this.live_segment.get();
        if !live_segment.is_null() {
            // SAFETY: the live segment is a live descriptor.
            let seg = unsafe { &mut *live_segment };
            let last_allocation =
                seg.buffer_base() + this.last_allocation_offset.get().to_usize();

            if last_allocation == old_ptr as usize {
                let allocated = seg.allocated_size;
                let delta = S::from_usize(new_size).wrapping_sub(S::from_usize(old_size));
                let new_allocated = allocated.wrapping_add(delta);

                if new_allocated <= seg.buffer_size() {
                    seg.allocated_size = new_allocated;
                    // Same memory, nothing to copy
                    // SAFETY: old_ptr matches an allocation we handed out.
                    return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
                }
                // The live segment lacks room; fall through to a fresh
                // allocation, possibly in another segment
            }
        }

        let ptr = this.allocate_impl(new_size, alignment)?;

        let bytes_to_copy = old_size.min(new_size);
        if !old_ptr.is_null() && bytes_to_copy > 0 {
            // SAFETY: caller guarantees old_ptr is valid for old_size
            // reads; a fresh allocation never overlaps an existing one.
            unsafe { ptr::copy_nonoverlapping(old_ptr, ptr.as_ptr(), bytes_to_copy) };
        }

        Ok(ptr)
    }
}

impl<S: SizeType> Default for FrameStackAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SizeType> Drop for FrameStackAllocator<S> {
    fn drop(&mut self) {
        if self.is_initialized() {
            // A leaked FrameGuard can leave a live frame behind; release
            // then refuses and the segments leak with it.
            let _ = self.release();
        }
    }
}

// SAFETY: the stored function pointer is Self::reallocate_impl, which
// expects Self behind the erased allocator argument.
unsafe impl<S: SizeType> Allocator for FrameStackAllocator<S> {
    fn allocate(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        validate_request::<S>(size, alignment)?;
        if !self.has_live_frame() {
            return Err(AllocError::NoLiveFrame);
        }

        self.allocate_impl(size, alignment)
    }

    fn is_owner_of(&self, ptr: *const u8) -> bool {
        if !self.is_initialized() {
            return false;
        }

        // Walks the live stack; not constant-time
        let mut segment = self.live_segment.get();
        while !segment.is_null() {
            // SAFETY: live-stack segments are live descriptors.
            let seg = unsafe { &*segment };
            if is_ptr_in_range(ptr, seg.buffer_base(), seg.allocated_size.to_usize()) {
                return true;
            }
            segment = seg.link();
        }
        false
    }

    fn allocator_base(&self) -> &AllocatorBase {
        &self.base
    }
}

impl<S: SizeType> MemoryUsage for FrameStackAllocator<S> {
    fn used_memory(&self) -> usize {
        self.allocated_size()
    }

    fn available_memory(&self) -> Option<usize> {
        // Grows by mapping fresh segments on demand
        None
    }
}
