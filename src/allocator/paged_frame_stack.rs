//! Virtual-memory-backed stack-frame allocator
//!
//! Same frame discipline as [`FrameStackAllocator`](super::FrameStackAllocator),
//! but over one contiguous reserved range instead of a segment list: pages
//! are committed on demand as the cursor advances, popping a frame rewinds
//! the cursor and keeps the committed pages warm for the next frame, and
//! [`decommit_slack`](PagedFrameStackAllocator::decommit_slack) hands the
//! cold tail back to the operating system explicitly.
//!
//! Not thread-safe; state lives in `Cell`s.

use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};

use super::frame::FrameGuard;
use super::frame_stack::segment::FrameDescriptor;
use super::traits::{validate_request, Allocator, AllocatorBase, MemoryUsage};
use crate::error::{AllocError, AllocResult};
use crate::platform::page_size;
use crate::platform::virtual_memory::{self as vmem, AccessFlags, RegionFlags};
use crate::size::SizeType;
use crate::utils::{align_up, allocate_from_buffer, can_satisfy_allocation, is_aligned, is_ptr_in_range};

/// Stack-frame allocator over a single reserved range
///
/// `allocated_size <= committed_size <= buffer_size`, with `committed_size`
/// a multiple of the page size.
pub struct PagedFrameStackAllocator<S: SizeType = usize> {
    base: AllocatorBase,
    /// Base of the reservation; null iff uninitialized
    buffer: Cell<*mut u8>,
    live_frame: Cell<*mut FrameDescriptor>,
    buffer_size: Cell<S>,
    allocated_size: Cell<S>,
    committed_size: Cell<S>,
    /// Offset of the most recent allocation from the reservation base
    last_allocation_offset: Cell<S>,
}

impl<S: SizeType> PagedFrameStackAllocator<S> {
    /// Creates an uninitialized allocator
    pub const fn new() -> Self {
        Self {
            base: AllocatorBase::new(Self::reallocate_impl),
            buffer: Cell::new(ptr::null_mut()),
            live_frame: Cell::new(ptr::null_mut()),
            buffer_size: Cell::new(S::ZERO),
            allocated_size: Cell::new(S::ZERO),
            committed_size: Cell::new(S::ZERO),
            last_allocation_offset: Cell::new(S::ZERO),
        }
    }

    /// Reserves `buffer_size` bytes and returns the allocator in one step
    pub fn with_capacity(buffer_size: usize) -> AllocResult<Self> {
        let allocator = Self::new();
        allocator.initialize(buffer_size)?;
        Ok(allocator)
    }

    /// Reserves the address range; no pages are committed yet
    ///
    /// `buffer_size` must be at least one page, a multiple of the page
    /// size, and representable in the size type.
    pub fn initialize(&self, buffer_size: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::AlreadyInitialized);
        }
        if buffer_size < page_size() {
            return Err(AllocError::invalid_argument(
                "buffer size is below one page",
            ));
        }
        if !is_aligned(buffer_size, page_size()) {
            return Err(AllocError::invalid_argument(
                "buffer size is not page-aligned",
            ));
        }
        if buffer_size > S::MAX_USIZE {
            return Err(AllocError::invalid_argument(
                "buffer size exceeds the allocator's size type range",
            ));
        }

        let Some(buffer) = vmem::reserve(
            buffer_size,
            AccessFlags::READ_WRITE,
            RegionFlags::PRIVATE_ANONYMOUS,
        ) else {
            return Err(AllocError::out_of_memory(buffer_size));
        };

        #[cfg(feature = "logging")]
        tracing::debug!(buffer_size, "reserved stack-frame allocator range");

        self.buffer.set(buffer.as_ptr());
        self.live_frame.set(ptr::null_mut());
        self.buffer_size.set(S::from_usize(buffer_size));
        self.allocated_size.set(S::ZERO);
        self.committed_size.set(S::ZERO);
        self.last_allocation_offset.set(S::from_usize(buffer_size));
        Ok(())
    }

    /// Releases the reservation; commit state is irrelevant
    ///
    /// Refuses while a frame is live, leaking instead of corrupting.
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        if self.has_live_frame() {
            return Err(AllocError::LiveFrames);
        }

        // SAFETY: buffer is the live reservation base.
        let buffer = unsafe { NonNull::new_unchecked(self.buffer.get()) };
        if !vmem::release(buffer, self.buffer_size.get().to_usize()) {
            return Err(AllocError::SystemFailure {
                operation: "release",
            });
        }

        #[cfg(feature = "logging")]
        tracing::debug!("released stack-frame allocator range");

        self.buffer.set(ptr::null_mut());
        self.live_frame.set(ptr::null_mut());
        self.buffer_size.set(S::ZERO);
        self.allocated_size.set(S::ZERO);
        self.committed_size.set(S::ZERO);
        self.last_allocation_offset.set(S::ZERO);
        Ok(())
    }

    /// Decommits committed-but-unallocated pages beyond `min_slack`
    ///
    /// `min_slack` must be page-aligned. Whole pages are returned from the
    /// committed tail until at most `min_slack` (rounded up to the page
    /// boundary above the cursor) of slack remains; keeping some slack
    /// committed spares the next frame a commit round-trip.
    pub fn decommit_slack(&self, min_slack: usize) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        if !is_aligned(min_slack, page_size()) {
            return Err(AllocError::invalid_argument(
                "minimum slack is not page-aligned",
            ));
        }
        if min_slack > S::MAX_USIZE {
            return Err(AllocError::invalid_argument(
                "minimum slack exceeds the allocator's size type range",
            ));
        }

        let committed = self.committed_size.get().to_usize();
        let allocated = self.allocated_size.get().to_usize();
        let slack = committed - allocated;

        // Round the decommit down to whole pages
        let decommit_size = slack.saturating_sub(min_slack) & !(page_size() - 1);

        if slack > min_slack && decommit_size != 0 {
            let new_committed = committed - decommit_size;
            // SAFETY: new_committed <= committed <= buffer_size, so the
            // offset stays inside the reservation; both are page-aligned.
            let tail = unsafe { NonNull::new_unchecked(self.buffer.get().add(new_committed)) };

            if !vmem::decommit(tail, decommit_size) {
                return Err(AllocError::SystemFailure {
                    operation: "decommit",
                });
            }

            self.committed_size.set(S::from_usize(new_committed));
        }

        Ok(())
    }

    /// True once `initialize` has succeeded
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.buffer.get().is_null()
    }

    /// True while at least one frame is pushed and not yet popped
    #[inline]
    pub fn has_live_frame(&self) -> bool {
        !self.live_frame.get().is_null()
    }

    /// Bytes consumed so far, alignment padding included
    #[inline]
    pub fn allocated_size(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        self.allocated_size.get().to_usize()
    }

    /// Bytes of the reservation currently backed by committed pages
    #[inline]
    pub fn committed_size(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        self.committed_size.get().to_usize()
    }

    /// Bytes a pushed frame consumes out of the buffer
    #[inline]
    pub fn frame_overhead(&self) -> usize {
        mem::size_of::<FrameDescriptor>()
    }

    /// Opens a new frame; allocations made until the matching pop are
    /// released together
    pub fn push_frame(&self) -> AllocResult<FrameGuard<'_>> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }

        let ptr = self.allocate_impl(
            mem::size_of::<FrameDescriptor>(),
            mem::align_of::<FrameDescriptor>(),
        )?;

        let frame = ptr.as_ptr().cast::<FrameDescriptor>();
        // SAFETY: freshly allocated, aligned for FrameDescriptor, and the
        // covering pages are committed.
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
    pub fn pop_frame(&self, frame: &mut FrameGuard<'_>) -> bool {
        frame.pop()
    }

    /// Grows the committed prefix to cover `new_allocated` bytes
    fn ensure_committed(&self, new_allocated: usize, requested: usize) -> AllocResult<()> {
        let committed = self.committed_size.get().to_usize();
        if new_allocated <= committed {
            return Ok(());
        }

        // SAFETY: committed <= buffer_size keeps the offset inside the
        // reservation.
        let commit_ptr = unsafe { NonNull::new_unchecked(self.buffer.get().add(committed)) };
        let commit_size = align_up(new_allocated - committed, page_size());

        if !vmem::commit(
            commit_ptr,
            commit_size,
            AccessFlags::READ_WRITE,
            RegionFlags::PRIVATE_ANONYMOUS,
        ) {
            return Err(AllocError::out_of_memory(requested));
        }

        self.committed_size
            .set(S::from_usize(committed + commit_size));
        Ok(())
    }

    fn allocate_impl(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        let buffer = self.buffer.get();

        if !can_satisfy_allocation(
            buffer as usize,
            self.buffer_size.get(),
            self.allocated_size.get(),
            size,
            alignment,
        ) {
            // Exhausted reservation or wrapped arithmetic
            return Err(AllocError::out_of_memory(size));
        }

        let mut allocated = self.allocated_size.get();
        let mut last_offset = self.last_allocation_offset.get();

        // SAFETY: buffer is the live, non-null reservation base.
        let base = unsafe { NonNull::new_unchecked(buffer) };
        let ptr = allocate_from_buffer(
            base,
            self.buffer_size.get(),
            &mut allocated,
            size,
            alignment,
            &mut last_offset,
        );

        // Commit before publishing so a refusal leaves state untouched
        self.ensure_committed(allocated.to_usize(), size)?;

        self.allocated_size.set(allocated);
        self.last_allocation_offset.set(last_offset);
        Ok(ptr)
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

        // Rewind the cursor to the frame descriptor; committed pages are
        // retained for the next frame
        let allocated = frame as usize - this.buffer.get() as usize;
        this.allocated_size.set(S::from_usize(allocated));

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
        // to the PagedFrameStackAllocator<S> that stores it.
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

        let base_addr = this.buffer.get() as usize;
        let last_allocation = base_addr + this.last_allocation_offset.get().to_usize();

        if last_allocation == old_ptr as usize {
            // In-place resize of the most recent allocation; the shrink
            // case relies on size-type wraparound, see the size module.
            let allocated = this.allocated_size.get();
            let delta = S::from_usize(new_size).wrapping_sub(S::from_usize(old_size));
            let new_allocated = allocated.wrapping_add(delta);

            if new_allocated > this.buffer_size.get() {
                // The reservation cannot grow; in-place failure is final
                return Err(AllocError::out_of_memory(new_size));
            }

            this.ensure_committed(new_allocated.to_usize(), new_size)?;
            this.allocated_size.set(new_allocated);

            // SAFETY: old_ptr matches an allocation we handed out.
            return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
        }

        let ptr = this.allocate_impl(new_size, alignment)?;

        let bytes_to_copy = old_size.min(new_size);
        if !old_ptr.is_null() && bytes_to_copy > 0 {
            // SAFETY: caller guarantees old_ptr is valid for old_size
            // reads; the fresh allocation is past the cursor, no overlap.
            unsafe { ptr::copy_nonoverlapping(old_ptr, ptr.as_ptr(), bytes_to_copy) };
        }

        Ok(ptr)
    }
}

impl<S: SizeType> Default for PagedFrameStackAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SizeType> Drop for PagedFrameStackAllocator<S> {
    fn drop(&mut self) {
        if self.is_initialized() {
            // A leaked FrameGuard can leave a live frame behind; release
            // then refuses and the reservation leaks with it.
            let _ = self.release();
        }
    }
}

// SAFETY: the stored function pointer is Self::reallocate_impl, which
// expects Self behind the erased allocator argument.
unsafe impl<S: SizeType> Allocator for PagedFrameStackAllocator<S> {
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

        is_ptr_in_range(
            ptr,
            self.buffer.get() as usize,
            self.allocated_size.get().to_usize(),
        )
    }

    fn allocator_base(&self) -> &AllocatorBase {
        &self.base
    }
}

impl<S: SizeType> MemoryUsage for PagedFrameStackAllocator<S> {
    fn used_memory(&self) -> usize {
        self.allocated_size()
    }

    fn available_memory(&self) -> Option<usize> {
        if !self.is_initialized() {
            return Some(0);
        }
        Some(self.buffer_size.get().to_usize() - self.allocated_size.get().to_usize())
    }
}
