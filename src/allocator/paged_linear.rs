//! Virtual-memory-backed linear allocator
//!
//! Same bump semantics as [`LinearAllocator`](super::LinearAllocator), but
//! the region is a virtual-memory reservation made at initialization and
//! backing pages are committed on demand as the cursor advances. Reset
//! decommits all slack; release returns the whole reservation in one call.
//!
//! Not thread-safe; state lives in `Cell`s.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use super::traits::{validate_request, Allocator, AllocatorBase, MemoryUsage};
use crate::error::{AllocError, AllocResult};
use crate::platform::virtual_memory::{self as vmem, AccessFlags, RegionFlags};
use crate::platform::page_size;
use crate::size::SizeType;
use crate::utils::{align_up, is_aligned, is_ptr_in_range};

/// Linear allocator over a reserved range with on-demand page commit
///
/// Committed memory always covers the allocated prefix:
/// `allocated_size <= committed_size <= buffer_size`, with
/// `committed_size` a multiple of the page size.
pub struct PagedLinearAllocator<S: SizeType = usize> {
    base: AllocatorBase,
    /// Base of the reservation; null iff uninitialized
    buffer: Cell<*mut u8>,
    buffer_size: Cell<S>,
    allocated_size: Cell<S>,
    /// Offset of the most recent allocation; reset to `buffer_size`, a
    /// sentinel no real allocation can match
    last_allocation_offset: Cell<S>,
    committed_size: Cell<S>,
}

impl<S: SizeType> PagedLinearAllocator<S> {
    /// Creates an uninitialized allocator
    pub const fn new() -> Self {
        Self {
            base: AllocatorBase::new(Self::reallocate_impl),
            buffer: Cell::new(ptr::null_mut()),
            buffer_size: Cell::new(S::ZERO),
            allocated_size: Cell::new(S::ZERO),
            last_allocation_offset: Cell::new(S::ZERO),
            committed_size: Cell::new(S::ZERO),
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
        tracing::debug!(buffer_size, "reserved linear allocator range");

        self.buffer.set(buffer.as_ptr());
        self.buffer_size.set(S::from_usize(buffer_size));
        self.allocated_size.set(S::ZERO);
        self.last_allocation_offset.set(S::from_usize(buffer_size));
        self.committed_size.set(S::ZERO);
        Ok(())
    }

    /// Rewinds the cursor and decommits everything that was committed
    ///
    /// Policy: reset keeps no slack. The reservation itself survives, so
    /// the next allocation starts committing from the base again.
    pub fn reset(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }

        let committed = self.committed_size.get().to_usize();
        if committed != 0 {
            // SAFETY: buffer is the live reservation base.
            let buffer = unsafe { NonNull::new_unchecked(self.buffer.get()) };
            if !vmem::decommit(buffer, committed) {
                return Err(AllocError::SystemFailure {
                    operation: "decommit",
                });
            }
        }

        self.allocated_size.set(S::ZERO);
        self.last_allocation_offset.set(self.buffer_size.get());
        self.committed_size.set(S::ZERO);
        Ok(())
    }

    /// Releases the reservation; commit state is irrelevant
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }

        // SAFETY: buffer is the live reservation base.
        let buffer = unsafe { NonNull::new_unchecked(self.buffer.get()) };
        if !vmem::release(buffer, self.buffer_size.get().to_usize()) {
            return Err(AllocError::SystemFailure {
                operation: "release",
            });
        }

        #[cfg(feature = "logging")]
        tracing::debug!("released linear allocator range");

        self.buffer.set(ptr::null_mut());
        Ok(())
    }

    /// True once `initialize` has succeeded
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.buffer.get().is_null()
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

    /// Grows the committed prefix to cover `new_allocated` bytes
    ///
    /// Commits in page-aligned strides from the current committed end. A
    /// refusal from the operating system surfaces as out-of-memory and
    /// leaves all state unchanged.
    fn ensure_committed(&self, new_allocated: usize, requested: usize) -> AllocResult<()> {
        let committed = self.committed_size.get().to_usize();
        if new_allocated <= committed {
            return Ok(());
        }

        // SAFETY: committed <= buffer_size, so the offset stays inside the
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
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }
        validate_request::<S>(size, alignment)?;

        let base_addr = self.buffer.get() as usize;
        let allocated = self.allocated_size.get();
        let head = base_addr + allocated.to_usize();

        let alloc_start = align_up(head, alignment);
        if alloc_start < head {
            return Err(AllocError::Overflow);
        }

        let alloc_end = alloc_start.wrapping_add(size);
        if alloc_end <= alloc_start {
            return Err(AllocError::Overflow);
        }

        let alloc_size = alloc_end - head;
        let new_allocated = allocated.to_usize() + alloc_size;
        if new_allocated > self.buffer_size.get().to_usize() {
            return Err(AllocError::out_of_memory(size));
        }

        // Commit before publishing any state so a refusal leaves the
        // allocator exactly as it was.
        self.ensure_committed(new_allocated, size)?;

        self.allocated_size.set(S::from_usize(new_allocated));
        self.last_allocation_offset
            .set(S::from_usize(alloc_start - base_addr));

        // SAFETY: offset is within the reservation and the prefix covering
        // it was just committed.
        let ptr = unsafe { self.buffer.get().add(alloc_start - base_addr) };
        // SAFETY: derived from a non-null reservation base.
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn reallocate_impl(
        allocator: NonNull<()>,
        old_ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>> {
        // SAFETY: the Allocator contract hands this function only pointers
        // to the PagedLinearAllocator<S> that stores it.
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

            // SAFETY: old_ptr equals base + last_allocation_offset, which
            // only ever holds a pointer we handed out.
            return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
        }

        let ptr = this.allocate_impl(new_size, alignment)?;

        let bytes_to_copy = old_size.min(new_size);
        if !old_ptr.is_null() && bytes_to_copy > 0 {
            // SAFETY: caller guarantees old_ptr is valid for old_size reads;
            // the fresh allocation is past the cursor, so no overlap.
            unsafe { ptr::copy_nonoverlapping(old_ptr, ptr.as_ptr(), bytes_to_copy) };
        }

        Ok(ptr)
    }
}

impl<S: SizeType> Default for PagedLinearAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SizeType> Drop for PagedLinearAllocator<S> {
    fn drop(&mut self) {
        if self.is_initialized() {
            let _ = self.release();
        }
    }
}

// SAFETY: the stored function pointer is Self::reallocate_impl, which
// expects Self behind the erased allocator argument.
unsafe impl<S: SizeType> Allocator for PagedLinearAllocator<S> {
    fn allocate(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
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

impl<S: SizeType> MemoryUsage for PagedLinearAllocator<S> {
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
