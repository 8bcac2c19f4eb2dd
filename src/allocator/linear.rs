//! Buffer-backed linear (bump) allocator
//!
//! Carves allocations sequentially out of a caller-supplied region. No
//! per-allocation overhead, no freeing, and the buffer contents are never
//! touched by the allocator itself.
//!
//! ## Not thread-safe
//!
//! State lives in `Cell`s; the type is `!Sync` and must be externally
//! synchronized if shared.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use super::traits::{validate_request, Allocator, AllocatorBase, MemoryUsage};
use crate::error::{AllocError, AllocResult};
use crate::size::SizeType;
use crate::utils::{align_up, is_ptr_in_range};

/// Linear allocator over a caller-supplied buffer
///
/// # Memory layout
/// ```text
/// [buffer]----[alloc0]--[alloc1]----[cursor]......[buffer + size]
///              <----- allocated ---->  <--- untouched --->
/// ```
///
/// Alignment padding is charged to the allocation that needed it, so
/// [`allocated_size`](Self::allocated_size) always equals the distance from
/// the buffer base to the cursor.
///
/// The allocator starts uninitialized; a null buffer pointer is the one and
/// only initialization sentinel, so `initialize`/`release` round-trips are
/// cheap and double initialization is detected without extra state.
pub struct LinearAllocator<S: SizeType = usize> {
    base: AllocatorBase,
    /// Null iff uninitialized
    buffer: Cell<*mut u8>,
    buffer_size: Cell<S>,
    allocated_size: Cell<S>,
    /// Offset of the most recent allocation; reset to `buffer_size`, a
    /// sentinel no real allocation can match
    last_allocation_offset: Cell<S>,
}

impl<S: SizeType> LinearAllocator<S> {
    /// Creates an uninitialized allocator
    pub const fn new() -> Self {
        Self {
            base: AllocatorBase::new(Self::reallocate_impl),
            buffer: Cell::new(ptr::null_mut()),
            buffer_size: Cell::new(S::ZERO),
            allocated_size: Cell::new(S::ZERO),
            last_allocation_offset: Cell::new(S::ZERO),
        }
    }

    /// Creates an allocator over `buffer` in one step
    ///
    /// # Safety
    /// Same contract as [`initialize`](Self::initialize).
    pub unsafe fn with_buffer(buffer: *mut u8, buffer_size: usize) -> AllocResult<Self> {
        let allocator = Self::new();
        // SAFETY: forwarded caller contract.
        unsafe { allocator.initialize(buffer, buffer_size)? };
        Ok(allocator)
    }

    /// Adopts `buffer` as the allocation region
    ///
    /// Rejects a null buffer, a zero size, and sizes the size type cannot
    /// represent. The buffer contents are left untouched.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes of `buffer_size` bytes
    /// for as long as this allocator hands out memory from it, and must not
    /// be accessed except through pointers returned by this allocator.
    pub unsafe fn initialize(&self, buffer: *mut u8, buffer_size: usize) -> AllocResult<()> {
        if self.is_initialized() {
            return Err(AllocError::AlreadyInitialized);
        }
        if buffer.is_null() {
            return Err(AllocError::invalid_argument("buffer is null"));
        }
        if buffer_size == 0 {
            return Err(AllocError::invalid_argument("buffer size is zero"));
        }
        if buffer_size > S::MAX_USIZE {
            return Err(AllocError::invalid_argument(
                "buffer size exceeds the allocator's size type range",
            ));
        }

        self.buffer.set(buffer);
        self.buffer_size.set(S::from_usize(buffer_size));
        self.allocated_size.set(S::ZERO);
        self.last_allocation_offset.set(S::from_usize(buffer_size));
        Ok(())
    }

    /// Rewinds the cursor, invalidating every previous allocation
    pub fn reset(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }

        self.allocated_size.set(S::ZERO);
        self.last_allocation_offset.set(self.buffer_size.get());
        Ok(())
    }

    /// Detaches from the buffer, returning to the uninitialized state
    pub fn release(&self) -> AllocResult<()> {
        if !self.is_initialized() {
            return Err(AllocError::Uninitialized);
        }

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
            // Alignment rounding wrapped past the address space
            return Err(AllocError::Overflow);
        }

        let alloc_end = alloc_start.wrapping_add(size);
        if alloc_end <= alloc_start {
            // Requested size wrapped past the address space
            return Err(AllocError::Overflow);
        }

        let alloc_size = alloc_end - head;
        let new_allocated = allocated.to_usize() + alloc_size;
        if new_allocated > self.buffer_size.get().to_usize() {
            return Err(AllocError::out_of_memory(size));
        }

        self.allocated_size.set(S::from_usize(new_allocated));
        self.last_allocation_offset
            .set(S::from_usize(alloc_start - base_addr));

        // SAFETY: alloc_start - base_addr <= buffer_size, so the offset
        // stays inside the buffer the caller handed to initialize.
        let ptr = unsafe { self.buffer.get().add(alloc_start - base_addr) };
        // SAFETY: derived from a non-null buffer by an in-bounds offset.
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
        // to the LinearAllocator<S> that stores it.
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
            // Reallocating the most recent allocation: grow or shrink in
            // place. A shrink makes delta wrap to a huge value and the
            // second wrapping_add brings the total back down; the single
            // bounds check below covers both directions.
            let allocated = this.allocated_size.get();
            let delta = S::from_usize(new_size).wrapping_sub(S::from_usize(old_size));
            let new_allocated = allocated.wrapping_add(delta);

            if new_allocated > this.buffer_size.get() {
                // The buffer cannot grow; in-place failure is final
                return Err(AllocError::out_of_memory(new_size));
            }

            this.allocated_size.set(new_allocated);
            // Same memory, nothing to copy
            // SAFETY: old_ptr equals base + last_allocation_offset, which
            // only ever holds a pointer we handed out.
            return Ok(unsafe { NonNull::new_unchecked(old_ptr) });
        }

        // Arbitrary reallocation: fresh allocation plus copy
        let ptr = this.allocate_impl(new_size, alignment)?;

        let bytes_to_copy = old_size.min(new_size);
        if !old_ptr.is_null() && bytes_to_copy > 0 {
            // SAFETY: caller guarantees old_ptr is valid for old_size reads;
            // the fresh allocation cannot overlap it because the cursor only
            // moves forward.
            unsafe { ptr::copy_nonoverlapping(old_ptr, ptr.as_ptr(), bytes_to_copy) };
        }

        Ok(ptr)
    }
}

impl<S: SizeType> Default for LinearAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the stored function pointer is Self::reallocate_impl, which
// expects Self behind the erased allocator argument.
unsafe impl<S: SizeType> Allocator for LinearAllocator<S> {
    fn allocate(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        self.allocate_impl(size, alignment)
    }

    fn is_owner_of(&self, ptr: *const u8) -> bool {
        if !self.is_initialized() {
            return false;
        }

        // Deliberately bounded by the high-water mark, not the buffer size:
        // a pointer into the untouched tail is not an allocation.
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

impl<S: SizeType> MemoryUsage for LinearAllocator<S> {
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
