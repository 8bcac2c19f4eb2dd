//! The allocator contract shared by every allocator in this crate
//!
//! # Reallocate dispatch
//!
//! `reallocate` is the one operation that every caller hits on its hot path,
//! so it is not dispatched through the trait's vtable. Each allocator embeds
//! an [`AllocatorBase`] holding a function pointer to its monomorphized
//! reallocate implementation; the provided [`Allocator::reallocate`] loads
//! that pointer and calls straight through it with a type-erased pointer to
//! the whole allocator. On a concrete allocator type the call inlines down
//! to one indirect call with no vtable load.
//!
//! The `Allocator` trait is `unsafe` to implement because the stored
//! function pointer must expect the implementing type behind its erased
//! allocator argument; a mismatch is type confusion.

use core::ptr::NonNull;

use crate::error::{AllocError, AllocResult};
use crate::size::SizeType;
use crate::utils::is_power_of_two;

/// Validation shared by every allocate/reallocate entry point
///
/// Rejects zero sizes, non-power-of-two alignments, and sizes the
/// allocator's size type cannot represent.
#[inline]
pub(crate) fn validate_request<S: SizeType>(size: usize, alignment: usize) -> AllocResult<()> {
    if size == 0 {
        return Err(AllocError::invalid_argument("allocation size is zero"));
    }
    if !is_power_of_two(alignment) {
        return Err(AllocError::invalid_argument(
            "alignment is not a power of two",
        ));
    }
    if size > S::MAX_USIZE {
        return Err(AllocError::invalid_argument(
            "size exceeds the allocator's size type range",
        ));
    }
    Ok(())
}

/// Signature of a reallocate implementation
///
/// `allocator` is a type-erased pointer to the allocator that stored this
/// function. `old_ptr` may be null, in which case the call degenerates to a
/// fresh allocation.
pub type ReallocateFn = unsafe fn(
    allocator: NonNull<()>,
    old_ptr: *mut u8,
    old_size: usize,
    new_size: usize,
    alignment: usize,
) -> AllocResult<NonNull<u8>>;

/// Per-instance dispatch state embedded in every allocator
///
/// Holds the function pointer through which [`Allocator::reallocate`] is
/// routed.
pub struct AllocatorBase {
    reallocate_fn: ReallocateFn,
}

impl AllocatorBase {
    pub(crate) const fn new(reallocate_fn: ReallocateFn) -> Self {
        Self { reallocate_fn }
    }

    #[inline(always)]
    pub(crate) fn reallocate_fn(&self) -> ReallocateFn {
        self.reallocate_fn
    }
}

/// Strategy for obtaining aligned memory
///
/// All allocators in this family hand out aligned, uninitialized memory and
/// do not support freeing individual allocations: `deallocate` is a
/// documented no-op, and memory is reclaimed wholesale by `reset`, frame
/// pops, or `release` on the concrete types.
///
/// # Safety
///
/// The function pointer stored in the [`AllocatorBase`] returned by
/// [`allocator_base`] must expect `Self` behind the erased allocator
/// argument of its [`ReallocateFn`] signature.
///
/// [`allocator_base`]: Allocator::allocator_base
pub unsafe trait Allocator {
    /// Allocates `size` bytes aligned to `alignment`
    ///
    /// `size` must be non-zero and `alignment` a power of two; violations
    /// are reported as [`InvalidArgument`](crate::AllocError::InvalidArgument).
    /// The returned memory is uninitialized.
    fn allocate(&self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>>;

    /// Releases a single allocation: a no-op for this allocator family
    ///
    /// Present for contract completeness; memory is reclaimed in bulk.
    ///
    /// # Safety
    /// `ptr` must have been returned by this allocator with the given size.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }

    /// True iff `ptr` lies in a currently-allocated range of this allocator
    ///
    /// Pointers past the allocator's high-water mark answer false, even when
    /// they fall inside the configured buffer.
    fn is_owner_of(&self, ptr: *const u8) -> bool;

    /// The embedded dispatch state; see the trait-level safety contract
    fn allocator_base(&self) -> &AllocatorBase;

    /// Resizes `old_ptr` to at least `new_size` bytes
    ///
    /// If `old_ptr` is the most recent allocation, grows or shrinks it in
    /// place where the backing memory allows; otherwise allocates fresh
    /// memory and copies `min(old_size, new_size)` bytes. A null `old_ptr`
    /// degenerates to a fresh allocation with no copy.
    ///
    /// # Safety
    /// `old_ptr` must be null or a pointer previously returned by this
    /// allocator, valid for reads of `old_size` bytes.
    #[inline]
    unsafe fn reallocate(
        &self,
        old_ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        alignment: usize,
    ) -> AllocResult<NonNull<u8>>
    where
        Self: Sized,
    {
        let reallocate_fn = self.allocator_base().reallocate_fn();
        // SAFETY: the trait contract guarantees the stored function pointer
        // expects Self behind the erased pointer; the caller's pointer
        // contract is forwarded.
        unsafe {
            reallocate_fn(
                NonNull::from(self).cast::<()>(),
                old_ptr,
                old_size,
                new_size,
                alignment,
            )
        }
    }
}

/// Memory usage reporting
pub trait MemoryUsage {
    /// Bytes currently allocated
    fn used_memory(&self) -> usize;

    /// Bytes still available, or `None` if the allocator grows on demand
    fn available_memory(&self) -> Option<usize>;

    /// Total capacity, or `None` if unbounded
    fn total_memory(&self) -> Option<usize> {
        self.available_memory()
            .map(|available| self.used_memory() + available)
    }
}
