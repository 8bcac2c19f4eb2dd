//! Integration tests for the buffer-backed linear allocator

use frame_alloc::allocator::{Allocator, LinearAllocator, MemoryUsage};
use frame_alloc::AllocError;

const BUFFER_SIZE: usize = 1024;

// u64 storage keeps the buffer base 8-aligned, making padding math exact
fn backing() -> Box<[u64]> {
    vec![0u64; BUFFER_SIZE / 8].into_boxed_slice()
}

#[test]
fn initialized_allocator_starts_empty() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }
            .expect("initialization failed");

    assert!(alloc.is_initialized());
    assert_eq!(alloc.allocated_size(), 0);
}

#[test]
fn bump_and_exhaust() {
    let mut buffer = backing();
    let base = buffer.as_mut_ptr().cast::<u8>();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(base, BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(2, 1).expect("allocation failed");
    assert_eq!(p0.as_ptr(), base);
    assert_eq!(alloc.allocated_size(), 2);
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };

    let p1 = alloc.allocate(1022, 1).expect("allocation failed");
    assert_eq!(p1.as_ptr() as usize, base as usize + 2);
    assert_eq!(alloc.allocated_size(), 1024);
    unsafe { p1.as_ptr().write_bytes(0xcd, 1022) };

    // Exact fit reached; one more byte is refused and state is unchanged
    let err = alloc.allocate(1, 1).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(alloc.allocated_size(), 1024);
}

#[test]
fn ownership_probes() {
    let mut buffer = backing();
    let base = buffer.as_mut_ptr().cast::<u8>();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(base, BUFFER_SIZE) }.unwrap();

    // Nothing allocated yet: even the buffer base is not owned
    assert!(!alloc.is_owner_of(core::ptr::null()));
    assert!(!alloc.is_owner_of(base));
    assert!(!alloc.is_owner_of(base.wrapping_add(32768)));

    let p0 = alloc.allocate(2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };

    assert!(alloc.is_owner_of(p0.as_ptr()));
    assert!(alloc.is_owner_of(unsafe { p0.as_ptr().add(1) }));
    assert!(!alloc.is_owner_of(unsafe { p0.as_ptr().add(2) }));
}

#[test]
fn alignment_padding_is_charged_to_the_allocation() {
    let mut buffer = backing();
    let base = buffer.as_mut_ptr().cast::<u8>();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(base, BUFFER_SIZE) }.unwrap();

    let head = base as usize;
    let p0 = alloc.allocate(2, 8).unwrap();
    assert_eq!(p0.as_ptr() as usize % 8, 0);
    let p0_size = (p0.as_ptr() as usize - head) + 2;
    assert_eq!(alloc.allocated_size(), p0_size);

    let head = head + p0_size;
    let p1 = alloc.allocate(2, 16).unwrap();
    assert_eq!(p1.as_ptr() as usize % 16, 0);
    let p1_size = (p1.as_ptr() as usize - head) + 2;
    assert_eq!(alloc.allocated_size(), p0_size + p1_size);
    assert_ne!(p0, p1);
}

#[test]
fn realloc_grows_in_place_then_copies() {
    let mut buffer = backing();
    let base = buffer.as_mut_ptr().cast::<u8>();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(base, BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };

    // Growing the most recent allocation stays in place
    let p1 = unsafe { alloc.reallocate(p0.as_ptr(), 2, 8, 1) }.unwrap();
    assert_eq!(p0, p1);
    assert_eq!(alloc.allocated_size(), 8);

    // A null old pointer degenerates to a fresh allocation
    let p2 = unsafe { alloc.reallocate(core::ptr::null_mut(), 0, 4, 1) }.unwrap();
    assert_eq!(p2.as_ptr() as usize, p0.as_ptr() as usize + 8);
    assert_eq!(alloc.allocated_size(), 12);

    // p0 is no longer the most recent allocation: fresh allocation + copy
    let p3 = unsafe { alloc.reallocate(p0.as_ptr(), 8, 12, 1) }.unwrap();
    assert_ne!(p3, p0);
    assert_ne!(p3, p2);
    assert_eq!(p3.as_ptr() as usize, p2.as_ptr() as usize + 4);
    assert_eq!(alloc.allocated_size(), 24);
    // The old contents came along
    assert_eq!(unsafe { *p3.as_ptr() }, 0xcd);
}

#[test]
fn realloc_shrinks_in_place() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(12, 1).unwrap();
    assert_eq!(alloc.allocated_size(), 12);

    let p1 = unsafe { alloc.reallocate(p0.as_ptr(), 12, 4, 1) }.unwrap();
    assert_eq!(p0, p1);
    assert_eq!(alloc.allocated_size(), 4);
}

#[test]
fn realloc_of_last_allocation_fails_when_buffer_cannot_grow() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(16, 1).unwrap();
    let err = unsafe { alloc.reallocate(p0.as_ptr(), 16, BUFFER_SIZE + 1, 1) }.unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(alloc.allocated_size(), 16);
}

#[test]
fn deallocate_is_a_nop() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    assert_eq!(alloc.allocated_size(), 2);

    unsafe { alloc.deallocate(p0, 2) };
    assert_eq!(alloc.allocated_size(), 2);

    let p1 = alloc.allocate(2, 1).unwrap();
    assert_ne!(p0, p1);
    assert_eq!(alloc.allocated_size(), 4);
}

#[test]
fn reset_rewinds_to_the_buffer_base() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    assert_eq!(alloc.allocated_size(), 2);

    alloc.reset().unwrap();
    assert_eq!(alloc.allocated_size(), 0);

    let p1 = alloc.allocate(2, 1).unwrap();
    assert_eq!(p0, p1);
    assert_eq!(alloc.allocated_size(), 2);
}

#[test]
fn reset_clears_the_realloc_fast_path() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let _ = alloc.allocate(8, 1).unwrap();
    let stale = alloc.allocate(8, 1).unwrap();
    alloc.reset().unwrap();

    // The reset sentinel can never match a pointer, so a stale pointer
    // takes the allocate-and-copy path instead of resizing in place.
    let _ = alloc.allocate(64, 1).unwrap();
    let moved = unsafe { alloc.reallocate(stale.as_ptr(), 8, 8, 1) }.unwrap();
    assert_ne!(moved, stale);
    assert_eq!(alloc.allocated_size(), 72);
}

#[test]
fn invalid_initialization_is_rejected() {
    let alloc = LinearAllocator::<usize>::new();
    assert!(!alloc.is_initialized());

    let err = unsafe { alloc.initialize(core::ptr::null_mut(), 1024) }.unwrap_err();
    assert!(matches!(err, AllocError::InvalidArgument { .. }));
    assert!(!alloc.is_initialized());

    let mut byte = [0u8; 1];
    let err = unsafe { alloc.initialize(byte.as_mut_ptr(), 0) }.unwrap_err();
    assert!(matches!(err, AllocError::InvalidArgument { .. }));
    assert!(!alloc.is_initialized());

    let mut buffer = backing();
    unsafe { alloc.initialize(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();
    let err = unsafe { alloc.initialize(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap_err();
    assert_eq!(err, AllocError::AlreadyInitialized);
}

#[test]
fn uninitialized_operations_are_rejected() {
    let alloc = LinearAllocator::<usize>::new();

    assert_eq!(alloc.allocate(16, 8).unwrap_err(), AllocError::Uninitialized);
    assert_eq!(alloc.reset().unwrap_err(), AllocError::Uninitialized);
    assert_eq!(alloc.release().unwrap_err(), AllocError::Uninitialized);
    assert!(!alloc.is_owner_of(0x1000 as *const u8));
    assert_eq!(alloc.allocated_size(), 0);
}

#[test]
fn invalid_allocation_arguments_are_rejected() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    assert!(matches!(
        alloc.allocate(0, 1).unwrap_err(),
        AllocError::InvalidArgument { .. }
    ));
    assert!(matches!(
        alloc.allocate(16, 3).unwrap_err(),
        AllocError::InvalidArgument { .. }
    ));
    assert_eq!(alloc.allocated_size(), 0);
}

#[test]
fn oversized_allocation_is_out_of_memory() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let err = alloc.allocate(BUFFER_SIZE + 1, 1).unwrap_err();
    assert!(err.is_out_of_memory());
}

#[test]
fn arithmetic_overflow_near_the_address_space_top() {
    // A fabricated buffer flush against the top of the address space; the
    // allocator only does arithmetic on it and fails before any access.
    let fake_buffer = (usize::MAX - 7) as *mut u8;
    let alloc = LinearAllocator::<usize>::new();
    unsafe { alloc.initialize(fake_buffer, 8) }.unwrap();

    // Alignment rounding wraps
    assert_eq!(alloc.allocate(1, 16).unwrap_err(), AllocError::Overflow);
    // Size addition wraps
    assert_eq!(alloc.allocate(32, 1).unwrap_err(), AllocError::Overflow);
    assert_eq!(alloc.allocated_size(), 0);
}

#[test]
fn release_then_reinitialize_restores_a_usable_state() {
    let mut first = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(first.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let _ = alloc.allocate(64, 8).unwrap();
    alloc.release().unwrap();
    assert!(!alloc.is_initialized());

    let mut second = backing();
    unsafe { alloc.initialize(second.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();
    assert!(alloc.is_initialized());
    assert_eq!(alloc.allocated_size(), 0);

    let p = alloc.allocate(64, 8).unwrap();
    assert_eq!(p.as_ptr(), second.as_mut_ptr().cast::<u8>());
}

#[test]
fn memory_usage_tracks_the_cursor() {
    let mut buffer = backing();
    let alloc: LinearAllocator =
        unsafe { LinearAllocator::with_buffer(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    assert_eq!(alloc.used_memory(), 0);
    assert_eq!(alloc.available_memory(), Some(BUFFER_SIZE));
    assert_eq!(alloc.total_memory(), Some(BUFFER_SIZE));

    let _ = alloc.allocate(100, 1).unwrap();
    assert_eq!(alloc.used_memory(), 100);
    assert_eq!(alloc.available_memory(), Some(BUFFER_SIZE - 100));
}

#[test]
fn narrow_size_type_works_end_to_end() {
    let mut buffer = backing();
    let alloc = LinearAllocator::<u32>::new();
    unsafe { alloc.initialize(buffer.as_mut_ptr().cast::<u8>(), BUFFER_SIZE) }.unwrap();

    let p0 = alloc.allocate(8, 8).unwrap();
    let p1 = unsafe { alloc.reallocate(p0.as_ptr(), 8, 16, 8) }.unwrap();
    assert_eq!(p0, p1);

    let p2 = unsafe { alloc.reallocate(p1.as_ptr(), 16, 4, 8) }.unwrap();
    assert_eq!(p1, p2);
    assert_eq!(alloc.allocated_size(), 4);
}
