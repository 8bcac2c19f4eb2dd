//! Integration tests for the virtual-memory-backed linear allocator

use frame_alloc::allocator::{Allocator, MemoryUsage, PagedLinearAllocator};
use frame_alloc::platform::page_size;
use frame_alloc::AllocError;

fn buffer_size() -> usize {
    page_size() * 16
}

#[test]
fn reserve_commits_nothing_up_front() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).expect("reserve failed");

    assert!(alloc.is_initialized());
    assert_eq!(alloc.allocated_size(), 0);
    assert_eq!(alloc.committed_size(), 0);
}

#[test]
fn commit_grows_in_page_strides() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };
    assert_eq!(alloc.allocated_size(), 2);
    assert_eq!(alloc.committed_size(), page_size());

    // Crossing the first page boundary commits the next stride
    let p1 = alloc.allocate(page_size(), 1).unwrap();
    unsafe { p1.as_ptr().write_bytes(0xcd, page_size()) };
    assert_eq!(alloc.allocated_size(), page_size() + 2);
    assert_eq!(alloc.committed_size(), page_size() * 2);
}

#[test]
fn bump_and_exhaust_the_reservation() {
    let size = buffer_size();
    let alloc: PagedLinearAllocator = PagedLinearAllocator::with_capacity(size).unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };
    assert_eq!(alloc.committed_size(), page_size());

    let p1 = alloc.allocate(size - 2, 1).unwrap();
    unsafe { p1.as_ptr().write_bytes(0xcd, size - 2) };
    assert_eq!(alloc.allocated_size(), size);
    assert_eq!(alloc.committed_size(), size);
    assert_ne!(p0, p1);

    let err = alloc.allocate(1, 1).unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(alloc.allocated_size(), size);
    assert_eq!(alloc.committed_size(), size);
}

#[test]
fn ownership_probes() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    assert!(!alloc.is_owner_of(core::ptr::null()));

    let p0 = alloc.allocate(2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };

    assert!(alloc.is_owner_of(p0.as_ptr()));
    assert!(alloc.is_owner_of(unsafe { p0.as_ptr().add(1) }));
    assert!(!alloc.is_owner_of(unsafe { p0.as_ptr().add(2) }));
}

#[test]
fn aligned_allocations() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p0 = alloc.allocate(2, 8).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };
    assert_eq!(p0.as_ptr() as usize % 8, 0);

    let p1 = alloc.allocate(2, 16).unwrap();
    unsafe { p1.as_ptr().write_bytes(0xcd, 2) };
    assert_eq!(p1.as_ptr() as usize % 16, 0);
    assert_ne!(p0, p1);
}

#[test]
fn realloc_in_place_copy_and_shrink() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, 2) };

    let p1 = unsafe { alloc.reallocate(p0.as_ptr(), 2, 8, 1) }.unwrap();
    assert_eq!(p0, p1);
    assert_eq!(alloc.allocated_size(), 8);

    let p2 = unsafe { alloc.reallocate(core::ptr::null_mut(), 0, 4, 1) }.unwrap();
    assert_ne!(p2, p0);
    assert_eq!(alloc.allocated_size(), 12);

    let p3 = unsafe { alloc.reallocate(p0.as_ptr(), 8, 12, 1) }.unwrap();
    assert_ne!(p3, p0);
    assert_ne!(p3, p2);
    assert_eq!(alloc.allocated_size(), 24);
    assert_eq!(unsafe { *p3.as_ptr() }, 0xcd);

    // Shrinking the most recent allocation rewinds in place
    let p4 = unsafe { alloc.reallocate(p3.as_ptr(), 12, 4, 1) }.unwrap();
    assert_eq!(p3, p4);
    assert_eq!(alloc.allocated_size(), 16);

    // Growing past the whole reservation fails in place, state unchanged
    let err =
        unsafe { alloc.reallocate(p4.as_ptr(), 4, buffer_size() * 2, 1) }.unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(alloc.allocated_size(), 16);
}

#[test]
fn realloc_growth_commits_pages() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p0 = alloc.allocate(16, 1).unwrap();
    assert_eq!(alloc.committed_size(), page_size());

    let p1 =
        unsafe { alloc.reallocate(p0.as_ptr(), 16, page_size() * 3, 1) }.unwrap();
    assert_eq!(p0, p1);
    unsafe { p1.as_ptr().write_bytes(0xcd, page_size() * 3) };
    assert_eq!(alloc.committed_size(), page_size() * 3);
}

#[test]
fn deallocate_is_a_nop() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p0 = alloc.allocate(2, 1).unwrap();
    assert_eq!(alloc.allocated_size(), 2);
    assert_eq!(alloc.committed_size(), page_size());

    unsafe { alloc.deallocate(p0, 2) };
    assert_eq!(alloc.allocated_size(), 2);
    assert_eq!(alloc.committed_size(), page_size());

    let p1 = alloc.allocate(2, 1).unwrap();
    assert_ne!(p0, p1);
    assert_eq!(alloc.allocated_size(), 4);
}

#[test]
fn reset_decommits_everything() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p0 = alloc.allocate(page_size() * 2, 1).unwrap();
    unsafe { p0.as_ptr().write_bytes(0xcd, page_size() * 2) };
    assert_eq!(alloc.committed_size(), page_size() * 2);

    alloc.reset().unwrap();
    assert_eq!(alloc.allocated_size(), 0);
    assert_eq!(alloc.committed_size(), 0);

    // The reservation survives: allocation restarts from the base
    let p1 = alloc.allocate(16, 1).unwrap();
    unsafe { p1.as_ptr().write_bytes(0xcd, 16) };
    assert_eq!(p1, p0);
    assert_eq!(alloc.committed_size(), page_size());
}

#[test]
fn invalid_initialization_is_rejected() {
    let alloc = PagedLinearAllocator::<usize>::new();

    let err = alloc.initialize(page_size() - 1).unwrap_err();
    assert!(matches!(err, AllocError::InvalidArgument { .. }));

    let err = alloc.initialize(page_size() + 1).unwrap_err();
    assert!(matches!(err, AllocError::InvalidArgument { .. }));
    assert!(!alloc.is_initialized());

    alloc.initialize(buffer_size()).unwrap();
    assert_eq!(
        alloc.initialize(buffer_size()).unwrap_err(),
        AllocError::AlreadyInitialized
    );
}

#[test]
fn uninitialized_operations_are_rejected() {
    let alloc = PagedLinearAllocator::<usize>::new();

    assert_eq!(alloc.allocate(16, 8).unwrap_err(), AllocError::Uninitialized);
    assert_eq!(alloc.reset().unwrap_err(), AllocError::Uninitialized);
    assert_eq!(alloc.release().unwrap_err(), AllocError::Uninitialized);
    assert!(!alloc.is_owner_of(0x1000 as *const u8));
    assert_eq!(alloc.allocated_size(), 0);
    assert_eq!(alloc.committed_size(), 0);
}

#[test]
fn release_then_reinitialize_restores_a_usable_state() {
    let alloc: PagedLinearAllocator =
        PagedLinearAllocator::with_capacity(buffer_size()).unwrap();

    let p = alloc.allocate(64, 8).unwrap();
    unsafe { p.as_ptr().write_bytes(0xcd, 64) };

    alloc.release().unwrap();
    assert!(!alloc.is_initialized());

    alloc.initialize(buffer_size()).unwrap();
    assert!(alloc.is_initialized());
    assert_eq!(alloc.allocated_size(), 0);
    assert_eq!(alloc.committed_size(), 0);

    let p = alloc.allocate(64, 8).unwrap();
    unsafe { p.as_ptr().write_bytes(0xcd, 64) };
}

#[test]
fn memory_usage_tracks_the_cursor() {
    let size = buffer_size();
    let alloc: PagedLinearAllocator = PagedLinearAllocator::with_capacity(size).unwrap();

    assert_eq!(alloc.used_memory(), 0);
    assert_eq!(alloc.available_memory(), Some(size));

    let _ = alloc.allocate(100, 1).unwrap();
    assert_eq!(alloc.used_memory(), 100);
    assert_eq!(alloc.available_memory(), Some(size - 100));
    assert_eq!(alloc.total_memory(), Some(size));
}
