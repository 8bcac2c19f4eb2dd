//! Virtual-memory primitives: reserve, commit, decommit, release
//!
//! Thin, allocation-free wrappers over `mmap`/`mprotect`/`madvise` on unix
//! and `VirtualAlloc`/`VirtualFree` on windows. Reserving obtains an address
//! range without backing store; committing attaches backing store to a
//! page-aligned slice of a reservation; decommitting returns the backing
//! store while keeping the reservation; releasing destroys the reservation.
//!
//! Unix has no native reserve/commit split, so reservation is emulated:
//! with the `vmem-protect` feature (default) reserved pages are mapped
//! `PROT_NONE` and `commit` flips the protection to the requested access,
//! which makes touching uncommitted or decommitted memory fault instead of
//! silently paging. With the feature disabled, reserve maps with the full
//! requested access and `commit` is a successful no-op; `decommit` still
//! advises the kernel that the range is disposable.
//!
//! All functions report failure as `None`/`false`; errno is not surfaced.

use core::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// CPU access rights for a mapped range
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Readable
        const READ = 0b001;
        /// Writable
        const WRITE = 0b010;
        /// Executable
        const EXEC = 0b100;
    }
}

bitflags! {
    /// Sharing and backing semantics of a mapped range
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Modifications stay private to this process
        const PRIVATE = 0b001;
        /// Modifications are visible to other mappings
        const SHARED = 0b010;
        /// Not backed by a file
        const ANONYMOUS = 0b100;
    }
}

impl AccessFlags {
    /// The common read-write access of heap-like regions
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

impl RegionFlags {
    /// The common private anonymous region of allocator backing memory
    pub const PRIVATE_ANONYMOUS: Self = Self::PRIVATE.union(Self::ANONYMOUS);
}

// ============================================================================
// Unix
// ============================================================================

#[cfg(unix)]
mod sys {
    use super::{AccessFlags, RegionFlags};
    use core::ptr::{self, NonNull};

    fn to_prot(access: AccessFlags) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if access.contains(AccessFlags::READ) {
            prot |= libc::PROT_READ;
        }
        if access.contains(AccessFlags::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if access.contains(AccessFlags::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    fn to_map_flags(region: RegionFlags) -> libc::c_int {
        let mut flags = 0;
        if region.contains(RegionFlags::PRIVATE) {
            flags |= libc::MAP_PRIVATE;
        }
        if region.contains(RegionFlags::SHARED) {
            flags |= libc::MAP_SHARED;
        }
        if region.contains(RegionFlags::ANONYMOUS) {
            flags |= libc::MAP_ANONYMOUS;
        }
        flags
    }

    fn map(size: usize, prot: libc::c_int, region: RegionFlags) -> Option<NonNull<u8>> {
        // SAFETY: mmap with a null hint and ANONYMOUS flags has no memory
        // preconditions; failure is reported as MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                to_map_flags(region),
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(ptr.cast::<u8>())
        }
    }

    pub fn reserve(size: usize, access: AccessFlags, region: RegionFlags) -> Option<NonNull<u8>> {
        #[cfg(feature = "vmem-protect")]
        let prot = {
            let _ = access;
            libc::PROT_NONE
        };
        #[cfg(not(feature = "vmem-protect"))]
        let prot = to_prot(access);

        map(size, prot, region)
    }

    pub fn commit(
        ptr: NonNull<u8>,
        size: usize,
        access: AccessFlags,
        _region: RegionFlags,
    ) -> bool {
        #[cfg(feature = "vmem-protect")]
        {
            // SAFETY: caller passes a page-aligned slice of a live mapping.
            let result =
                unsafe { libc::mprotect(ptr.as_ptr().cast(), size, to_prot(access)) };
            result == 0
        }

        #[cfg(not(feature = "vmem-protect"))]
        {
            // Reservation already carries the requested access; on-demand
            // paging commits for us.
            let _ = (ptr, size, access);
            true
        }
    }

    pub fn decommit(ptr: NonNull<u8>, size: usize) -> bool {
        #[cfg(target_os = "macos")]
        const ADVICE: libc::c_int = libc::MADV_FREE;
        #[cfg(not(target_os = "macos"))]
        const ADVICE: libc::c_int = libc::MADV_DONTNEED;

        // SAFETY: caller passes a page-aligned slice of a live mapping.
        let result = unsafe { libc::madvise(ptr.as_ptr().cast(), size, ADVICE) };
        if result != 0 {
            return false;
        }

        #[cfg(feature = "vmem-protect")]
        {
            // SAFETY: same mapping as above; PROT_NONE makes stray access
            // to decommitted pages fault.
            let result = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE) };
            result == 0
        }

        #[cfg(not(feature = "vmem-protect"))]
        {
            true
        }
    }

    pub fn release(ptr: NonNull<u8>, size: usize) -> bool {
        // SAFETY: caller passes the exact range returned by reserve/alloc.
        let result = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
        result == 0
    }

    pub fn alloc(size: usize, access: AccessFlags, region: RegionFlags) -> Option<NonNull<u8>> {
        map(size, to_prot(access), region)
    }

    pub fn free(ptr: NonNull<u8>, size: usize) -> bool {
        release(ptr, size)
    }
}

// ============================================================================
// Windows
// ============================================================================

#[cfg(windows)]
mod sys {
    use super::{AccessFlags, RegionFlags};
    use core::ptr::{self, NonNull};

    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    fn to_protect(access: AccessFlags) -> u32 {
        let read = access.contains(AccessFlags::READ);
        let write = access.contains(AccessFlags::WRITE);
        let exec = access.contains(AccessFlags::EXEC);
        match (read, write, exec) {
            (_, true, true) => PAGE_EXECUTE_READWRITE,
            (true, false, true) => PAGE_EXECUTE_READ,
            (false, false, true) => PAGE_EXECUTE,
            // Windows has no write-only protection
            (_, true, false) => PAGE_READWRITE,
            (true, false, false) => PAGE_READONLY,
            (false, false, false) => PAGE_NOACCESS,
        }
    }

    pub fn reserve(size: usize, _access: AccessFlags, _region: RegionFlags) -> Option<NonNull<u8>> {
        // Reserved pages are inaccessible until committed; access flags
        // apply at commit time.
        // SAFETY: reserving with a null base has no preconditions.
        let ptr =
            unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
        NonNull::new(ptr.cast::<u8>())
    }

    pub fn commit(
        ptr: NonNull<u8>,
        size: usize,
        access: AccessFlags,
        _region: RegionFlags,
    ) -> bool {
        // SAFETY: caller passes a page-aligned slice of a live reservation.
        let result = unsafe {
            VirtualAlloc(ptr.as_ptr().cast(), size, MEM_COMMIT, to_protect(access))
        };
        !result.is_null()
    }

    pub fn decommit(ptr: NonNull<u8>, size: usize) -> bool {
        // SAFETY: caller passes a page-aligned slice of a live reservation.
        let result = unsafe { VirtualFree(ptr.as_ptr().cast(), size, MEM_DECOMMIT) };
        result != 0
    }

    pub fn release(ptr: NonNull<u8>, _size: usize) -> bool {
        // MEM_RELEASE requires a zero size and the original base address.
        // SAFETY: caller passes the base returned by reserve/alloc.
        let result = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
        result != 0
    }

    pub fn alloc(size: usize, access: AccessFlags, _region: RegionFlags) -> Option<NonNull<u8>> {
        // SAFETY: one-shot reserve+commit with a null base.
        let ptr = unsafe {
            VirtualAlloc(
                ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                to_protect(access),
            )
        };
        NonNull::new(ptr.cast::<u8>())
    }

    pub fn free(ptr: NonNull<u8>, size: usize) -> bool {
        release(ptr, size)
    }
}

// ============================================================================
// Public surface
// ============================================================================

/// Reserves `size` bytes of address space without committing backing store
///
/// Returns the base of the reservation, or `None` if the operating system
/// refused. The range must eventually be passed to [`release`].
#[inline]
pub fn reserve(size: usize, access: AccessFlags, region: RegionFlags) -> Option<NonNull<u8>> {
    sys::reserve(size, access, region)
}

/// Commits backing store for a page-aligned slice of a reservation
#[inline]
pub fn commit(ptr: NonNull<u8>, size: usize, access: AccessFlags, region: RegionFlags) -> bool {
    sys::commit(ptr, size, access, region)
}

/// Returns backing store for a page-aligned range, keeping the reservation
#[inline]
pub fn decommit(ptr: NonNull<u8>, size: usize) -> bool {
    sys::decommit(ptr, size)
}

/// Destroys a reservation entirely; commit state is irrelevant
#[inline]
pub fn release(ptr: NonNull<u8>, size: usize) -> bool {
    sys::release(ptr, size)
}

/// One-shot reserve-and-commit of `size` bytes
#[inline]
pub fn alloc(size: usize, access: AccessFlags, region: RegionFlags) -> Option<NonNull<u8>> {
    sys::alloc(size, access, region)
}

/// Releases a range obtained from [`alloc`]
#[inline]
pub fn free(ptr: NonNull<u8>, size: usize) -> bool {
    sys::free(ptr, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::page_size;

    #[test]
    fn reserve_commit_write_release() {
        let size = page_size() * 4;
        let ptr = reserve(size, AccessFlags::READ_WRITE, RegionFlags::PRIVATE_ANONYMOUS)
            .expect("reserve failed");

        assert!(commit(
            ptr,
            page_size(),
            AccessFlags::READ_WRITE,
            RegionFlags::PRIVATE_ANONYMOUS
        ));

        // SAFETY: the first page is committed read-write.
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, page_size());
            assert_eq!(*ptr.as_ptr().add(page_size() - 1), 0xAB);
        }

        assert!(decommit(ptr, page_size()));
        assert!(release(ptr, size));
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let size = page_size();
        let ptr = alloc(size, AccessFlags::READ_WRITE, RegionFlags::PRIVATE_ANONYMOUS)
            .expect("alloc failed");

        // SAFETY: the whole range is committed read-write.
        unsafe {
            ptr.as_ptr().write_bytes(0xCD, size);
        }

        assert!(free(ptr, size));
    }
}
