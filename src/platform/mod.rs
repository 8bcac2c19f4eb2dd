//! Platform integration: page size query and virtual-memory primitives

pub mod virtual_memory;

pub use virtual_memory::{AccessFlags, RegionFlags};

use std::sync::LazyLock;

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(query_page_size);

/// Returns the virtual-memory page size of the host, queried once per process
///
/// Buffer sizes handed to the virtual-memory-backed allocators must be at
/// least one page, and `decommit_slack` arguments must be multiples of it.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn query_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name constant has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
        4096
    }

    #[cfg(windows)]
    {
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
        // SAFETY: GetSystemInfo fills the zeroed struct; no preconditions.
        unsafe {
            let mut system_info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut system_info);
            system_info.dwPageSize as usize
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_nonzero_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }
}
