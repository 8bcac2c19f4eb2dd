//! # frame-alloc
//!
//! Predictable, low-overhead allocators for workloads that allocate a lot
//! and free all at once: linear (bump) allocators over caller buffers or
//! on-demand committed virtual memory, and stack-frame allocators whose
//! nestable frames release everything allocated after the matching push.
//!
//! ## Quick start
//!
//! ```
//! use frame_alloc::prelude::*;
//!
//! # fn main() -> AllocResult<()> {
//! // Bump allocations out of a stack buffer
//! let mut storage = [0u8; 256];
//! let linear: LinearAllocator =
//!     unsafe { LinearAllocator::with_buffer(storage.as_mut_ptr(), storage.len())? };
//! let ptr = linear.allocate(64, 8)?;
//! assert!(linear.is_owner_of(ptr.as_ptr()));
//!
//! // Frames release everything allocated after the push
//! let frames: FrameStackAllocator = FrameStackAllocator::with_segment_size(64 * 1024)?;
//! {
//!     let _frame = frames.push_frame()?;
//!     let _scratch = frames.allocate(1024, 16)?;
//! }
//! assert_eq!(frames.allocated_size(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - No per-allocation metadata: an allocation is a cursor bump, and
//!   `deallocate` is a documented no-op across the family.
//! - Reallocating the *most recent* allocation grows or shrinks in place;
//!   the check is a single pointer comparison dispatched through a stored
//!   function pointer rather than a vtable.
//! - The virtual-memory-backed variants reserve their whole range up front
//!   and commit pages only as the cursor reaches them.
//! - Allocators are single-threaded by design: state lives in `Cell`s, the
//!   types are not `Sync`, and no locks are taken. Wrap externally to
//!   share.
//!
//! ## Features
//!
//! - `vmem-protect` (default): decommitted pages are re-protected so stray
//!   access faults instead of silently re-paging
//! - `logging`: `tracing` spans for reserve/release/segment traffic

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod allocator;
pub mod error;
pub mod platform;
pub mod size;
pub mod utils;

pub use crate::error::{AllocError, AllocResult};
pub use crate::size::SizeType;

pub mod prelude {
    //! Convenient re-exports of the commonly used types and traits

    pub use crate::allocator::{
        Allocator, FrameGuard, FrameStackAllocator, LinearAllocator, MemoryUsage,
        PagedFrameStackAllocator, PagedLinearAllocator,
    };
    pub use crate::error::{AllocError, AllocResult};
    pub use crate::size::SizeType;
}
