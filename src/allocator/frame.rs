//! Move-only frame token with a drop-guaranteed pop

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

/// Signature of a frame pop implementation
///
/// `allocator` is a type-erased pointer to the allocator that pushed the
/// frame; `data` is the allocator-private frame state recorded at push time.
/// Returns false when the frame is not the topmost live frame.
pub type PopFrameFn = unsafe fn(allocator: NonNull<()>, data: NonNull<()>) -> bool;

/// Handle to one pushed frame of a frame-capable allocator
///
/// Dropping the guard pops the frame, so every allocation made after the
/// matching `push_frame` is reclaimed on all exit paths. Frames are strictly
/// stack-disciplined: popping out of order returns false and changes
/// nothing, and [`pop`](FrameGuard::pop) is idempotent — the first call
/// reports the allocator's answer, later calls report false.
///
/// The guard borrows its allocator, so the allocator cannot be moved or
/// dropped while the frame is live. The guard is move-only; a moved-from
/// guard cannot be observed in Rust, so no empty state is reachable except
/// through [`pop`].
pub struct FrameGuard<'alloc> {
    allocator: NonNull<()>,
    pop_fn: PopFrameFn,
    data: *mut (),
    _allocator: PhantomData<&'alloc ()>,
}

impl<'alloc> FrameGuard<'alloc> {
    /// Binds a frame token to `allocator`, whose borrow keeps it alive for
    /// the guard's lifetime
    pub(crate) fn new<A>(allocator: &'alloc A, pop_fn: PopFrameFn, data: NonNull<()>) -> Self {
        Self {
            allocator: NonNull::from(allocator).cast::<()>(),
            pop_fn,
            data: data.as_ptr(),
            _allocator: PhantomData,
        }
    }

    /// True while the frame has not been popped
    #[inline]
    pub fn can_pop(&self) -> bool {
        !self.data.is_null()
    }

    /// Pops the frame, releasing everything allocated since the push
    ///
    /// Returns false if the frame was already popped or is not the topmost
    /// live frame; in the latter case the allocator is left untouched.
    pub fn pop(&mut self) -> bool {
        let Some(data) = NonNull::new(self.data) else {
            return false;
        };

        // Null first so a second pop is a no-op even if the allocator
        // refuses this one.
        self.data = ptr::null_mut();

        // SAFETY: allocator and data were produced together by the
        // allocator's push, and the 'alloc borrow keeps the allocator
        // alive.
        unsafe { (self.pop_fn)(self.allocator, data) }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.pop();
    }
}
