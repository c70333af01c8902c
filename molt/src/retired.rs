//! Finalizable object header.

use std::ptr;

/// Type-erased destructor invoked once the object's grace period elapsed.
pub type DestroyFn = unsafe fn(*mut FinNode);

/// Header embedded in every object subject to deferred reclamation.
///
/// Must be the **first** field of a `#[repr(C)]` struct so that a pointer
/// to the object and a pointer to its header are interchangeable. The
/// `destroy` hook is fixed at construction time and receives the header
/// pointer of the object being reclaimed.
#[repr(C)]
pub struct FinNode {
    pub(crate) next: *mut FinNode,
    pub(crate) destroy: DestroyFn,
}

impl FinNode {
    /// Creates an unlinked header with the given destruction hook.
    pub const fn new(destroy: DestroyFn) -> Self {
        Self {
            next: ptr::null_mut(),
            destroy,
        }
    }
}

// SAFETY: the link field is only touched by the owning thread's finalizer
// list; cross-thread hand-off happens through container publication points.
unsafe impl Send for FinNode {}
unsafe impl Sync for FinNode {}

/// Destruction hook for objects allocated with `Box::new`.
///
/// # Safety
///
/// `node` must point to the `FinNode` at offset 0 of a live, boxed `T`,
/// and must not be used again afterwards.
pub unsafe fn drop_boxed<T>(node: *mut FinNode) {
    unsafe { drop(Box::from_raw(node as *mut T)) }
}

/// Runs an object's destruction hook immediately, bypassing the grace
/// period machinery.
///
/// # Safety
///
/// The object must be unreachable from every thread; this is only safe
/// from contexts with exclusive ownership, e.g. container `Drop` impls.
pub unsafe fn destroy_now(node: *mut FinNode) {
    unsafe { ((*node).destroy)(node) }
}
