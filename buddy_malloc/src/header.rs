//! The fixed-size record prepended to every block, buddy or mmap.
//!
//! Headers live inside the memory they describe and are linked into doubly-linked
//! lists in place, so they're addressed as raw cells (`*mut BlockHeader`) rather
//! than owned Rust values with a `Drop` impl.

use std::mem;
use std::ptr;

#[repr(C)]
pub(crate) struct BlockHeader {
    /// Payload size in bytes (total block size minus `header_size()`).
    pub size: usize,
    pub is_free: bool,
    pub is_mmap: bool,
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
    /// Back-reference to this block's buddy at its current order, set at split time.
    /// Null for `MAX_ORDER` blocks and meaningless for mmap blocks.
    pub buddy: *mut BlockHeader,
}

/// Size of [`BlockHeader`] in bytes. A hard requirement of this allocator is that
/// this stays at or under 64 bytes.
pub(crate) const fn header_size() -> usize {
    mem::size_of::<BlockHeader>()
}

/// Recovers the header immediately preceding a payload pointer previously handed
/// out by this allocator.
///
/// # Safety
/// `ptr` must have been returned by this allocator and not already freed.
pub(crate) unsafe fn header_of(ptr: *mut u8) -> *mut BlockHeader {
    unsafe { ptr.sub(header_size()) as *mut BlockHeader }
}

/// The payload pointer for a block whose header starts at `header`.
pub(crate) unsafe fn payload_of(header: *mut BlockHeader) -> *mut u8 {
    unsafe { (header as *mut u8).add(header_size()) }
}

pub(crate) unsafe fn unlink(
    list_head: &mut *mut BlockHeader,
    node: *mut BlockHeader,
) {
    unsafe {
        if !(*node).prev.is_null() {
            (*(*node).prev).next = (*node).next;
        }
        if !(*node).next.is_null() {
            (*(*node).next).prev = (*node).prev;
        }
        if *list_head == node {
            *list_head = (*node).next;
        }
        (*node).prev = ptr::null_mut();
        (*node).next = ptr::null_mut();
    }
}
