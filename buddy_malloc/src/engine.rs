//! The buddy engine: arena initialization, allocation, freeing, and the
//! statistics surface.
//!
//! Memory is broken up into blocks that are each a power-of-two multiple of
//! `base_block_size`. A block of size `base << k` is said to be of order `k`.
//! Blocks at each order come in pairs - each has a "buddy", and a pair can
//! always be recombined into the block they were originally split from. Free
//! blocks are tracked in per-order free-lists, kept sorted by address so that
//! the lowest-addressed block of the smallest sufficient order is always
//! chosen (tightest fit), and so that a freed block's list neighbours are
//! exactly the candidates for its buddy.
//!
//! Requests too big for the arena's largest block bypass it entirely and are
//! satisfied by an independent anonymous mapping per request (see
//! `allocate_mmap`/`free`'s mmap branch).

use std::io;
use std::ptr;

use crate::config::{AllocError, Config};
use crate::header::{header_of, header_size, payload_of, unlink, BlockHeader};
use crate::order::OrderTable;

const _: () = assert!(header_size() <= 64, "block header must fit in 64 bytes");

#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    free_blocks: u64,
    free_bytes: u64,
    used_blocks: u64,
    used_bytes: u64,
}

/// An owned buddy allocator. All of its state - the arena, free-lists, mmap
/// list, and counters - belongs to this value; there is no hidden process-wide
/// global, so nothing stops an embedder wrapping it in a `Mutex` for
/// multi-threaded use, though this type itself assumes a single logical caller
/// at a time.
pub struct Allocator {
    config: Config,
    orders: OrderTable,
    free_lists: Vec<*mut BlockHeader>,
    mmap_head: *mut BlockHeader,
    mmap_tail: *mut BlockHeader,
    arena_base: *mut u8,
    arena_size: usize,
    arena_ready: bool,
    stats: Stats,
}

impl Allocator {
    /// Builds an allocator with the distilled default configuration (128-byte
    /// base blocks, 11 orders, a 32-block arena, a 10^8-byte request cap).
    pub fn new() -> Allocator {
        Allocator::with_config(Config::default()).expect("the default configuration is always valid")
    }

    pub fn with_config(config: Config) -> Result<Allocator, AllocError> {
        let orders = OrderTable::new(config.base_block_size, config.max_order);
        Ok(Allocator {
            free_lists: vec![ptr::null_mut(); config.max_order + 1],
            orders,
            config,
            mmap_head: ptr::null_mut(),
            mmap_tail: ptr::null_mut(),
            arena_base: ptr::null_mut(),
            arena_size: 0,
            arena_ready: false,
            stats: Stats::default(),
        })
    }

    /// Size, in bytes, of the header prepended to every block. A constant,
    /// always `<= 64`.
    pub const fn header_size() -> usize {
        header_size()
    }

    // ---- statistics surface (§4.7) ----

    pub fn num_free_blocks(&self) -> u64 {
        self.stats.free_blocks
    }

    pub fn num_free_bytes(&self) -> u64 {
        self.stats.free_bytes
    }

    pub fn num_allocated_blocks(&self) -> u64 {
        self.stats.free_blocks + self.stats.used_blocks
    }

    pub fn num_allocated_bytes(&self) -> u64 {
        self.stats.free_bytes + self.stats.used_bytes
    }

    pub fn num_meta_data_bytes(&self) -> u64 {
        self.num_allocated_blocks() * Self::header_size() as u64
    }

    // ---- allocation (§4.3) ----

    pub fn allocate(&mut self, n: usize) -> *mut u8 {
        if !self.arena_ready && !self.init_arena() {
            return ptr::null_mut();
        }
        if n == 0 || n > self.config.max_request {
            return ptr::null_mut();
        }
        // `n + header_size` must not overflow (§4.1): a caller-tunable
        // `max_request` can be set up to `usize::MAX`, so this can't be
        // ruled out by validating `Config` alone.
        let total = match n.checked_add(Self::header_size()) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        if total <= self.orders.block_size(self.config.max_order) {
            self.allocate_buddy(n)
        } else {
            self.allocate_mmap(n)
        }
    }

    /// As `allocate(count * size)`, with overflow detection, zeroing the
    /// returned payload (§4.5).
    pub fn zalloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let ptr = self.allocate(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// # Safety
    /// `ptr` must either be null, or have been returned by a prior call to
    /// `allocate`/`zalloc`/`resize` on this allocator and not already freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let header = unsafe { header_of(ptr) };
        if unsafe { (*header).is_free } {
            return;
        }
        let size = unsafe { (*header).size };
        self.stats.used_blocks -= 1;
        self.stats.used_bytes -= size as u64;

        if unsafe { (*header).is_mmap } {
            self.unlink_mmap(header);
            let total = size + Self::header_size();
            log::debug!("munmap'd {total} bytes");
            unsafe { libc::munmap(header as *mut libc::c_void, total) };
            return;
        }

        self.coalesce(header);
    }

    /// # Safety
    /// `old_ptr` must either be null, or have been returned by a prior call to
    /// `allocate`/`zalloc`/`resize` on this allocator and not already freed.
    pub unsafe fn resize(&mut self, old_ptr: *mut u8, n: usize) -> *mut u8 {
        if old_ptr.is_null() {
            return self.allocate(n);
        }
        if n == 0 {
            unsafe { self.free(old_ptr) };
            return ptr::null_mut();
        }

        let header = unsafe { header_of(old_ptr) };
        let old_size = unsafe { (*header).size };
        if old_size >= n {
            unsafe { (*header).is_free = false };
            return old_ptr;
        }

        if !unsafe { (*header).is_mmap } {
            let header_size = Self::header_size();
            let start_order = self
                .orders
                .order_of_exact(old_size + header_size)
                .expect("buddy block size must land exactly on an order boundary");
            let target_total = n.checked_add(header_size);
            if let Some(final_order) = target_total.and_then(|total| self.probe_grow(header, start_order, total)) {
                let merged = self.commit_grow(header, start_order, final_order);
                let merged_size = self.orders.block_size(final_order) - header_size;
                self.stats.used_bytes = self.stats.used_bytes - old_size as u64 + merged_size as u64;
                let new_payload = unsafe { payload_of(merged) };
                if new_payload != old_ptr {
                    unsafe { ptr::copy(old_ptr, new_payload, old_size) };
                }
                return new_payload;
            }
        }

        let new_ptr = self.allocate(n);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        unsafe { ptr::copy(old_ptr, new_ptr, old_size) };
        unsafe { self.free(old_ptr) };
        new_ptr
    }

    // ---- OS collaborator wrappers (§4.9) ----

    /// Requests an anonymous private mapping of `size` bytes from the kernel.
    /// The only place `libc::mmap` is called from; `init_arena` and
    /// `allocate_mmap` both log and fall back to NULL on `Err`, per the
    /// NULL-returning contract, but this wrapper itself surfaces the OS error.
    fn mmap_region(size: usize) -> Result<*mut u8, AllocError> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            Err(AllocError::MapFailed(io::Error::last_os_error()))
        } else {
            Ok(addr as *mut u8)
        }
    }

    // ---- arena bring-up (§4.2) ----

    fn init_arena(&mut self) -> bool {
        let header_size = Self::header_size();
        let block_size = self.orders.block_size(self.config.max_order);
        let arena_size = block_size * self.config.arena_blocks;

        let addr = match Self::mmap_region(arena_size) {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!("failed to map {arena_size} byte arena: {err}");
                return false;
            }
        };

        self.arena_base = addr;
        self.arena_size = arena_size;
        self.arena_ready = true;

        let mut prev: *mut BlockHeader = ptr::null_mut();
        for i in 0..self.config.arena_blocks {
            let block = unsafe { self.arena_base.add(i * block_size) } as *mut BlockHeader;
            unsafe {
                (*block).size = block_size - header_size;
                (*block).is_free = true;
                (*block).is_mmap = false;
                (*block).buddy = ptr::null_mut();
                (*block).prev = prev;
                (*block).next = ptr::null_mut();
                if !prev.is_null() {
                    (*prev).next = block;
                }
            }
            if i == 0 {
                self.free_lists[self.config.max_order] = block;
            }
            prev = block;
        }

        self.stats.free_blocks = self.config.arena_blocks as u64;
        self.stats.free_bytes = (self.config.arena_blocks * (block_size - header_size)) as u64;
        log::info!(
            "buddy arena initialized: base={:p} size={arena_size} bytes ({} blocks)",
            self.arena_base, self.config.arena_blocks
        );
        true
    }

    // ---- buddy path ----

    fn allocate_buddy(&mut self, n: usize) -> *mut u8 {
        let header_size = Self::header_size();
        let total = match n.checked_add(header_size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let k = match self.orders.order_of_total(total) {
            Some(k) => k,
            None => return ptr::null_mut(),
        };

        let mut j = k;
        while j <= self.config.max_order && self.free_lists[j].is_null() {
            j += 1;
        }
        if j > self.config.max_order {
            log::debug!("buddy arena out of memory for order {k}");
            return ptr::null_mut();
        }

        let block = self.free_lists[j];
        self.remove_free(j, block);

        // `block` stays at the low address through every split and so is
        // always the left half of its own pair; only the right half's buddy
        // pointer is ever consulted when coalescing (see `coalesce`). At the
        // top split only, `block`'s own buddy field is also stamped, so it
        // remembers its order-(MAX_ORDER-1) sibling; stale once `block` is
        // split again into a smaller order, but nothing ever reads it there.
        for i in (k..j).rev() {
            let right = unsafe { self.arena_base.add(self.block_offset(block) + self.orders.block_size(i)) }
                as *mut BlockHeader;
            unsafe {
                (*right).is_free = true;
                (*right).is_mmap = false;
                (*right).buddy = block;
                (*right).prev = ptr::null_mut();
                (*right).next = ptr::null_mut();
                if i == self.config.max_order - 1 {
                    (*block).buddy = right;
                }
            }
            self.insert_free(i, right);
        }

        unsafe {
            (*block).size = self.orders.block_size(k) - header_size;
            (*block).is_free = false;
            (*block).is_mmap = false;
        }
        self.stats.used_blocks += 1;
        self.stats.used_bytes += unsafe { (*block).size } as u64;
        unsafe { payload_of(block) }
    }

    /// Iteratively coalesces a freed buddy block with its buddy at each order,
    /// up to `MAX_ORDER` (§4.4).
    fn coalesce(&mut self, header: *mut BlockHeader) {
        let header_size = Self::header_size();
        let mut block = header;
        let mut order = self
            .orders
            .order_of_exact(unsafe { (*block).size } + header_size)
            .expect("buddy block size must land exactly on an order boundary");
        self.insert_free(order, block);

        while order < self.config.max_order {
            // Only the higher-address member of a pair has a buddy pointer
            // that's safe to trust (see `allocate_buddy`); `block` is always
            // the lower-address member of its own pair, so merging with the
            // next (higher-address) free neighbour must check *its* pointer,
            // never `block`'s own, which may be stale from a smaller order.
            let next = unsafe { (*block).next };
            if !next.is_null() && unsafe { (*next).buddy } == block {
                self.remove_free(order, next);
                self.remove_free(order, block);
                order += 1;
                self.insert_free(order, block);
                continue;
            }

            let prev = unsafe { (*block).prev };
            if !prev.is_null() && unsafe { (*block).buddy } == prev {
                self.remove_free(order, block);
                self.remove_free(order, prev);
                block = prev;
                order += 1;
                self.insert_free(order, block);
                continue;
            }

            break;
        }
    }

    // ---- in-place resize growth (§4.6, §9 open question) ----

    /// Walks the buddy-merge chain upward from `start_order` without mutating
    /// any state, to see whether growing in place can reach `target_total`
    /// bytes. Returns the order at which it can, if any.
    fn probe_grow(&self, header: *mut BlockHeader, start_order: usize, target_total: usize) -> Option<usize> {
        let mut order = start_order;
        loop {
            if self.orders.block_size(order) >= target_total {
                return Some(order);
            }
            if order >= self.config.max_order {
                return None;
            }
            // `header` never moves: it's always the lower-address member of
            // every pair it belongs to (see `allocate_buddy`), so growing it
            // only ever consumes a buddy at a higher address.
            self.find_free_buddy(header, order)?;
            order += 1;
        }
    }

    /// Replays exactly the merges `probe_grow` confirmed were available,
    /// actually removing the consumed buddies from their free-lists this time.
    fn commit_grow(&mut self, header: *mut BlockHeader, start_order: usize, final_order: usize) -> *mut BlockHeader {
        let mut order = start_order;
        while order < final_order {
            let buddy = self
                .find_free_buddy(header, order)
                .expect("commit_grow must only run after a successful probe_grow");
            self.remove_free(order, buddy);
            order += 1;
        }
        unsafe {
            (*header).size = self.orders.block_size(final_order) - Self::header_size();
            (*header).is_free = false;
            (*header).is_mmap = false;
        }
        header
    }

    /// Locates `block`'s buddy at `order` by walking `free_lists[order]` for
    /// the node whose buddy back-reference points to `block` - the same
    /// pointer `coalesce` trusts, rather than recomputing the buddy's address
    /// by XOR. `block` is always the lower-address member of its own pair,
    /// so at most one free node in the list can carry `buddy == block`.
    fn find_free_buddy(&self, block: *mut BlockHeader, order: usize) -> Option<*mut BlockHeader> {
        if order >= self.config.max_order {
            return None;
        }
        let mut cur = self.free_lists[order];
        while !cur.is_null() {
            if unsafe { (*cur).buddy } == block {
                return Some(cur);
            }
            cur = unsafe { (*cur).next };
        }
        None
    }

    fn block_offset(&self, block: *mut BlockHeader) -> usize {
        block as usize - self.arena_base as usize
    }

    // ---- free-list bookkeeping ----

    /// Inserts `node` into `free_lists[order]` in address order, stamping its
    /// size/free flag for that order and updating the free counters. The
    /// single place free-list membership and the free counters are kept in
    /// lockstep.
    fn insert_free(&mut self, order: usize, node: *mut BlockHeader) {
        unsafe {
            (*node).size = self.orders.block_size(order) - Self::header_size();
            (*node).is_free = true;
        }

        let head = self.free_lists[order];
        if head.is_null() || (node as usize) < (head as usize) {
            unsafe {
                (*node).prev = ptr::null_mut();
                (*node).next = head;
                if !head.is_null() {
                    (*head).prev = node;
                }
            }
            self.free_lists[order] = node;
        } else {
            let mut cur = head;
            unsafe {
                while !(*cur).next.is_null() && ((*cur).next as usize) < (node as usize) {
                    cur = (*cur).next;
                }
                (*node).next = (*cur).next;
                (*node).prev = cur;
                if !(*cur).next.is_null() {
                    (*(*cur).next).prev = node;
                }
                (*cur).next = node;
            }
        }

        self.stats.free_blocks += 1;
        self.stats.free_bytes += unsafe { (*node).size } as u64;
    }

    /// Removes `node` from `free_lists[order]`, clearing its free flag and
    /// updating the free counters.
    fn remove_free(&mut self, order: usize, node: *mut BlockHeader) {
        self.stats.free_blocks -= 1;
        self.stats.free_bytes -= unsafe { (*node).size } as u64;
        unsafe { unlink(&mut self.free_lists[order], node) };
        unsafe { (*node).is_free = false };
    }

    // ---- mmap path (§4.3, §4.4) ----

    fn allocate_mmap(&mut self, n: usize) -> *mut u8 {
        let header_size = Self::header_size();
        let total = match n.checked_add(header_size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let addr = match Self::mmap_region(total) {
            Ok(addr) => addr,
            Err(err) => {
                log::warn!("mmap of {total} bytes failed: {err}");
                return ptr::null_mut();
            }
        };

        let header = addr as *mut BlockHeader;
        unsafe {
            (*header).size = n;
            (*header).is_free = false;
            (*header).is_mmap = true;
            (*header).buddy = ptr::null_mut();
            (*header).prev = self.mmap_tail;
            (*header).next = ptr::null_mut();
            if !self.mmap_tail.is_null() {
                (*self.mmap_tail).next = header;
            }
        }
        if self.mmap_head.is_null() {
            self.mmap_head = header;
        }
        self.mmap_tail = header;

        self.stats.used_blocks += 1;
        self.stats.used_bytes += n as u64;
        unsafe { payload_of(header) }
    }

    fn unlink_mmap(&mut self, node: *mut BlockHeader) {
        if self.mmap_tail == node {
            self.mmap_tail = unsafe { (*node).prev };
        }
        unsafe { unlink(&mut self.mmap_head, node) };
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::new()
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let header_size = Self::header_size();
        let mut node = self.mmap_head;
        while !node.is_null() {
            let next = unsafe { (*node).next };
            let size = unsafe { (*node).size };
            unsafe { libc::munmap(node as *mut libc::c_void, size + header_size) };
            node = next;
        }
        if self.arena_ready {
            unsafe { libc::munmap(self.arena_base as *mut libc::c_void, self.arena_size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A small arena (four order-5 blocks, 64-byte base) kept separate from
    /// the distilled defaults so free-list walks in these tests stay short
    /// enough to read.
    fn small_allocator() -> Allocator {
        Allocator::with_config(Config::new(64, 5, 4, 1_000_000).unwrap()).unwrap()
    }

    /// Walks every free-list, checking the invariants a freed block must
    /// hold: marked free, stamped size landing exactly on its order's byte
    /// count, prev/next symmetric, and addresses strictly ascending.
    fn check_free_lists(allocator: &Allocator) {
        let header_size = Allocator::header_size();
        for (order, &head) in allocator.free_lists.iter().enumerate() {
            let order_size = allocator.orders.block_size(order);
            let mut cur = head;
            let mut prev: *mut BlockHeader = ptr::null_mut();
            while !cur.is_null() {
                unsafe {
                    assert!((*cur).is_free, "block in free_lists[{order}] not marked free");
                    assert_eq!(
                        (*cur).size + header_size,
                        order_size,
                        "block in free_lists[{order}] has the wrong stamped size"
                    );
                    assert_eq!((*cur).prev, prev, "broken prev link in free_lists[{order}]");
                    if !prev.is_null() {
                        assert!((cur as usize) > (prev as usize), "free_lists[{order}] not address-ascending");
                    }
                    prev = cur;
                    cur = (*cur).next;
                }
            }
        }
    }

    #[test]
    fn init_arena_leaves_one_free_block_per_arena_slot_at_the_top_order() {
        let mut allocator = small_allocator();
        assert!(allocator.init_arena());
        assert!(!allocator.free_lists[allocator.config.max_order].is_null());
        for order in 0..allocator.config.max_order {
            assert!(allocator.free_lists[order].is_null(), "order {order} should start empty");
        }
        check_free_lists(&allocator);
    }

    #[test]
    fn split_stamps_buddy_back_references_down_to_the_requested_order() {
        let mut allocator = small_allocator();
        let smallest_total = allocator.orders.block_size(0);
        let ptr = allocator.allocate(smallest_total - Allocator::header_size());
        assert!(!ptr.is_null());

        for order in 0..allocator.config.max_order {
            let head = allocator.free_lists[order];
            assert!(!head.is_null(), "order {order} should hold the block split off on the way down");
            assert!(unsafe { (*head).next }.is_null(), "order {order} should hold exactly one block");
            assert_eq!(unsafe { (*head).buddy }, unsafe { header_of(ptr) }, "split-off buddy must point back at the allocation");
        }
        check_free_lists(&allocator);
    }

    #[test]
    fn freeing_the_only_allocation_coalesces_every_order_back_to_the_top() {
        let mut allocator = small_allocator();
        let smallest_total = allocator.orders.block_size(0);
        let ptr = allocator.allocate(smallest_total - Allocator::header_size());
        assert!(!ptr.is_null());

        unsafe { allocator.free(ptr) };

        assert!(!allocator.free_lists[allocator.config.max_order].is_null());
        for order in 0..allocator.config.max_order {
            assert!(allocator.free_lists[order].is_null(), "order {order} should be empty after full coalescing");
        }
        check_free_lists(&allocator);
    }

    #[test]
    fn probe_grow_walks_the_buddy_chain_without_mutating_any_free_list() {
        let mut allocator = small_allocator();
        let header_size = Allocator::header_size();
        let smallest_total = allocator.orders.block_size(0);
        let ptr = allocator.allocate(smallest_total - header_size);
        assert!(!ptr.is_null());
        let header = unsafe { header_of(ptr) };

        let free_lists_before = allocator.free_lists.clone();
        let target_total = allocator.orders.block_size(allocator.config.max_order);
        let reachable = allocator.probe_grow(header, 0, target_total);
        assert_eq!(reachable, Some(allocator.config.max_order));
        assert_eq!(allocator.free_lists, free_lists_before, "probe_grow must not mutate free-lists");

        let merged = allocator.commit_grow(header, 0, allocator.config.max_order);
        assert_eq!(merged, header, "the grown block never changes address (§4.4: it's always the pair's lower half)");
        for order in 0..allocator.config.max_order {
            assert!(allocator.free_lists[order].is_null(), "order {order} should be fully consumed by the grow");
        }
        check_free_lists(&allocator);
    }

    #[test]
    fn allocate_rejects_a_request_that_would_overflow_the_header_addition() {
        let config = Config::new(128, 10, 32, usize::MAX).unwrap();
        let mut allocator = Allocator::with_config(config).unwrap();
        assert!(allocator.allocate(usize::MAX - 10).is_null());
    }
}
