//! The order table: `order_size[k] = base_block_size << k`, for `k` in `0..=max_order`.
//!
//! An "order" is the index into this table; a block of order `k` has total
//! byte size (payload + header) equal to `order_size(k)`.

#[derive(Debug, Clone)]
pub(crate) struct OrderTable {
    sizes: Vec<usize>,
}

impl OrderTable {
    pub(crate) fn new(base_block_size: usize, max_order: usize) -> OrderTable {
        let sizes = (0..=max_order).map(|k| base_block_size << k).collect();
        OrderTable { sizes }
    }

    pub(crate) fn block_size(&self, order: usize) -> usize {
        self.sizes[order]
    }

    /// The smallest order whose block size is `>= total`, or `None` if `total`
    /// exceeds the largest order's block size.
    pub(crate) fn order_of_total(&self, total: usize) -> Option<usize> {
        self.sizes.iter().position(|&size| size >= total)
    }

    /// The order whose block size is exactly `total`, or `None` if it doesn't
    /// land on a boundary (which would indicate a corrupted header).
    pub(crate) fn order_of_exact(&self, total: usize) -> Option<usize> {
        self.sizes.iter().position(|&size| size == total)
    }
}
