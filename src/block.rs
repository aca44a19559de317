/// A stable handle naming one block.
///
/// Handles combine an arena slot with a generation counter. The generation is
/// bumped whenever the slot is reused or the block is allocated, so a handle
/// held past the end of its allocation no longer resolves. The epoch is unique
/// to one allocator and changes on every re-initialization.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub(crate) epoch: u32,
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

/// A partition of the managed range.
///
/// `Block` values are snapshots: the allocator owns the live block, and the
/// copy held by the caller is only used to name it on free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub(crate) id: BlockId,
    pub(crate) size: usize,
    pub(crate) offset: usize,
    pub(crate) free: bool,
}

impl Block {
    /// Returns the handle of this block.
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Returns the size of the block. Always a power of two.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the offset of the block from the start of the range.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the offset one past the end of the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Returns `true` if the block was free when this snapshot was taken.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.free
    }

    /// Returns the base-2 logarithm of the block size, i.e. its size class.
    #[inline]
    pub fn log_size(&self) -> u32 {
        log2(self.size)
    }

    /// Returns `true` if this block is the lower-addressed half of its parent.
    #[inline]
    pub fn is_left(&self) -> bool {
        is_left(self.offset, self.size)
    }

    /// Returns the offset of this block's buddy.
    #[inline]
    pub fn buddy_offset(&self) -> usize {
        self.offset ^ self.size
    }
}

#[inline]
pub(crate) fn log2(size: usize) -> u32 {
    debug_assert!(size.is_power_of_two());
    size.trailing_zeros()
}

#[inline]
pub(crate) fn is_left(offset: usize, size: usize) -> bool {
    (offset / size) % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(size: usize, offset: usize) -> Block {
        Block {
            id: BlockId {
                epoch: 0,
                slot: 0,
                generation: 0,
            },
            size,
            offset,
            free: true,
        }
    }

    #[test]
    fn role_follows_address() {
        assert!(block(4, 0).is_left());
        assert!(!block(4, 4).is_left());
        assert!(block(4, 8).is_left());
        assert!(!block(1, 7).is_left());
    }

    #[test]
    fn buddy_offset_flips_size_bit() {
        assert_eq!(block(4, 0).buddy_offset(), 4);
        assert_eq!(block(4, 4).buddy_offset(), 0);
        assert_eq!(block(2, 12).buddy_offset(), 14);
    }

    #[test]
    fn log_size_is_exponent() {
        assert_eq!(block(1, 0).log_size(), 0);
        assert_eq!(block(4096, 0).log_size(), 12);
        assert_eq!(block(8, 8).end(), 16);
    }
}
