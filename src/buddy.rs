//! A buddy allocator with optional ternary splitting.

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{
    accounting::Accounting,
    block::Block,
    registry::{GroupId, Registry},
    AllocError, AllocInitError, FreeError, InvariantViolation,
};

/// The splitting rules applied by [`TernaryBuddy::alloc`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Policy {
    /// Split a candidate block while it is at least twice the request.
    pub halve: bool,
    /// Satisfy a request of between one half and three quarters of a
    /// candidate block with a half-size and a quarter-size piece.
    pub ternary: bool,
}

impl Policy {
    /// The classic binary buddy system.
    pub const BINARY: Policy = Policy {
        halve: true,
        ternary: false,
    };

    /// Binary splitting plus the three-quarter rule.
    pub const TERNARY: Policy = Policy {
        halve: true,
        ternary: true,
    };
}

impl Default for Policy {
    fn default() -> Self {
        Policy::TERNARY
    }
}

/// The blocks handed out for one call to [`TernaryBuddy::alloc`].
///
/// The blocks are listed in the order they were committed. They must be
/// freed together, along with the requested size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    requested: usize,
    blocks: Vec<Block>,
}

impl Allocation {
    /// Returns the size that was requested.
    #[inline]
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Returns the blocks backing the allocation.
    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns the total size of the backing blocks.
    pub fn size(&self) -> usize {
        self.blocks.iter().map(Block::size).sum()
    }

    /// Consumes the allocation, returning its blocks.
    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}

/// Bookkeeping for an outstanding allocation.
#[derive(Copy, Clone, Debug)]
struct Group {
    requested: usize,
    num_blocks: usize,
}

/// A buddy allocator over the range `[0, total)`.
///
/// `total` must be a power of two. Blocks are handed out from per-size free
/// lists in FIFO order, and freed blocks are eagerly coalesced with their
/// buddies.
///
/// The allocator is single-threaded; wrap it in a lock to share it.
///
/// ```
/// use ternary_buddy::{Policy, TernaryBuddy};
///
/// let mut buddy = TernaryBuddy::with_policy(8, Policy::BINARY).unwrap();
/// let a = buddy.alloc(3).unwrap();
///
/// assert_eq!(a.blocks()[0].size(), 4);
/// assert_eq!(buddy.usage(), Some(0.75));
/// ```
#[derive(Debug)]
pub struct TernaryBuddy {
    registry: Registry,
    accounting: Accounting,
    policy: Policy,
    groups: BTreeMap<GroupId, Group>,
    next_group: GroupId,
}

impl TernaryBuddy {
    /// Constructs an allocator over `[0, total)` with the default policy.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `total` is not a nonzero
    /// power of two.
    pub fn new(total: usize) -> Result<TernaryBuddy, AllocInitError> {
        TernaryBuddy::with_policy(total, Policy::default())
    }

    /// Constructs an allocator over `[0, total)` with the given policy.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `total` is not a nonzero
    /// power of two.
    pub fn with_policy(total: usize, policy: Policy) -> Result<TernaryBuddy, AllocInitError> {
        let registry = Registry::new(total)?;

        log::debug!("TernaryBuddy::new({total:#x}, {policy:?})");

        Ok(TernaryBuddy {
            registry,
            accounting: Accounting::default(),
            policy,
            groups: BTreeMap::new(),
            next_group: 0,
        })
    }

    /// Selects the splitting rules for subsequent allocations.
    pub fn configure(&mut self, halve: bool, ternary: bool) {
        self.set_policy(Policy { halve, ternary });
    }

    /// Selects the splitting rules for subsequent allocations.
    pub fn set_policy(&mut self, policy: Policy) {
        log::debug!("policy set to {policy:?}");
        self.policy = policy;
    }

    /// Returns the current splitting rules.
    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Resets the allocator to a single free block of size `total`.
    ///
    /// All outstanding allocations are forgotten, and their blocks can no
    /// longer be freed. The policy is kept.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `total` is not a nonzero
    /// power of two. The allocator is left unchanged in that case.
    pub fn init(&mut self, total: usize) -> Result<(), AllocInitError> {
        self.registry = Registry::new(total)?;
        self.accounting = Accounting::default();
        self.groups.clear();

        log::debug!("TernaryBuddy::init({total:#x})");

        Ok(())
    }

    /// Returns the size of the managed range.
    #[inline]
    pub fn total(&self) -> usize {
        self.registry.total()
    }

    /// Returns the number of size classes, `log2(total) + 1`.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.registry.num_levels()
    }

    /// Returns the sum of the sizes requested by outstanding allocations.
    #[inline]
    pub fn requested(&self) -> usize {
        self.accounting.requested()
    }

    /// Returns the sum of the block sizes backing outstanding allocations.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.accounting.allocated()
    }

    /// Returns the total size of all free blocks.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.total() - self.allocated()
    }

    /// Returns the number of outstanding allocations.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.groups.len()
    }

    /// Returns the space efficiency of outstanding allocations: the ratio of
    /// requested to allocated size.
    ///
    /// Returns `None` if nothing is allocated.
    #[inline]
    pub fn usage(&self) -> Option<f64> {
        self.accounting.usage()
    }

    /// Iterates over every block, free or allocated, in address order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.registry.iter().map(|slot| self.registry.block(slot))
    }

    /// Iterates over the free blocks of size `2^level` in the order they will
    /// be handed out.
    ///
    /// # Panics
    ///
    /// Panics if `level >= self.num_levels()`.
    pub fn free_blocks(&self, level: u32) -> impl Iterator<Item = Block> + '_ {
        self.registry
            .iter_free(level)
            .map(|slot| self.registry.block(slot))
    }

    /// Allocates one or more blocks whose sizes sum to at least `requested`.
    ///
    /// The smallest size class that can hold the request and has a free block
    /// is searched for, and its oldest free block is split according to the
    /// current [`Policy`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::ZeroSize`] if `requested` is zero, and
    /// [`AllocError::Exhausted`] if no free block is large enough. The
    /// allocator is unchanged on error.
    pub fn alloc(&mut self, requested: usize) -> Result<Allocation, AllocError> {
        if requested == 0 {
            return Err(AllocError::ZeroSize);
        }

        if requested > self.total() {
            log::debug!("alloc({requested:#x}): larger than capacity");
            return Err(AllocError::Exhausted);
        }

        let min_level = requested.next_power_of_two().trailing_zeros();
        let Some(level) = self.registry.first_nonempty(min_level) else {
            log::debug!("alloc({requested:#x}): no free block");
            return Err(AllocError::Exhausted);
        };

        let mut block = self
            .registry
            .free_list(level)
            .front()
            .expect("nonempty free list has no front");

        let group = self.next_group;
        self.next_group += 1;

        let mut committed = Vec::new();

        loop {
            let size = self.registry.node(block).size;

            if self.policy.halve && size / 2 >= requested {
                let (left, _) = self.registry.split(block);
                block = left;
            } else if self.policy.ternary && size >= 4 && size - size / 4 >= requested {
                // Keep the left half and carry on with the left quarter.
                let (left, right) = self.registry.split(block);
                let (quarter, _) = self.registry.split(right);

                self.registry.mark_allocated(left, group);
                committed.push(left);
                block = quarter;
            } else {
                self.registry.mark_allocated(block, group);
                committed.push(block);
                break;
            }
        }

        let blocks: Vec<Block> = committed
            .into_iter()
            .map(|slot| self.registry.block(slot))
            .collect();

        let allocation = Allocation { requested, blocks };
        let size = allocation.size();

        self.accounting.charge(requested, size);
        self.groups.insert(
            group,
            Group {
                requested,
                num_blocks: allocation.blocks.len(),
            },
        );

        log::trace!(
            "alloc({requested:#x}): {} block(s) totalling {size:#x}",
            allocation.blocks.len()
        );

        Ok(allocation)
    }

    /// Frees the blocks of one allocation, coalescing each with its buddies.
    ///
    /// `requested` and `blocks` must be exactly the requested size and blocks
    /// of an [`Allocation`] returned by [`alloc`](Self::alloc), in any order.
    ///
    /// # Errors
    ///
    /// Returns an error if `blocks` is empty, names a block that is not
    /// currently allocated, or does not match exactly one outstanding
    /// allocation. The allocator is unchanged on error.
    pub fn free(&mut self, requested: usize, blocks: &[Block]) -> Result<(), FreeError> {
        let (group, slots) = self.validate_free(requested, blocks).map_err(|e| {
            log::debug!("free({requested:#x}): rejected: {e}");
            e
        })?;

        self.groups.remove(&group);

        let mut released = 0;
        for slot in slots {
            released += self.registry.node(slot).size;
            self.registry.mark_free(slot);
            self.coalesce(slot);
        }

        self.accounting.release(requested, released);

        log::trace!("free({requested:#x}): released {released:#x}");

        Ok(())
    }

    /// Frees an allocation. Equivalent to calling [`free`](Self::free) with
    /// its requested size and blocks.
    pub fn free_allocation(&mut self, allocation: Allocation) -> Result<(), FreeError> {
        self.free(allocation.requested, &allocation.blocks)
    }

    /// Resolves `blocks` to arena slots, checking that they form exactly one
    /// outstanding allocation of `requested` units.
    fn validate_free(
        &self,
        requested: usize,
        blocks: &[Block],
    ) -> Result<(GroupId, Vec<usize>), FreeError> {
        let mut group = None;
        let mut slots = Vec::with_capacity(blocks.len());

        for block in blocks {
            let slot = self
                .registry
                .resolve(block.id)
                .filter(|&slot| !self.registry.node(slot).free)
                .ok_or(FreeError::StaleBlock(block.id))?;

            let block_group = self
                .registry
                .node(slot)
                .group
                .expect("allocated block has no group");

            if *group.get_or_insert(block_group) != block_group || slots.contains(&slot) {
                return Err(FreeError::MismatchedGroup);
            }

            slots.push(slot);
        }

        let group = group.ok_or(FreeError::Empty)?;
        let record = self.groups[&group];

        if record.requested != requested || record.num_blocks != slots.len() {
            return Err(FreeError::MismatchedGroup);
        }

        Ok((group, slots))
    }

    /// Repeatedly merges a free block with its buddy while the buddy is free.
    fn coalesce(&mut self, mut slot: usize) {
        while self.registry.node(slot).size < self.total() {
            let Some(buddy) = self.registry.buddy_of(slot) else {
                break;
            };

            if !self.registry.node(buddy).free {
                break;
            }

            slot = if self.registry.node(slot).is_left() {
                self.registry.merge(slot, buddy)
            } else {
                self.registry.merge(buddy, slot)
            };
        }
    }

    /// Verifies the structural invariants of the allocator.
    ///
    /// This walks every block and is intended for tests and debugging.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.registry.check()?;

        let allocated: usize = self
            .blocks()
            .filter(|b| !b.is_free())
            .map(|b| b.size())
            .sum();
        let requested: usize = self.groups.values().map(|g| g.requested).sum();

        if allocated != self.accounting.allocated()
            || requested != self.accounting.requested()
            || requested > allocated
        {
            return Err(InvariantViolation::Accounting {
                requested: self.accounting.requested(),
                allocated: self.accounting.allocated(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn layout(buddy: &TernaryBuddy) -> Vec<(usize, usize, bool)> {
        buddy
            .blocks()
            .map(|b| (b.offset(), b.size(), b.is_free()))
            .collect()
    }

    fn sizes(a: &Allocation) -> Vec<(usize, usize)> {
        a.blocks().iter().map(|b| (b.offset(), b.size())).collect()
    }

    #[test]
    fn binary_policy_rounds_up_to_power_of_two() {
        let mut buddy = TernaryBuddy::with_policy(8, Policy::BINARY).unwrap();
        let a = buddy.alloc(3).unwrap();

        assert_eq!(sizes(&a), [(0, 4)]);
        assert_eq!(buddy.requested(), 3);
        assert_eq!(buddy.allocated(), 4);
        assert_eq!(buddy.usage(), Some(0.75));
        assert_eq!(layout(&buddy), [(0, 4, false), (4, 4, true)]);
        buddy.check_invariants().unwrap();
    }

    #[test]
    fn ternary_policy_splits_into_half_and_quarter() {
        let mut buddy = TernaryBuddy::with_policy(16, Policy::TERNARY).unwrap();
        let first = buddy.alloc(8).unwrap();
        assert_eq!(sizes(&first), [(0, 8)]);

        let a = buddy.alloc(5).unwrap();
        assert_eq!(sizes(&a), [(8, 4), (12, 2)]);
        assert_eq!(buddy.requested(), 13);
        assert_eq!(buddy.allocated(), 14);
        assert_eq!(
            layout(&buddy),
            [(0, 8, false), (8, 4, false), (12, 2, false), (14, 2, true)]
        );
        buddy.check_invariants().unwrap();

        buddy.free_allocation(first).unwrap();
        assert_eq!(buddy.usage(), Some(5.0 / 6.0));
    }

    #[test]
    fn freeing_ternary_pieces_restores_parent() {
        let mut buddy = TernaryBuddy::with_policy(16, Policy::TERNARY).unwrap();
        let first = buddy.alloc(8).unwrap();
        let a = buddy.alloc(5).unwrap();

        buddy.free_allocation(a).unwrap();
        assert_eq!(layout(&buddy), [(0, 8, false), (8, 8, true)]);

        buddy.free_allocation(first).unwrap();
        assert_eq!(layout(&buddy), [(0, 16, true)]);
        buddy.check_invariants().unwrap();
    }

    #[test]
    fn ternary_beats_binary_on_same_request() {
        let mut binary = TernaryBuddy::with_policy(8, Policy::BINARY).unwrap();
        let mut ternary = TernaryBuddy::with_policy(8, Policy::TERNARY).unwrap();

        binary.alloc(5).unwrap();
        ternary.alloc(5).unwrap();

        assert_eq!(binary.usage(), Some(0.625));
        assert!(ternary.usage().unwrap() > binary.usage().unwrap());
    }

    #[test]
    fn freeing_ternary_pieces_restores_whole_range() {
        let mut buddy = TernaryBuddy::new(16).unwrap();
        let a = buddy.alloc(5).unwrap();
        assert_eq!(sizes(&a), [(0, 4), (4, 2)]);

        buddy.free(5, a.blocks()).unwrap();
        assert_eq!(layout(&buddy), [(0, 16, true)]);
        assert_eq!(buddy.usage(), None);
        assert_eq!(buddy.outstanding(), 0);
        buddy.check_invariants().unwrap();
    }

    #[test]
    fn coalescing_stops_at_allocated_buddy() {
        let mut buddy = TernaryBuddy::with_policy(16, Policy::BINARY).unwrap();
        let a = buddy.alloc(4).unwrap();
        let b = buddy.alloc(4).unwrap();
        assert_eq!(sizes(&b), [(4, 4)]);

        buddy.free_allocation(a).unwrap();
        assert_eq!(
            layout(&buddy),
            [(0, 4, true), (4, 4, false), (8, 8, true)]
        );

        buddy.free_allocation(b).unwrap();
        assert_eq!(layout(&buddy), [(0, 16, true)]);
    }

    #[test]
    fn free_lists_are_fifo() {
        let mut buddy = TernaryBuddy::with_policy(16, Policy::BINARY).unwrap();
        let a = buddy.alloc(2).unwrap();
        let b = buddy.alloc(2).unwrap();
        let c = buddy.alloc(2).unwrap();
        let _d = buddy.alloc(2).unwrap();
        assert_eq!(sizes(&c), [(4, 2)]);

        // Neither freed block can coalesce; both join the size-2 list in the
        // order they were freed.
        buddy.free_allocation(c).unwrap();
        buddy.free_allocation(a).unwrap();
        let order: Vec<usize> = buddy.free_blocks(1).map(|b| b.offset()).collect();
        assert_eq!(order, [4, 0]);

        assert_eq!(sizes(&buddy.alloc(2).unwrap()), [(4, 2)]);
        assert_eq!(sizes(&buddy.alloc(2).unwrap()), [(0, 2)]);
        drop(b);
    }

    #[test]
    fn unit_blocks_at_bottom_level() {
        let mut buddy = TernaryBuddy::new(4).unwrap();
        let a = buddy.alloc(1).unwrap();
        assert_eq!(sizes(&a), [(0, 1)]);
        assert_eq!(layout(&buddy), [(0, 1, false), (1, 1, true), (2, 2, true)]);
        buddy.check_invariants().unwrap();
    }

    #[test]
    fn exhaustion_leaves_state_unchanged() {
        let mut buddy = TernaryBuddy::new(8).unwrap();
        assert_eq!(buddy.alloc(9), Err(AllocError::Exhausted));
        assert_eq!(buddy.alloc(0), Err(AllocError::ZeroSize));

        let _a = buddy.alloc(5).unwrap();
        let before = layout(&buddy);
        let (requested, allocated) = (buddy.requested(), buddy.allocated());

        assert_eq!(buddy.alloc(3), Err(AllocError::Exhausted));
        assert_eq!(layout(&buddy), before);
        assert_eq!((buddy.requested(), buddy.allocated()), (requested, allocated));
    }

    #[test]
    fn without_any_policy_whole_block_is_committed() {
        let mut buddy = TernaryBuddy::new(16).unwrap();
        buddy.configure(false, false);

        let a = buddy.alloc(1).unwrap();
        assert_eq!(sizes(&a), [(0, 16)]);
        assert_eq!(buddy.free_bytes(), 0);
    }

    #[test]
    fn ternary_only_keeps_collecting_pieces() {
        let mut buddy = TernaryBuddy::new(16).unwrap();
        buddy.configure(false, true);

        // 16 -> keep 8, continue with 4 -> keep 2, continue with 1.
        let a = buddy.alloc(1).unwrap();
        assert_eq!(sizes(&a), [(0, 8), (8, 2), (10, 1)]);
        buddy.check_invariants().unwrap();

        buddy.free_allocation(a).unwrap();
        assert_eq!(layout(&buddy), [(0, 16, true)]);
    }

    #[test]
    fn free_rejects_mismatched_groups() {
        let mut buddy = TernaryBuddy::new(32).unwrap();
        let a = buddy.alloc(5).unwrap();
        let b = buddy.alloc(3).unwrap();

        assert_eq!(buddy.free(5, &[]), Err(FreeError::Empty));
        assert_eq!(buddy.free(4, a.blocks()), Err(FreeError::MismatchedGroup));
        assert_eq!(buddy.free(5, &a.blocks()[..1]), Err(FreeError::MismatchedGroup));

        let mixed = [a.blocks()[0], b.blocks()[0]];
        assert_eq!(buddy.free(5, &mixed), Err(FreeError::MismatchedGroup));

        let doubled = [a.blocks()[0], a.blocks()[0]];
        assert_eq!(buddy.free(5, &doubled), Err(FreeError::MismatchedGroup));

        buddy.check_invariants().unwrap();
        buddy.free_allocation(a.clone()).unwrap();
        assert_eq!(
            buddy.free_allocation(a.clone()),
            Err(FreeError::StaleBlock(a.blocks()[0].id()))
        );
        buddy.free_allocation(b).unwrap();
        assert_eq!(layout(&buddy), [(0, 32, true)]);
    }

    #[test]
    fn reallocated_block_rejects_old_handle() {
        let mut buddy = TernaryBuddy::with_policy(4, Policy::BINARY).unwrap();
        buddy.configure(false, false);

        let a = buddy.alloc(4).unwrap();
        buddy.free_allocation(a.clone()).unwrap();
        let b = buddy.alloc(4).unwrap();

        assert_eq!(a.blocks()[0].offset(), b.blocks()[0].offset());
        assert!(buddy.free_allocation(a).is_err());
        buddy.free_allocation(b).unwrap();
    }

    #[test]
    fn free_rejects_blocks_of_another_allocator() {
        let mut x = TernaryBuddy::new(16).unwrap();
        let mut y = TernaryBuddy::new(16).unwrap();

        let ax = x.alloc(5).unwrap();
        let ay = y.alloc(5).unwrap();
        assert_eq!(sizes(&ax), sizes(&ay));

        assert!(matches!(
            y.free(5, ax.blocks()),
            Err(FreeError::StaleBlock(_))
        ));
        assert_eq!(y.outstanding(), 1);
        assert_eq!(y.allocated(), 6);

        y.free_allocation(ay).unwrap();
        x.free_allocation(ax).unwrap();
        assert_eq!(y.blocks().count(), 1);
        assert_eq!(x.blocks().count(), 1);
    }

    #[test]
    fn init_resets_and_invalidates_handles() {
        let mut buddy = TernaryBuddy::new(8).unwrap();
        let a = buddy.alloc(3).unwrap();
        assert_eq!(sizes(&a), [(0, 2), (2, 1)]);

        assert_eq!(buddy.init(12), Err(AllocInitError::InvalidConfig));
        assert_eq!(buddy.allocated(), 3);

        buddy.init(64).unwrap();
        assert_eq!(buddy.total(), 64);
        assert_eq!(buddy.num_levels(), 7);
        assert_eq!(buddy.usage(), None);
        assert_eq!(layout(&buddy), [(0, 64, true)]);
        assert_eq!(buddy.policy(), Policy::TERNARY);
        assert!(matches!(
            buddy.free_allocation(a),
            Err(FreeError::StaleBlock(_))
        ));
    }
}
