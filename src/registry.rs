//! The address-ordered set of blocks covering the managed range.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    block::{self, Block, BlockId},
    free_list::{FreeLink, FreeList, FreeLists},
    AllocInitError, InvariantViolation,
};

/// Source of registry epochs. Every registry draws a fresh one, so handles
/// issued by one allocator never resolve in another.
static NEXT_EPOCH: AtomicU32 = AtomicU32::new(0);

/// Identifies the allocation a block was handed out by.
pub(crate) type GroupId = u64;

/// A block as stored in the arena.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub size: usize,
    pub offset: usize,
    pub free: bool,
    pub generation: u32,
    /// The allocation this block belongs to, if it is allocated.
    pub group: Option<GroupId>,
    /// Neighbours in address order.
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub link: FreeLink,
}

impl Node {
    #[inline]
    pub fn log_size(&self) -> u32 {
        block::log2(self.size)
    }

    #[inline]
    pub fn is_left(&self) -> bool {
        block::is_left(self.offset, self.size)
    }
}

#[derive(Clone, Debug)]
enum Slot {
    Occupied(Node),
    Vacant {
        generation: u32,
        next_vacant: Option<usize>,
    },
}

/// Backing storage for blocks, addressed by slot index.
///
/// Slots emptied by a merge are kept on a vacancy list and reused by later
/// splits.
#[derive(Clone, Debug, Default)]
pub(crate) struct Arena {
    /// Distinguishes handles issued by other registries.
    epoch: u32,
    slots: Vec<Slot>,
    vacant: Option<usize>,
    live: usize,
}

impl Arena {
    fn insert(&mut self, size: usize, offset: usize) -> usize {
        let mut node = Node {
            size,
            offset,
            free: true,
            generation: 0,
            group: None,
            prev: None,
            next: None,
            link: FreeLink::default(),
        };

        self.live += 1;

        match self.vacant {
            Some(slot) => {
                let Slot::Vacant {
                    generation,
                    next_vacant,
                } = self.slots[slot]
                else {
                    panic!("vacancy list points at occupied slot {slot}");
                };

                node.generation = generation;
                self.vacant = next_vacant;
                self.slots[slot] = Slot::Occupied(node);
                slot
            }

            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, slot: usize) -> Node {
        let generation = self.node(slot).generation.wrapping_add(1);
        let vacated = Slot::Vacant {
            generation,
            next_vacant: self.vacant,
        };

        let Slot::Occupied(node) = core::mem::replace(&mut self.slots[slot], vacated) else {
            unreachable!();
        };

        self.vacant = Some(slot);
        self.live -= 1;
        node
    }

    /// Returns the block in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is vacant.
    #[inline]
    pub fn node(&self, slot: usize) -> &Node {
        match &self.slots[slot] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("slot {slot} is vacant"),
        }
    }

    #[inline]
    pub fn node_mut(&mut self, slot: usize) -> &mut Node {
        match &mut self.slots[slot] {
            Slot::Occupied(node) => node,
            Slot::Vacant { .. } => panic!("slot {slot} is vacant"),
        }
    }

    #[inline]
    pub fn link(&self, slot: usize) -> &FreeLink {
        &self.node(slot).link
    }

    #[inline]
    pub fn link_mut(&mut self, slot: usize) -> &mut FreeLink {
        &mut self.node_mut(slot).link
    }

    /// Resolves a handle, checking that its generation is current.
    pub fn resolve(&self, id: BlockId) -> Option<usize> {
        match self.slots.get(id.slot)? {
            Slot::Occupied(node) if id.epoch == self.epoch && node.generation == id.generation => {
                Some(id.slot)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }
}

/// The partition registry.
///
/// Owns every block and keeps them threaded in address order, forming an
/// exact cover of `[0, total)`. Free blocks are additionally threaded through
/// the free list of their size class.
#[derive(Clone, Debug)]
pub(crate) struct Registry {
    arena: Arena,
    free: FreeLists,
    /// The block at offset zero.
    head: usize,
    total: usize,
}

impl Registry {
    pub fn new(total: usize) -> Result<Registry, AllocInitError> {
        if !total.is_power_of_two() {
            return Err(AllocInitError::InvalidConfig);
        }

        let epoch = NEXT_EPOCH.fetch_add(1, Ordering::Relaxed);

        let num_levels = block::log2(total) as usize + 1;
        let mut arena = Arena {
            epoch,
            ..Arena::default()
        };
        let mut free = FreeLists::new(num_levels);

        let head = arena.insert(total, 0);
        free.register(&mut arena, head);

        Ok(Registry {
            arena,
            free,
            head,
            total,
        })
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.free.num_levels()
    }

    #[inline]
    pub fn node(&self, slot: usize) -> &Node {
        self.arena.node(slot)
    }

    #[inline]
    pub fn resolve(&self, id: BlockId) -> Option<usize> {
        self.arena.resolve(id)
    }

    /// Returns a snapshot of the block in `slot`.
    pub fn block(&self, slot: usize) -> Block {
        let node = self.arena.node(slot);

        Block {
            id: BlockId {
                epoch: self.arena.epoch,
                slot,
                generation: node.generation,
            },
            size: node.size,
            offset: node.offset,
            free: node.free,
        }
    }

    #[inline]
    pub fn free_list(&self, level: u32) -> &FreeList {
        self.free.level(level)
    }

    #[inline]
    pub fn first_nonempty(&self, min_level: u32) -> Option<u32> {
        self.free.first_nonempty(min_level)
    }

    /// Iterates over all blocks in address order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut current = Some(self.head);

        core::iter::from_fn(move || {
            let slot = current?;
            current = self.arena.node(slot).next;
            Some(slot)
        })
    }

    /// Iterates over the free blocks of one size class, front to back.
    pub fn iter_free(&self, level: u32) -> impl Iterator<Item = usize> + '_ {
        self.free.level(level).iter(&self.arena)
    }

    /// Splits a block into two half-size free blocks.
    ///
    /// Both halves are appended to their free list, left half first. The
    /// original block's slot is released.
    ///
    /// # Panics
    ///
    /// Panics if the block has size 1.
    pub fn split(&mut self, slot: usize) -> (usize, usize) {
        let node = self.arena.node(slot);
        assert!(node.size > 1, "cannot split a block of size 1");

        if node.free {
            self.free.unregister(&mut self.arena, slot);
        }

        let node = self.arena.remove(slot);
        let half = node.size / 2;

        let left = self.arena.insert(half, node.offset);
        let right = self.arena.insert(half, node.offset + half);

        self.relink(node.prev, left, right, node.next);
        self.free.register(&mut self.arena, left);
        self.free.register(&mut self.arena, right);

        log::trace!(
            "split {:#x}+{:#x} into two {:#x} halves",
            node.offset,
            node.size,
            half
        );

        (left, right)
    }

    /// Merges two free buddies into one free block of twice the size.
    ///
    /// The merged block is appended to its free list.
    ///
    /// # Panics
    ///
    /// Panics unless `left` and `right` are free, equally sized, adjacent
    /// buddies with `left` at the lower address.
    pub fn merge(&mut self, left: usize, right: usize) -> usize {
        let (l, r) = (self.arena.node(left), self.arena.node(right));

        assert!(l.free && r.free, "merged blocks must be free");
        assert_eq!(l.size, r.size, "merged blocks must be the same size");
        assert_eq!(l.offset + l.size, r.offset, "merged blocks must be adjacent");
        assert_eq!(l.next, Some(right), "merged blocks must be neighbours");
        assert!(l.is_left(), "left block is a right buddy");
        assert!(!r.is_left(), "right block is a left buddy");

        self.free.unregister(&mut self.arena, left);
        self.free.unregister(&mut self.arena, right);

        let l = self.arena.remove(left);
        let r = self.arena.remove(right);

        let merged = self.arena.insert(l.size * 2, l.offset);
        self.relink(l.prev, merged, merged, r.next);
        self.free.register(&mut self.arena, merged);

        log::trace!("merged {:#x}+{:#x}", l.offset, l.size * 2);

        merged
    }

    /// Threads `first..=last` into address order between `prev` and `next`.
    fn relink(&mut self, prev: Option<usize>, first: usize, last: usize, next: Option<usize>) {
        if first != last {
            self.arena.node_mut(first).next = Some(last);
            self.arena.node_mut(last).prev = Some(first);
        }

        self.arena.node_mut(first).prev = prev;
        self.arena.node_mut(last).next = next;

        match prev {
            Some(p) => self.arena.node_mut(p).next = Some(first),
            None => self.head = first,
        }

        if let Some(n) = next {
            self.arena.node_mut(n).prev = Some(last);
        }
    }

    /// Takes a free block off its free list and assigns it to `group`.
    ///
    /// The block's handle generation is bumped, invalidating any earlier
    /// snapshot of it.
    pub fn mark_allocated(&mut self, slot: usize, group: GroupId) {
        assert!(self.arena.node(slot).free, "allocated block must be free");
        self.free.unregister(&mut self.arena, slot);

        let node = self.arena.node_mut(slot);
        node.free = false;
        node.group = Some(group);
        node.generation = node.generation.wrapping_add(1);
    }

    /// Releases an allocated block, appending it to its free list.
    pub fn mark_free(&mut self, slot: usize) {
        let node = self.arena.node_mut(slot);
        assert!(!node.free, "freed block must be allocated");
        node.free = true;
        node.group = None;

        self.free.register(&mut self.arena, slot);
    }

    /// Returns the address-adjacent buddy of a block, if one of the same size
    /// exists.
    ///
    /// For a left buddy this is the successor in address order; for a right
    /// buddy, the predecessor.
    pub fn buddy_of(&self, slot: usize) -> Option<usize> {
        let node = self.arena.node(slot);

        let buddy = if node.is_left() { node.next } else { node.prev }?;

        (self.arena.node(buddy).size == node.size).then_some(buddy)
    }

    /// Verifies the partition, alignment and free list invariants.
    pub fn check(&self) -> Result<(), InvariantViolation> {
        let mut expected = 0;
        let mut free_per_level = alloc::vec![0usize; self.num_levels()];
        let mut count = 0;

        for slot in self.iter() {
            let node = self.arena.node(slot);

            if node.offset != expected {
                return Err(InvariantViolation::Gap {
                    expected,
                    found: node.offset,
                });
            }

            if !node.size.is_power_of_two() || node.offset % node.size != 0 {
                return Err(InvariantViolation::Misaligned {
                    offset: node.offset,
                    size: node.size,
                });
            }

            if node.free {
                free_per_level[node.log_size() as usize] += 1;
            }

            expected = node.offset + node.size;
            count += 1;
        }

        if expected != self.total {
            return Err(InvariantViolation::Coverage { end: expected });
        }

        if count != self.arena.live() {
            return Err(InvariantViolation::Coverage { end: expected });
        }

        for (level, &num_free) in free_per_level.iter().enumerate() {
            let level = level as u32;
            let list = self.free.level(level);

            let consistent = list.len() == num_free
                && self.iter_free(level).count() == num_free
                && self.iter_free(level).all(|slot| {
                    let node = self.arena.node(slot);
                    node.free && node.log_size() == level
                });

            if !consistent {
                return Err(InvariantViolation::FreeList { level });
            }
        }

        Ok(())
    }
}
