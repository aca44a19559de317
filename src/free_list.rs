//! Size-indexed lists of free blocks.

use alloc::vec::Vec;

use crate::registry::Arena;

/// A link in a free list.
///
/// This is embedded in each block's arena slot, forming an intrusive doubly
/// linked list. Links store slot indices rather than references, so a list can
/// be relinked while the arena is mutably borrowed.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct FreeLink {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

/// The free blocks of a single size class, in FIFO order.
#[derive(Clone, Debug, Default)]
pub(crate) struct FreeList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl FreeList {
    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends a block to the back of the list.
    pub fn push_back(&mut self, arena: &mut Arena, slot: usize) {
        let old_tail = self.tail;

        *arena.link_mut(slot) = FreeLink {
            prev: old_tail,
            next: None,
        };

        match old_tail {
            // Link the old tail forward to the new one.
            Some(t) => arena.link_mut(t).next = Some(slot),

            // An empty list gains its first element.
            None => self.head = Some(slot),
        }

        self.tail = Some(slot);
        self.len += 1;
    }

    /// Removes the specified block from the list.
    ///
    /// `slot` must be an element of this list.
    pub fn remove(&mut self, arena: &mut Arena, slot: usize) {
        let removed = *arena.link_mut(slot);

        match removed.prev {
            // Link `prev` forward to `next`.
            Some(p) => arena.link_mut(p).next = removed.next,

            // If there's no previous block, then `removed` is the head.
            None => {
                debug_assert_eq!(self.head, Some(slot));
                self.head = removed.next;
            }
        }

        match removed.next {
            // Link `next` back to `prev`.
            Some(n) => arena.link_mut(n).prev = removed.prev,
            None => {
                debug_assert_eq!(self.tail, Some(slot));
                self.tail = removed.prev;
            }
        }

        *arena.link_mut(slot) = FreeLink::default();
        self.len -= 1;
    }

    /// Iterates over the slots in the list from front to back.
    pub fn iter<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = usize> + 'a {
        let mut current = self.head;

        core::iter::from_fn(move || {
            let slot = current?;
            current = arena.link(slot).next;
            Some(slot)
        })
    }
}

/// One [`FreeList`] per size class, indexed by the base-2 logarithm of the
/// block size.
#[derive(Clone, Debug)]
pub(crate) struct FreeLists {
    levels: Vec<FreeList>,
}

impl FreeLists {
    pub fn new(num_levels: usize) -> FreeLists {
        FreeLists {
            levels: (0..num_levels).map(|_| FreeList::default()).collect(),
        }
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn level(&self, level: u32) -> &FreeList {
        &self.levels[level as usize]
    }

    /// Appends a free block to the list for its size class.
    pub fn register(&mut self, arena: &mut Arena, slot: usize) {
        let level = arena.node(slot).log_size();
        self.levels[level as usize].push_back(arena, slot);
    }

    /// Removes a free block from the list for its size class.
    pub fn unregister(&mut self, arena: &mut Arena, slot: usize) {
        let level = arena.node(slot).log_size();
        self.levels[level as usize].remove(arena, slot);
    }

    /// Finds the smallest size class of at least `min_level` with a free block.
    pub fn first_nonempty(&self, min_level: u32) -> Option<u32> {
        (min_level as usize..self.levels.len())
            .find(|&level| !self.levels[level].is_empty())
            .map(|level| level as u32)
    }
}
