//! Typed index arena for code-cache nodes.
//!
//! Patch nodes (compile-time, per instruction) and hash nodes (run-time,
//! per externally reachable address) share one arena. A patch slot is
//! converted in place into a hash slot when its instruction turns out to be
//! referenced, and the remaining patch slots are truncated away.
//!
//! Nodes refer to each other by [`Id`], never by reference, so compaction
//! only has to rewrite indices.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Node handle
// =============================================================================

/// Index of a `T` inside an [`Arena<T>`].
///
/// `Copy` and `Eq` for every `T`, hence the manual impls.
pub struct Id<T> {
    slot: u32,
    _node: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    /// End of a hash chain or an empty bucket.
    pub const INVALID: Self = Id::new(u32::MAX);

    #[inline]
    pub const fn new(slot: u32) -> Self {
        Id {
            slot,
            _node: PhantomData,
        }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.slot
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.slot != u32::MAX
    }

    #[inline]
    fn slot(self) -> usize {
        self.slot as usize
    }
}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.is_valid() {
            true => write!(f, "node {}", self.slot),
            false => f.write_str("no node"),
        }
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Node storage; allocation order is slot order.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<T>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            slots: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn alloc(&mut self, node: T) -> Id<T> {
        let id = self.next_id();
        self.slots.push(node);
        id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The handle the next [`alloc`](Self::alloc) returns.
    #[inline]
    pub fn next_id(&self) -> Id<T> {
        Id::new(self.slots.len() as u32)
    }

    /// Forget `id` and everything allocated after it. Undoes a partially
    /// compiled instruction.
    #[inline]
    pub fn truncate(&mut self, id: Id<T>) {
        self.slots.truncate(id.slot());
    }

    /// Nodes from `start` on, for converting patch nodes in place.
    #[inline]
    pub fn tail_mut(&mut self, start: Id<T>) -> &mut [T] {
        &mut self.slots[start.slot()..]
    }

    /// Drop the nodes `keep` rejects. Survivors keep their relative order
    /// but move down, so every stored `Id` must be rebuilt afterwards.
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.slots.retain(keep);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &T {
        &self.slots[id.slot()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.slots[id.slot()]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_hands_out_sequential_ids() {
        let mut arena: Arena<u32> = Arena::new();
        let a = arena.alloc(10);
        let b = arena.alloc(20);
        assert_eq!(a, Id::new(0));
        assert_eq!(b, Id::new(1));
        arena[b] = 21;
        assert_eq!(arena[b], 21);
        assert_eq!(arena.next_id(), Id::new(2));
    }

    #[test]
    fn test_truncate_rolls_back() {
        let mut arena: Arena<u32> = Arena::new();
        arena.alloc(1);
        let mark = arena.next_id();
        arena.alloc(2);
        arena.alloc(3);
        arena.truncate(mark);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.next_id(), mark);
    }

    #[test]
    fn test_tail_mut_rewrites_in_place() {
        let mut arena: Arena<u32> = Arena::new();
        arena.alloc(1);
        let start = arena.alloc(2);
        arena.alloc(3);
        arena.tail_mut(start).iter_mut().for_each(|v| *v *= 10);
        assert_eq!(arena[Id::new(0)], 1);
        assert_eq!(arena[Id::new(2)], 30);
    }

    #[test]
    fn test_retain_compacts_in_order() {
        let mut arena: Arena<u32> = Arena::new();
        for value in 0..5 {
            arena.alloc(value);
        }
        arena.retain(|&v| v % 2 == 0);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena[Id::new(1)], 2);
        assert_eq!(arena[Id::new(2)], 4);
    }

    #[test]
    fn test_invalid_id() {
        let id: Id<u32> = Id::INVALID;
        assert!(!id.is_valid());
        assert!(Id::<u32>::new(3).is_valid());
        assert_eq!(format!("{:?}", id), "no node");
    }
}
