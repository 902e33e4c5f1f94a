use std::fmt;

use tracing::error;

/// A generational entity handle. Packs a 1-based slot index and a generation into 64 bits.
///
/// Index 0 is reserved for [`Entity::NULL`], which doubles as the hierarchy root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Entity {
    /// The null handle. Never valid; used as the parent of top-level entities.
    pub const NULL: Entity = Entity {
        index: 0,
        generation: 0,
    };

    /// Create an entity from raw parts (mainly for testing).
    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The 1-based slot index of this entity.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The generation of this entity (incremented on reuse).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_null(&self) -> bool {
        self.index == 0
    }

    /// Pack into a single `u64`: generation in the high half, index in the low half.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    /// Zero-based position in slot-indexed tables. Must not be called on `NULL`.
    pub(crate) fn slot(self) -> usize {
        debug_assert!(!self.is_null(), "null entity has no slot");
        self.index as usize - 1
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Entity(null)")
        } else {
            write!(f, "Entity({}v{})", self.index, self.generation)
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    /// 1-based index of the next free slot, 0 terminates the list. Only meaningful when `empty`.
    next_free: u32,
    empty: bool,
}

const FREE_LIST_END: u32 = 0;

/// Hands out entity ids from an intrusive free list, bumping generations on reuse.
pub struct EntityIdList {
    slots: Vec<Slot>,
    free_head: u32,
    len: usize,
    max_slots: usize,
}

impl EntityIdList {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_slots(capacity, u32::MAX as usize - 1)
    }

    pub(crate) fn with_max_slots(capacity: usize, max_slots: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_head: FREE_LIST_END,
            len: 0,
            max_slots,
        }
    }

    /// Allocate an id, reusing the most recently freed slot if there is one.
    ///
    /// Returns [`Entity::NULL`] once the index space is exhausted.
    pub fn new_id(&mut self) -> Entity {
        if self.free_head == FREE_LIST_END {
            if self.slots.len() >= self.max_slots {
                error!("Entity id space exhausted ({} slots)", self.slots.len());
                return Entity::NULL;
            }
            self.slots.push(Slot {
                generation: 1,
                next_free: FREE_LIST_END,
                empty: false,
            });
            self.len += 1;
            return Entity {
                index: self.slots.len() as u32,
                generation: 1,
            };
        }

        let index = self.free_head;
        let slot = &mut self.slots[index as usize - 1];
        debug_assert!(slot.empty, "free list points at a live slot");
        self.free_head = slot.next_free;

        slot.generation = next_generation(slot.generation);
        slot.next_free = FREE_LIST_END;
        slot.empty = false;
        self.len += 1;

        Entity {
            index,
            generation: slot.generation,
        }
    }

    /// Whether `id` refers to a currently allocated slot with a matching generation.
    pub fn check(&self, id: Entity) -> bool {
        if id.is_null() || id.index as usize > self.slots.len() {
            return false;
        }
        let slot = &self.slots[id.index as usize - 1];
        !slot.empty && slot.generation == id.generation
    }

    /// Release `id`. The caller must have validated it with [`check`](Self::check).
    pub fn remove_id(&mut self, id: Entity) {
        debug_assert!(self.check(id), "removing invalid entity id {id:?}");
        let slot = &mut self.slots[id.slot()];
        slot.empty = true;
        slot.next_free = self.free_head;
        self.free_head = id.index;
        self.len -= 1;
    }

    /// Invalidate every id. Each slot gets a bumped generation and the free list is rebuilt
    /// in slot order.
    pub fn clear(&mut self) {
        let count = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.generation = next_generation(slot.generation);
            slot.empty = true;
            slot.next_free = if i + 1 < count {
                (i + 2) as u32
            } else {
                FREE_LIST_END
            };
        }
        self.free_head = if count > 0 { 1 } else { FREE_LIST_END };
        self.len = 0;
    }

    /// Number of live ids.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated (live or free).
    pub fn max_index(&self) -> usize {
        self.slots.len()
    }

    /// Iterate live ids in slot order. Double-ended, so `.rev()` walks backwards.
    pub fn iter(&self) -> Ids<'_> {
        Ids {
            slots: &self.slots,
            front: 0,
            back: self.slots.len(),
        }
    }
}

impl<'a> IntoIterator for &'a EntityIdList {
    type Item = Entity;
    type IntoIter = Ids<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

/// Iterator over the live ids of an [`EntityIdList`].
#[derive(Clone)]
pub struct Ids<'a> {
    slots: &'a [Slot],
    front: usize,
    back: usize,
}

impl Ids<'_> {
    fn entity_at(&self, pos: usize) -> Entity {
        Entity {
            index: pos as u32 + 1,
            generation: self.slots[pos].generation,
        }
    }
}

impl Iterator for Ids<'_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        while self.front < self.back {
            let pos = self.front;
            self.front += 1;
            if !self.slots[pos].empty {
                return Some(self.entity_at(pos));
            }
        }
        None
    }
}

impl DoubleEndedIterator for Ids<'_> {
    fn next_back(&mut self) -> Option<Entity> {
        while self.back > self.front {
            self.back -= 1;
            if !self.slots[self.back].empty {
                return Some(self.entity_at(self.back));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_sequential() {
        let mut ids = EntityIdList::new(4);
        let e0 = ids.new_id();
        let e1 = ids.new_id();
        assert_eq!(e0.index(), 1);
        assert_eq!(e1.index(), 2);
        assert_eq!(e0.generation(), 1);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn remove_and_reuse() {
        let mut ids = EntityIdList::new(4);
        let e0 = ids.new_id();
        ids.remove_id(e0);
        let reused = ids.new_id();
        assert_eq!(reused.index(), e0.index());
        assert_eq!(reused.generation(), 2);
        assert_ne!(e0, reused);
    }

    #[test]
    fn stale_id_fails_check() {
        let mut ids = EntityIdList::new(4);
        let e0 = ids.new_id();
        assert!(ids.check(e0));
        ids.remove_id(e0);
        assert!(!ids.check(e0));
        let e0_new = ids.new_id();
        assert!(ids.check(e0_new));
        assert!(!ids.check(e0));
    }

    #[test]
    fn null_and_out_of_range_fail_check() {
        let mut ids = EntityIdList::new(4);
        ids.new_id();
        assert!(!ids.check(Entity::NULL));
        assert!(!ids.check(Entity::from_raw(7, 1)));
    }

    #[test]
    fn free_list_is_lifo() {
        let mut ids = EntityIdList::new(4);
        let a = ids.new_id();
        let b = ids.new_id();
        let _c = ids.new_id();
        ids.remove_id(a);
        ids.remove_id(b);
        assert_eq!(ids.new_id().index(), b.index());
        assert_eq!(ids.new_id().index(), a.index());
        assert_eq!(ids.new_id().index(), 4);
    }

    #[test]
    fn generation_wraps_past_zero() {
        let mut ids = EntityIdList::new(1);
        let e = ids.new_id();
        ids.slots[0].generation = u32::MAX;
        ids.remove_id(Entity::from_raw(e.index(), u32::MAX));
        let reused = ids.new_id();
        assert_eq!(reused.generation(), 1);
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut ids = EntityIdList::with_max_slots(2, 2);
        assert!(!ids.new_id().is_null());
        assert!(!ids.new_id().is_null());
        assert!(ids.new_id().is_null());
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn clear_invalidates_and_relinks() {
        let mut ids = EntityIdList::new(4);
        let a = ids.new_id();
        let b = ids.new_id();
        let c = ids.new_id();
        ids.clear();
        assert!(ids.is_empty());
        assert!(!ids.check(a) && !ids.check(b) && !ids.check(c));

        let a2 = ids.new_id();
        let b2 = ids.new_id();
        // clear bumps once, reuse bumps again
        assert_eq!((a2.index(), a2.generation()), (1, 3));
        assert_eq!((b2.index(), b2.generation()), (2, 3));
        assert_eq!(ids.new_id().index(), 3);
        assert_eq!(ids.new_id().index(), 4);
    }

    #[test]
    fn iteration_skips_empty_slots_both_ways() {
        let mut ids = EntityIdList::new(4);
        let a = ids.new_id();
        let b = ids.new_id();
        let c = ids.new_id();
        ids.remove_id(b);

        let forward: Vec<_> = ids.iter().collect();
        assert_eq!(forward, vec![a, c]);
        let backward: Vec<_> = ids.iter().rev().collect();
        assert_eq!(backward, vec![c, a]);
    }

    #[test]
    fn bits_roundtrip() {
        let e = Entity::from_raw(42, 7);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
        assert_eq!(Entity::NULL.to_bits(), 0);
    }
}
