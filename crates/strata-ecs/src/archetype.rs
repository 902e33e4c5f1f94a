//! Column storage for entities sharing an exact set of component types.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use crate::component::{ComponentVector, UntypedComponentVector};
use crate::entity::Entity;

/// Index of an archetype in the world's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    /// The archetype with no components. Always present, every new entity starts there.
    pub const EMPTY: ArchetypeId = ArchetypeId(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sorted, de-duplicated set of component types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ArchetypeKey(Vec<TypeId>);

impl ArchetypeKey {
    pub fn new(types: impl IntoIterator<Item = TypeId>) -> Self {
        let mut types: Vec<TypeId> = types.into_iter().collect();
        types.sort_unstable();
        types.dedup();
        Self(types)
    }

    pub fn contains(&self, ty: TypeId) -> bool {
        self.0.binary_search(&ty).is_ok()
    }

    pub fn with(&self, ty: TypeId) -> Self {
        let mut types = self.0.clone();
        if let Err(pos) = types.binary_search(&ty) {
            types.insert(pos, ty);
        }
        Self(types)
    }

    pub fn without(&self, ty: TypeId) -> Self {
        let mut types = self.0.clone();
        if let Ok(pos) = types.binary_search(&ty) {
            types.remove(pos);
        }
        Self(types)
    }

    /// Whether every type in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &ArchetypeKey) -> bool {
        let mut theirs = other.0.iter();
        self.0.iter().all(|ty| theirs.any(|t| t == ty))
    }

    pub fn union(&self, other: &ArchetypeKey) -> Self {
        Self::new(self.0.iter().chain(other.0.iter()).copied())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.0.iter().copied()
    }
}

/// Result of relocating a row out of an archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Moved {
    /// Row of the entity in its new archetype.
    pub row: usize,
    /// Entity that was swapped into the vacated source row, if any.
    pub relocated: Option<Entity>,
}

pub struct Archetype {
    id: ArchetypeId,
    key: ArchetypeKey,
    columns: BTreeMap<TypeId, Box<dyn UntypedComponentVector>>,
    entities: Vec<Entity>,
    add_edges: HashMap<TypeId, ArchetypeId>,
    remove_edges: HashMap<TypeId, ArchetypeId>,
}

impl Archetype {
    pub(crate) fn new(
        id: ArchetypeId,
        columns: impl IntoIterator<Item = (TypeId, Box<dyn UntypedComponentVector>)>,
    ) -> Self {
        let columns: BTreeMap<_, _> = columns.into_iter().collect();
        Self {
            id,
            key: ArchetypeKey::new(columns.keys().copied()),
            columns,
            entities: Vec::new(),
            add_edges: HashMap::new(),
            remove_edges: HashMap::new(),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn key(&self) -> &ArchetypeKey {
        &self.key
    }

    /// Row count.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity ids in row order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn has(&self, ty: TypeId) -> bool {
        self.columns.contains_key(&ty)
    }

    pub fn column<T: 'static>(&self) -> Option<&ComponentVector<T>> {
        self.columns.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }

    pub fn column_mut<T: 'static>(&mut self) -> Option<&mut ComponentVector<T>> {
        self.columns.get_mut(&TypeId::of::<T>())?.downcast_mut::<T>()
    }

    pub(crate) fn column_untyped_mut(
        &mut self,
        ty: TypeId,
    ) -> Option<&mut dyn UntypedComponentVector> {
        Some(self.columns.get_mut(&ty)?.as_mut())
    }

    /// Append an entity id whose column values have already been pushed. Returns its row.
    pub(crate) fn push_entity(&mut self, entity: Entity) -> usize {
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Drop every component at `row` and swap the last row into its place.
    ///
    /// Returns the entity that now occupies `row`, if one was moved.
    pub(crate) fn remove_row(&mut self, row: usize) -> Option<Entity> {
        debug_assert!(row < self.entities.len(), "row {row} out of range");
        for column in self.columns.values_mut() {
            column.remove(row);
        }
        self.entities.swap_remove(row);
        self.debug_check();
        self.entities.get(row).copied()
    }

    /// Move the entity at `row` into `dst`.
    ///
    /// Columns shared with `dst` are moved across. Columns `dst` lacks are handed to
    /// `on_dropped` with the row, which must remove that element. Columns only `dst` has are
    /// left one element short; the caller fills them immediately.
    pub(crate) fn move_row(
        &mut self,
        dst: &mut Archetype,
        row: usize,
        mut on_dropped: impl FnMut(&mut dyn UntypedComponentVector, usize),
    ) -> Moved {
        debug_assert!(row < self.entities.len(), "row {row} out of range");
        for (ty, column) in self.columns.iter_mut() {
            match dst.columns.get_mut(ty) {
                Some(target) => target.move_from(column.as_mut(), row),
                None => on_dropped(column.as_mut(), row),
            }
        }

        let entity = self.entities.swap_remove(row);
        let new_row = dst.push_entity(entity);
        self.debug_check();

        Moved {
            row: new_row,
            relocated: self.entities.get(row).copied(),
        }
    }

    pub(crate) fn clear(&mut self) {
        for column in self.columns.values_mut() {
            column.clear();
        }
        self.entities.clear();
    }

    // ---- Graph edges ----

    pub(crate) fn add_edge(&self, ty: TypeId) -> Option<ArchetypeId> {
        self.add_edges.get(&ty).copied()
    }

    pub(crate) fn remove_edge(&self, ty: TypeId) -> Option<ArchetypeId> {
        self.remove_edges.get(&ty).copied()
    }

    pub(crate) fn set_add_edge(&mut self, ty: TypeId, target: ArchetypeId) {
        self.add_edges.insert(ty, target);
    }

    pub(crate) fn set_remove_edge(&mut self, ty: TypeId, target: ArchetypeId) {
        self.remove_edges.insert(ty, target);
    }

    /// Assert that every column has one element per row.
    pub(crate) fn debug_check(&self) {
        if cfg!(debug_assertions) {
            for column in self.columns.values() {
                assert_eq!(
                    column.len(),
                    self.entities.len(),
                    "column {} out of step with archetype {:?}",
                    column.type_name(),
                    self.id
                );
            }
        }
    }
}

/// Borrow two distinct archetypes of the arena mutably.
pub(crate) fn pair_mut(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    let (a, b) = (a.index(), b.index());
    assert_ne!(a, b, "archetype pair must be distinct");
    if a < b {
        let (lo, hi) = archetypes.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = archetypes.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}
