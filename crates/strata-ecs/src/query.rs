use std::any::{type_name, TypeId};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::archetype::{Archetype, ArchetypeId, ArchetypeKey};
use crate::component::Component;
use crate::entity::Entity;
use crate::world::{World, WorldId};

/// Describes which columns a query reads or writes, and how a row of them becomes an item.
///
/// Implemented for `&T`, `&mut T`, `Option<&T>` and tuples of up to eight of those.
///
/// # Safety
/// The reported type ids must cover every column `fetch` touches, and `fetch` may only return
/// pointers into columns of those types.
pub unsafe trait WorldQuery {
    type Item<'w>;

    /// Raw column base pointers resolved for one archetype.
    type Fetch: Copy;

    /// Types an archetype must contain to match.
    fn required_type_ids() -> Vec<TypeId>;

    /// Types read when present. They do not affect matching.
    fn optional_type_ids() -> Vec<TypeId>;

    /// Column pointers of `archetype`, or `None` when a required column is missing.
    fn fetch(archetype: &mut Archetype) -> Option<Self::Fetch>;

    /// Item at `row` of the columns behind `fetch`.
    ///
    /// # Safety
    /// No structural change may happen to the archetype between `fetch` and this call. `row`
    /// must be below its length, and no other live item may alias a `&mut` column at `row`.
    unsafe fn item<'w>(fetch: Self::Fetch, row: usize) -> Self::Item<'w>;
}

// ---- Shared column ----

unsafe impl<T: Component> WorldQuery for &T {
    type Item<'w> = &'w T;
    type Fetch = *const T;

    fn required_type_ids() -> Vec<TypeId> {
        vec![TypeId::of::<T>()]
    }

    fn optional_type_ids() -> Vec<TypeId> {
        vec![]
    }

    fn fetch(archetype: &mut Archetype) -> Option<Self::Fetch> {
        Some(archetype.column_mut::<T>()?.as_mut_ptr() as *const T)
    }

    unsafe fn item<'w>(fetch: Self::Fetch, row: usize) -> Self::Item<'w> {
        &*fetch.add(row)
    }
}

// ---- Exclusive column ----

unsafe impl<T: Component> WorldQuery for &mut T {
    type Item<'w> = &'w mut T;
    type Fetch = *mut T;

    fn required_type_ids() -> Vec<TypeId> {
        vec![TypeId::of::<T>()]
    }

    fn optional_type_ids() -> Vec<TypeId> {
        vec![]
    }

    fn fetch(archetype: &mut Archetype) -> Option<Self::Fetch> {
        Some(archetype.column_mut::<T>()?.as_mut_ptr())
    }

    unsafe fn item<'w>(fetch: Self::Fetch, row: usize) -> Self::Item<'w> {
        &mut *fetch.add(row)
    }
}

// ---- Column that may be absent ----

unsafe impl<T: Component> WorldQuery for Option<&T> {
    type Item<'w> = Option<&'w T>;
    type Fetch = Option<*const T>;

    fn required_type_ids() -> Vec<TypeId> {
        vec![]
    }

    fn optional_type_ids() -> Vec<TypeId> {
        vec![TypeId::of::<T>()]
    }

    fn fetch(archetype: &mut Archetype) -> Option<Self::Fetch> {
        Some(
            archetype
                .column_mut::<T>()
                .map(|column| column.as_mut_ptr() as *const T),
        )
    }

    unsafe fn item<'w>(fetch: Self::Fetch, row: usize) -> Self::Item<'w> {
        fetch.map(|ptr| &*ptr.add(row))
    }
}

// ---- Tuples: fetch every member, fail if any required column is missing ----

macro_rules! impl_world_query_tuple {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        unsafe impl<$($name: WorldQuery),+> WorldQuery for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);
            type Fetch = ($($name::Fetch,)+);

            fn required_type_ids() -> Vec<TypeId> {
                let mut ids = Vec::new();
                $(ids.extend($name::required_type_ids());)+
                ids
            }

            fn optional_type_ids() -> Vec<TypeId> {
                let mut ids = Vec::new();
                $(ids.extend($name::optional_type_ids());)+
                ids
            }

            fn fetch(archetype: &mut Archetype) -> Option<Self::Fetch> {
                Some(($($name::fetch(archetype)?,)+))
            }

            unsafe fn item<'w>(fetch: Self::Fetch, row: usize) -> Self::Item<'w> {
                let ($($name,)+) = fetch;
                ($(<$name as WorldQuery>::item($name, row),)+)
            }
        }
    };
}

impl_world_query_tuple!(A);
impl_world_query_tuple!(A, B);
impl_world_query_tuple!(A, B, C);
impl_world_query_tuple!(A, B, C, D);
impl_world_query_tuple!(A, B, C, D, E);
impl_world_query_tuple!(A, B, C, D, E, F);
impl_world_query_tuple!(A, B, C, D, E, F, G);
impl_world_query_tuple!(A, B, C, D, E, F, G, H);

/// Live list of archetypes whose key contains a required type set.
///
/// Shared by every query over the same types; the world appends new matches as
/// archetypes are created.
#[derive(Debug)]
pub struct QueryArchetypes {
    key: ArchetypeKey,
    archetypes: Vec<ArchetypeId>,
}

impl QueryArchetypes {
    pub(crate) fn new(key: ArchetypeKey, archetypes: Vec<ArchetypeId>) -> Self {
        Self { key, archetypes }
    }

    pub fn key(&self) -> &ArchetypeKey {
        &self.key
    }

    pub fn archetypes(&self) -> &[ArchetypeId] {
        &self.archetypes
    }

    /// Record `archetype` if its key is a superset of ours.
    pub(crate) fn on_new_archetype(&mut self, id: ArchetypeId, key: &ArchetypeKey) {
        if self.key.is_subset_of(key) {
            self.archetypes.push(id);
        }
    }
}

/// One matched row: the entity plus its query items.
pub struct Bundle<'a, Q: WorldQuery> {
    entity: Entity,
    item: Q::Item<'a>,
}

impl<'a, Q: WorldQuery> Bundle<'a, Q> {
    pub(crate) fn new(entity: Entity, item: Q::Item<'a>) -> Self {
        Self { entity, item }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn into_inner(self) -> Q::Item<'a> {
        self.item
    }
}

impl<'a, Q: WorldQuery> Deref for Bundle<'a, Q> {
    type Target = Q::Item<'a>;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<Q: WorldQuery> DerefMut for Bundle<'_, Q> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.item
    }
}

/// A typed view over every entity carrying the components of `Q`.
///
/// Built by [`World::query`]. Cheap to clone; clones share one archetype cache.
pub struct Query<Q: WorldQuery> {
    archetypes: Arc<RwLock<QueryArchetypes>>,
    world_id: WorldId,
    _marker: PhantomData<fn() -> Q>,
}

impl<Q: WorldQuery> Clone for Query<Q> {
    fn clone(&self) -> Self {
        Self {
            archetypes: Arc::clone(&self.archetypes),
            world_id: self.world_id,
            _marker: PhantomData,
        }
    }
}

impl<Q: WorldQuery> Query<Q> {
    pub(crate) fn new(archetypes: Arc<RwLock<QueryArchetypes>>, world_id: WorldId) -> Self {
        Self {
            archetypes,
            world_id,
            _marker: PhantomData,
        }
    }

    /// Sorted set of required component types.
    pub fn key(&self) -> ArchetypeKey {
        self.archetypes.read().key.clone()
    }

    /// Visit every matching row, in archetype creation order then row order.
    pub fn each<'w>(&self, world: &'w mut World, mut f: impl FnMut(Q::Item<'w>)) {
        self.each_entity(world, |_, item| f(item));
    }

    /// Like [`each`](Self::each) but also passes the entity.
    pub fn each_entity<'w>(&self, world: &'w mut World, mut f: impl FnMut(Entity, Q::Item<'w>)) {
        let ids = self.snapshot(world);
        let archetypes = world.archetypes_mut();
        for id in ids {
            let archetype = &mut archetypes[id.index()];
            let Some(fetch) = Q::fetch(archetype) else {
                continue;
            };
            for (row, &entity) in archetype.entities().iter().enumerate() {
                // Safety: each row is visited once and `world` stays borrowed for 'w.
                f(entity, unsafe { Q::item(fetch, row) });
            }
        }
    }

    /// Visit every unordered pair of distinct matching rows exactly once, including pairs that
    /// span two archetypes.
    pub fn pairs(&self, world: &mut World, mut f: impl for<'a> FnMut(Bundle<'a, Q>, Bundle<'a, Q>)) {
        let ids = self.snapshot(world);
        let archetypes = world.archetypes_mut();

        let mut rows: Vec<(Q::Fetch, usize, Entity)> = Vec::new();
        for id in ids {
            let archetype = &mut archetypes[id.index()];
            let Some(fetch) = Q::fetch(archetype) else {
                continue;
            };
            rows.extend(
                archetype
                    .entities()
                    .iter()
                    .enumerate()
                    .map(|(row, &entity)| (fetch, row, entity)),
            );
        }

        for i in 0..rows.len() {
            for j in i + 1..rows.len() {
                let (fetch_a, row_a, entity_a) = rows[i];
                let (fetch_b, row_b, entity_b) = rows[j];
                // Safety: i != j so the two items never share a row, and both live only for
                // the duration of the call.
                let (a, b) = unsafe { (Q::item(fetch_a, row_a), Q::item(fetch_b, row_b)) };
                f(Bundle::new(entity_a, a), Bundle::new(entity_b, b));
            }
        }
    }

    /// The items of `entity`, if it exists and matches.
    pub fn get<'w>(&self, world: &'w mut World, entity: Entity) -> Option<Q::Item<'w>> {
        self.check_world(world);
        let location = world.location(entity)?;
        let archetype = &mut world.archetypes_mut()[location.archetype.index()];
        let fetch = Q::fetch(archetype)?;
        // Safety: a single row is handed out while `world` is borrowed for 'w.
        Some(unsafe { Q::item(fetch, location.row) })
    }

    /// Number of matching rows.
    pub fn len(&self, world: &World) -> usize {
        self.check_world(world);
        self.archetypes
            .read()
            .archetypes
            .iter()
            .map(|id| world.archetype(*id).len())
            .sum()
    }

    pub fn is_empty(&self, world: &World) -> bool {
        self.len(world) == 0
    }

    fn snapshot(&self, world: &World) -> Vec<ArchetypeId> {
        self.check_world(world);
        self.archetypes.read().archetypes.clone()
    }

    fn check_world(&self, world: &World) {
        assert_eq!(
            self.world_id,
            world.id(),
            "Query<{}> used with a world that did not create it",
            type_name::<Q>()
        );
    }
}
