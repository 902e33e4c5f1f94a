use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::archetype::{pair_mut, Archetype, ArchetypeId, ArchetypeKey, Moved};
use crate::component::Component;
use crate::config::WorldConfig;
use crate::entity::{Entity, EntityIdList, Ids};
use crate::entity_mut::EntityMut;
use crate::error::{EcsError, EcsResult};
use crate::prefab::{Prefab, PrefabBuilder, PrefabId, PrefabTable};
use crate::query::{Bundle, Query, QueryArchetypes, WorldQuery};
use crate::relationship::{Children, RelationshipManager};
use crate::signal::{
    ComponentRegistration, OnAddChild, OnRemoveChild, SignalHandlerVector, UntypedComponent,
    UntypedSignalVector,
};

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`World`]. Queries and prefabs remember the world that made them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldId(u64);

/// Where an entity's components live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

type DeferredApply = Box<dyn FnOnce(&mut World) + Send>;

/// The central ECS container. Owns all entities, archetypes, handlers and prefabs.
pub struct World {
    id: WorldId,
    config: WorldConfig,

    entities: EntityIdList,
    locations: Vec<EntityLocation>,
    relationships: RelationshipManager,

    archetypes: Vec<Archetype>,
    archetype_index: HashMap<ArchetypeKey, ArchetypeId>,
    query_archetypes: Vec<Weak<RwLock<QueryArchetypes>>>,

    components: Vec<Box<dyn UntypedComponent>>,
    component_index: HashMap<TypeId, usize>,
    signals: Vec<Box<dyn UntypedSignalVector>>,
    signal_index: HashMap<TypeId, usize>,

    prefabs: Arc<Mutex<PrefabTable>>,

    defer_count: u32,
    remove_defer_count: u32,
    signal_defer_count: u32,
    deferred_removals: Vec<Entity>,
    deferred_applies: Vec<(Entity, DeferredApply)>,
    deferred_instantiations: Vec<(Prefab, Entity)>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let config = config.sanitized();
        let id = WorldId(NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed));
        let mut archetype_index = HashMap::new();
        archetype_index.insert(ArchetypeKey::default(), ArchetypeId::EMPTY);

        Self {
            id,
            entities: EntityIdList::new(config.entity_capacity),
            locations: Vec::with_capacity(config.entity_capacity),
            relationships: RelationshipManager::new(config.entity_capacity),
            archetypes: vec![Archetype::new(ArchetypeId::EMPTY, Vec::new())],
            archetype_index,
            query_archetypes: Vec::new(),
            components: Vec::new(),
            component_index: HashMap::new(),
            signals: Vec::new(),
            signal_index: HashMap::new(),
            prefabs: Arc::new(Mutex::new(PrefabTable::new())),
            defer_count: 0,
            remove_defer_count: 0,
            signal_defer_count: 0,
            deferred_removals: Vec::new(),
            deferred_applies: Vec::new(),
            deferred_instantiations: Vec::new(),
            config,
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // ---- Component registration ----

    /// Register `T` under its Rust type name.
    pub fn register<T: Component>(&mut self) -> EcsResult<()> {
        self.register_named::<T>(type_name::<T>())
    }

    /// Register `T` so entities may carry it. Must happen before first use.
    pub fn register_named<T: Component>(&mut self, name: &'static str) -> EcsResult<()> {
        let ty = TypeId::of::<T>();
        if self.component_index.contains_key(&ty) {
            error!("Component {} is already registered", name);
            return Err(EcsError::DuplicateRegistration(name));
        }
        self.component_index.insert(ty, self.components.len());
        self.components
            .push(Box::new(ComponentRegistration::<T>::new(name)));
        debug!("Registered component {}", name);
        Ok(())
    }

    pub fn is_registered<T: Component>(&self) -> bool {
        self.is_registered_type(TypeId::of::<T>())
    }

    pub(crate) fn is_registered_type(&self, ty: TypeId) -> bool {
        self.component_index.contains_key(&ty)
    }

    fn registration<T: Component>(&mut self) -> Option<&mut ComponentRegistration<T>> {
        let index = *self.component_index.get(&TypeId::of::<T>())?;
        let registration = self.components[index]
            .as_any_mut()
            .downcast_mut::<ComponentRegistration<T>>()
            .expect("component registration type mismatch");
        Some(registration)
    }

    fn registration_or_err<T: Component>(&mut self) -> EcsResult<&mut ComponentRegistration<T>> {
        match self.registration::<T>() {
            Some(registration) => Ok(registration),
            None => {
                error!("Component {} was never registered", type_name::<T>());
                Err(EcsError::UnregisteredComponent(type_name::<T>()))
            }
        }
    }

    fn component_name(&self, ty: TypeId) -> &'static str {
        self.component_index
            .get(&ty)
            .map_or("<unregistered>", |&index| self.components[index].name())
    }

    /// Call `handler` whenever a `T` is placed on an entity.
    pub fn on_insert<T: Component>(
        &mut self,
        handler: impl Fn(&mut World, Entity) + Send + Sync + 'static,
    ) -> EcsResult<()> {
        self.registration_or_err::<T>()?
            .add_insert_handler(Arc::new(handler));
        Ok(())
    }

    /// Call `handler` with the removed value whenever a `T` is erased from an entity.
    pub fn on_remove<T: Component>(
        &mut self,
        handler: impl Fn(&mut World, Entity, &T) + Send + Sync + 'static,
    ) -> EcsResult<()> {
        self.registration_or_err::<T>()?
            .add_remove_handler(Arc::new(handler));
        Ok(())
    }

    // ---- Entity management ----

    /// Create an empty entity under `parent` (`Entity::NULL` for the root).
    ///
    /// Returns `Entity::NULL` if `parent` is invalid or ids are exhausted.
    pub fn create(&mut self, parent: Entity) -> Entity {
        if !parent.is_null() && !self.entities.check(parent) {
            warn!("Cannot create child of invalid entity {:?}", parent);
            return Entity::NULL;
        }
        let entity = self.entities.new_id();
        if entity.is_null() {
            return Entity::NULL;
        }

        let row = self.archetypes[ArchetypeId::EMPTY.index()].push_entity(entity);
        let location = EntityLocation {
            archetype: ArchetypeId::EMPTY,
            row,
        };
        let slot = entity.slot();
        debug_assert!(slot <= self.locations.len());
        if slot == self.locations.len() {
            self.locations.push(location);
        } else {
            self.locations[slot] = location;
        }
        self.relationships.add(entity, parent);

        if !parent.is_null() {
            let _ = self.raise(parent, OnAddChild { child: entity });
        }
        entity
    }

    /// Remove an entity and all of its descendants. Deferred while the world is deferring
    /// removals.
    pub fn remove(&mut self, entity: Entity) -> EcsResult<()> {
        self.check_entity(entity)?;
        if self.remove_defer_count > 0 {
            self.deferred_removals.push(entity);
        } else {
            self.remove_internal(entity, true);
        }
        Ok(())
    }

    fn remove_internal(&mut self, entity: Entity, update_parent: bool) {
        if update_parent {
            let parent = self.relationships.parent(entity);
            if !parent.is_null() {
                let _ = self.raise(parent, OnRemoveChild { child: entity });
                if !self.exists(entity) {
                    return;
                }
            }
        }

        let mut child = self.relationships.first_child(entity);
        while !child.is_null() {
            let next = self.relationships.next(child);
            self.remove_internal(child, false);
            child = next;
        }

        self.relationships.remove(entity, update_parent);

        let location = self.locations[entity.slot()];
        if let Some(relocated) = self.archetypes[location.archetype.index()].remove_row(location.row)
        {
            self.locations[relocated.slot()].row = location.row;
        }
        self.entities.remove_id(entity);
        trace!("Removed entity {:?}", entity);
    }

    /// Remove every entity. Archetypes and query caches survive, empty.
    pub fn clear(&mut self) {
        assert!(
            self.defer_count == 0 && self.remove_defer_count == 0,
            "World::clear called while deferring"
        );
        for archetype in &mut self.archetypes {
            archetype.clear();
        }
        self.relationships.reset();
        self.entities.clear();
        debug!("Cleared world {:?}", self.id);
    }

    /// Move `entity` under `parent` (`Entity::NULL` for the root).
    pub fn reparent(&mut self, entity: Entity, parent: Entity) -> EcsResult<()> {
        self.check_entity(entity)?;
        if !parent.is_null() {
            self.check_entity(parent)?;
            if self.relationships.is_ancestor(entity, parent) {
                error!("Cannot move {:?} under its own descendant {:?}", entity, parent);
                return Err(EcsError::CyclicParent { entity, parent });
            }
        }

        let old_parent = self.relationships.parent(entity);
        if !old_parent.is_null() {
            let _ = self.raise(old_parent, OnRemoveChild { child: entity });
            self.check_entity(entity)?;
            if !parent.is_null() {
                self.check_entity(parent)?;
            }
        }

        self.relationships.remove_from_parent(entity);
        self.relationships.set_parent(entity, parent);

        if !parent.is_null() {
            let _ = self.raise(parent, OnAddChild { child: entity });
        }
        Ok(())
    }

    /// Check whether an entity exists.
    pub fn exists(&self, entity: Entity) -> bool {
        self.entities.check(entity)
    }

    fn check_entity(&self, entity: Entity) -> EcsResult<()> {
        if self.entities.check(entity) {
            Ok(())
        } else {
            warn!("Entity {:?} does not exist", entity);
            Err(EcsError::InvalidEntity(entity))
        }
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Live entities in slot order.
    pub fn iter(&self) -> Ids<'_> {
        self.entities.iter()
    }

    /// Handle for chained operations on one entity.
    pub fn entity(&mut self, entity: Entity) -> EntityMut<'_> {
        EntityMut::new(self, entity)
    }

    /// The parent of `entity`, or `None` for top-level and invalid entities.
    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        if !self.exists(entity) {
            warn!("Entity {:?} does not exist", entity);
            return None;
        }
        let parent = self.relationships.parent(entity);
        (!parent.is_null()).then_some(parent)
    }

    /// Direct children of `entity`, most recently attached first.
    pub fn children(&self, entity: Entity) -> Children<'_> {
        if !self.exists(entity) {
            warn!("Entity {:?} does not exist", entity);
            return self.relationships.no_children();
        }
        self.relationships.children(entity)
    }

    /// Top-level entities.
    pub fn root(&self) -> Children<'_> {
        self.relationships.children(Entity::NULL)
    }

    // ---- Archetypes ----

    pub(crate) fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.exists(entity).then(|| self.locations[entity.slot()])
    }

    /// Like `location`, but warns about stale handles.
    fn checked_location(&self, entity: Entity) -> Option<EntityLocation> {
        let location = self.location(entity);
        if location.is_none() {
            warn!("Entity {:?} does not exist", entity);
        }
        location
    }

    /// Component set of the archetype `entity` currently lives in.
    pub fn archetype_key(&self, entity: Entity) -> Option<&ArchetypeKey> {
        let location = self.location(entity)?;
        Some(self.archetypes[location.archetype.index()].key())
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    pub(crate) fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    pub(crate) fn archetypes_mut(&mut self) -> &mut [Archetype] {
        &mut self.archetypes
    }

    /// Exact-key lookup, building and announcing a new archetype on a miss.
    fn find_archetype(&mut self, key: ArchetypeKey) -> ArchetypeId {
        if let Some(&id) = self.archetype_index.get(&key) {
            return id;
        }

        let mut names = Vec::with_capacity(key.len());
        let mut columns = Vec::with_capacity(key.len());
        for ty in key.iter() {
            let Some(&index) = self.component_index.get(&ty) else {
                panic!("component {ty:?} reached archetype construction without registration");
            };
            let registration = &self.components[index];
            names.push(registration.name());
            columns.push((
                ty,
                registration.make_vector(self.config.column_capacity, self.config.growth_factor),
            ));
        }

        let id = ArchetypeId(self.archetypes.len() as u32);
        self.archetypes.push(Archetype::new(id, columns));
        debug!("Created archetype {:?} {:?}", id, names);

        self.cleanup_query_archetypes();
        for cache in &self.query_archetypes {
            if let Some(cache) = cache.upgrade() {
                cache.write().on_new_archetype(id, &key);
            }
        }
        self.archetype_index.insert(key, id);
        id
    }

    fn add_target(&mut self, from: ArchetypeId, ty: TypeId) -> ArchetypeId {
        if let Some(to) = self.archetypes[from.index()].add_edge(ty) {
            return to;
        }
        let key = self.archetypes[from.index()].key().with(ty);
        let to = self.find_archetype(key);
        self.archetypes[from.index()].set_add_edge(ty, to);
        self.archetypes[to.index()].set_remove_edge(ty, from);
        to
    }

    fn remove_target(&mut self, from: ArchetypeId, ty: TypeId) -> ArchetypeId {
        if let Some(to) = self.archetypes[from.index()].remove_edge(ty) {
            return to;
        }
        let key = self.archetypes[from.index()].key().without(ty);
        let to = self.find_archetype(key);
        self.archetypes[from.index()].set_remove_edge(ty, to);
        self.archetypes[to.index()].set_add_edge(ty, from);
        to
    }

    fn relocate(&mut self, entity: Entity, from: EntityLocation, to: ArchetypeId, moved: Moved) {
        if let Some(relocated) = moved.relocated {
            self.locations[relocated.slot()].row = from.row;
        }
        self.locations[entity.slot()] = EntityLocation {
            archetype: to,
            row: moved.row,
        };
    }

    // ---- Components ----

    /// Add a component. Deferred while the world is deferring.
    pub fn insert<T: Component>(&mut self, entity: Entity, value: T) -> EcsResult<()> {
        self.check_entity(entity)?;
        let deferring = self.defer_count > 0;
        let registration = self.registration_or_err::<T>()?;
        if deferring {
            registration.defer_insert(entity, value);
            return Ok(());
        }

        let ty = TypeId::of::<T>();
        let location = self.locations[entity.slot()];
        if self.archetypes[location.archetype.index()].has(ty) {
            let component = self.component_name(ty);
            error!("Entity {:?} already has component {}", entity, component);
            return Err(EcsError::DuplicateComponent { entity, component });
        }

        let target = self.add_target(location.archetype, ty);
        let (src, dst) = pair_mut(&mut self.archetypes, location.archetype, target);
        let moved = src.move_row(dst, location.row, |column, row| column.remove(row));
        dst.column_mut::<T>()
            .expect("target archetype lacks the inserted column")
            .push(value);
        dst.debug_check();
        self.relocate(entity, location, target, moved);

        self.raise_insert(entity, ty);
        Ok(())
    }

    /// Remove a component. Deferred while the world is deferring.
    pub fn erase<T: Component>(&mut self, entity: Entity) -> EcsResult<()> {
        self.check_entity(entity)?;
        let deferring = self.defer_count > 0;
        let registration = self.registration_or_err::<T>()?;
        if deferring {
            registration.defer_erase(entity);
            return Ok(());
        }

        let ty = TypeId::of::<T>();
        let location = self.locations[entity.slot()];
        if !self.archetypes[location.archetype.index()].has(ty) {
            let component = self.component_name(ty);
            error!("Entity {:?} has no component {}", entity, component);
            return Err(EcsError::MissingComponent { entity, component });
        }

        let target = self.remove_target(location.archetype, ty);
        let (src, dst) = pair_mut(&mut self.archetypes, location.archetype, target);
        let mut removed: Option<T> = None;
        let moved = src.move_row(dst, location.row, |column, row| {
            removed = column.downcast_mut::<T>().map(|column| column.swap_remove(row));
        });
        dst.debug_check();
        self.relocate(entity, location, target, moved);

        if let Some(value) = removed {
            self.raise_remove(entity, &value);
        }
        Ok(())
    }

    /// Get an immutable reference to a component on an entity.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let location = self.checked_location(entity)?;
        self.archetypes[location.archetype.index()]
            .column::<T>()?
            .get(location.row)
    }

    /// Get a mutable reference to a component on an entity.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let location = self.checked_location(entity)?;
        self.archetypes[location.archetype.index()]
            .column_mut::<T>()?
            .get_mut(location.row)
    }

    /// Check whether an entity has a component of the given type.
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.checked_location(entity).is_some_and(|location| {
            self.archetypes[location.archetype.index()].has(TypeId::of::<T>())
        })
    }

    /// Run `f` on the entity's `T`, now or when the outermost defer scope ends.
    pub fn apply<T: Component>(
        &mut self,
        entity: Entity,
        f: impl FnOnce(&mut T) + Send + 'static,
    ) -> EcsResult<()> {
        self.check_entity(entity)?;
        if self.defer_count > 0 {
            self.deferred_applies.push((
                entity,
                Box::new(move |world: &mut World| {
                    let _ = world.apply::<T>(entity, f);
                }),
            ));
            return Ok(());
        }

        match self.get_mut::<T>(entity) {
            Some(component) => {
                f(component);
                Ok(())
            }
            None => {
                let component = type_name::<T>();
                error!("Entity {:?} has no component {}", entity, component);
                Err(EcsError::MissingComponent { entity, component })
            }
        }
    }

    fn raise_insert(&mut self, entity: Entity, ty: TypeId) {
        let handlers = self.components[self.component_index[&ty]].insert_handlers();
        if handlers.is_empty() {
            return;
        }
        self.remove_defer_count += 1;
        for handler in handlers {
            handler(self, entity);
        }
        self.defer_remove_end();
    }

    fn raise_remove<T: Component>(&mut self, entity: Entity, value: &T) {
        let handlers = match self.registration::<T>() {
            Some(registration) => registration.remove_handlers(),
            None => return,
        };
        if handlers.is_empty() {
            return;
        }
        self.remove_defer_count += 1;
        for handler in handlers {
            handler(self, entity, value);
        }
        self.defer_remove_end();
    }

    // ---- Signals ----

    fn signal_vector<S: Component>(&mut self) -> &mut SignalHandlerVector<S> {
        let ty = TypeId::of::<S>();
        let index = match self.signal_index.get(&ty) {
            Some(&index) => index,
            None => {
                let index = self.signals.len();
                self.signals.push(Box::new(SignalHandlerVector::<S>::new()));
                self.signal_index.insert(ty, index);
                index
            }
        };
        self.signals[index]
            .as_any_mut()
            .downcast_mut::<SignalHandlerVector<S>>()
            .expect("signal handler vector type mismatch")
    }

    /// Call `handler` whenever an `S` is raised on any entity.
    pub fn on_signal<S: Component>(
        &mut self,
        handler: impl Fn(&mut World, Entity, &S) + Send + Sync + 'static,
    ) {
        self.signal_vector::<S>().add_handler(Arc::new(handler));
    }

    /// Call `handler` whenever an `S` is raised on an entity matching `Q`.
    pub fn on_signal_with<S: Component, Q: WorldQuery + 'static>(
        &mut self,
        handler: impl Fn(&S, Bundle<'_, Q>) + Send + Sync + 'static,
    ) {
        let query = self.query::<Q>();
        self.on_signal::<S>(move |world, entity, signal| {
            if let Some(item) = query.get(world, entity) {
                handler(signal, Bundle::new(entity, item));
            }
        });
    }

    /// Raise `signal` on `entity`. Handlers run in registration order, or when the outermost
    /// defer scope ends.
    pub fn raise<S: Component>(&mut self, entity: Entity, signal: S) -> EcsResult<()> {
        self.check_entity(entity)?;
        if !self.signal_index.contains_key(&TypeId::of::<S>()) {
            trace!("Ignored {} for {:?} with no handlers", type_name::<S>(), entity);
            return Ok(());
        }
        if self.signal_defer_count > 0 {
            self.signal_vector::<S>().defer(entity, signal);
            return Ok(());
        }
        self.dispatch_signal(entity, &signal);
        Ok(())
    }

    pub(crate) fn dispatch_signal<S: Component>(&mut self, entity: Entity, signal: &S) {
        let handlers = self.signal_vector::<S>().handlers();
        self.remove_defer_count += 1;
        for handler in handlers {
            handler(self, entity, signal);
        }
        self.defer_remove_end();
    }

    // ---- Deferral ----

    /// Open a defer scope. Until the matching outermost [`defer_end`](Self::defer_end),
    /// component edits, prefab instantiations, applies, signals and removals are queued.
    pub fn defer(&mut self) {
        self.defer_count += 1;
        if self.defer_count > 1 {
            return;
        }
        self.remove_defer_count += 1;
        self.signal_defer_count += 1;
    }

    /// Close a defer scope, replaying queued work if it was the outermost.
    pub fn defer_end(&mut self) {
        assert!(self.defer_count > 0, "defer_end without matching defer");
        self.defer_count -= 1;
        if self.defer_count > 0 {
            return;
        }
        trace!("Flushing deferred operations of world {:?}", self.id);

        let mut index = 0;
        while index < self.components.len() {
            if let Some(flush) = self.components[index].take_deferred() {
                flush(self);
            }
            index += 1;
        }

        for (prefab, entity) in mem::take(&mut self.deferred_instantiations) {
            if self.exists(entity) {
                self.populate(prefab.id(), entity);
            }
        }

        for (entity, apply) in mem::take(&mut self.deferred_applies) {
            if self.exists(entity) {
                apply(self);
            }
        }

        self.defer_signals_end();
        self.defer_remove_end();
    }

    pub fn is_deferring(&self) -> bool {
        self.defer_count > 0
    }

    fn defer_signals_end(&mut self) {
        assert!(self.signal_defer_count > 0, "unbalanced signal deferral");
        self.signal_defer_count -= 1;
        if self.signal_defer_count > 0 {
            return;
        }

        self.remove_defer_count += 1;
        let mut index = 0;
        while index < self.signals.len() {
            if let Some(flush) = self.signals[index].take_deferred() {
                flush(self);
            }
            index += 1;
        }
        self.defer_remove_end();
    }

    fn defer_remove_end(&mut self) {
        assert!(self.remove_defer_count > 0, "unbalanced removal deferral");
        self.remove_defer_count -= 1;
        if self.remove_defer_count > 0 {
            return;
        }
        while !self.deferred_removals.is_empty() {
            for entity in mem::take(&mut self.deferred_removals) {
                if self.exists(entity) {
                    self.remove_internal(entity, true);
                }
            }
        }
    }

    // ---- Queries ----

    /// Build a query over `Q`, sharing the archetype cache of any live query over the same
    /// required types.
    pub fn query<Q: WorldQuery>(&mut self) -> Query<Q> {
        let mut access = Q::required_type_ids();
        access.extend(Q::optional_type_ids());
        let total = access.len();
        access.sort_unstable();
        access.dedup();
        assert_eq!(
            access.len(),
            total,
            "Query<{}> accesses a component more than once",
            type_name::<Q>()
        );

        let key = ArchetypeKey::new(Q::required_type_ids());
        Query::new(self.make_query_archetypes(key), self.id)
    }

    fn make_query_archetypes(&mut self, key: ArchetypeKey) -> Arc<RwLock<QueryArchetypes>> {
        self.cleanup_query_archetypes();
        for cache in &self.query_archetypes {
            if let Some(cache) = cache.upgrade() {
                if cache.read().key() == &key {
                    return cache;
                }
            }
        }

        let matching = self
            .archetypes
            .iter()
            .filter(|archetype| key.is_subset_of(archetype.key()))
            .map(Archetype::id)
            .collect();
        debug!("Created query cache over {} components", key.len());
        let cache = Arc::new(RwLock::new(QueryArchetypes::new(key, matching)));
        self.query_archetypes.push(Arc::downgrade(&cache));
        cache
    }

    fn cleanup_query_archetypes(&mut self) {
        self.query_archetypes
            .retain(|cache| cache.strong_count() > 0);
    }

    // ---- Prefabs ----

    pub fn build_prefab(&self) -> PrefabBuilder<'_> {
        PrefabBuilder::new(self)
    }

    pub(crate) fn prefab_table(&self) -> &Arc<Mutex<PrefabTable>> {
        &self.prefabs
    }

    fn check_prefab(&self, prefab: &Prefab) -> EcsResult<()> {
        if prefab.world_id() != self.id {
            error!("{:?} belongs to another world", prefab);
            return Err(EcsError::ForeignPrefab);
        }
        if !self.prefabs.lock().contains(prefab.id()) {
            error!("{:?} no longer exists", prefab);
            return Err(EcsError::InvalidPrefab);
        }
        Ok(())
    }

    /// Create a new entity under `parent` from `prefab`, children included.
    pub fn instantiate(&mut self, prefab: &Prefab, parent: Entity) -> EcsResult<Entity> {
        self.check_prefab(prefab)?;
        if !parent.is_null() {
            self.check_entity(parent)?;
        }
        let entity = self.create(parent);
        if entity.is_null() {
            return Err(EcsError::InvalidEntity(parent));
        }
        self.instantiate_into(prefab, entity)?;
        Ok(entity)
    }

    /// Add the prefab's components to an existing entity. Components it already has are kept.
    pub fn instantiate_into(&mut self, prefab: &Prefab, entity: Entity) -> EcsResult<()> {
        self.check_prefab(prefab)?;
        self.check_entity(entity)?;
        if self.defer_count > 0 {
            self.deferred_instantiations.push((prefab.clone(), entity));
            return Ok(());
        }
        self.populate(prefab.id(), entity);
        Ok(())
    }

    fn populate(&mut self, id: PrefabId, entity: Entity) {
        let Some((factories, children)) = self.prefabs.lock().resolve(id) else {
            error!("Prefab {:?} released during instantiation", id);
            return;
        };

        let location = self.locations[entity.slot()];
        let current = self.archetypes[location.archetype.index()].key();
        let key = current.union(&ArchetypeKey::new(factories.keys().copied()));

        let mut added = Vec::new();
        if &key != current {
            let target = self.find_archetype(key);
            let (src, dst) = pair_mut(&mut self.archetypes, location.archetype, target);
            let moved = src.move_row(dst, location.row, |column, row| column.remove(row));
            let rows = dst.len();
            for (&ty, factory) in factories.iter() {
                let column = dst
                    .column_untyped_mut(ty)
                    .expect("prefab archetype lacks a factory column");
                if column.len() < rows {
                    factory.construct(column);
                    added.push(ty);
                }
            }
            dst.debug_check();
            self.relocate(entity, location, target, moved);
        }

        for ty in added {
            if !self.exists(entity) {
                return;
            }
            self.raise_insert(entity, ty);
        }

        for child in children {
            if !self.exists(entity) {
                return;
            }
            let child_entity = self.create(entity);
            if child_entity.is_null() {
                return;
            }
            self.populate(child, child_entity);
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
