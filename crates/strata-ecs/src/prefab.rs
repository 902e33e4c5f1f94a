//! Reference-counted entity templates.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::component::{Component, UntypedComponentVector};
use crate::error::{EcsError, EcsResult};
use crate::world::{World, WorldId};

/// Constructs one component value at the end of a column.
///
/// This is the interface external serializers implement to feed deserialized values into
/// prefabs.
pub trait ComponentFactory: Send + Sync {
    fn component_type(&self) -> TypeId;

    fn component_name(&self) -> &'static str;

    /// Push a new value onto `column`, which stores [`component_type`](Self::component_type).
    fn construct(&self, column: &mut dyn UntypedComponentVector);
}

/// Clones a prototype value.
struct CopyFactory<T>(T);

impl<T: Component + Clone> ComponentFactory for CopyFactory<T> {
    fn component_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn component_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn construct(&self, column: &mut dyn UntypedComponentVector) {
        column
            .downcast_mut::<T>()
            .expect("prefab column type mismatch")
            .push(self.0.clone());
    }
}

/// Calls a generator for every instance.
struct GeneratorFactory<T, F> {
    generator: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Component, F: Fn() -> T + Send + Sync> ComponentFactory for GeneratorFactory<T, F> {
    fn component_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn component_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn construct(&self, column: &mut dyn UntypedComponentVector) {
        column
            .downcast_mut::<T>()
            .expect("prefab column type mismatch")
            .push((self.generator)());
    }
}

pub(crate) type Factories = BTreeMap<TypeId, Arc<dyn ComponentFactory>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PrefabId(u64);

struct PrefabEntry {
    factories: Arc<Factories>,
    children: Vec<PrefabId>,
    ref_count: usize,
}

/// Storage for every prefab of one world.
pub(crate) struct PrefabTable {
    entries: HashMap<PrefabId, PrefabEntry>,
    next_id: u64,
}

impl PrefabTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, factories: Factories, children: Vec<PrefabId>) -> PrefabId {
        let id = PrefabId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            PrefabEntry {
                factories: Arc::new(factories),
                children,
                ref_count: 1,
            },
        );
        id
    }

    pub fn contains(&self, id: PrefabId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Factories and child prefabs of `id`, cloned out so the lock can be released.
    pub fn resolve(&self, id: PrefabId) -> Option<(Arc<Factories>, Vec<PrefabId>)> {
        let entry = self.entries.get(&id)?;
        Some((Arc::clone(&entry.factories), entry.children.clone()))
    }

    pub fn ref_count(&self, id: PrefabId) -> usize {
        self.entries.get(&id).map_or(0, |entry| entry.ref_count)
    }

    fn increment(&mut self, id: PrefabId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            panic!("incrementing released prefab {id:?}");
        };
        entry.ref_count += 1;
    }

    /// Drop one reference. Entries reaching zero are erased and release their children.
    fn decrement(&mut self, id: PrefabId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(entry) = self.entries.get_mut(&id) else {
                panic!("prefab {id:?} released more often than acquired");
            };
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                continue;
            }
            if let Some(entry) = self.entries.remove(&id) {
                debug!("Destroyed prefab {:?}", id);
                pending.extend(entry.children);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handle to a prefab. Cloning adds a reference, dropping releases one.
pub struct Prefab {
    id: PrefabId,
    world_id: WorldId,
    table: Weak<Mutex<PrefabTable>>,
}

impl Prefab {
    pub(crate) fn id(&self) -> PrefabId {
        self.id
    }

    pub(crate) fn world_id(&self) -> WorldId {
        self.world_id
    }

    /// Current reference count, 0 once the owning world is gone.
    pub fn ref_count(&self) -> usize {
        self.table
            .upgrade()
            .map_or(0, |table| table.lock().ref_count(self.id))
    }
}

impl Clone for Prefab {
    fn clone(&self) -> Self {
        if let Some(table) = self.table.upgrade() {
            table.lock().increment(self.id);
        }
        Self {
            id: self.id,
            world_id: self.world_id,
            table: Weak::clone(&self.table),
        }
    }
}

impl Drop for Prefab {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().decrement(self.id);
        }
    }
}

impl fmt::Debug for Prefab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefab({})", self.id.0)
    }
}

/// Fluent construction of a [`Prefab`], started with [`World::build_prefab`].
pub struct PrefabBuilder<'w> {
    world: &'w World,
    factories: Factories,
    children: Vec<Prefab>,
    error: Option<EcsError>,
}

impl<'w> PrefabBuilder<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            factories: BTreeMap::new(),
            children: Vec::new(),
            error: None,
        }
    }

    /// Every instance gets a clone of `value`.
    pub fn with<T: Component + Clone>(self, value: T) -> Self {
        self.with_factory(CopyFactory(value))
    }

    /// Every instance gets a fresh value from `generator`.
    pub fn with_generator<T: Component>(self, generator: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.with_factory(GeneratorFactory {
            generator,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn with_factory(mut self, factory: impl ComponentFactory + 'static) -> Self {
        if !self.world.is_registered_type(factory.component_type()) {
            error!(
                "Prefab uses unregistered component {}",
                factory.component_name()
            );
            self.error
                .get_or_insert(EcsError::UnregisteredComponent(factory.component_name()));
            return self;
        }
        self.factories
            .insert(factory.component_type(), Arc::new(factory));
        self
    }

    /// Instantiate `child` under every instance of this prefab.
    pub fn with_child(mut self, child: &Prefab) -> Self {
        if child.world_id() != self.world.id() {
            error!("Prefab child {:?} belongs to another world", child);
            self.error.get_or_insert(EcsError::ForeignPrefab);
            return self;
        }
        self.children.push(child.clone());
        self
    }

    pub fn build(self) -> EcsResult<Prefab> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let table = self.world.prefab_table();
        let mut guard = table.lock();
        let mut children = Vec::with_capacity(self.children.len());
        for child in &self.children {
            if !guard.contains(child.id()) {
                error!("Prefab child {:?} no longer exists", child);
                return Err(EcsError::InvalidPrefab);
            }
            guard.increment(child.id());
            children.push(child.id());
        }
        let id = guard.insert(self.factories, children);
        drop(guard);
        debug!("Built prefab {:?}", id);

        // Handles in `self.children` release their references when dropped.
        Ok(Prefab {
            id,
            world_id: self.world.id(),
            table: Arc::downgrade(table),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(&'static str);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Health(u32);

    fn world() -> World {
        let mut world = World::new();
        world.register::<Tag>().unwrap();
        world.register::<Health>().unwrap();
        world
    }

    #[test]
    fn clone_and_drop_adjust_ref_count() {
        let world = world();
        let prefab = world.build_prefab().with(Health(10)).build().unwrap();
        assert_eq!(prefab.ref_count(), 1);
        let copy = prefab.clone();
        assert_eq!(prefab.ref_count(), 2);
        drop(copy);
        assert_eq!(prefab.ref_count(), 1);
    }

    #[test]
    fn last_release_destroys_and_releases_children() {
        let world = world();
        let child = world.build_prefab().with(Tag("child")).build().unwrap();
        let parent = world.build_prefab().with_child(&child).build().unwrap();
        assert_eq!(child.ref_count(), 2);
        assert_eq!(world.prefab_table().lock().len(), 2);

        drop(parent);
        assert_eq!(child.ref_count(), 1);
        assert_eq!(world.prefab_table().lock().len(), 1);

        drop(child);
        assert_eq!(world.prefab_table().lock().len(), 0);
    }

    #[test]
    fn child_outlives_its_handle_while_parent_holds_it() {
        let world = world();
        let child = world.build_prefab().with(Tag("child")).build().unwrap();
        let child_id = child.id();
        let parent = world.build_prefab().with_child(&child).build().unwrap();
        drop(child);
        assert!(world.prefab_table().lock().contains(child_id));
        drop(parent);
        assert!(!world.prefab_table().lock().contains(child_id));
    }

    #[test]
    fn nested_release_cascades() {
        let world = world();
        let leaf = world.build_prefab().with(Tag("leaf")).build().unwrap();
        let mid = world.build_prefab().with_child(&leaf).build().unwrap();
        let top = world.build_prefab().with_child(&mid).build().unwrap();
        drop(leaf);
        drop(mid);
        assert_eq!(world.prefab_table().lock().len(), 3);
        drop(top);
        assert_eq!(world.prefab_table().lock().len(), 0);
    }

    #[test]
    fn unregistered_component_fails_build() {
        let world = World::new();
        let result = world.build_prefab().with(Health(1)).build();
        assert!(matches!(result, Err(EcsError::UnregisteredComponent(_))));
    }

    #[test]
    fn foreign_child_fails_build() {
        let first = world();
        let second = world();
        let child = first.build_prefab().with(Tag("x")).build().unwrap();
        let result = second.build_prefab().with_child(&child).build();
        assert!(matches!(result, Err(EcsError::ForeignPrefab)));
    }

    #[test]
    fn generator_runs_per_instance() {
        let mut world = world();
        let counter = Arc::new(Mutex::new(0u32));
        let c = Arc::clone(&counter);
        let prefab = world
            .build_prefab()
            .with_generator(move || {
                let mut n = c.lock();
                *n += 1;
                Health(*n)
            })
            .build()
            .unwrap();

        let a = world.instantiate(&prefab, Entity::NULL).unwrap();
        let b = world.instantiate(&prefab, Entity::NULL).unwrap();
        assert_eq!(world.get::<Health>(a), Some(&Health(1)));
        assert_eq!(world.get::<Health>(b), Some(&Health(2)));
        assert_eq!(*counter.lock(), 2);
    }

    #[test]
    fn handles_outliving_world_are_inert() {
        let world = world();
        let prefab = world.build_prefab().with(Health(3)).build().unwrap();
        drop(world);
        assert_eq!(prefab.ref_count(), 0);
        let copy = prefab.clone();
        drop(copy);
    }
}
