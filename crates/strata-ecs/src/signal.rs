//! Handler lists for component insert/remove events and custom per-entity signals.

use std::any::{type_name, Any};
use std::mem;
use std::sync::Arc;

use tracing::trace;

use crate::component::{Component, ComponentVector, UntypedComponentVector};
use crate::entity::Entity;
use crate::world::World;

/// Runs after a component of the registered type was placed on an entity.
///
/// The new value is read back with `world.get::<T>(entity)`.
pub type InsertHandler = Arc<dyn Fn(&mut World, Entity) + Send + Sync>;

/// Runs after a component left an entity, before the removed value is dropped.
pub type RemoveHandler<T> = Arc<dyn Fn(&mut World, Entity, &T) + Send + Sync>;

/// Runs when a signal of type `S` is raised on an entity.
pub type SignalHandler<S> = Arc<dyn Fn(&mut World, Entity, &S) + Send + Sync>;

/// Work queued while the world was deferring, replayed against the world afterwards.
pub(crate) type DeferredFlush = Box<dyn FnOnce(&mut World)>;

/// Raised on a parent when a child is attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnAddChild {
    pub child: Entity,
}

/// Raised on a parent when a child is detached from it or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnRemoveChild {
    pub child: Entity,
}

// ---- Component registrations ----

pub(crate) trait UntypedComponent: Any + Send + Sync {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn name(&self) -> &'static str;
    fn make_vector(&self, capacity: usize, growth_factor: usize) -> Box<dyn UntypedComponentVector>;
    fn insert_handlers(&self) -> Vec<InsertHandler>;
    fn take_deferred(&mut self) -> Option<DeferredFlush>;
}

/// Registration record of one component type: its handlers and deferred edits.
pub(crate) struct ComponentRegistration<T> {
    name: &'static str,
    insert_handlers: Vec<InsertHandler>,
    remove_handlers: Vec<RemoveHandler<T>>,
    deferred_inserts: Vec<(Entity, T)>,
    deferred_erases: Vec<Entity>,
}

impl<T: Component> ComponentRegistration<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            insert_handlers: Vec::new(),
            remove_handlers: Vec::new(),
            deferred_inserts: Vec::new(),
            deferred_erases: Vec::new(),
        }
    }

    pub fn add_insert_handler(&mut self, handler: InsertHandler) {
        self.insert_handlers.push(handler);
    }

    pub fn add_remove_handler(&mut self, handler: RemoveHandler<T>) {
        self.remove_handlers.push(handler);
    }

    pub fn remove_handlers(&self) -> Vec<RemoveHandler<T>> {
        self.remove_handlers.clone()
    }

    pub fn defer_insert(&mut self, entity: Entity, value: T) {
        self.deferred_inserts.push((entity, value));
    }

    pub fn defer_erase(&mut self, entity: Entity) {
        self.deferred_erases.push(entity);
    }
}

impl<T: Component> UntypedComponent for ComponentRegistration<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn make_vector(&self, capacity: usize, growth_factor: usize) -> Box<dyn UntypedComponentVector> {
        Box::new(ComponentVector::<T>::new(capacity, growth_factor))
    }

    fn insert_handlers(&self) -> Vec<InsertHandler> {
        self.insert_handlers.clone()
    }

    fn take_deferred(&mut self) -> Option<DeferredFlush> {
        if self.deferred_inserts.is_empty() && self.deferred_erases.is_empty() {
            return None;
        }
        let inserts = mem::take(&mut self.deferred_inserts);
        let erases = mem::take(&mut self.deferred_erases);
        Some(Box::new(move |world: &mut World| {
            // Failures are logged by the world.
            for (entity, value) in inserts {
                let _ = world.insert(entity, value);
            }
            for entity in erases {
                let _ = world.erase::<T>(entity);
            }
        }))
    }
}

// ---- Custom signals ----

pub(crate) trait UntypedSignalVector: Any + Send + Sync {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn take_deferred(&mut self) -> Option<DeferredFlush>;
}

pub(crate) struct SignalHandlerVector<S> {
    handlers: Vec<SignalHandler<S>>,
    deferred: Vec<(Entity, S)>,
}

impl<S: Component> SignalHandlerVector<S> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, handler: SignalHandler<S>) {
        self.handlers.push(handler);
    }

    /// Snapshot of the current handlers. Handlers added while these run are not included.
    pub fn handlers(&self) -> Vec<SignalHandler<S>> {
        self.handlers.clone()
    }

    pub fn defer(&mut self, entity: Entity, signal: S) {
        self.deferred.push((entity, signal));
    }
}

impl<S: Component> UntypedSignalVector for SignalHandlerVector<S> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn take_deferred(&mut self) -> Option<DeferredFlush> {
        if self.deferred.is_empty() {
            return None;
        }
        let queued = mem::take(&mut self.deferred);
        Some(Box::new(move |world: &mut World| {
            for (entity, signal) in queued {
                if world.exists(entity) {
                    world.dispatch_signal(entity, &signal);
                } else {
                    trace!(
                        "Dropped deferred {} for removed entity {:?}",
                        type_name::<S>(),
                        entity
                    );
                }
            }
        }))
    }
}
