//! Strata ECS - Entity Component System
//!
//! Archetype-based storage: entities with the same component set share one table of
//! columns, and adding or removing a component moves the entity along a cached graph edge.
//! Entities form a parent/child hierarchy, prefabs stamp out reference-counted templates,
//! and structural changes can be deferred while iterating or handling signals.

mod archetype;
mod component;
mod config;
mod entity;
mod entity_mut;
mod error;
mod prefab;
mod query;
mod relationship;
mod signal;
mod world;

pub use archetype::{Archetype, ArchetypeId, ArchetypeKey};
pub use component::{Component, ComponentVector, UntypedComponentVector};
pub use config::WorldConfig;
pub use entity::{Entity, EntityIdList, Ids};
pub use entity_mut::EntityMut;
pub use error::{EcsError, EcsResult};
pub use prefab::{ComponentFactory, Prefab, PrefabBuilder};
pub use query::{Bundle, Query, QueryArchetypes, WorldQuery};
pub use relationship::Children;
pub use signal::{InsertHandler, OnAddChild, OnRemoveChild, RemoveHandler, SignalHandler};
pub use world::{World, WorldId};
