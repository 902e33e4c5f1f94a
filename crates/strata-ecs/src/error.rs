use std::path::PathBuf;

use crate::entity::Entity;

/// Errors reported by world operations. Every variant is also logged where it is detected,
/// so callers reacting to events may ignore the result.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    #[error("entity {0:?} does not exist")]
    InvalidEntity(Entity),

    #[error("entity {entity:?} already has component {component}")]
    DuplicateComponent {
        entity: Entity,
        component: &'static str,
    },

    #[error("entity {entity:?} has no component {component}")]
    MissingComponent {
        entity: Entity,
        component: &'static str,
    },

    #[error("component {0} was never registered")]
    UnregisteredComponent(&'static str),

    #[error("component {0} is already registered")]
    DuplicateRegistration(&'static str),

    #[error("cannot move entity {entity:?} under its own descendant {parent:?}")]
    CyclicParent { entity: Entity, parent: Entity },

    #[error("prefab no longer exists")]
    InvalidPrefab,

    #[error("prefab belongs to a different world")]
    ForeignPrefab,

    #[error("failed to read config '{0}': {1}")]
    ConfigRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type EcsResult<T> = Result<T, EcsError>;
