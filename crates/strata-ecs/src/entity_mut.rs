use crate::component::Component;
use crate::entity::Entity;
use crate::error::EcsResult;
use crate::relationship::Children;
use crate::world::World;

/// Mutable access to one entity, obtained from [`World::entity`].
///
/// Every method forwards to the world, so the same validation, logging and deferral apply.
pub struct EntityMut<'w> {
    world: &'w mut World,
    entity: Entity,
}

impl<'w> EntityMut<'w> {
    pub(crate) fn new(world: &'w mut World, entity: Entity) -> Self {
        Self { world, entity }
    }

    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn exists(&self) -> bool {
        self.world.exists(self.entity)
    }

    pub fn world(&mut self) -> &mut World {
        self.world
    }

    pub fn insert<T: Component>(&mut self, value: T) -> EcsResult<&mut Self> {
        self.world.insert(self.entity, value)?;
        Ok(self)
    }

    pub fn erase<T: Component>(&mut self) -> EcsResult<&mut Self> {
        self.world.erase::<T>(self.entity)?;
        Ok(self)
    }

    pub fn get<T: Component>(&self) -> Option<&T> {
        self.world.get::<T>(self.entity)
    }

    pub fn get_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.world.get_mut::<T>(self.entity)
    }

    pub fn has<T: Component>(&self) -> bool {
        self.world.has::<T>(self.entity)
    }

    pub fn apply<T: Component>(&mut self, f: impl FnOnce(&mut T) + Send + 'static) -> EcsResult<()> {
        self.world.apply(self.entity, f)
    }

    pub fn raise<S: Component>(&mut self, signal: S) -> EcsResult<()> {
        self.world.raise(self.entity, signal)
    }

    /// Create a child of this entity.
    pub fn create_child(&mut self) -> Entity {
        self.world.create(self.entity)
    }

    pub fn parent(&self) -> Option<Entity> {
        self.world.parent(self.entity)
    }

    pub fn children(&self) -> Children<'_> {
        self.world.children(self.entity)
    }

    pub fn reparent(&mut self, parent: Entity) -> EcsResult<()> {
        self.world.reparent(self.entity, parent)
    }

    /// Remove the entity and its descendants.
    pub fn remove(self) -> EcsResult<()> {
        self.world.remove(self.entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Health(i32);

    #[derive(Debug, Clone, PartialEq)]
    struct Armor(i32);

    #[test]
    fn chained_inserts() {
        let mut world = World::new();
        world.register::<Health>().unwrap();
        world.register::<Armor>().unwrap();
        let e = world.create(Entity::NULL);

        world
            .entity(e)
            .insert(Health(10))
            .unwrap()
            .insert(Armor(2))
            .unwrap();
        assert_eq!(world.get::<Health>(e), Some(&Health(10)));
        assert_eq!(world.get::<Armor>(e), Some(&Armor(2)));

        let mut handle = world.entity(e);
        handle.get_mut::<Health>().unwrap().0 -= 3;
        handle.erase::<Armor>().unwrap();
        assert_eq!(handle.get::<Health>(), Some(&Health(7)));
        assert!(!handle.has::<Armor>());
    }

    #[test]
    fn hierarchy_through_handle() {
        let mut world = World::new();
        let parent = world.create(Entity::NULL);
        let other = world.create(Entity::NULL);

        let mut handle = world.entity(parent);
        let child = handle.create_child();
        assert_eq!(handle.children().collect::<Vec<_>>(), vec![child]);

        let mut child_handle = world.entity(child);
        assert_eq!(child_handle.parent(), Some(parent));
        child_handle.reparent(other).unwrap();
        assert_eq!(world.parent(child), Some(other));

        world.entity(other).remove().unwrap();
        assert!(!world.exists(child));
        assert!(world.entity(parent).exists());
    }

    #[test]
    fn invalid_entity_reports_errors() {
        let mut world = World::new();
        world.register::<Health>().unwrap();
        let e = world.create(Entity::NULL);
        world.remove(e).unwrap();

        let mut handle = world.entity(e);
        assert!(!handle.exists());
        assert!(handle.insert(Health(1)).is_err());
        assert_eq!(handle.get::<Health>(), None);
        assert!(handle.remove().is_err());
    }
}
