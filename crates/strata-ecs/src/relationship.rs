//! Parent/child links stored as intrusive doubly linked sibling lists.

use crate::entity::Entity;

#[derive(Debug, Clone, Copy, Default)]
struct Relationship {
    parent: Entity,
    first_child: Entity,
    next: Entity,
    prev: Entity,
}

/// Slot 0 is the root; every other entry is addressed by entity index.
pub(crate) struct RelationshipManager {
    relationships: Vec<Relationship>,
}

impl RelationshipManager {
    pub fn new(capacity: usize) -> Self {
        let mut relationships = Vec::with_capacity(capacity + 1);
        relationships.push(Relationship::default());
        Self { relationships }
    }

    fn get(&self, id: Entity) -> &Relationship {
        &self.relationships[id.index as usize]
    }

    fn get_mut(&mut self, id: Entity) -> &mut Relationship {
        &mut self.relationships[id.index as usize]
    }

    /// Register a freshly allocated entity under `parent`.
    pub fn add(&mut self, id: Entity, parent: Entity) {
        let index = id.index as usize;
        debug_assert!(index <= self.relationships.len(), "entity {id:?} skipped a slot");
        if index == self.relationships.len() {
            self.relationships.push(Relationship::default());
        } else {
            *self.get_mut(id) = Relationship::default();
        }
        self.set_parent(id, parent);
    }

    /// Link `id` at the front of `parent`'s child list. `id` must currently be unlinked.
    pub fn set_parent(&mut self, id: Entity, parent: Entity) {
        let old_first = self.get(parent).first_child;

        let rel = self.get_mut(id);
        rel.parent = parent;
        rel.prev = Entity::NULL;
        rel.next = old_first;

        if !old_first.is_null() {
            self.get_mut(old_first).prev = id;
        }
        self.get_mut(parent).first_child = id;
    }

    /// Unlink `id` from its sibling list. Its parent field and own children are left intact.
    pub fn remove_from_parent(&mut self, id: Entity) {
        let Relationship {
            parent, next, prev, ..
        } = *self.get(id);

        if prev.is_null() {
            self.get_mut(parent).first_child = next;
        } else {
            self.get_mut(prev).next = next;
        }
        if !next.is_null() {
            self.get_mut(next).prev = prev;
        }

        let rel = self.get_mut(id);
        rel.prev = Entity::NULL;
        rel.next = Entity::NULL;
    }

    /// Forget `id`. With `update_parent` unset the sibling list is left as is, which is only
    /// correct when the parent is being removed as well.
    pub fn remove(&mut self, id: Entity, update_parent: bool) {
        if update_parent {
            self.remove_from_parent(id);
        }
        *self.get_mut(id) = Relationship::default();
    }

    pub fn parent(&self, id: Entity) -> Entity {
        self.get(id).parent
    }

    pub fn first_child(&self, id: Entity) -> Entity {
        self.get(id).first_child
    }

    pub fn next(&self, id: Entity) -> Entity {
        self.get(id).next
    }

    /// Whether `ancestor` is `id` or one of its parents.
    pub fn is_ancestor(&self, ancestor: Entity, id: Entity) -> bool {
        let mut current = id;
        while !current.is_null() {
            if current == ancestor {
                return true;
            }
            current = self.parent(current);
        }
        false
    }

    pub fn children(&self, id: Entity) -> Children<'_> {
        Children {
            manager: self,
            current: self.first_child(id),
        }
    }

    /// An iterator that yields nothing.
    pub fn no_children(&self) -> Children<'_> {
        Children {
            manager: self,
            current: Entity::NULL,
        }
    }

    /// Drop every link, root included.
    pub fn reset(&mut self) {
        for rel in &mut self.relationships {
            *rel = Relationship::default();
        }
    }
}

/// Iterator over the direct children of an entity, most recently attached first.
#[derive(Clone)]
pub struct Children<'a> {
    manager: &'a RelationshipManager,
    current: Entity,
}

impl Iterator for Children<'_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        if self.current.is_null() {
            return None;
        }
        let id = self.current;
        self.current = self.manager.next(id);
        Some(id)
    }
}
