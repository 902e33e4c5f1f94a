use std::any::{type_name, Any};

/// Marker trait for types that can be stored as ECS components.
pub trait Component: 'static + Send + Sync {}

/// Blanket implementation: any `'static + Send + Sync` type is a valid component.
impl<T: 'static + Send + Sync> Component for T {}

/// Type-erased column interface. Every archetype holds one per component type in its key.
pub trait UntypedComponentVector: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Name of the stored component type.
    fn type_name(&self) -> &'static str;

    fn len(&self) -> usize;
    fn capacity(&self) -> usize;

    /// Drop the element at `pos`, moving the last element into its place.
    fn remove(&mut self, pos: usize);

    /// Take the element at `pos` out of `other` (swap-removing it there) and append it here.
    ///
    /// Panics if `other` stores a different type.
    fn move_from(&mut self, other: &mut dyn UntypedComponentVector, pos: usize);

    fn clear(&mut self);
}

impl dyn UntypedComponentVector {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&ComponentVector<T>> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut ComponentVector<T>> {
        self.as_any_mut().downcast_mut()
    }
}

/// Dense, geometrically growing storage for a single component type.
pub struct ComponentVector<T> {
    data: Vec<T>,
    growth_factor: usize,
}

impl<T: Component> ComponentVector<T> {
    pub fn new(capacity: usize, growth_factor: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            growth_factor: growth_factor.max(2),
        }
    }

    /// Append a value, growing by the configured factor when full.
    pub fn push(&mut self, value: T) -> &mut T {
        if self.data.len() == self.data.capacity() {
            let target = (self.data.capacity() * self.growth_factor).max(1);
            self.data.reserve_exact(target - self.data.len());
        }
        let pos = self.data.len();
        self.data.push(value);
        &mut self.data[pos]
    }

    /// Remove the element at `pos` and return it. The last element takes its place.
    pub fn swap_remove(&mut self, pos: usize) -> T {
        self.data.swap_remove(pos)
    }

    pub fn get(&self, pos: usize) -> Option<&T> {
        self.data.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> Option<&mut T> {
        self.data.get_mut(pos)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.data.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut T {
        self.data.as_mut_ptr()
    }
}

impl<T: Component> UntypedComponentVector for ComponentVector<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn capacity(&self) -> usize {
        self.data.capacity()
    }

    fn remove(&mut self, pos: usize) {
        self.data.swap_remove(pos);
    }

    fn move_from(&mut self, other: &mut dyn UntypedComponentVector, pos: usize) {
        let other_name = other.type_name();
        let Some(other) = other.downcast_mut::<T>() else {
            panic!("cannot move {} into a column of {}", other_name, type_name::<T>());
        };
        let value = other.swap_remove(pos);
        self.push(value);
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_get() {
        let mut column = ComponentVector::new(4, 2);
        column.push(1i32);
        *column.push(2) += 40;
        assert_eq!(column.get(0), Some(&1));
        assert_eq!(column.get(1), Some(&42));
        assert_eq!(column.get(2), None);
    }

    #[test]
    fn grows_geometrically() {
        let mut column = ComponentVector::new(4, 3);
        for i in 0..5u64 {
            column.push(i);
        }
        assert!(UntypedComponentVector::capacity(&column) >= 12);
    }

    #[test]
    fn zero_capacity_still_grows() {
        let mut column = ComponentVector::new(0, 2);
        column.push('a');
        assert!(UntypedComponentVector::capacity(&column) >= 1);
        assert_eq!(column.as_slice(), &['a']);
    }

    #[test]
    fn remove_moves_last_into_hole() {
        let mut column = ComponentVector::new(4, 2);
        column.push('a');
        column.push('b');
        column.push('c');
        UntypedComponentVector::remove(&mut column, 0);
        assert_eq!(column.as_slice(), &['c', 'b']);
        UntypedComponentVector::remove(&mut column, 1);
        assert_eq!(column.as_slice(), &['c']);
    }

    #[test]
    fn move_between_columns() {
        let mut src = ComponentVector::new(4, 2);
        src.push(String::from("x"));
        src.push(String::from("y"));
        src.push(String::from("z"));
        let mut dst: Box<dyn UntypedComponentVector> = Box::new(ComponentVector::<String>::new(4, 2));

        dst.move_from(&mut src, 0);
        assert_eq!(dst.downcast_ref::<String>().unwrap().as_slice(), &["x"]);
        assert_eq!(src.as_slice(), &["z", "y"]);
    }

    #[test]
    #[should_panic(expected = "cannot move")]
    fn move_between_mismatched_columns_panics() {
        let mut src = ComponentVector::new(1, 2);
        src.push(1u8);
        let mut dst = ComponentVector::<u16>::new(1, 2);
        dst.move_from(&mut src, 0);
    }

    #[test]
    fn clear_drops_everything() {
        let mut column: Box<dyn UntypedComponentVector> = Box::new(ComponentVector::<i32>::new(2, 2));
        column.downcast_mut::<i32>().unwrap().push(5);
        column.clear();
        assert!(column.is_empty());
    }
}
