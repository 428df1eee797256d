//! Tree keyed by sequences of classes.
//!
//! Each level of the tree consumes one class of the key, so signatures of
//! different arity share prefixes and lookups never allocate.

use std::collections::HashMap;

use crate::types::Class;

/// Map from class sequences (one per argument position) to values.
#[derive(Debug)]
pub struct ClassTree<V> {
    value: Option<V>,
    children: HashMap<Class, ClassTree<V>>,
}

impl<V> Default for ClassTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ClassTree<V> {
    pub fn new() -> Self {
        Self {
            value: None,
            children: HashMap::new(),
        }
    }

    pub fn get(&self, key: &[Class]) -> Option<&V> {
        self.node(key).and_then(|node| node.value.as_ref())
    }

    pub fn insert(&mut self, key: &[Class], value: V) -> Option<V> {
        self.node_mut(key).value.replace(value)
    }

    pub fn get_or_insert_with<F>(&mut self, key: &[Class], f: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        self.node_mut(key).value.get_or_insert_with(f)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        usize::from(self.value.is_some())
            + self.children.values().map(ClassTree::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn node(&self, key: &[Class]) -> Option<&ClassTree<V>> {
        let mut node = self;
        for class in key {
            node = node.children.get(class)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, key: &[Class]) -> &mut ClassTree<V> {
        let mut node = self;
        for class in key {
            node = node.children.entry(*class).or_default();
        }
        node
    }
}
