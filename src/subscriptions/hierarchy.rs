//! Cached transitive supertypes of message classes.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::types::Class;

/// Computes and caches the ancestors of each class.
///
/// Computation is pure, so concurrent misses may compute the same entry
/// twice; the first one stored wins.
#[derive(Debug, Default)]
pub struct TypeHierarchy {
    supertypes: RwLock<HashMap<Class, Arc<[Class]>>>,
}

impl TypeHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// All proper supertypes of `class`, nearest first. Root classes
    /// (`Object`, `Object[]`, ...) come last.
    pub fn supertypes(&self, class: Class) -> Arc<[Class]> {
        if let Some(found) = self.supertypes.read().get(&class) {
            return Arc::clone(found);
        }

        let computed: Arc<[Class]> = compute_supertypes(class).into();
        Arc::clone(self.supertypes.write().entry(class).or_insert(computed))
    }

    /// Whether a value of class `from` can be used where `to` is declared.
    pub fn is_assignable(&self, from: Class, to: Class) -> bool {
        from == to || self.supertypes(from).contains(&to)
    }
}

fn compute_supertypes(class: Class) -> Vec<Class> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<Class> = class.direct_supertypes().into();
    let mut ordered = Vec::new();

    while let Some(next) = queue.pop_front() {
        if next == class || !seen.insert(next) {
            continue;
        }
        ordered.push(next);
        queue.extend(next.direct_supertypes());
    }

    let (mut nearest, roots): (Vec<Class>, Vec<Class>) = ordered
        .into_iter()
        .partition(|c| c.base() != Class::object());
    nearest.extend(roots);
    nearest
}
