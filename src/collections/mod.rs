//! Concurrent collections backing the subscription index.

mod class_tree;
mod concurrent_set;

pub use class_tree::ClassTree;
pub use concurrent_set::{ConcurrentSet, Iter};
