//! Identity set optimized for reads that never block on writers.
//!
//! Elements live in a linked list whose `next` pointers are swapped
//! atomically, so iteration never takes a lock. Mutations are serialized by
//! a read/write lock guarding an identity index; adds check membership under
//! an upgradable read and only upgrade when the element is absent.
//!
//! A removed node keeps its own `next` pointer, so an iterator parked on it
//! can still advance. Removals therefore only affect positions an iterator
//! has not reached yet.

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::types::ReferenceMode;

/// Identity of a shared value: the address of its allocation.
fn identity<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

enum Element<T: ?Sized> {
    Strong(Arc<T>),
    Weak(Weak<T>),
}

impl<T: ?Sized> Element<T> {
    fn get(&self) -> Option<Arc<T>> {
        match self {
            Element::Strong(value) => Some(Arc::clone(value)),
            Element::Weak(value) => value.upgrade(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Element::Strong(_) => true,
            Element::Weak(value) => value.strong_count() > 0,
        }
    }
}

struct Node<T: ?Sized> {
    key: usize,
    element: Element<T>,
    next: ArcSwapOption<Node<T>>,
    /// Only touched while holding the set's write lock.
    prev: Mutex<Weak<Node<T>>>,
    removed: AtomicBool,
}

/// Concurrent identity set with lock-free iteration.
///
/// New elements are inserted at the head, so iteration yields the most
/// recently added element first.
pub struct ConcurrentSet<T: ?Sized> {
    mode: ReferenceMode,
    entries: RwLock<HashMap<usize, Arc<Node<T>>>>,
    head: ArcSwapOption<Node<T>>,
}

impl<T: ?Sized> ConcurrentSet<T> {
    pub fn new(mode: ReferenceMode) -> Self {
        Self {
            mode,
            entries: RwLock::new(HashMap::new()),
            head: ArcSwapOption::empty(),
        }
    }

    /// Set that keeps its elements alive.
    pub fn strong() -> Self {
        Self::new(ReferenceMode::Strong)
    }

    /// Set that holds weak references and prunes dead ones while iterating.
    pub fn weak() -> Self {
        Self::new(ReferenceMode::Weak)
    }

    pub fn mode(&self) -> ReferenceMode {
        self.mode
    }

    /// Add an element. Returns false if it was already present.
    pub fn add(&self, value: &Arc<T>) -> bool {
        let key = identity(value);

        let entries = self.entries.upgradable_read();
        if entries.contains_key(&key) {
            return false;
        }

        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let element = match self.mode {
            ReferenceMode::Strong => Element::Strong(Arc::clone(value)),
            ReferenceMode::Weak => Element::Weak(Arc::downgrade(value)),
        };
        let node = Arc::new(Node {
            key,
            element,
            next: ArcSwapOption::empty(),
            prev: Mutex::new(Weak::new()),
            removed: AtomicBool::new(false),
        });

        self.link_head(&node);
        entries.insert(key, node);
        true
    }

    /// Remove an element. Returns false if it was not present.
    pub fn remove(&self, value: &Arc<T>) -> bool {
        let key = identity(value);

        // Fast exit without contending for the write lock.
        if !self.entries.read().contains_key(&key) {
            return false;
        }

        let mut entries = self.entries.write();
        match entries.remove(&key) {
            Some(node) => {
                self.unlink(&node);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, value: &Arc<T>) -> bool {
        self.entries
            .read()
            .get(&identity(value))
            .map_or(false, |node| node.element.is_alive())
    }

    /// Number of registered elements, including weak ones not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_none()
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            set: self,
            current: self.head.load_full(),
        }
    }

    /// Caller must hold the write lock.
    fn link_head(&self, node: &Arc<Node<T>>) {
        let old_head = self.head.load_full();
        if let Some(old_head) = &old_head {
            *old_head.prev.lock() = Arc::downgrade(node);
        }
        node.next.store(old_head);
        self.head.store(Some(Arc::clone(node)));
    }

    /// Caller must hold the write lock. The node's own `next` is left intact
    /// for iterators currently positioned on it.
    fn unlink(&self, node: &Arc<Node<T>>) {
        node.removed.store(true, Ordering::Release);

        let prev = node.prev.lock().upgrade();
        let next = node.next.load_full();

        match &prev {
            Some(prev) => prev.next.store(next.clone()),
            None => self.head.store(next.clone()),
        }

        if let Some(next) = &next {
            *next.prev.lock() = prev.as_ref().map(Arc::downgrade).unwrap_or_default();
        }
    }

    /// Drop a node whose weak referent is gone.
    fn prune(&self, node: &Arc<Node<T>>) {
        let mut entries = self.entries.write();
        let current = entries
            .get(&node.key)
            .map_or(false, |entry| Arc::ptr_eq(entry, node));
        if current {
            entries.remove(&node.key);
            self.unlink(node);
        }
    }
}

impl<T: ?Sized> Drop for ConcurrentSet<T> {
    fn drop(&mut self) {
        // Unlink iteratively so long lists don't recurse on drop.
        self.entries.get_mut().clear();
        let mut current = self.head.swap(None);
        while let Some(node) = current {
            current = node.next.swap(None);
        }
    }
}

impl<T: ?Sized> fmt::Debug for ConcurrentSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentSet")
            .field("mode", &self.mode)
            .field("len", &self.len())
            .finish()
    }
}

/// Iterator over a [`ConcurrentSet`].
///
/// Never blocks on writers. For weak sets, nodes whose referent was dropped
/// are unlinked as they are encountered.
pub struct Iter<'a, T: ?Sized> {
    set: &'a ConcurrentSet<T>,
    current: Option<Arc<Node<T>>>,
}

impl<'a, T: ?Sized> Iterator for Iter<'a, T> {
    type Item = Arc<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.current.take()?;
            self.current = node.next.load_full();

            if node.removed.load(Ordering::Acquire) {
                continue;
            }

            match node.element.get() {
                Some(value) => return Some(value),
                None => self.set.prune(&node),
            }
        }
    }
}
