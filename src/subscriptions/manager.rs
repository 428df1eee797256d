//! Subscription manager: listener registration and type-based lookup.
//!
//! Two levels of locking keep lookups off the registration path:
//! - The registry (subscriptions per listener type) sits behind a read/write
//!   lock that is only upgraded when a listener type is seen for the first
//!   time. Publishing an index snapshot happens under that write lock.
//! - Listener instances live in each subscription's own concurrent set, so
//!   subscribing another instance of a known type never touches the index.
//!
//! Lookups read an immutable index snapshot. Each snapshot caches resolved
//! matches per argument class combination; the caches hold the live
//! subscriptions, so they stay valid as listeners come and go and are thrown
//! away only when a new subscription is created.

use arc_swap::ArcSwap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::hierarchy::TypeHierarchy;
use super::types::{Listener, ListenerRef, Match, Subscription, SubscriptionId};
use crate::collections::ClassTree;
use crate::types::{Class, DispatchMode, ReferenceMode};

#[derive(Default)]
struct Registry {
    /// Subscriptions per listener type, one per enabled handler.
    by_listener: HashMap<TypeId, Arc<[Arc<Subscription>]>>,
    /// Listener types without any enabled handler.
    non_listeners: HashSet<TypeId>,
}

/// Immutable view of all subscriptions plus a lazily filled match cache.
#[derive(Default)]
struct SubscriptionIndex {
    /// Ordered by id, i.e. by registration.
    all: Vec<Arc<Subscription>>,
    by_signature: ClassTree<Vec<Arc<Subscription>>>,
    resolved: RwLock<ClassTree<Arc<[Match]>>>,
}

impl SubscriptionIndex {
    fn build(registry: &Registry) -> Self {
        let mut all: Vec<Arc<Subscription>> = registry
            .by_listener
            .values()
            .flat_map(|subs| subs.iter().cloned())
            .collect();
        all.sort_by_key(|sub| sub.id());

        let mut by_signature = ClassTree::new();
        for sub in &all {
            by_signature
                .get_or_insert_with(sub.signature(), Vec::new)
                .push(Arc::clone(sub));
        }

        Self {
            all,
            by_signature,
            resolved: RwLock::new(ClassTree::new()),
        }
    }
}

/// Owns every subscription and answers which ones handle a given message.
pub struct SubscriptionManager {
    dispatch_mode: DispatchMode,
    reference_mode: ReferenceMode,
    hierarchy: TypeHierarchy,
    registry: RwLock<Registry>,
    index: ArcSwap<SubscriptionIndex>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(dispatch_mode: DispatchMode, reference_mode: ReferenceMode) -> Self {
        Self {
            dispatch_mode,
            reference_mode,
            hierarchy: TypeHierarchy::new(),
            registry: RwLock::new(Registry::default()),
            index: ArcSwap::from_pointee(SubscriptionIndex::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Default reference mode for listener types that do not pin one.
    pub fn reference_mode(&self) -> ReferenceMode {
        self.reference_mode
    }

    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    // --- Registration ---

    /// Register `listener` with every enabled handler of its type.
    ///
    /// Subscribing an instance that is already subscribed does nothing.
    pub fn subscribe<L: Listener>(&self, listener: &Arc<L>) {
        let subscriptions = match self.subscriptions_of::<L>() {
            Some(subscriptions) => subscriptions,
            None => return,
        };

        let erased: ListenerRef = Arc::clone(listener) as ListenerRef;
        for subscription in subscriptions.iter() {
            subscription.add(&erased);
        }
    }

    /// Remove `listener` from every subscription. Unknown listeners are
    /// ignored.
    pub fn unsubscribe<L: Listener>(&self, listener: &Arc<L>) {
        let subscriptions = match self.registry.read().by_listener.get(&TypeId::of::<L>()) {
            Some(subscriptions) => Arc::clone(subscriptions),
            None => return,
        };

        let erased: ListenerRef = Arc::clone(listener) as ListenerRef;
        for subscription in subscriptions.iter() {
            subscription.remove(&erased);
        }
    }

    /// Whether `listener` is subscribed to any handler.
    pub fn is_subscribed<L: Listener>(&self, listener: &Arc<L>) -> bool {
        let registry = self.registry.read();
        let erased: ListenerRef = Arc::clone(listener) as ListenerRef;
        registry
            .by_listener
            .get(&TypeId::of::<L>())
            .map_or(false, |subs| subs.iter().any(|sub| sub.contains(&erased)))
    }

    /// Subscriptions for `L`, creating them on first sight of the type.
    /// `None` if the type exposes no enabled handler.
    fn subscriptions_of<L: Listener>(&self) -> Option<Arc<[Arc<Subscription>]>> {
        let type_id = TypeId::of::<L>();

        let registry = self.registry.upgradable_read();
        if registry.non_listeners.contains(&type_id) {
            return None;
        }
        if let Some(existing) = registry.by_listener.get(&type_id) {
            return Some(Arc::clone(existing));
        }

        let mut registry = RwLockUpgradableReadGuard::upgrade(registry);
        let mode = L::reference_mode().unwrap_or(self.reference_mode);
        let created: Arc<[Arc<Subscription>]> = L::handlers()
            .into_iter()
            .filter(|handler| handler.is_enabled())
            .map(|handler| {
                let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
                Arc::new(Subscription::new(id, handler, mode))
            })
            .collect();

        if created.is_empty() {
            trace!(listener = std::any::type_name::<L>(), "Type has no enabled handlers");
            registry.non_listeners.insert(type_id);
            return None;
        }

        for sub in created.iter() {
            debug!(
                id = sub.id().0,
                listener = sub.listener_type(),
                handler = sub.handler(),
                signature = ?sub.signature(),
                "Created subscription"
            );
        }

        registry.by_listener.insert(type_id, Arc::clone(&created));
        self.index.store(Arc::new(SubscriptionIndex::build(&registry)));
        Some(created)
    }

    // --- Lookup ---

    /// Non-empty subscriptions that handle a message with these argument
    /// classes, in registration order.
    pub fn subscriptions_for(&self, classes: &[Class]) -> Vec<Arc<Subscription>> {
        self.resolve(classes)
            .iter()
            .map(Match::subscription)
            .filter(|sub| !sub.is_empty())
            .cloned()
            .collect()
    }

    /// Non-empty subscriptions whose declared signature is exactly
    /// `signature`.
    pub fn exact_subscriptions(&self, signature: &[Class]) -> Vec<Arc<Subscription>> {
        let index = self.index.load();
        index
            .by_signature
            .get(signature)
            .map(|subs| subs.iter().filter(|sub| !sub.is_empty()).cloned().collect())
            .unwrap_or_default()
    }

    /// Every subscription created so far, including empty ones.
    pub fn subscription_count(&self) -> usize {
        self.index.load().all.len()
    }

    /// Resolved matches for an argument class combination, cached per
    /// combination.
    pub fn resolve(&self, classes: &[Class]) -> Arc<[Match]> {
        let index = self.index.load_full();
        if let Some(found) = index.resolved.read().get(classes) {
            return Arc::clone(found);
        }

        let matches: Arc<[Match]> = index
            .all
            .iter()
            .filter_map(|sub| self.match_subscription(sub, classes))
            .collect();

        let mut resolved = index.resolved.write();
        let found = Arc::clone(resolved.get_or_insert_with(classes, || matches));
        trace!(
            arity = classes.len(),
            matches = found.len(),
            cached = resolved.len(),
            "Resolved subscriptions"
        );
        found
    }

    /// How `subscription` accepts arguments of `args`, if at all.
    ///
    /// A direct match needs equal arity with every position either equal or,
    /// for subtype-accepting handlers, assignable. A vararg match pairs the
    /// leading positions the same way and requires every remaining argument
    /// to be compatible with the trailing array's component. Direct matches
    /// take precedence.
    fn match_subscription(&self, subscription: &Arc<Subscription>, args: &[Class]) -> Option<Match> {
        let signature = subscription.signature();

        if self.dispatch_mode == DispatchMode::Exact {
            return (signature == args).then(|| Match::direct(Arc::clone(subscription)));
        }

        let subtypes = subscription.accepts_subtypes();
        let compatible = |arg: Class, declared: Class| {
            arg == declared || (subtypes && self.hierarchy.is_assignable(arg, declared))
        };

        if signature.len() == args.len()
            && signature.iter().zip(args).all(|(d, a)| compatible(*a, *d))
        {
            return Some(Match::direct(Arc::clone(subscription)));
        }

        if !subscription.accepts_varargs() {
            return None;
        }

        let (last, prefix) = signature.split_last()?;
        let component = last.component()?;
        if args.len() < prefix.len() {
            return None;
        }

        let (head, tail) = args.split_at(prefix.len());
        let accepted = prefix.iter().zip(head).all(|(d, a)| compatible(*a, *d))
            && tail.iter().all(|a| compatible(*a, component));

        accepted.then(|| Match::vararg(Arc::clone(subscription), component))
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(DispatchMode::default(), ReferenceMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HandlerResult, LoggingErrorHandler};
    use crate::subscriptions::Handler;
    use crate::types::{AnyMessage, Message};

    struct Animal;
    struct Dog;
    impl Message for Animal {}
    impl Message for Dog {
        fn supertypes() -> Vec<Class> {
            vec![Class::of::<Animal>()]
        }
    }

    fn ok<L>(_: &L, _: &[AnyMessage]) -> HandlerResult {
        Ok(())
    }

    struct StringListener;
    impl Listener for StringListener {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::on::<String>("on_string", |_, _| {})]
        }
    }

    struct ObjectListener;
    impl Listener for ObjectListener {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::new("on_object", vec![Class::object()], ok)]
        }
    }

    struct AnimalListener;
    impl Listener for AnimalListener {
        fn handlers() -> Vec<Handler<Self>> {
            vec![
                Handler::new("on_animal", vec![Class::of::<Animal>()], ok),
                Handler::new("on_animal_exact", vec![Class::of::<Animal>()], ok).reject_subtypes(),
                Handler::new("on_animals", vec![Class::of::<Animal>().array()], ok),
                Handler::new("on_disabled", vec![Class::of::<Animal>()], ok).disabled(),
            ]
        }
    }

    struct VarargListener;
    impl Listener for VarargListener {
        fn handlers() -> Vec<Handler<Self>> {
            vec![Handler::new(
                "on_tagged",
                vec![Class::of::<u32>(), Class::of::<Animal>().array()],
                ok,
            )
            .accept_varargs()]
        }
    }

    struct NotAListener;
    impl Listener for NotAListener {
        fn handlers() -> Vec<Handler<Self>> {
            Vec::new()
        }
    }

    fn handler_names(subs: &[Arc<Subscription>]) -> Vec<&'static str> {
        subs.iter().map(|sub| sub.handler()).collect()
    }

    #[test]
    fn test_subscribe_creates_subscriptions_once() {
        let manager = SubscriptionManager::default();
        let first = Arc::new(AnimalListener);
        let second = Arc::new(AnimalListener);

        manager.subscribe(&first);
        manager.subscribe(&first);
        manager.subscribe(&second);

        // The disabled handler is never subscribed.
        assert_eq!(manager.subscription_count(), 3);
        let subs = manager.exact_subscriptions(&[Class::of::<Animal>()]);
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|sub| sub.len() == 2));
        assert!(manager.is_subscribed(&first));
    }

    #[test]
    fn test_non_listener_is_ignored() {
        let manager = SubscriptionManager::default();
        manager.subscribe(&Arc::new(NotAListener));
        manager.unsubscribe(&Arc::new(NotAListener));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_supertype_and_exact_matching() {
        let manager = SubscriptionManager::default();
        manager.subscribe(&Arc::new(StringListener));
        manager.subscribe(&Arc::new(ObjectListener));

        let for_string = manager.subscriptions_for(&[Class::of::<String>()]);
        assert_eq!(handler_names(&for_string), vec!["on_string", "on_object"]);

        let for_int = manager.subscriptions_for(&[Class::of::<i32>()]);
        assert_eq!(handler_names(&for_int), vec!["on_object"]);
    }

    #[test]
    fn test_subtype_flag_gates_matching() {
        let manager = SubscriptionManager::default();
        manager.subscribe(&Arc::new(AnimalListener));

        let for_dog = manager.subscriptions_for(&[Class::of::<Dog>()]);
        assert_eq!(handler_names(&for_dog), vec!["on_animal"]);

        let for_animal = manager.subscriptions_for(&[Class::of::<Animal>()]);
        assert_eq!(handler_names(&for_animal), vec!["on_animal", "on_animal_exact"]);

        let for_dogs = manager.subscriptions_for(&[Class::of::<Dog>().array()]);
        assert_eq!(handler_names(&for_dogs), vec!["on_animals"]);
    }

    #[test]
    fn test_vararg_matching() {
        let manager = SubscriptionManager::default();
        manager.subscribe(&Arc::new(VarargListener));

        let u32_class = Class::of::<u32>();
        let dog = Class::of::<Dog>();
        let animal = Class::of::<Animal>();

        let spread = manager.resolve(&[u32_class, dog, animal, dog]);
        assert_eq!(spread.len(), 1);
        assert!(spread[0].is_vararg());

        let direct = manager.resolve(&[u32_class, dog.array()]);
        assert_eq!(direct.len(), 1);
        assert!(!direct[0].is_vararg());

        // An empty tail packs into an empty array.
        assert_eq!(manager.resolve(&[u32_class]).len(), 1);

        assert!(manager.resolve(&[dog, dog]).is_empty());
        assert!(manager.resolve(&[u32_class, dog, Class::of::<String>()]).is_empty());
    }

    #[test]
    fn test_exact_dispatch_mode() {
        let manager = SubscriptionManager::new(DispatchMode::Exact, ReferenceMode::Strong);
        manager.subscribe(&Arc::new(ObjectListener));
        manager.subscribe(&Arc::new(AnimalListener));

        assert!(manager.subscriptions_for(&[Class::of::<String>()]).is_empty());
        assert!(manager.subscriptions_for(&[Class::of::<Dog>()]).is_empty());
        assert_eq!(manager.subscriptions_for(&[Class::object()]).len(), 1);
        assert_eq!(manager.subscriptions_for(&[Class::of::<Animal>()]).len(), 2);
    }

    #[test]
    fn test_unsubscribe_restores_lookup() {
        let manager = SubscriptionManager::default();
        let kept = Arc::new(ObjectListener);
        manager.subscribe(&kept);

        let key = [Class::of::<Dog>()];
        let before = handler_names(&manager.subscriptions_for(&key));

        let transient = Arc::new(AnimalListener);
        manager.subscribe(&transient);
        assert_eq!(manager.subscriptions_for(&key).len(), 2);

        manager.unsubscribe(&transient);
        assert_eq!(handler_names(&manager.subscriptions_for(&key)), before);
        assert!(!manager.is_subscribed(&transient));
    }

    #[test]
    fn test_cache_survives_new_listener_instances() {
        let manager = SubscriptionManager::default();
        manager.subscribe(&Arc::new(StringListener));

        let key = [Class::of::<String>()];
        let first = manager.resolve(&key);
        manager.subscribe(&Arc::new(StringListener));
        let second = manager.resolve(&key);
        assert!(Arc::ptr_eq(&first, &second));

        // A new listener type invalidates the cache.
        manager.subscribe(&Arc::new(ObjectListener));
        let third = manager.resolve(&key);
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn test_weak_reference_mode() {
        let manager = SubscriptionManager::new(DispatchMode::default(), ReferenceMode::Weak);
        let listener = Arc::new(StringListener);
        manager.subscribe(&listener);

        let key = [Class::of::<String>()];
        assert_eq!(manager.subscriptions_for(&key).len(), 1);
        assert_eq!(Arc::strong_count(&listener), 1);

        drop(listener);
        let subs = manager.exact_subscriptions(&key);
        assert_eq!(subs.len(), 1);
        assert!(!subs[0].publish(&[AnyMessage::new(String::from("x"))], &LoggingErrorHandler));

        // The walk above pruned the dead listener.
        assert_eq!(subs[0].len(), 0);
        assert!(manager.subscriptions_for(&key).is_empty());
    }
}
