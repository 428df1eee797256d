//! Listener and handler descriptors, and the subscriptions built from them.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::collections::ConcurrentSet;
use crate::dispatch::{ErrorHandler, HandlerResult, PublicationError};
use crate::types::{AnyMessage, Class, Message, ReferenceMode};

/// Type-erased listener instance as stored by subscriptions.
pub type ListenerRef = Arc<dyn Any + Send + Sync>;

type Invoker<L> = Arc<dyn Fn(&L, &[AnyMessage]) -> HandlerResult + Send + Sync>;
type ErasedInvoker = Box<dyn Fn(&(dyn Any + Send + Sync), &[AnyMessage]) -> HandlerResult + Send + Sync>;

/// A type whose instances can be subscribed to the bus.
///
/// `handlers` plays the role of a metadata reader: it describes every
/// message handler the type exposes. It is called once per listener type.
///
/// ```ignore
/// struct Greeter;
///
/// impl Listener for Greeter {
///     fn handlers() -> Vec<Handler<Self>> {
///         vec![Handler::on::<String>("greet", |_, name| println!("hello {}", name))]
///     }
/// }
/// ```
pub trait Listener: Any + Send + Sync + Sized {
    fn handlers() -> Vec<Handler<Self>>;

    /// Pin how subscriptions hold instances of this type, overriding the
    /// bus default.
    fn reference_mode() -> Option<ReferenceMode> {
        None
    }
}

/// Description of one message handler on a listener type.
pub struct Handler<L> {
    name: &'static str,
    signature: Vec<Class>,
    invoke: Invoker<L>,
    accepts_subtypes: bool,
    accepts_varargs: bool,
    synchronized: bool,
    enabled: bool,
}

impl<L: Listener> Handler<L> {
    /// Handler over raw arguments. `signature` lists the declared parameter
    /// classes; arguments arrive in the same order.
    ///
    /// Accepts subtypes by default, so arguments may be of any class
    /// assignable to the declared one.
    pub fn new<F>(name: &'static str, signature: Vec<Class>, invoke: F) -> Self
    where
        F: Fn(&L, &[AnyMessage]) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            name,
            signature,
            invoke: Arc::new(invoke),
            accepts_subtypes: true,
            accepts_varargs: false,
            synchronized: false,
            enabled: true,
        }
    }

    /// Typed handler for exactly `M`.
    pub fn on<M: Message>(
        name: &'static str,
        handle: impl Fn(&L, &M) + Send + Sync + 'static,
    ) -> Self {
        Self::try_on::<M>(name, move |listener, message| {
            handle(listener, message);
            Ok(())
        })
    }

    /// Typed handler for exactly `M` that may fail.
    pub fn try_on<M: Message>(
        name: &'static str,
        handle: impl Fn(&L, &M) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, vec![Class::of::<M>()], move |listener, args| {
            match args.first().and_then(AnyMessage::downcast_ref::<M>) {
                Some(message) => handle(listener, message),
                None => Err(format!("expected a {} argument", Class::of::<M>()).into()),
            }
        })
        .reject_subtypes()
    }

    /// Only deliver messages whose classes equal the signature.
    pub fn reject_subtypes(mut self) -> Self {
        self.accepts_subtypes = false;
        self
    }

    /// Let a trailing array parameter absorb the remaining arguments.
    /// Ignored unless the last declared class is an array class.
    pub fn accept_varargs(mut self) -> Self {
        self.accepts_varargs = true;
        self
    }

    /// Serialize invocations of this handler across all threads.
    pub fn synchronized(mut self) -> Self {
        self.synchronized = true;
        self
    }

    /// Keep the handler out of every subscription.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signature(&self) -> &[Class] {
        &self.signature
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl<L> fmt::Debug for Handler<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("accepts_subtypes", &self.accepts_subtypes)
            .field("accepts_varargs", &self.accepts_varargs)
            .field("synchronized", &self.synchronized)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Unique identifier for a subscription. Also its registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// One handler of one listener type, with the live set of subscribed
/// instances of that type.
pub struct Subscription {
    id: SubscriptionId,
    listener_type: &'static str,
    listener_type_id: TypeId,
    handler: &'static str,
    signature: Vec<Class>,
    accepts_subtypes: bool,
    accepts_varargs: bool,
    /// Present for synchronized handlers.
    lock: Option<Mutex<()>>,
    invoke: ErasedInvoker,
    listeners: ConcurrentSet<dyn Any + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new<L: Listener>(id: SubscriptionId, handler: Handler<L>, mode: ReferenceMode) -> Self {
        let accepts_varargs = handler.accepts_varargs
            && handler.signature.last().map_or(false, |last| last.is_array());

        let invoke = handler.invoke;
        let erased: ErasedInvoker = Box::new(
            move |listener: &(dyn Any + Send + Sync), args: &[AnyMessage]| {
                match listener.downcast_ref::<L>() {
                    Some(listener) => invoke(listener, args),
                    None => Err("listener type mismatch".into()),
                }
            },
        );

        Self {
            id,
            listener_type: std::any::type_name::<L>(),
            listener_type_id: TypeId::of::<L>(),
            handler: handler.name,
            signature: handler.signature,
            accepts_subtypes: handler.accepts_subtypes,
            accepts_varargs,
            lock: handler.synchronized.then(|| Mutex::new(())),
            invoke: erased,
            listeners: ConcurrentSet::new(mode),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn listener_type(&self) -> &'static str {
        self.listener_type
    }

    pub fn handler(&self) -> &'static str {
        self.handler
    }

    pub fn signature(&self) -> &[Class] {
        &self.signature
    }

    pub fn accepts_subtypes(&self) -> bool {
        self.accepts_subtypes
    }

    pub fn accepts_varargs(&self) -> bool {
        self.accepts_varargs
    }

    pub fn is_synchronized(&self) -> bool {
        self.lock.is_some()
    }

    pub fn reference_mode(&self) -> ReferenceMode {
        self.listeners.mode()
    }

    /// Number of subscribed listener instances.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn contains(&self, listener: &ListenerRef) -> bool {
        self.listeners.contains(listener)
    }

    pub(crate) fn belongs_to(&self, type_id: TypeId) -> bool {
        self.listener_type_id == type_id
    }

    pub(crate) fn add(&self, listener: &ListenerRef) -> bool {
        self.listeners.add(listener)
    }

    pub(crate) fn remove(&self, listener: &ListenerRef) -> bool {
        self.listeners.remove(listener)
    }

    /// Invoke the handler on every subscribed listener.
    ///
    /// Failures and panics are reported to `errors` and do not stop delivery
    /// to the remaining listeners. Returns true if at least one listener was
    /// invoked.
    pub fn publish(&self, args: &[AnyMessage], errors: &dyn ErrorHandler) -> bool {
        let mut delivered = false;
        for listener in self.listeners.iter() {
            delivered = true;

            let outcome = {
                let _guard = self.lock.as_ref().map(|lock| lock.lock());
                catch_unwind(AssertUnwindSafe(|| (self.invoke)(&*listener, args)))
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(cause)) => errors.handle_error(&PublicationError::handler_failed(
                    self.listener_type,
                    self.handler,
                    args,
                    cause,
                )),
                Err(panic) => errors.handle_error(&PublicationError::handler_panicked(
                    self.listener_type,
                    self.handler,
                    args,
                    panic.as_ref(),
                )),
            }
        }
        delivered
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("listener_type", &self.listener_type)
            .field("handler", &self.handler)
            .field("signature", &self.signature)
            .field("listeners", &self.len())
            .finish()
    }
}

/// A subscription resolved for a concrete argument type combination.
#[derive(Clone, Debug)]
pub struct Match {
    subscription: Arc<Subscription>,
    /// Component class when trailing arguments are packed into an array.
    vararg: Option<Class>,
}

impl Match {
    pub(crate) fn direct(subscription: Arc<Subscription>) -> Self {
        Self {
            subscription,
            vararg: None,
        }
    }

    pub(crate) fn vararg(subscription: Arc<Subscription>, component: Class) -> Self {
        Self {
            subscription,
            vararg: Some(component),
        }
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn is_vararg(&self) -> bool {
        self.vararg.is_some()
    }

    /// Arguments shaped for the handler's signature.
    pub fn arguments<'a>(&self, args: &'a [AnyMessage]) -> Cow<'a, [AnyMessage]> {
        let component = match self.vararg {
            Some(component) => component,
            None => return Cow::Borrowed(args),
        };

        let prefix = self.subscription.signature.len().saturating_sub(1).min(args.len());
        let mut packed = args[..prefix].to_vec();
        packed.push(AnyMessage::array_of(component, args[prefix..].to_vec()));
        Cow::Owned(packed)
    }

    /// Deliver to every listener of the subscription.
    pub fn publish(&self, args: &[AnyMessage], errors: &dyn ErrorHandler) -> bool {
        self.subscription.publish(&self.arguments(args), errors)
    }
}
