//! Core types for the message bus.
//!
//! The bus routes on runtime types. Since Rust has no class hierarchy, every
//! publishable type describes itself through [`Message`], and the bus works on
//! [`Class`] descriptors built from it.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A value that can be published on the bus.
///
/// `supertypes` lists the direct parents of the implementing type. The root
/// class ([`Class::object`]) is an implicit ancestor of everything and never
/// needs to be listed.
///
/// ```ignore
/// struct Animal;
/// struct Dog;
///
/// impl Message for Animal {}
/// impl Message for Dog {
///     fn supertypes() -> Vec<Class> {
///         vec![Class::of::<Animal>()]
///     }
/// }
/// ```
pub trait Message: Any + Send + Sync {
    /// Direct supertypes of this message type.
    fn supertypes() -> Vec<Class>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// Marker for the root class.
struct Object;

fn no_parents() -> Vec<Class> {
    Vec::new()
}

/// Runtime type descriptor used as a routing key.
///
/// Equality and hashing only consider the underlying type and the array
/// dimension count.
#[derive(Clone, Copy)]
pub struct Class {
    id: TypeId,
    name: &'static str,
    dims: u8,
    parents: fn() -> Vec<Class>,
}

impl Class {
    /// Descriptor for a message type.
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
            dims: 0,
            parents: M::supertypes,
        }
    }

    /// The root class. Every other class is assignable to it.
    pub fn object() -> Self {
        Self {
            id: TypeId::of::<Object>(),
            name: "Object",
            dims: 0,
            parents: no_parents,
        }
    }

    /// Array class whose component is `self`.
    pub fn array(self) -> Self {
        Self {
            dims: self.dims.saturating_add(1),
            ..self
        }
    }

    /// Component class, if this is an array class.
    pub fn component(self) -> Option<Self> {
        if self.dims == 0 {
            None
        } else {
            Some(Self {
                dims: self.dims - 1,
                ..self
            })
        }
    }

    pub fn is_array(self) -> bool {
        self.dims > 0
    }

    /// True only for the root class itself (not arrays of it).
    pub fn is_object(self) -> bool {
        self.dims == 0 && self.id == TypeId::of::<Object>()
    }

    /// Number of array dimensions (0 for plain classes).
    pub fn dimensions(self) -> usize {
        self.dims as usize
    }

    /// Type name of the innermost component.
    pub fn name(self) -> &'static str {
        self.name
    }

    /// Innermost component class (`self` for non-array classes).
    pub fn base(self) -> Self {
        self.with_dims(0)
    }

    fn with_dims(self, dims: u8) -> Self {
        Self { dims, ..self }
    }

    /// Direct supertypes, including the implicit root.
    ///
    /// For array classes these are the arrays of the component's supertypes,
    /// with the root class as the final parent.
    pub(crate) fn direct_supertypes(self) -> Vec<Class> {
        if self.base().is_object() {
            return if self.dims == 0 {
                Vec::new()
            } else {
                vec![Class::object()]
            };
        }

        let mut parents: Vec<Class> = (self.parents)()
            .into_iter()
            .map(|p| p.with_dims(p.dims.saturating_add(self.dims)))
            .collect();

        if self.dims == 0 {
            parents.push(Class::object());
        } else {
            parents.push(Class::object().with_dims(self.dims));
        }
        parents
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.dims == other.dims
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.dims.hash(state);
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for _ in 0..self.dims {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self)
    }
}

/// Elements of an array message.
struct ArrayValue(Vec<AnyMessage>);

/// A type-erased published message.
///
/// Cloning is cheap; the value itself is shared.
#[derive(Clone)]
pub struct AnyMessage {
    class: Class,
    value: Arc<dyn Any + Send + Sync>,
}

impl AnyMessage {
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_arc(Arc::new(message))
    }

    /// Wrap an already shared message without copying it.
    pub fn from_arc<M: Message>(message: Arc<M>) -> Self {
        Self {
            class: Class::of::<M>(),
            value: message,
        }
    }

    /// Array message of `M` elements.
    pub fn array<M: Message>(elements: impl IntoIterator<Item = M>) -> Self {
        Self::array_of(
            Class::of::<M>(),
            elements.into_iter().map(AnyMessage::new).collect(),
        )
    }

    /// Array message with an explicit component class.
    ///
    /// The elements are expected to be assignable to `component`; this is
    /// not checked.
    pub fn array_of(component: Class, elements: Vec<AnyMessage>) -> Self {
        Self {
            class: component.array(),
            value: Arc::new(ArrayValue(elements)),
        }
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn is<M: Message>(&self) -> bool {
        self.value.is::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.value.downcast_ref::<M>()
    }

    /// Elements of an array message.
    pub fn as_array(&self) -> Option<&[AnyMessage]> {
        if !self.class.is_array() {
            return None;
        }
        self.value
            .downcast_ref::<ArrayValue>()
            .map(|array| array.0.as_slice())
    }

    /// True if both handles share the same underlying value.
    pub fn ptr_eq(&self, other: &AnyMessage) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl<M: Message> From<M> for AnyMessage {
    fn from(message: M) -> Self {
        AnyMessage::new(message)
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_array() {
            Some(elements) => write!(f, "AnyMessage({}; len {})", self.class, elements.len()),
            None => write!(f, "AnyMessage({})", self.class),
        }
    }
}

/// Wrapper published when a message had no receiving listener.
///
/// Subscribe a handler for `DeadMessage` to observe unhandled traffic.
#[derive(Clone, Debug)]
pub struct DeadMessage {
    messages: Vec<AnyMessage>,
}

impl DeadMessage {
    pub fn new(messages: Vec<AnyMessage>) -> Self {
        Self { messages }
    }

    /// The original published arguments.
    pub fn messages(&self) -> &[AnyMessage] {
        &self.messages
    }
}

impl Message for DeadMessage {}

macro_rules! impl_message {
    ($($ty:ty),* $(,)?) => {
        $(impl Message for $ty {})*
    };
}

impl_message!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
);

/// Which subscriptions receive a published message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Only handlers whose signature equals the runtime types.
    Exact,
    /// Exact handlers plus supertype and vararg handlers that accept them.
    #[default]
    ExactWithSuperTypes,
}

/// How a subscription holds on to its listeners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReferenceMode {
    /// The bus keeps listeners alive until they are unsubscribed.
    #[default]
    Strong,
    /// Listeners are held weakly and dropped from the bus once deallocated.
    Weak,
}
