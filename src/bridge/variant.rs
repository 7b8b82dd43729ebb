//! Dynamic values exchanged with the automation server
//!
//! The external object model is late-bound: every argument and return value
//! is one of a handful of scalar types or a reference to another external
//! object. [`ObjectRef`] and [`TypeRef`] are opaque handles whose identity is
//! the identity of the wrapped allocation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A late-bound value passed to or returned from a member call
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    /// No value
    #[default]
    Null,

    Bool(bool),

    Int(i64),

    Float(f64),

    Str(String),

    /// Reference to another external object
    Object(ObjectRef),
}

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Variant::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => f.write_str("null"),
            Variant::Bool(value) => write!(f, "{value}"),
            Variant::Int(value) => write!(f, "{value}"),
            Variant::Float(value) => write!(f, "{value}"),
            Variant::Str(value) => f.write_str(value),
            Variant::Object(object) => write!(f, "{object}"),
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Variant::Int(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Float(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::Str(value)
    }
}

impl From<ObjectRef> for Variant {
    fn from(value: ObjectRef) -> Self {
        Variant::Object(value)
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(value: Option<T>) -> Self {
        value.map_or(Variant::Null, Into::into)
    }
}

/// Opaque handle to an external object
///
/// Clones share the same underlying object; equality is identity.
#[derive(Clone)]
pub struct ObjectRef {
    name: Arc<str>,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ObjectRef {
    /// Wrap a bridge-specific object under a display name
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>, value: T) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(value),
        }
    }

    /// Display name used in error messages and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Access the bridge-specific object
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether both handles point at the same external object
    pub fn same_object(&self, other: &ObjectRef) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}@{:p})", self.name, Arc::as_ptr(&self.inner) as *const ())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Opaque handle to a resolved, instantiable external type
#[derive(Clone, PartialEq, Eq)]
pub struct TypeRef(ObjectRef);

impl TypeRef {
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>, value: T) -> Self {
        Self(ObjectRef::new(name, value))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({})", self.0.name())
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}

/// Render an argument list the way invocation errors report it: `{a} {b} {null}`
pub fn format_args_list(args: Option<&[Variant]>) -> String {
    let Some(args) = args else {
        return "null".to_string();
    };

    args.iter()
        .map(|arg| format!("{{{arg}}}"))
        .collect::<Vec<_>>()
        .join(" ")
}
