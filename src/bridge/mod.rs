//! Late-bound access to the automation server
//!
//! This module defines the two collaborators a [`Connection`](crate::pool::Connection)
//! depends on:
//! - [`InstanceFactory`]: resolves a registered component identifier to a type
//!   and instantiates it
//! - [`MemberInvoker`]: calls a method or reads a property by name
//!
//! Implementations wrap the platform's automation layer. Both report failures
//! as [`InvokeError`]; the connection lifts those into [`Error`](crate::Error)
//! with the member name and rendered arguments attached.

pub mod variant;

pub use variant::{format_args_list, ObjectRef, TypeRef, Variant};

use tracing::trace;

use crate::error::{Error, Result};

/// Failure reported by a bridge implementation
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvokeError {
    message: String,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl InvokeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Invokes members of external objects by name
///
/// Calls are blocking and must only be issued by one caller at a time per
/// external object; [`Connection`](crate::pool::Connection) guarantees that.
pub trait MemberInvoker: Send + Sync {
    /// Invoke a public method of `target` named `name`
    fn invoke_method(&self, target: &ObjectRef, name: &str, args: &[Variant]) -> Result<Variant, InvokeError>;

    /// Read the public property of `target` named `name`
    fn get_property(&self, target: &ObjectRef, name: &str) -> Result<Variant, InvokeError>;
}

/// Creates external objects from a registered component identifier
pub trait InstanceFactory: Send + Sync {
    /// Resolve the type registered under `prog_id`
    fn resolve_type(&self, prog_id: &str) -> Result<TypeRef, InvokeError>;

    /// Create an instance of `ty` with no constructor arguments
    fn create_instance(&self, ty: &TypeRef) -> Result<ObjectRef, InvokeError>;

    /// Release an instance created by this factory
    fn release_instance(&self, object: ObjectRef) {
        drop(object);
    }
}

/// Invoke a method and lift bridge failures into [`Error::InvokeMember`]
pub(crate) fn call_method(
    invoker: &dyn MemberInvoker,
    target: &ObjectRef,
    name: &str,
    args: &[Variant],
) -> Result<Variant> {
    trace!(
        target_object = %target,
        member = name,
        args = %format_args_list(Some(args)),
        "Invoking method"
    );

    invoker
        .invoke_method(target, name, args)
        .map_err(|source| Error::InvokeMember {
            target: target.to_string(),
            member: name.to_string(),
            args: format_args_list(Some(args)),
            source,
        })
}

/// Read a property and lift bridge failures into [`Error::InvokeMember`]
pub(crate) fn read_property(invoker: &dyn MemberInvoker, target: &ObjectRef, name: &str) -> Result<Variant> {
    trace!(target_object = %target, member = name, "Reading property");

    invoker
        .get_property(target, name)
        .map_err(|source| Error::InvokeMember {
            target: target.to_string(),
            member: name.to_string(),
            args: format_args_list(None),
            source,
        })
}
