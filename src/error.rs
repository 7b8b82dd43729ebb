//! Error types shared by the bridge, the connection and the factory
//!
//! Every failure surfaced by this crate is a single [`Error`] enum. Wrapping
//! variants (`Connect`, `RunUnitOfWork`) box the underlying cause, so the
//! innermost kind stays reachable through [`Error::cause_kind`].

use std::time::Duration;

use crate::bridge::InvokeError;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types for connection operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to invoke member '{member}' on '{target}' with args: {args}")]
    InvokeMember {
        target: String,
        member: String,
        args: String,
        #[source]
        source: InvokeError,
    },

    #[error("Failed to get type from ProgID '{prog_id}'")]
    ResolveType {
        prog_id: String,
        #[source]
        source: InvokeError,
    },

    #[error("Failed to create instance of type '{type_name}'")]
    CreateInstance {
        type_name: String,
        #[source]
        source: InvokeError,
    },

    #[error("Member '{member}' returned unexpected value: {value}")]
    UnexpectedValue { member: String, value: String },

    #[error("Failed to initialize connection to infobase '{address}'")]
    InitializeReturnedFalse { address: String },

    #[error("Initialize timeout exceeded ({timeout:?})")]
    InitializeTimeout { timeout: Duration },

    #[error("Too many errors: {count}")]
    TooManyErrors { count: u32 },

    #[error("Connection is not ready: {0}")]
    NotReady(&'static str),

    #[error("Failed to connect to infobase '{address}'")]
    Connect {
        address: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to run unit of work at infobase '{address}'")]
    RunUnitOfWork {
        address: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Unit of work running at '{address}' returned error message: '{message}'")]
    UnitOfWorkReported { address: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Connection to '{address}' is disposed")]
    Disposed { address: String },

    #[error("Invalid connection target: {0}")]
    InvalidTarget(&'static str),

    #[error("Worker for a blocking call failed: {0}")]
    Worker(String),
}

/// Flat tag for an [`Error`], independent of its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvokeMember,
    ResolveType,
    CreateInstance,
    UnexpectedValue,
    InitializeReturnedFalse,
    InitializeTimeout,
    TooManyErrors,
    NotReady,
    Connect,
    RunUnitOfWork,
    UnitOfWorkReported,
    Cancelled,
    Disposed,
    InvalidTarget,
    Worker,
}

impl Error {
    /// Tag of this error, without looking through wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvokeMember { .. } => ErrorKind::InvokeMember,
            Error::ResolveType { .. } => ErrorKind::ResolveType,
            Error::CreateInstance { .. } => ErrorKind::CreateInstance,
            Error::UnexpectedValue { .. } => ErrorKind::UnexpectedValue,
            Error::InitializeReturnedFalse { .. } => ErrorKind::InitializeReturnedFalse,
            Error::InitializeTimeout { .. } => ErrorKind::InitializeTimeout,
            Error::TooManyErrors { .. } => ErrorKind::TooManyErrors,
            Error::NotReady(_) => ErrorKind::NotReady,
            Error::Connect { .. } => ErrorKind::Connect,
            Error::RunUnitOfWork { .. } => ErrorKind::RunUnitOfWork,
            Error::UnitOfWorkReported { .. } => ErrorKind::UnitOfWorkReported,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Disposed { .. } => ErrorKind::Disposed,
            Error::InvalidTarget(_) => ErrorKind::InvalidTarget,
            Error::Worker(_) => ErrorKind::Worker,
        }
    }

    /// Tag of the innermost error, looking through `Connect` and `RunUnitOfWork`
    pub fn cause_kind(&self) -> ErrorKind {
        match self {
            Error::Connect { source, .. } | Error::RunUnitOfWork { source, .. } => source.cause_kind(),
            other => other.kind(),
        }
    }

    /// Whether this error passes through the connection unwrapped and uncounted
    pub(crate) fn is_passthrough(&self) -> bool {
        matches!(self, Error::Cancelled | Error::TooManyErrors { .. } | Error::Disposed { .. })
    }

    /// Whether this error should increment the connection's error counter
    pub(crate) fn is_counted(&self) -> bool {
        !self.is_passthrough() && !matches!(self, Error::NotReady(_))
    }
}
