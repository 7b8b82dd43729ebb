//! Connection target descriptor
//!
//! A [`ConnectionTarget`] identifies one infobase session: the infobase
//! address, the user to log in as, an optional password and an optional
//! initialization timeout override. Two targets with equal fields are
//! interchangeable cache keys.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable description of what to connect to
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionTarget {
    /// Infobase path
    address: String,

    /// User name
    principal: String,

    /// Password, if the user has one
    credential: Option<String>,

    /// Overrides the default initialization timeout
    initialize_timeout: Option<Duration>,
}

impl ConnectionTarget {
    /// Create a target; `address` and `principal` must be non-empty
    pub fn new(
        address: impl Into<String>,
        principal: impl Into<String>,
        credential: Option<String>,
    ) -> Result<Self> {
        let address = address.into();
        let principal = principal.into();

        if address.trim().is_empty() {
            return Err(Error::InvalidTarget("infobase address is empty"));
        }
        if principal.trim().is_empty() {
            return Err(Error::InvalidTarget("user name is empty"));
        }

        Ok(Self {
            address,
            principal,
            credential,
            initialize_timeout: None,
        })
    }

    /// Copy of this target with an initialization timeout override
    pub fn with_initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = Some(timeout);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn initialize_timeout(&self) -> Option<Duration> {
        self.initialize_timeout
    }

    /// Command line passed to `Initialize`: `/D<address> /N<principal> /P<credential>`
    pub fn connection_string(&self) -> String {
        format!(
            "/D{} /N{} /P{}",
            self.address,
            self.principal,
            self.credential.as_deref().unwrap_or_default()
        )
    }

    /// Absolute path of a unit of work stored under the infobase
    pub fn resolve_path(&self, relative_path: &str) -> String {
        Path::new(&self.address)
            .join(relative_path)
            .to_string_lossy()
            .into_owned()
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("address", &self.address)
            .field("principal", &self.principal)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("initialize_timeout", &self.initialize_timeout)
            .finish()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.principal, self.address)
    }
}
