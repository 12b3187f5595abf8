//! Authentication methods
//!
//! Chirp servers know several ways of establishing identity but this client
//! only speaks one of them: a pre-shared cookie. The remaining names are
//! still recognised so a configuration asking for them fails fast with
//! [`Error::AuthNotImplemented`] instead of silently moving on to the next
//! method.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authentication methods known to the Chirp protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuthMethod {
    /// Pre-shared secret presented once per connection
    Cookie,
    /// Recognised, not implemented
    Hostname,
    /// Recognised, not implemented
    Unix,
    /// Recognised, not implemented
    Kerberos,
    /// Recognised, not implemented
    Globus,
}

impl AuthMethod {
    /// Protocol name of this method
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Cookie => "cookie",
            AuthMethod::Hostname => "hostname",
            AuthMethod::Unix => "unix",
            AuthMethod::Kerberos => "kerberos",
            AuthMethod::Globus => "globus",
        }
    }

    /// Whether this client can actually perform the method
    pub fn is_implemented(&self) -> bool {
        matches!(self, AuthMethod::Cookie)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cookie" => Ok(AuthMethod::Cookie),
            "hostname" => Ok(AuthMethod::Hostname),
            "unix" => Ok(AuthMethod::Unix),
            "kerberos" => Ok(AuthMethod::Kerberos),
            "globus" => Ok(AuthMethod::Globus),
            _ => Err(Error::UnknownAuthMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for AuthMethod {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AuthMethod> for String {
    fn from(method: AuthMethod) -> Self {
        method.as_str().to_string()
    }
}

/// Render a list of methods for error messages and logs
pub fn describe(methods: &[AuthMethod]) -> String {
    methods
        .iter()
        .map(AuthMethod::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Try each method in order and keep the first one that succeeds.
///
/// `attempt` performs one full connect + authenticate cycle for a method.
/// A [`ChirpStatus::NotAuthenticated`](crate::ChirpStatus::NotAuthenticated)
/// result moves on to the next method; any other failure (including
/// [`Error::AuthNotImplemented`]) aborts the search immediately.
pub fn negotiate<F>(methods: &[AuthMethod], mut attempt: F) -> Result<AuthMethod>
where
    F: FnMut(AuthMethod) -> Result<()>,
{
    for &method in methods {
        match attempt(method) {
            Ok(()) => return Ok(method),
            Err(e) if e.status() == Some(crate::ChirpStatus::NotAuthenticated) => {
                tracing::warn!("Authentication with '{}' rejected, trying next method", method);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::AuthenticationFailed {
        methods: describe(methods),
    })
}
