//! Client identity validation
//!
//! The client id travels unescaped in every request header, so it is checked
//! once, before any connection is attempted, and rejected rather than
//! sanitized.

use crate::error::KafkalinkClientError;
use std::fmt;

/// A validated client identifier: one or more of `[A-Za-z0-9._-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Validate and wrap a client identifier
    pub fn new<S: Into<String>>(identity: S) -> Result<Self, KafkalinkClientError> {
        let identity = identity.into();
        validate(&identity)?;
        Ok(Self(identity))
    }

    /// The validated id as sent in request headers
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Check an identifier against the allowed character set
pub fn validate(identity: &str) -> Result<(), KafkalinkClientError> {
    if identity.is_empty() {
        return Err(KafkalinkClientError::invalid_identity(
            identity,
            "client id must not be empty",
        ));
    }

    // Written as an INT16-length string in the request header
    if identity.len() > i16::MAX as usize {
        return Err(KafkalinkClientError::invalid_identity(
            identity,
            format!("client id longer than {} bytes", i16::MAX),
        ));
    }

    if let Some(bad) = identity.chars().find(|c| !is_legal(*c)) {
        return Err(KafkalinkClientError::invalid_identity(
            identity,
            format!("illegal character {:?}, allowed are [A-Za-z0-9._-]", bad),
        ));
    }

    Ok(())
}

fn is_legal(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}
