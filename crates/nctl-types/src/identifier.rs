//! Identifier validation and the newtypes built on it.
//!
//! Identifiers become path components under the data root, so every rule
//! here also rules out path traversal:
//! - Docker-compatible names (containers, volumes): first character
//!   alphanumeric, the rest alphanumeric or one of `_`, `.`, `-`; at least
//!   two characters long
//! - Namespaces and container IDs: containerd identifiers, i.e.
//!   alphanumeric runs separated by single `.`, `_` or `-`, at most 76
//!   characters. IDs generated here are 64 lowercase hex characters.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Longest containerd identifier (namespace or container ID).
pub const MAX_IDENTIFIER_LEN: usize = 76;

/// Longest namespace accepted, matching containerd.
pub const MAX_NAMESPACE_LEN: usize = MAX_IDENTIFIER_LEN;

/// Length of a generated container ID in hex characters.
pub const CONTAINER_ID_LEN: usize = 64;

/// Length of the abbreviated container ID shown by `ls`.
pub const SHORT_ID_LEN: usize = 12;

/// The namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

fn is_name_separator(ch: char) -> bool {
    matches!(ch, '_' | '.' | '-')
}

/// Validate a container or volume name against the Docker naming rule.
///
/// # Examples
///
/// ```
/// use nctl_types::validate_docker_compat;
///
/// assert!(validate_docker_compat("web").is_ok());
/// assert!(validate_docker_compat("my_db.1").is_ok());
/// assert!(validate_docker_compat("").is_err());
/// assert!(validate_docker_compat("-leading").is_err());
/// assert!(validate_docker_compat("../etc").is_err());
/// ```
pub fn validate_docker_compat(value: &str) -> Result<(), TypeError> {
    let invalid = |reason: &str| TypeError::InvalidIdentifier {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("identifier must not be empty"));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(invalid("must start with an ASCII letter or digit"));
    }
    if value.len() < 2 {
        return Err(invalid("must be at least 2 characters long"));
    }
    if let Some(ch) = chars.find(|c| !(c.is_ascii_alphanumeric() || is_name_separator(*c))) {
        return Err(invalid(&format!("contains forbidden character: {ch:?}")));
    }
    Ok(())
}

/// Validate a namespace name following containerd's identifier rule.
pub fn validate_namespace(value: &str) -> Result<(), TypeError> {
    check_containerd_identifier(value).map_err(|reason| TypeError::InvalidNamespace {
        value: value.to_string(),
        reason,
    })
}

/// containerd's identifier rule, shared by namespaces and container IDs.
/// Returns the reason on failure.
fn check_containerd_identifier(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".into());
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(format!("longer than {MAX_IDENTIFIER_LEN} characters"));
    }

    let mut prev_separator = true;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            prev_separator = false;
        } else if is_name_separator(ch) {
            if prev_separator {
                return Err("separators must sit between alphanumeric runs".into());
            }
            prev_separator = true;
        } else {
            return Err(format!("contains forbidden character: {ch:?}"));
        }
    }
    if prev_separator {
        return Err("must not end with a separator".into());
    }
    Ok(())
}

/// A validated containerd namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    /// Parse and validate a namespace.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        validate_namespace(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self(DEFAULT_NAMESPACE.to_string())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Namespace {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Namespace {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl AsRef<str> for Namespace {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A container ID.
///
/// Any containerd identifier is accepted, so IDs assigned elsewhere can be
/// recorded as they are. [`ContainerId::generate`] always yields the
/// 64-hex-character form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONTAINER_ID_LEN / 2];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse and validate an ID.
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        match check_containerd_identifier(&value) {
            Ok(()) => Ok(Self(value)),
            Err(reason) => Err(TypeError::InvalidContainerId { value, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The abbreviated form shown in listings.
    pub fn short(&self) -> &str {
        // ASCII only, so any byte offset is a char boundary.
        &self.0[..SHORT_ID_LEN.min(self.0.len())]
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.short())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
