//! Validated package names.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned for a syntactically invalid package name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid package name `{name}`: {reason}")]
pub struct InvalidName {
    pub name: String,
    pub reason: String,
}

/// A package name matching `[a-z][a-z0-9_-]*`.
///
/// Cheap to clone; ordering and equality are by string content.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageName(Arc<str>);

impl PackageName {
    /// Validate and wrap a name.
    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidName> {
        let name = name.as_ref();
        validate_package_name(name)?;
        Ok(PackageName(Arc::from(name)))
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First character of the name, used for index sharding.
    pub fn first_char(&self) -> char {
        // Validation guarantees a non-empty ASCII name.
        self.0.chars().next().unwrap_or('_')
    }
}

/// Validate a package name.
pub fn validate_package_name(name: &str) -> Result<(), InvalidName> {
    let invalid = |reason: String| InvalidName {
        name: name.to_string(),
        reason,
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("name cannot be empty".to_string()));
    };

    if !first.is_ascii_lowercase() {
        return Err(invalid("must start with a lowercase letter [a-z]".to_string()));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
    {
        return Err(invalid(format!("only [a-z0-9_-] allowed, found '{}'", c)));
    }

    Ok(())
}

impl Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl TryFrom<&str> for PackageName {
    type Error = InvalidName;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        PackageName::new(s)
    }
}

impl Serialize for PackageName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PackageName::new(s).map_err(serde::de::Error::custom)
    }
}
