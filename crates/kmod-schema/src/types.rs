//! Module names and install requests.

use serde::{Deserialize, Deserializer, Serialize};
use semver::VersionReq;
use std::borrow::Borrow;
use std::str::FromStr;

use crate::SchemaError;

/// Longest accepted module name.
pub const MAX_NAME_LEN: usize = 128;

/// A validated, normalized module name.
///
/// Names are lowercased on construction. Allowed characters are ASCII
/// alphanumerics plus `.`, `_` and `-`; the first character must be alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ModuleName(String);

impl ModuleName {
    /// Validate and normalize `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidName`] if the name is empty, too long,
    /// starts with punctuation or contains a disallowed character.
    pub fn parse(name: &str) -> Result<Self, SchemaError> {
        let normalized = name.trim().to_lowercase();
        let reject = |reason| SchemaError::InvalidName {
            name: name.to_string(),
            reason,
        };

        let Some(first) = normalized.chars().next() else {
            return Err(reject("name is empty"));
        };
        if normalized.len() > MAX_NAME_LEN {
            return Err(reject("name is longer than 128 characters"));
        }
        if !first.is_ascii_alphanumeric() {
            return Err(reject("name must start with a letter or digit"));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(reject("only a-z, 0-9, '.', '_' and '-' are allowed"));
        }

        Ok(Self(normalized))
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ModuleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ModuleName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ModuleName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl PartialEq<&str> for ModuleName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl FromStr for ModuleName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ModuleName {
    type Error = SchemaError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ModuleName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a version constraint, treating `latest` and the empty string as `*`.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidConstraint`] if the requirement does not parse.
pub fn parse_constraint(s: &str) -> Result<VersionReq, SchemaError> {
    let s = s.trim();
    if s.is_empty() || s == "latest" || s == "*" {
        return Ok(VersionReq::STAR);
    }
    VersionReq::parse(s).map_err(|e| SchemaError::InvalidConstraint(s.to_string(), e))
}

/// A module request: `name` or `name@constraint`.
///
/// Supported constraint forms follow semver requirements:
/// - `latest` or `*`: newest version
/// - `1.2.3`: caret-compatible with 1.2.3
/// - `=1.2.3`: exact match
/// - `^1.2`, `~1.2`: compatible / minor-compatible
/// - `>=1.0, <2.0`: range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Requested module.
    pub name: ModuleName,
    /// Version constraint (`*` when omitted).
    pub constraint: VersionReq,
}

impl ModuleSpec {
    /// Parse `name[@constraint]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or the constraint is invalid.
    pub fn parse(spec: &str) -> Result<Self, SchemaError> {
        let (name, constraint) = match spec.split_once('@') {
            Some((name, constraint)) => (name, constraint),
            None => (spec, ""),
        };

        Ok(Self {
            name: ModuleName::parse(name)?,
            constraint: parse_constraint(constraint)?,
        })
    }
}

impl FromStr for ModuleSpec {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ModuleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.constraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized() {
        let name = ModuleName::parse("Revit-API").unwrap();
        assert_eq!(name.as_str(), "revit-api");
        assert_eq!(name, "REVIT-api");
    }

    #[test]
    fn names_are_validated() {
        assert!(ModuleName::parse("").is_err());
        assert!(ModuleName::parse("-leading").is_err());
        assert!(ModuleName::parse("has space").is_err());
        assert!(ModuleName::parse("slash/name").is_err());
        assert!(ModuleName::parse(&"a".repeat(129)).is_err());
        assert!(ModuleName::parse("jordan-context.sample_2").is_ok());
    }

    #[test]
    fn deserialize_validates_names() {
        let ok: ModuleName = serde_json::from_str("\"Demo\"").unwrap();
        assert_eq!(ok.as_str(), "demo");
        assert!(serde_json::from_str::<ModuleName>("\"../etc\"").is_err());
    }

    #[test]
    fn spec_without_constraint_is_star() {
        let spec = ModuleSpec::parse("demo").unwrap();
        assert_eq!(spec.name.as_str(), "demo");
        assert_eq!(spec.constraint, VersionReq::STAR);

        let latest = ModuleSpec::parse("demo@latest").unwrap();
        assert_eq!(latest.constraint, VersionReq::STAR);
    }

    #[test]
    fn spec_with_constraint() {
        let spec = ModuleSpec::parse("demo@^1.0.0").unwrap();
        assert!(spec.constraint.matches(&semver::Version::new(1, 4, 0)));
        assert!(!spec.constraint.matches(&semver::Version::new(2, 0, 0)));
    }

    #[test]
    fn spec_rejects_garbage_constraint() {
        assert!(matches!(
            ModuleSpec::parse("demo@not-a-version"),
            Err(SchemaError::InvalidConstraint(..))
        ));
    }
}
