//! Module names.
//!
//! Every business module owns one set of outbox / inbox tables, living in a database
//! schema named after the module. The name ends up inside SQL identifiers, so it is
//! validated once here and can be interpolated safely afterwards.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

const MAX_LEN: usize = 63;

/// Validated module name: lowercase ASCII letter first, then `[a-z0-9_]`, at most
/// 63 characters (the Postgres identifier limit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleName(String);

impl ModuleName {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> DomainResult<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(DomainError::validation("module name cannot be empty")),
        Some(c) if !c.is_ascii_lowercase() => {
            return Err(DomainError::validation(format!(
                "module name '{name}' must start with a lowercase letter"
            )));
        }
        Some(_) => {}
    }
    if name.len() > MAX_LEN {
        return Err(DomainError::validation(format!(
            "module name '{name}' exceeds {MAX_LEN} characters"
        )));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')) {
        return Err(DomainError::validation(format!(
            "module name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

impl core::fmt::Display for ModuleName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModuleName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ModuleName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ModuleName> for String {
    fn from(value: ModuleName) -> Self {
        value.0
    }
}

impl AsRef<str> for ModuleName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
